//! Engine configuration
//!
//! TOML-backed knobs for the clock, the order tracker and the rate gate.
//! Every field has a serde default so partial files are valid.

use crate::engine::time::{secs_to_nanos, Nanos};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub clock: ClockConfig,

    #[serde(default)]
    pub tracker: TrackerConfig,

    #[serde(default)]
    pub rate_gate: RateGateConfig,
}

impl EngineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing engine config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `ENGINE_CONFIG_PATH` (default `engine.toml`), falling back to defaults
    pub fn from_env() -> Self {
        let path =
            std::env::var("ENGINE_CONFIG_PATH").unwrap_or_else(|_| "engine.toml".to_string());

        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default engine config ({}): {:#}", path, e);
            Self::default()
        })
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.clock.tick_size_secs > 0.0) {
            bail!("clock.tick_size_secs must be positive");
        }
        if !(self.tracker.create_timeout_secs > 0.0) {
            bail!("tracker.create_timeout_secs must be positive");
        }
        if self.tracker.terminal_grace_secs < 0.0 {
            bail!("tracker.terminal_grace_secs must not be negative");
        }
        for limit in &self.rate_gate.limits {
            if limit.max_requests == 0 || !(limit.window_secs > 0.0) {
                bail!("rate limit '{}' needs max_requests > 0 and window_secs > 0", limit.limit_id);
            }
        }
        Ok(())
    }
}

/// Clock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Seconds between cycles
    #[serde(default = "default_tick_size_secs")]
    pub tick_size_secs: f64,
}

fn default_tick_size_secs() -> f64 {
    1.0
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            tick_size_secs: default_tick_size_secs(),
        }
    }
}

/// Order tracker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// In-flight timeout: PENDING_CREATE orders older than this fail
    #[serde(default = "default_create_timeout_secs")]
    pub create_timeout_secs: f64,

    /// How long terminal orders stay in the active map before archiving
    #[serde(default = "default_terminal_grace_secs")]
    pub terminal_grace_secs: f64,

    /// Archived (evicted) orders kept for lookups
    #[serde(default = "default_archive_capacity")]
    pub archive_capacity: usize,

    /// How long exchange-id-only events wait for the ack that binds them
    #[serde(default = "default_unmatched_event_ttl_secs")]
    pub unmatched_event_ttl_secs: f64,

    /// Cadence of reconciliation against venue open orders
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: f64,

    /// Prefix of generated client order ids
    #[serde(default = "default_client_order_id_prefix")]
    pub client_order_id_prefix: String,

    /// Amounts closer than this are considered equal
    #[serde(default = "default_amount_epsilon")]
    pub amount_epsilon: f64,
}

fn default_create_timeout_secs() -> f64 {
    10.0
}
fn default_terminal_grace_secs() -> f64 {
    30.0
}
fn default_archive_capacity() -> usize {
    1_000
}
fn default_unmatched_event_ttl_secs() -> f64 {
    5.0
}
fn default_reconcile_interval_secs() -> f64 {
    60.0
}
fn default_client_order_id_prefix() -> String {
    "eng".to_string()
}
fn default_amount_epsilon() -> f64 {
    1e-9
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            create_timeout_secs: default_create_timeout_secs(),
            terminal_grace_secs: default_terminal_grace_secs(),
            archive_capacity: default_archive_capacity(),
            unmatched_event_ttl_secs: default_unmatched_event_ttl_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            client_order_id_prefix: default_client_order_id_prefix(),
            amount_epsilon: default_amount_epsilon(),
        }
    }
}

impl TrackerConfig {
    pub fn create_timeout(&self) -> Nanos {
        secs_to_nanos(self.create_timeout_secs)
    }

    pub fn terminal_grace(&self) -> Nanos {
        secs_to_nanos(self.terminal_grace_secs)
    }

    pub fn unmatched_event_ttl(&self) -> Nanos {
        secs_to_nanos(self.unmatched_event_ttl_secs)
    }

    pub fn reconcile_interval(&self) -> Nanos {
        secs_to_nanos(self.reconcile_interval_secs)
    }
}

/// Rate gate configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateGateConfig {
    #[serde(default)]
    pub limits: Vec<RateLimitConfig>,
}

/// One named sliding-window limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub limit_id: String,
    pub max_requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: f64,
}

fn default_window_secs() -> f64 {
    1.0
}

impl RateLimitConfig {
    pub fn new(limit_id: impl Into<String>, max_requests: u32, window_secs: f64) -> Self {
        Self {
            limit_id: limit_id.into(),
            max_requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Nanos {
        secs_to_nanos(self.window_secs)
    }
}
