//! Rate Gate
//!
//! Named sliding-window request limits shared by every connector of one
//! engine. A granted request returns a [`RatePermit`]; dropping the permit
//! releases its in-flight slot and records the call latency. Window slots
//! expire on their own once `window` has passed.

use crate::engine::config::{RateGateConfig, RateLimitConfig};
use crate::engine::error::EngineError;
use crate::engine::time::{Nanos, TimeSource, WallClock};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Rate gate errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateGateError {
    /// No limit with this id was configured.
    UnknownLimit(String),
    /// Window is full; capacity frees up after `retry_after` nanoseconds.
    Exhausted { limit_id: String, retry_after: Nanos },
    /// The wall clock could not be read while waiting.
    TimeSource(String),
}

impl fmt::Display for RateGateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateGateError::UnknownLimit(id) => write!(f, "unknown rate limit: {}", id),
            RateGateError::Exhausted {
                limit_id,
                retry_after,
            } => write!(
                f,
                "rate limit '{}' exhausted, retry in {}ns",
                limit_id, retry_after
            ),
            RateGateError::TimeSource(msg) => write!(f, "rate gate clock failure: {}", msg),
        }
    }
}

impl std::error::Error for RateGateError {}

/// Per-limit counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LimitStats {
    pub granted: u64,
    pub rejected: u64,
    pub in_flight: u32,
    /// Requests currently counted in the window.
    pub window_usage: usize,
    pub completed: u64,
    pub total_latency_ns: u64,
    pub max_latency_ns: u64,
}

impl LimitStats {
    pub fn mean_latency_ns(&self) -> u64 {
        if self.completed == 0 {
            0
        } else {
            self.total_latency_ns / self.completed
        }
    }
}

struct LimitState {
    window_ns: Nanos,
    max_requests: u32,
    /// Grant timestamps inside the window.
    requests: VecDeque<Nanos>,
    stats: LimitStats,
}

impl LimitState {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            window_ns: config.window(),
            max_requests: config.max_requests,
            requests: VecDeque::with_capacity(config.max_requests as usize),
            stats: LimitStats::default(),
        }
    }

    fn expire(&mut self, now: Nanos) {
        let cutoff = now - self.window_ns;
        while let Some(&front) = self.requests.front() {
            if front <= cutoff {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }

    /// Grant a slot, or report how long until the oldest one expires.
    fn try_grant(&mut self, now: Nanos) -> Result<(), Nanos> {
        self.expire(now);
        if self.requests.len() >= self.max_requests as usize {
            self.stats.rejected += 1;
            let oldest = self.requests.front().copied().unwrap_or(now);
            return Err((oldest + self.window_ns - now).max(1));
        }
        self.requests.push_back(now);
        self.stats.granted += 1;
        self.stats.in_flight += 1;
        Ok(())
    }
}

struct GateInner {
    limits: Mutex<HashMap<String, LimitState>>,
}

/// Shared, clonable rate gate.
#[derive(Clone)]
pub struct RateGate {
    inner: Arc<GateInner>,
}

impl RateGate {
    pub fn new(limits: impl IntoIterator<Item = RateLimitConfig>) -> Self {
        let limits = limits
            .into_iter()
            .map(|c| (c.limit_id.clone(), LimitState::new(&c)))
            .collect();
        Self {
            inner: Arc::new(GateInner {
                limits: Mutex::new(limits),
            }),
        }
    }

    pub fn from_config(config: &RateGateConfig) -> Self {
        Self::new(config.limits.iter().cloned())
    }

    /// Add or replace a limit. Replacing resets its window.
    pub fn set_limit(&self, config: RateLimitConfig) {
        self.inner
            .limits
            .lock()
            .insert(config.limit_id.clone(), LimitState::new(&config));
    }

    pub fn limit_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.limits.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Try to take a slot at `now` without waiting.
    pub fn try_acquire(&self, limit_id: &str, now: Nanos) -> Result<RatePermit, RateGateError> {
        let mut limits = self.inner.limits.lock();
        let state = limits
            .get_mut(limit_id)
            .ok_or_else(|| RateGateError::UnknownLimit(limit_id.to_string()))?;

        match state.try_grant(now) {
            Ok(()) => Ok(RatePermit {
                gate: self.clone(),
                limit_id: limit_id.to_string(),
                acquired_at: now,
                started: Instant::now(),
                released: false,
            }),
            Err(retry_after) => {
                tracing::debug!(limit_id, retry_after_ns = retry_after, "Rate limit exhausted");
                Err(RateGateError::Exhausted {
                    limit_id: limit_id.to_string(),
                    retry_after,
                })
            }
        }
    }

    /// Wait on wall-clock time until a slot frees up.
    pub async fn acquire(&self, limit_id: &str) -> Result<RatePermit, RateGateError> {
        let mut clock = WallClock;
        loop {
            let now = clock
                .now()
                .map_err(|e: EngineError| RateGateError::TimeSource(e.to_string()))?;
            match self.try_acquire(limit_id, now) {
                Ok(permit) => return Ok(permit),
                Err(RateGateError::Exhausted { retry_after, .. }) => {
                    tokio::time::sleep(Duration::from_nanos(retry_after as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remaining capacity at `now`.
    pub fn available(&self, limit_id: &str, now: Nanos) -> Option<u32> {
        let mut limits = self.inner.limits.lock();
        let state = limits.get_mut(limit_id)?;
        state.expire(now);
        Some(state.max_requests.saturating_sub(state.requests.len() as u32))
    }

    pub fn stats(&self, limit_id: &str) -> Option<LimitStats> {
        let limits = self.inner.limits.lock();
        limits.get(limit_id).map(|s| {
            let mut stats = s.stats.clone();
            stats.window_usage = s.requests.len();
            stats
        })
    }

    fn release(&self, limit_id: &str, latency_ns: u64) {
        let mut limits = self.inner.limits.lock();
        if let Some(state) = limits.get_mut(limit_id) {
            state.stats.in_flight = state.stats.in_flight.saturating_sub(1);
            state.stats.completed += 1;
            state.stats.total_latency_ns += latency_ns;
            state.stats.max_latency_ns = state.stats.max_latency_ns.max(latency_ns);
        }
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl fmt::Debug for RateGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateGate")
            .field("limits", &self.limit_ids())
            .finish()
    }
}

/// Scoped grant of one request slot.
#[must_use = "dropping the permit immediately ends the call it guards"]
pub struct RatePermit {
    gate: RateGate,
    limit_id: String,
    acquired_at: Nanos,
    started: Instant,
    released: bool,
}

impl RatePermit {
    pub fn limit_id(&self) -> &str {
        &self.limit_id
    }

    pub fn acquired_at(&self) -> Nanos {
        self.acquired_at
    }

    /// Release with a latency measured on the caller's time base.
    pub fn release_at(mut self, now: Nanos) {
        let latency = (now - self.acquired_at).max(0) as u64;
        self.gate.release(&self.limit_id, latency);
        self.released = true;
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        if !self.released {
            let latency = self.started.elapsed().as_nanos() as u64;
            self.gate.release(&self.limit_id, latency);
        }
    }
}

impl fmt::Debug for RatePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatePermit")
            .field("limit_id", &self.limit_id)
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}
