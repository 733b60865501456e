//! Time Sources
//!
//! Integer-nanosecond time base shared by every engine component.
//! Live runs read the wall clock; backtests read a virtual cursor that only the
//! `Clock` advances, so replays never observe system time.

use crate::engine::error::EngineError;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds since Unix epoch (or since the virtual origin of a backtest).
pub type Nanos = i64;

pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Convert floating-point seconds to nanoseconds (rounded to the nearest ns).
#[inline]
pub fn secs_to_nanos(secs: f64) -> Nanos {
    (secs * NANOS_PER_SEC as f64).round() as Nanos
}

/// Convert nanoseconds to floating-point seconds.
#[inline]
pub fn nanos_to_secs(nanos: Nanos) -> f64 {
    nanos as f64 / NANOS_PER_SEC as f64
}

/// Source of "current time" for a Clock.
pub trait TimeSource: Send {
    /// Current time. An error here is fatal for the owning Clock.
    fn now(&mut self) -> Result<Nanos, EngineError>;

    /// Whether this source is a virtual (backtest) cursor.
    fn is_virtual(&self) -> bool {
        false
    }
}

/// Wall-clock time source for live trading.
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock;

impl TimeSource for WallClock {
    fn now(&mut self) -> Result<Nanos, EngineError> {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| EngineError::TimeSource(format!("system clock before epoch: {}", e)))?;
        i64::try_from(elapsed.as_nanos())
            .map_err(|_| EngineError::TimeSource("system clock out of i64 range".into()))
    }
}

/// Monotonic virtual cursor for backtests.
///
/// # Determinism Contract
/// - `now()` returns the cursor, never system time
/// - `advance_to()` only moves forward
/// - the cursor moves only when the owning Clock advances it
#[derive(Debug, Clone)]
pub struct VirtualTime {
    current: Nanos,
}

impl VirtualTime {
    #[inline]
    pub fn new(start_time: Nanos) -> Self {
        Self {
            current: start_time,
        }
    }

    #[inline]
    pub fn from_unix_secs(secs: i64) -> Self {
        Self::new(secs * NANOS_PER_SEC)
    }

    #[inline]
    pub fn current(&self) -> Nanos {
        self.current
    }

    /// Advance the cursor. Moving backward is rejected.
    #[inline]
    pub fn advance_to(&mut self, new_time: Nanos) -> Result<(), EngineError> {
        if new_time < self.current {
            return Err(EngineError::TimeSource(format!(
                "virtual time cannot go backward from {} to {}",
                self.current, new_time
            )));
        }
        self.current = new_time;
        Ok(())
    }

    #[inline]
    pub fn advance_by(&mut self, delta: Nanos) -> Result<(), EngineError> {
        self.advance_to(self.current.saturating_add(delta.max(0)))
    }
}

impl Default for VirtualTime {
    fn default() -> Self {
        Self::new(0)
    }
}

impl TimeSource for VirtualTime {
    fn now(&mut self) -> Result<Nanos, EngineError> {
        Ok(self.current)
    }

    fn is_virtual(&self) -> bool {
        true
    }
}

impl fmt::Display for VirtualTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.current / NANOS_PER_SEC;
        let nanos = self.current % NANOS_PER_SEC;
        write!(f, "{}.{:09}s", secs, nanos)
    }
}

#[inline]
pub fn datetime_to_nanos(dt: &chrono::DateTime<chrono::Utc>) -> Nanos {
    dt.timestamp_nanos_opt().unwrap_or(0)
}

/// Render nanoseconds as a UTC datetime; `None` when out of chrono's range.
#[inline]
pub fn nanos_to_datetime(nanos: Nanos) -> Option<chrono::DateTime<chrono::Utc>> {
    use chrono::TimeZone;
    let secs = nanos.div_euclid(NANOS_PER_SEC);
    let nsecs = nanos.rem_euclid(NANOS_PER_SEC) as u32;
    chrono::Utc.timestamp_opt(secs, nsecs).single()
}

/// Parse an RFC 3339 string to nanoseconds.
pub fn parse_timestamp(s: &str) -> Option<Nanos> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| datetime_to_nanos(&dt.with_timezone(&chrono::Utc)))
}
