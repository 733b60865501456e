//! Tickable Capability
//!
//! The one interface the Clock drives. Connectors, strategies, the order
//! tracker sweep and the historical feed all implement it identically.

use crate::engine::error::TickError;
use crate::engine::time::{nanos_to_secs, Nanos};
use serde::{Deserialize, Serialize};

/// One logical instant delivered by the Clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    /// Cycle timestamp in nanoseconds.
    pub timestamp: Nanos,
    /// Nominal tick interval in nanoseconds.
    pub interval: Nanos,
    /// Zero-based cycle index within the owning Clock.
    pub cycle: u64,
}

impl Tick {
    #[inline]
    pub fn new(timestamp: Nanos, interval: Nanos, cycle: u64) -> Self {
        Self {
            timestamp,
            interval,
            cycle,
        }
    }

    /// Timestamp as floating-point seconds.
    #[inline]
    pub fn timestamp_secs(&self) -> f64 {
        nanos_to_secs(self.timestamp)
    }
}

/// Label used in logs and diagnostics; the Clock never branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TickableKind {
    Connector,
    Strategy,
    /// Engine-internal services (order tracker sweep, historical feed).
    Service,
}

/// Component driven once per Clock cycle.
///
/// Hooks run on the Clock's thread and must not block on network I/O;
/// asynchronous work is started in one tick and its results are picked up in
/// a later one.
pub trait Tickable: Send {
    /// Identity. The Clock keeps at most one component per name.
    fn name(&self) -> &str;

    fn kind(&self) -> TickableKind {
        TickableKind::Strategy
    }

    /// Called once before the component's first tick.
    fn initialize(&mut self, _tick: &Tick) -> Result<(), TickError> {
        Ok(())
    }

    fn tick(&mut self, tick: &Tick) -> Result<(), TickError>;

    /// Called once after the last tick, on stop, or on removal.
    fn teardown(&mut self, _tick: &Tick) {}
}

impl<T: Tickable + ?Sized> Tickable for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn kind(&self) -> TickableKind {
        (**self).kind()
    }

    fn initialize(&mut self, tick: &Tick) -> Result<(), TickError> {
        (**self).initialize(tick)
    }

    fn tick(&mut self, tick: &Tick) -> Result<(), TickError> {
        (**self).tick(tick)
    }

    fn teardown(&mut self, tick: &Tick) {
        (**self).teardown(tick)
    }
}
