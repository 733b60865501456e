//! Execution Engine
//!
//! Tick-driven trading execution core: one Clock drives every component on a
//! fixed cadence, venue events fan out over an in-process bus, and the order
//! tracker keeps one consistent record per order.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Clock                                │
//! │  (live: wall time, tick-aligned / backtest: virtual time)       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │ tick(t) in registration order
//!        ┌───────────────────────┼───────────────────────┐
//!        ▼                       ▼                       ▼
//! ┌─────────────┐        ┌─────────────┐        ┌─────────────┐
//! │ Connector / │        │  Strategy   │        │ OrderTracker│
//! │ Historical  │        │             │        │  (timeout   │
//! │ Feed        │        │             │        │   sweep)    │
//! └──────┬──────┘        └──────┬──────┘        └──────▲──────┘
//!        │ publish               │ start_tracking       │
//!        ▼                       └──────────────────────┤
//! ┌─────────────────────────────────────────────────────┴───────────┐
//! │                          EventBus                               │
//! │  synchronous fan-out, subscription order, failures isolated     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Determinism
//!
//! - **Time**: integer nanoseconds; backtests never read the system clock
//! - **Ticks**: registration order, one `Tick` value per cycle
//! - **Dispatch**: subscription order; nested publishes queue behind the
//!   event being dispatched

pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod feed;
pub mod order_tracker;
pub mod rate_gate;
pub mod replay;
pub mod tickable;
pub mod time;

pub use clock::{Clock, ClockHandle, ClockStats};
pub use config::{ClockConfig, EngineConfig, RateGateConfig, RateLimitConfig, TrackerConfig};
pub use error::{EngineError, TickError};
pub use event_bus::{BusStats, EventBus, Handler, SubscriptionId};
pub use events::{
    Event, EventPayload, EventSource, EventType, FailureReason, FillUpdate, OrderRef, OrderType,
    Side,
};
pub use feed::HistoricalFeed;
pub use order_tracker::{
    Anomaly, EventOutcome, OrderIntent, OrderRecord, OrderStatus, OrderTracker,
    ReconciliationReport, TrackerError, TrackerStats, VenueOpenOrder,
};
pub use rate_gate::{LimitStats, RateGate, RateGateError, RatePermit};
pub use replay::{run_scenario, ReplayScenario, ReplaySummary, ScheduledIntent, ScriptedStrategy};
pub use tickable::{Tick, Tickable, TickableKind};
pub use time::{Nanos, TimeSource, VirtualTime, WallClock};
