//! Execution Engine Library
//!
//! Tick-driven execution core: Clock, EventBus, OrderTracker and RateGate.
//! Binaries and integration tests build on the `engine` module.

pub mod engine;
