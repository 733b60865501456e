//! Scenario replay
//!
//! Runs a recorded scenario (scheduled order intents plus venue events)
//! through a backtest Clock, the EventBus and the OrderTracker, and
//! summarizes the outcome.

use crate::engine::clock::{Clock, ClockStats};
use crate::engine::config::EngineConfig;
use crate::engine::error::TickError;
use crate::engine::event_bus::{BusStats, EventBus};
use crate::engine::events::Event;
use crate::engine::feed::HistoricalFeed;
use crate::engine::order_tracker::{OrderIntent, OrderRecord, OrderTracker, TrackerStats};
use crate::engine::tickable::{Tick, Tickable};
use crate::engine::time::{secs_to_nanos, Nanos};
use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// An intent submitted once the clock reaches `at_secs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledIntent {
    pub at_secs: f64,
    #[serde(flatten)]
    pub intent: OrderIntent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayScenario {
    pub start_secs: f64,
    pub end_secs: f64,
    /// Overrides `clock.tick_size_secs` from the engine config.
    #[serde(default)]
    pub tick_size_secs: Option<f64>,
    #[serde(default)]
    pub intents: Vec<ScheduledIntent>,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl ReplayScenario {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing scenario {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub clock: ClockStats,
    pub bus: BusStats,
    pub tracker: TrackerStats,
    /// Active and archived orders in creation order.
    pub orders: Vec<OrderRecord>,
    pub rejected_intents: Vec<String>,
}

/// Strategy stand-in that submits pre-scheduled intents.
pub struct ScriptedStrategy {
    tracker: OrderTracker,
    schedule: Vec<(Nanos, OrderIntent)>,
    index: usize,
    rejected: Arc<Mutex<Vec<String>>>,
}

impl ScriptedStrategy {
    pub fn new(tracker: OrderTracker, intents: Vec<ScheduledIntent>) -> Self {
        let mut schedule: Vec<(Nanos, OrderIntent)> = intents
            .into_iter()
            .map(|s| (secs_to_nanos(s.at_secs), s.intent))
            .collect();
        schedule.sort_by_key(|(at, _)| *at);
        Self {
            tracker,
            schedule,
            index: 0,
            rejected: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared view of rejected intents; stays readable after the Clock owns
    /// the strategy.
    pub fn rejections(&self) -> Arc<Mutex<Vec<String>>> {
        self.rejected.clone()
    }
}

impl Tickable for ScriptedStrategy {
    fn name(&self) -> &str {
        "scripted_strategy"
    }

    fn tick(&mut self, tick: &Tick) -> Result<(), TickError> {
        while let Some((at, intent)) = self.schedule.get(self.index) {
            if *at > tick.timestamp {
                break;
            }
            match self.tracker.start_tracking_at(intent.clone(), tick.timestamp) {
                Ok(id) => tracing::debug!(client_order_id = %id, "Submitted scheduled intent"),
                Err(e) => {
                    tracing::warn!(error = %e, "Scheduled intent rejected");
                    self.rejected.lock().push(e.to_string());
                }
            }
            self.index += 1;
        }
        Ok(())
    }

    fn teardown(&mut self, _tick: &Tick) {
        let rejected = self.rejected.lock().len();
        if rejected > 0 {
            tracing::warn!(rejected, "Scenario had rejected intents");
        }
    }
}

/// Run a scenario to completion on a fresh engine.
pub fn run_scenario(config: &EngineConfig, scenario: ReplayScenario) -> anyhow::Result<ReplaySummary> {
    config.validate()?;
    let tick_size = scenario
        .tick_size_secs
        .unwrap_or(config.clock.tick_size_secs);

    let bus = EventBus::new();
    let tracker = OrderTracker::new(bus.clone(), config.tracker.clone());
    tracker.attach();

    let strategy = ScriptedStrategy::new(tracker.clone(), scenario.intents);
    let rejected = strategy.rejections();

    let mut clock = Clock::backtest_secs(scenario.start_secs, scenario.end_secs, tick_size)?;
    clock.register(strategy);
    clock.register(HistoricalFeed::new("historical", bus.clone(), scenario.events));
    clock.register(tracker.clone());

    let clock_stats = clock.run_backtest()?;

    let orders = tracker.all_orders();
    let rejected_intents = rejected.lock().clone();
    Ok(ReplaySummary {
        clock: clock_stats,
        bus: bus.stats(),
        tracker: tracker.stats(),
        orders,
        rejected_intents,
    })
}
