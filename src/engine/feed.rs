//! Historical Feed
//!
//! Backtest data boundary. Holds a timestamp-ordered list of venue events and
//! publishes, on each tick, every event due at or before the tick time.

use crate::engine::error::TickError;
use crate::engine::event_bus::EventBus;
use crate::engine::events::Event;
use crate::engine::tickable::{Tick, Tickable, TickableKind};
use crate::engine::time::Nanos;
use anyhow::Context;
use std::path::Path;

/// Replays recorded events onto the bus in timestamp order.
pub struct HistoricalFeed {
    name: String,
    bus: EventBus,
    events: Vec<Event>,
    index: usize,
    /// Pushed after their time had already been ticked past.
    late: Vec<Event>,
    last_tick: Option<Nanos>,
    published: u64,
}

impl HistoricalFeed {
    pub fn new(name: impl Into<String>, bus: EventBus, mut events: Vec<Event>) -> Self {
        // Stable: equal timestamps keep their recorded order.
        events.sort_by_key(|e| e.timestamp);
        Self {
            name: name.into(),
            bus,
            events,
            index: 0,
            late: Vec::new(),
            last_tick: None,
            published: 0,
        }
    }

    /// Load a JSON array of events.
    pub fn from_json_file(
        name: impl Into<String>,
        bus: EventBus,
        path: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading feed {}", path.display()))?;
        let events: Vec<Event> = serde_json::from_str(&contents)
            .with_context(|| format!("parsing feed {}", path.display()))?;
        Ok(Self::new(name, bus, events))
    }

    /// Add an event. Events older than the last tick go out on the next tick.
    pub fn push(&mut self, event: Event) {
        if let Some(last) = self.last_tick {
            if event.timestamp <= last {
                tracing::warn!(
                    feed = %self.name,
                    event_type = %event.event_type(),
                    timestamp = event.timestamp,
                    last_tick = last,
                    "Event pushed behind the feed cursor; publishing on next tick"
                );
                self.late.push(event);
                return;
            }
        }
        let pos = self.index
            + self.events[self.index..].partition_point(|e| e.timestamp <= event.timestamp);
        self.events.insert(pos, event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.events.len() - self.index + self.late.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    /// Timestamp of the next due event.
    pub fn peek_time(&self) -> Option<Nanos> {
        self.events.get(self.index).map(|e| e.timestamp)
    }

    /// Rewind to the first event.
    pub fn reset(&mut self) {
        self.index = 0;
        self.late.clear();
        self.last_tick = None;
        self.published = 0;
    }

    fn publish_due(&mut self, now: Nanos) -> usize {
        let mut count = 0;
        for event in std::mem::take(&mut self.late) {
            self.bus.publish(event);
            count += 1;
        }
        while let Some(event) = self.events.get(self.index) {
            if event.timestamp > now {
                break;
            }
            self.bus.publish(event.clone());
            self.index += 1;
            count += 1;
        }
        self.published += count as u64;
        count
    }
}

impl Tickable for HistoricalFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TickableKind {
        TickableKind::Connector
    }

    fn tick(&mut self, tick: &Tick) -> Result<(), TickError> {
        let count = self.publish_due(tick.timestamp);
        if count > 0 {
            tracing::trace!(feed = %self.name, count, cycle = tick.cycle, "Published feed events");
        }
        self.last_tick = Some(tick.timestamp);
        Ok(())
    }

    fn teardown(&mut self, _tick: &Tick) {
        let remaining = self.remaining();
        if remaining > 0 {
            tracing::info!(feed = %self.name, remaining, "Feed stopped with undelivered events");
        }
    }
}
