//! Clock
//!
//! Tick scheduler that drives every registered `Tickable` from one time base.
//!
//! # Determinism Contract
//! - components are ticked synchronously, in registration order, once per cycle
//! - timestamps never decrease across cycles of one Clock
//! - in backtest mode the cursor advances by exactly `tick_size` per cycle and
//!   wall-clock time is never consulted, so identical inputs replay identically
//!
//! # Live Mode
//! Cycles are aligned to multiples of `tick_size`. A cycle that overruns its
//! interval is followed immediately by the next one and recorded as lag;
//! ticks are compressed, never dropped.

use crate::engine::error::{EngineError, TickError};
use crate::engine::tickable::{Tick, Tickable, TickableKind};
use crate::engine::time::{secs_to_nanos, Nanos, TimeSource, VirtualTime, WallClock};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Clock counters and lag diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockStats {
    pub cycles: u64,
    pub ticks_delivered: u64,
    pub recoverable_errors: u64,
    /// Live cycles whose work overran `tick_size`.
    pub lagged_cycles: u64,
    pub max_lag_ns: i64,
    /// Wall-clock readings that went backward and were clamped.
    pub time_corrections: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopped,
}

enum TimeBase {
    Live(Box<dyn TimeSource>),
    Backtest {
        cursor: VirtualTime,
        end: Nanos,
        next: Nanos,
    },
}

struct Entry {
    name: String,
    kind: TickableKind,
    component: Box<dyn Tickable>,
    initialized: bool,
}

/// State shared between a Clock and its handles.
struct Control {
    stop_requested: AtomicBool,
    running: AtomicBool,
    /// Held while a tick executes; `stop` takes it so that an external caller
    /// returns only once the in-progress tick has finished. Reentrant so a
    /// tick may stop its own Clock.
    fence: ReentrantMutex<()>,
    wake: Notify,
    pending_add: Mutex<Vec<Box<dyn Tickable>>>,
    pending_remove: Mutex<HashSet<String>>,
}

/// Cloneable control handle for tickables and other threads.
#[derive(Clone)]
pub struct ClockHandle {
    control: Arc<Control>,
}

impl ClockHandle {
    /// Request the Clock to stop. No tick is delivered after this returns.
    pub fn stop(&self) {
        let _fence = self.control.fence.lock();
        self.control.stop_requested.store(true, Ordering::SeqCst);
        self.control.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.control.running.load(Ordering::SeqCst)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.control.stop_requested.load(Ordering::SeqCst)
    }

    /// Register a component; takes effect on the next cycle.
    pub fn register(&self, component: Box<dyn Tickable>) {
        self.control.pending_add.lock().push(component);
    }

    /// Remove a component by name. It receives no further ticks, including in
    /// the current cycle, and is torn down before the next one.
    pub fn remove(&self, name: &str) {
        self.control.pending_remove.lock().insert(name.to_string());
    }
}

/// Tick scheduler. One instance per engine; instances share nothing.
pub struct Clock {
    time: TimeBase,
    tick_size: Nanos,
    entries: Vec<Entry>,
    control: Arc<Control>,
    state: RunState,
    cycle: u64,
    last_timestamp: Option<Nanos>,
    stats: ClockStats,
}

impl Clock {
    /// Live clock on the system wall clock.
    pub fn live(tick_size: Duration) -> Result<Self, EngineError> {
        Self::with_time_source(tick_size, Box::new(WallClock))
    }

    /// Live clock on a custom time source.
    pub fn with_time_source(
        tick_size: Duration,
        source: Box<dyn TimeSource>,
    ) -> Result<Self, EngineError> {
        let tick_size = i64::try_from(tick_size.as_nanos())
            .map_err(|_| EngineError::InvalidConfig("tick size out of range".into()))?;
        Self::build(TimeBase::Live(source), tick_size)
    }

    /// Deterministic virtual-time clock ticking at `start`, `start + tick_size`,
    /// ... up to and including `end`.
    pub fn backtest(start: Nanos, end: Nanos, tick_size: Nanos) -> Result<Self, EngineError> {
        if end < start {
            return Err(EngineError::InvalidConfig(format!(
                "backtest end {} precedes start {}",
                end, start
            )));
        }
        Self::build(
            TimeBase::Backtest {
                cursor: VirtualTime::new(start),
                end,
                next: start,
            },
            tick_size,
        )
    }

    /// Backtest clock from floating-point seconds.
    pub fn backtest_secs(start: f64, end: f64, tick_size: f64) -> Result<Self, EngineError> {
        Self::backtest(
            secs_to_nanos(start),
            secs_to_nanos(end),
            secs_to_nanos(tick_size),
        )
    }

    fn build(time: TimeBase, tick_size: Nanos) -> Result<Self, EngineError> {
        if tick_size <= 0 {
            return Err(EngineError::InvalidConfig(format!(
                "tick size must be positive, got {}ns",
                tick_size
            )));
        }
        Ok(Self {
            time,
            tick_size,
            entries: Vec::new(),
            control: Arc::new(Control {
                stop_requested: AtomicBool::new(false),
                running: AtomicBool::new(false),
                fence: ReentrantMutex::new(()),
                wake: Notify::new(),
                pending_add: Mutex::new(Vec::new()),
                pending_remove: Mutex::new(HashSet::new()),
            }),
            state: RunState::Idle,
            cycle: 0,
            last_timestamp: None,
            stats: ClockStats::default(),
        })
    }

    pub fn handle(&self) -> ClockHandle {
        ClockHandle {
            control: self.control.clone(),
        }
    }

    /// Add a component to the tick list. Returns false (no-op) if a component
    /// with the same name is already registered.
    pub fn register<T: Tickable + 'static>(&mut self, component: T) -> bool {
        self.register_boxed(Box::new(component))
    }

    pub fn register_boxed(&mut self, component: Box<dyn Tickable>) -> bool {
        let name = component.name().to_string();
        if self.entries.iter().any(|e| e.name == name) {
            tracing::warn!(component = %name, "Tickable already registered; ignoring");
            return false;
        }
        tracing::debug!(component = %name, kind = ?component.kind(), "Registered tickable");
        self.entries.push(Entry {
            name,
            kind: component.kind(),
            component,
            initialized: false,
        });
        true
    }

    /// Remove a component, tearing it down if it has been initialized.
    pub fn remove(&mut self, name: &str) -> bool {
        let Some(idx) = self.entries.iter().position(|e| e.name == name) else {
            return false;
        };
        let mut entry = self.entries.remove(idx);
        if entry.initialized {
            let tick = self.current_tick();
            entry.component.teardown(&tick);
        }
        true
    }

    /// Stop the Clock and tear down every initialized component.
    pub fn stop(&mut self) {
        self.handle().stop();
        if self.state == RunState::Running {
            self.finish();
        }
    }

    pub fn tickable_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn tick_size(&self) -> Nanos {
        self.tick_size
    }

    pub fn is_backtest(&self) -> bool {
        matches!(self.time, TimeBase::Backtest { .. })
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    /// Timestamp of the last delivered cycle.
    pub fn current_timestamp(&self) -> Option<Nanos> {
        self.last_timestamp
    }

    pub fn stats(&self) -> ClockStats {
        self.stats.clone()
    }

    /// Run until stopped (live) or until the backtest window ends.
    pub async fn start(&mut self) -> Result<ClockStats, EngineError> {
        if self.is_backtest() {
            self.run_backtest()
        } else {
            self.run().await
        }
    }

    /// Live run loop. Returns once `stop` is called or a fatal error occurs.
    pub async fn run(&mut self) -> Result<ClockStats, EngineError> {
        if self.is_backtest() {
            return Err(EngineError::InvalidConfig(
                "live run requested on a backtest clock".into(),
            ));
        }
        self.begin()?;
        let control = self.control.clone();
        tracing::info!(tick_size_ns = self.tick_size, "Clock started (live)");

        let outcome = loop {
            if control.stop_requested.load(Ordering::SeqCst) {
                break Ok(());
            }
            let now = match self.live_now() {
                Ok(now) => now,
                Err(e) => break Err(e),
            };
            let started = tokio::time::Instant::now();
            if let Err(e) = self.run_cycle(now) {
                break Err(e);
            }
            if control.stop_requested.load(Ordering::SeqCst) {
                break Ok(());
            }

            let work = i64::try_from(started.elapsed().as_nanos()).unwrap_or(i64::MAX);
            if work >= self.tick_size {
                let lag = work - self.tick_size;
                self.stats.lagged_cycles += 1;
                self.stats.max_lag_ns = self.stats.max_lag_ns.max(lag);
                tracing::warn!(
                    cycle = self.cycle,
                    timestamp = now,
                    work_ns = work,
                    lag_ns = lag,
                    "Clock cycle overran tick size; next cycle starts immediately"
                );
                tokio::task::yield_now().await;
                continue;
            }

            let wall = match self.live_now() {
                Ok(wall) => wall,
                Err(e) => break Err(e),
            };
            let next_boundary = (now / self.tick_size + 1) * self.tick_size;
            let wait = next_boundary - wall;
            if wait <= 0 {
                continue;
            }
            let deadline = tokio::time::Instant::now() + Duration::from_nanos(wait as u64);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = control.wake.notified() => {
                        if control.stop_requested.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                }
            }
        };

        self.finish();
        outcome.map(|_| self.stats.clone())
    }

    /// Run the whole backtest window, then tear down.
    pub fn run_backtest(&mut self) -> Result<ClockStats, EngineError> {
        let end = match &self.time {
            TimeBase::Backtest { end, .. } => *end,
            TimeBase::Live(_) => {
                return Err(EngineError::InvalidConfig(
                    "backtest run requested on a live clock".into(),
                ))
            }
        };
        self.backtest_til(end)?;
        if self.state == RunState::Running {
            self.finish();
        }
        Ok(self.stats.clone())
    }

    /// Advance virtual time, ticking every cycle with timestamp <= `target`
    /// (capped at the window end). Components stay initialized between calls.
    pub fn backtest_til(&mut self, target: Nanos) -> Result<(), EngineError> {
        if !self.is_backtest() {
            return Err(EngineError::InvalidConfig(
                "backtest_til requires a backtest clock".into(),
            ));
        }
        if self.state == RunState::Idle {
            self.begin()?;
            tracing::info!(tick_size_ns = self.tick_size, "Clock started (backtest)");
        } else if self.state == RunState::Stopped {
            return Err(EngineError::Stopped);
        }

        loop {
            if self.control.stop_requested.load(Ordering::SeqCst) {
                self.finish();
                return Ok(());
            }
            let now = match &mut self.time {
                TimeBase::Backtest { cursor, end, next } => {
                    if *next > target.min(*end) {
                        return Ok(());
                    }
                    let tick_at = *next;
                    *next += self.tick_size;
                    cursor.advance_to(tick_at)?;
                    cursor.now()?
                }
                TimeBase::Live(_) => {
                    return Err(EngineError::InvalidConfig("not a backtest clock".into()))
                }
            };
            if let Err(e) = self.run_cycle(now) {
                self.finish();
                return Err(e);
            }
        }
    }

    fn begin(&mut self) -> Result<(), EngineError> {
        match self.state {
            RunState::Running => return Err(EngineError::AlreadyRunning),
            RunState::Stopped => return Err(EngineError::Stopped),
            RunState::Idle => {}
        }
        self.control.stop_requested.store(false, Ordering::SeqCst);
        self.control.running.store(true, Ordering::SeqCst);
        self.state = RunState::Running;
        Ok(())
    }

    /// Tear down every initialized component and mark the Clock stopped.
    fn finish(&mut self) {
        let tick = self.current_tick();
        for entry in self.entries.iter_mut().filter(|e| e.initialized) {
            entry.component.teardown(&tick);
            entry.initialized = false;
        }
        self.state = RunState::Stopped;
        self.control.running.store(false, Ordering::SeqCst);
        tracing::info!(
            cycles = self.stats.cycles,
            recoverable_errors = self.stats.recoverable_errors,
            lagged_cycles = self.stats.lagged_cycles,
            "Clock stopped"
        );
    }

    fn current_tick(&self) -> Tick {
        Tick::new(
            self.last_timestamp.unwrap_or_default(),
            self.tick_size,
            self.cycle,
        )
    }

    /// Wall-clock reading, clamped so that timestamps never decrease.
    fn live_now(&mut self) -> Result<Nanos, EngineError> {
        let TimeBase::Live(source) = &mut self.time else {
            return Err(EngineError::InvalidConfig("not a live clock".into()));
        };
        let now = source.now()?;
        match self.last_timestamp {
            Some(last) if now < last => {
                self.stats.time_corrections += 1;
                tracing::warn!(now, last, "Time source went backward; clamping");
                Ok(last)
            }
            _ => Ok(now),
        }
    }

    /// Apply queued registrations and removals from handles.
    fn apply_pending(&mut self) {
        let removals: Vec<String> = self.control.pending_remove.lock().drain().collect();
        let tick = self.current_tick();
        for name in removals {
            if let Some(idx) = self.entries.iter().position(|e| e.name == name) {
                let mut entry = self.entries.remove(idx);
                if entry.initialized {
                    entry.component.teardown(&tick);
                }
                tracing::info!(component = %name, "Removed tickable");
            }
        }

        let additions: Vec<Box<dyn Tickable>> =
            self.control.pending_add.lock().drain(..).collect();
        for component in additions {
            self.register_boxed(component);
        }
    }

    /// Deliver one cycle to every component, in registration order.
    fn run_cycle(&mut self, now: Nanos) -> Result<(), EngineError> {
        self.apply_pending();
        let tick = Tick::new(now, self.tick_size, self.cycle);

        for entry in self.entries.iter_mut() {
            let _fence = self.control.fence.lock();
            if self.control.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            if self.control.pending_remove.lock().contains(&entry.name) {
                continue;
            }

            if !entry.initialized {
                match entry.component.initialize(&tick) {
                    Ok(()) => entry.initialized = true,
                    Err(TickError::Recoverable(e)) => {
                        self.stats.recoverable_errors += 1;
                        tracing::warn!(
                            component = %entry.name,
                            kind = ?entry.kind,
                            timestamp = now,
                            error = %format!("{:#}", e),
                            "Tickable initialization failed; retrying next cycle"
                        );
                        continue;
                    }
                    Err(TickError::Fatal(e)) => {
                        return Err(fatal(&entry.name, now, e));
                    }
                }
            }

            match entry.component.tick(&tick) {
                Ok(()) => self.stats.ticks_delivered += 1,
                Err(TickError::Recoverable(e)) => {
                    self.stats.ticks_delivered += 1;
                    self.stats.recoverable_errors += 1;
                    tracing::warn!(
                        component = %entry.name,
                        kind = ?entry.kind,
                        timestamp = now,
                        cycle = self.cycle,
                        error = %format!("{:#}", e),
                        "Tickable failed; skipped for this cycle"
                    );
                }
                Err(TickError::Fatal(e)) => {
                    return Err(fatal(&entry.name, now, e));
                }
            }
        }

        self.last_timestamp = Some(now);
        self.cycle += 1;
        self.stats.cycles += 1;
        Ok(())
    }
}

fn fatal(component: &str, timestamp: Nanos, source: anyhow::Error) -> EngineError {
    tracing::error!(
        component = %component,
        timestamp,
        error = %format!("{:#}", source),
        "Fatal tickable error; stopping clock"
    );
    EngineError::Component {
        component: component.to_string(),
        timestamp,
        source,
    }
}
