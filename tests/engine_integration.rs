//! Integration tests for the execution engine
//!
//! Drive the public API end to end: backtest Clock ticking a historical feed,
//! strategies and the order tracker, with events flowing over the bus.

use std::sync::Arc;

use parking_lot::Mutex;

use execution_engine::engine::time::NANOS_PER_SEC;
use execution_engine::engine::{
    Clock, Event, EventBus, EventPayload, EventSource, EventType, FailureReason, FillUpdate,
    HistoricalFeed, OrderIntent, OrderRef, OrderStatus, OrderTracker, Side, Tick, TickError,
    Tickable, TrackerConfig,
};

/// Records (name, phase, timestamp) for every hook call.
struct Journal {
    name: String,
    log: Arc<Mutex<Vec<(String, &'static str, i64)>>>,
}

impl Tickable for Journal {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, tick: &Tick) -> Result<(), TickError> {
        self.log
            .lock()
            .push((self.name.clone(), "start", tick.timestamp));
        self.log.lock().push((self.name.clone(), "end", tick.timestamp));
        Ok(())
    }
}

fn venue(secs: i64, payload: EventPayload) -> Event {
    Event::new(
        secs * NANOS_PER_SEC,
        EventSource::Connector("venue".into()),
        payload,
    )
}

fn fill(cid: &str, amount: f64, trade_id: &str) -> FillUpdate {
    FillUpdate {
        order: OrderRef::client(cid),
        fill_amount: amount,
        fill_price: 100.0,
        fee: 0.01,
        trade_id: Some(trade_id.to_string()),
    }
}

/// Submits one intent on its first tick.
struct OneShot {
    tracker: OrderTracker,
    intent: Option<OrderIntent>,
}

impl Tickable for OneShot {
    fn name(&self) -> &str {
        "one_shot"
    }

    fn tick(&mut self, tick: &Tick) -> Result<(), TickError> {
        if let Some(intent) = self.intent.take() {
            self.tracker
                .start_tracking_at(intent, tick.timestamp)
                .map_err(TickError::fatal)?;
        }
        Ok(())
    }
}

#[test]
fn test_two_components_tick_in_registration_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut clock = Clock::backtest_secs(1.0, 5.0, 1.0).unwrap();
    for name in ["A", "B"] {
        clock.register(Journal {
            name: name.into(),
            log: log.clone(),
        });
    }

    let stats = clock.run_backtest().unwrap();
    assert_eq!(stats.cycles, 5);

    let log = log.lock();
    assert_eq!(log.len(), 20);
    for (cycle, chunk) in log.chunks(4).enumerate() {
        let ts = (cycle as i64 + 1) * NANOS_PER_SEC;
        assert_eq!(chunk[0], ("A".to_string(), "start", ts));
        assert_eq!(chunk[1], ("A".to_string(), "end", ts));
        assert_eq!(chunk[2], ("B".to_string(), "start", ts));
        assert_eq!(chunk[3], ("B".to_string(), "end", ts));
    }
}

#[test]
fn test_order_lifecycle_through_clock_and_feed() {
    let bus = EventBus::new();
    let tracker = OrderTracker::new(bus.clone(), TrackerConfig::default());
    tracker.attach();

    let filled = Arc::new(Mutex::new(0u32));
    let counter = filled.clone();
    bus.subscribe(EventType::OrderFilled, move |_| {
        *counter.lock() += 1;
        Ok(())
    });

    let events = vec![
        venue(
            1,
            EventPayload::OrderCreated {
                client_order_id: Some("co-1".into()),
                exchange_order_id: "ex-42".into(),
            },
        ),
        venue(2, EventPayload::OrderPartiallyFilled(fill("co-1", 4.0, "t-1"))),
        venue(3, EventPayload::OrderFilled(fill("co-1", 6.0, "t-2"))),
        venue(4, EventPayload::OrderFilled(fill("co-1", 6.0, "t-2"))),
    ];

    let mut clock = Clock::backtest_secs(0.0, 5.0, 1.0).unwrap();
    clock.register(OneShot {
        tracker: tracker.clone(),
        intent: Some(
            OrderIntent::limit("BTC-USDT", Side::Buy, 100.0, 10.0).with_client_order_id("co-1"),
        ),
    });
    clock.register(HistoricalFeed::new("historical", bus.clone(), events));
    clock.register(tracker.clone());

    clock.backtest_til(0).unwrap();
    assert_eq!(
        tracker.get_order("co-1").unwrap().status,
        OrderStatus::PendingCreate
    );

    clock.backtest_til(NANOS_PER_SEC).unwrap();
    let order = tracker.get_order("co-1").unwrap();
    assert_eq!(order.status, OrderStatus::Open);
    assert_eq!(order.exchange_order_id.as_deref(), Some("ex-42"));

    clock.backtest_til(2 * NANOS_PER_SEC).unwrap();
    let order = tracker.get_order("co-1").unwrap();
    assert_eq!(order.status, OrderStatus::PartiallyFilled);
    assert_eq!(order.filled_amount, 4.0);

    clock.run_backtest().unwrap();
    let order = tracker.get_order("co-1").unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.filled_amount, 10.0);
    assert!((order.cumulative_fee - 0.02).abs() < 1e-12);
    assert_eq!(tracker.stats().anomalies, 1);
    // Both venue fills were relayed; the tracker never republishes them.
    assert_eq!(*filled.lock(), 2);
}

#[test]
fn test_ack_timeout_publishes_single_failure() {
    let bus = EventBus::new();
    let tracker = OrderTracker::new(bus.clone(), TrackerConfig::default());
    tracker.attach();

    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = failures.clone();
    bus.subscribe(EventType::OrderFailed, move |e| {
        sink.lock().push(e.clone());
        Ok(())
    });

    let mut clock = Clock::backtest_secs(0.0, 30.0, 1.0).unwrap();
    clock.register(OneShot {
        tracker: tracker.clone(),
        intent: Some(
            OrderIntent::limit("BTC-USDT", Side::Sell, 101.0, 1.0).with_client_order_id("co-2"),
        ),
    });
    clock.register(tracker.clone());

    clock.backtest_til(9 * NANOS_PER_SEC).unwrap();
    assert_eq!(
        tracker.get_order("co-2").unwrap().status,
        OrderStatus::PendingCreate
    );
    assert!(failures.lock().is_empty());

    clock.run_backtest().unwrap();
    let order = tracker.get_order("co-2").unwrap();
    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(order.terminal_at, Some(10 * NANOS_PER_SEC));

    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].client_order_id(), Some("co-2"));
    assert_eq!(failures[0].source, EventSource::OrderTracker);
    assert!(matches!(
        &failures[0].payload,
        EventPayload::OrderFailed {
            reason: FailureReason::AckTimeout,
            ..
        }
    ));
}

/// Submits without a timestamp once the clock reaches `at`.
struct Untimed {
    tracker: OrderTracker,
    at: i64,
    intent: Option<OrderIntent>,
}

impl Tickable for Untimed {
    fn name(&self) -> &str {
        "untimed"
    }

    fn tick(&mut self, tick: &Tick) -> Result<(), TickError> {
        if tick.timestamp < self.at {
            return Ok(());
        }
        if let Some(intent) = self.intent.take() {
            self.tracker.start_tracking(intent).map_err(TickError::fatal)?;
        }
        Ok(())
    }
}

#[test]
fn test_strategy_ticked_before_tracker_gets_full_timeout() {
    let bus = EventBus::new();
    let tracker = OrderTracker::new(bus.clone(), TrackerConfig::default());
    tracker.attach();

    let mut clock = Clock::backtest_secs(0.0, 20.0, 1.0).unwrap();
    clock.register(Untimed {
        tracker: tracker.clone(),
        at: 5 * NANOS_PER_SEC,
        intent: Some(
            OrderIntent::limit("BTC-USDT", Side::Buy, 99.0, 1.0).with_client_order_id("co-late"),
        ),
    });
    clock.register(tracker.clone());

    clock.backtest_til(14 * NANOS_PER_SEC).unwrap();
    let order = tracker.get_order("co-late").unwrap();
    assert_eq!(order.status, OrderStatus::PendingCreate);
    assert_eq!(order.created_at, 5 * NANOS_PER_SEC);

    clock.run_backtest().unwrap();
    let order = tracker.get_order("co-late").unwrap();
    assert_eq!(order.status, OrderStatus::Failed);
    assert_eq!(order.terminal_at, Some(15 * NANOS_PER_SEC));
}

#[test]
fn test_repeated_backtests_are_identical() {
    fn run() -> (Vec<(String, &'static str, i64)>, Vec<String>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_all(move |e| {
            sink.lock().push(format!("{}@{}", e.event_type(), e.timestamp));
            Ok(())
        });

        let events = (0..6)
            .map(|i| {
                venue(
                    i % 3,
                    EventPayload::OrderCancelled(OrderRef::client(format!("x-{}", i))),
                )
            })
            .collect();

        let mut clock = Clock::backtest_secs(0.0, 4.0, 0.5).unwrap();
        clock.register(HistoricalFeed::new("historical", bus, events));
        clock.register(Journal {
            name: "strategy".into(),
            log: log.clone(),
        });
        clock.run_backtest().unwrap();

        let log = log.lock().clone();
        let seen = seen.lock().clone();
        (log, seen)
    }

    let first = run();
    let second = run();
    assert_eq!(first, second);
    assert_eq!(first.1.len(), 6);
    assert_eq!(first.0.len(), 18);
}

#[test]
fn test_terminal_orders_ignore_late_events() {
    let bus = EventBus::new();
    let tracker = OrderTracker::new(bus.clone(), TrackerConfig::default());
    tracker.attach();
    tracker
        .start_tracking(OrderIntent::market("ETH-USDT", Side::Buy, 2.0).with_client_order_id("m-1"))
        .unwrap();

    bus.publish(venue(
        1,
        EventPayload::MarketOrderFailure {
            order: OrderRef::client("m-1"),
            message: "insufficient balance".into(),
        },
    ));
    let snapshot = tracker.get_order("m-1").unwrap();
    assert_eq!(snapshot.status, OrderStatus::Failed);

    bus.publish(venue(
        2,
        EventPayload::OrderCreated {
            client_order_id: Some("m-1".into()),
            exchange_order_id: "ex-m".into(),
        },
    ));
    bus.publish(venue(3, EventPayload::OrderFilled(fill("m-1", 2.0, "t-9"))));

    assert_eq!(tracker.get_order("m-1").unwrap(), snapshot);
    assert_eq!(tracker.stats().anomalies, 2);
}
