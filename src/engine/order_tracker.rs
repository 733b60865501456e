//! Order Tracker
//!
//! Reconciles locally issued order intents with asynchronously reported venue
//! events into one consistent record per order.
//!
//! ```text
//! PENDING_CREATE ──ack──▶ OPEN ──partial fill──▶ PARTIALLY_FILLED ──fill──▶ FILLED
//!       │                  │  └──fill──▶ FILLED          │
//!       │                  ├──cancel ack──▶ CANCELLED ◀──┘ cancel ack
//!       │                  └──expiry──▶ EXPIRED
//!       └──create failure / ack timeout──▶ FAILED
//! ```
//!
//! # Guarantees
//! - a record exists from `start_tracking` on, before any network round trip
//! - terminal records never change again; updates for them are discarded
//! - an update event never creates a record
//! - fills repeating an applied trade id are dropped; filled <= amount always
//! - an order without venue acknowledgment within the in-flight timeout fails
//!   exactly once, and exactly one `OrderFailed` event is published for it

use crate::engine::config::TrackerConfig;
use crate::engine::error::TickError;
use crate::engine::event_bus::{EventBus, SubscriptionId};
use crate::engine::events::{
    Amount, ClientOrderId, Event, EventPayload, EventSource, EventType, ExchangeOrderId,
    FailureReason, FillUpdate, OrderRef, OrderType, Price, Side,
};
use crate::engine::tickable::{Tick, Tickable, TickableKind};
use crate::engine::time::Nanos;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Submitted locally, awaiting venue acknowledgment.
    PendingCreate,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed | OrderStatus::Expired
        )
    }

    /// Acknowledged by the venue and still working.
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, OrderStatus::PendingCreate)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::PendingCreate => "PENDING_CREATE",
            OrderStatus::Open => "OPEN",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

/// A strategy's request to create an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Explicit client order id; generated when absent.
    #[serde(default)]
    pub client_order_id: Option<ClientOrderId>,
    pub trading_pair: String,
    pub side: Side,
    pub order_type: OrderType,
    /// Limit price; ignored for market orders.
    #[serde(default)]
    pub price: Price,
    pub amount: Amount,
}

impl OrderIntent {
    pub fn limit(trading_pair: impl Into<String>, side: Side, price: Price, amount: Amount) -> Self {
        Self {
            client_order_id: None,
            trading_pair: trading_pair.into(),
            side,
            order_type: OrderType::Limit,
            price,
            amount,
        }
    }

    pub fn market(trading_pair: impl Into<String>, side: Side, amount: Amount) -> Self {
        Self {
            client_order_id: None,
            trading_pair: trading_pair.into(),
            side,
            order_type: OrderType::Market,
            price: 0.0,
            amount,
        }
    }

    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }
}

/// One order's full lifecycle. Callers only ever see copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub client_order_id: ClientOrderId,
    pub exchange_order_id: Option<ExchangeOrderId>,
    pub trading_pair: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Price,
    pub amount: Amount,
    pub created_at: Nanos,
    pub status: OrderStatus,
    pub filled_amount: Amount,
    pub average_fill_price: Price,
    pub cumulative_fee: f64,
    pub last_update: Nanos,
    pub acked_at: Option<Nanos>,
    pub terminal_at: Option<Nanos>,
    pub failure_reason: Option<FailureReason>,
    pub cancel_requested_at: Option<Nanos>,
    /// Venue trade ids already applied.
    pub trade_ids: HashSet<String>,
    /// Creation order within the tracker; breaks ties deterministically.
    pub sequence: u64,
    /// Start of the in-flight timeout window, in engine time. Unset until the
    /// next sweep when the order was submitted without a timestamp.
    in_flight_since: Option<Nanos>,
}

impl OrderRecord {
    pub fn remaining(&self) -> Amount {
        (self.amount - self.filled_amount).max(0.0)
    }

    fn order_ref(&self) -> OrderRef {
        OrderRef {
            client_order_id: Some(self.client_order_id.clone()),
            exchange_order_id: self.exchange_order_id.clone(),
        }
    }

    /// PENDING_CREATE -> OPEN.
    fn ack(&mut self, now: Nanos) -> bool {
        if self.status != OrderStatus::PendingCreate {
            return false;
        }
        self.status = OrderStatus::Open;
        self.acked_at = Some(now);
        self.last_update = now;
        true
    }

    fn finish(&mut self, status: OrderStatus, now: Nanos) {
        self.status = status;
        self.terminal_at = Some(now);
        self.last_update = now;
    }

    /// Apply one trade. Returns the amount actually applied.
    fn apply_fill(&mut self, fill: &FillUpdate, completes: bool, epsilon: f64, now: Nanos) -> Amount {
        let remaining = self.remaining();
        let applied = fill.fill_amount.min(remaining);

        if applied > 0.0 {
            let notional = self.average_fill_price * self.filled_amount + fill.fill_price * applied;
            self.filled_amount += applied;
            self.average_fill_price = notional / self.filled_amount;
        }
        self.cumulative_fee += fill.fee;
        if let Some(trade_id) = &fill.trade_id {
            self.trade_ids.insert(trade_id.clone());
        }
        self.last_update = now;

        if self.amount - self.filled_amount <= epsilon {
            self.filled_amount = self.amount;
            self.finish(OrderStatus::Filled, now);
        } else if completes {
            self.finish(OrderStatus::Filled, now);
        } else {
            self.status = OrderStatus::PartiallyFilled;
        }
        applied
    }
}

/// Result of feeding one event to the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// The event changed the order; carries its new status.
    Applied {
        client_order_id: ClientOrderId,
        status: OrderStatus,
    },
    /// Held until an acknowledgment binds its exchange id.
    Buffered,
    /// Logged and dropped.
    Discarded(Anomaly),
    /// Not an order update for this tracker (own events, funding payments).
    Ignored,
}

/// Data-integrity anomaly behind a discarded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Anomaly {
    UnknownOrder,
    TerminalOrder,
    DuplicateTrade,
    DuplicateAck,
    ConflictingExchangeId,
    MissingOrderId,
    InvalidFill,
    InvalidTransition,
    UnmatchedExpired,
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracker errors surfaced to callers.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerError {
    DuplicateClientOrderId(ClientOrderId),
    InvalidIntent(String),
    UnknownOrder(ClientOrderId),
    OrderTerminal {
        client_order_id: ClientOrderId,
        status: OrderStatus,
    },
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateClientOrderId(id) => write!(f, "duplicate client order id: {}", id),
            Self::InvalidIntent(msg) => write!(f, "invalid order intent: {}", msg),
            Self::UnknownOrder(id) => write!(f, "unknown order: {}", id),
            Self::OrderTerminal {
                client_order_id,
                status,
            } => write!(f, "order {} is already {}", client_order_id, status),
        }
    }
}

impl std::error::Error for TrackerError {}

/// Tracker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStats {
    pub orders_tracked: u64,
    pub orders_acked: u64,
    pub orders_partially_filled: u64,
    pub orders_filled: u64,
    pub orders_cancelled: u64,
    pub orders_failed: u64,
    pub orders_expired: u64,
    pub ack_timeouts: u64,
    pub fills_applied: u64,
    pub overfills_clamped: u64,
    pub events_buffered: u64,
    pub anomalies: u64,
    pub orders_archived: u64,
}

/// Open order as reported by a venue, used for reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueOpenOrder {
    #[serde(default)]
    pub client_order_id: Option<ClientOrderId>,
    pub exchange_order_id: ExchangeOrderId,
}

/// Discrepancies found by `reconcile`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// In-flight orders found live on the venue and acknowledged.
    pub acknowledged: Vec<ClientOrderId>,
    /// Orders failed by ack timeout that the venue reports live.
    pub timed_out_but_live: Vec<ClientOrderId>,
    /// Locally open orders the venue no longer lists.
    pub missing_on_venue: Vec<ClientOrderId>,
    /// Venue orders matching nothing tracked.
    pub unknown_on_venue: Vec<ExchangeOrderId>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.timed_out_but_live.is_empty()
            && self.missing_on_venue.is_empty()
            && self.unknown_on_venue.is_empty()
    }
}

struct Unmatched {
    event: Event,
    /// Engine time of arrival; unset until the next sweep if none was seen yet.
    received_at: Option<Nanos>,
}

struct TrackerState {
    config: TrackerConfig,
    orders: HashMap<ClientOrderId, OrderRecord>,
    exchange_index: HashMap<ExchangeOrderId, ClientOrderId>,
    unmatched: HashMap<ExchangeOrderId, Vec<Unmatched>>,
    archive: VecDeque<OrderRecord>,
    archived_ids: HashSet<ClientOrderId>,
    next_sequence: u64,
    now: Option<Nanos>,
    last_reconcile: Option<Nanos>,
    stats: TrackerStats,
}

impl TrackerState {
    fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            orders: HashMap::new(),
            exchange_index: HashMap::new(),
            unmatched: HashMap::new(),
            archive: VecDeque::new(),
            archived_ids: HashSet::new(),
            next_sequence: 1,
            now: None,
            last_reconcile: None,
            stats: TrackerStats::default(),
        }
    }

    fn observe_time(&mut self, ts: Nanos) -> Nanos {
        let now = self.now.map_or(ts, |n| n.max(ts));
        self.now = Some(now);
        now
    }

    fn is_known(&self, id: &str) -> bool {
        self.orders.contains_key(id) || self.archived_ids.contains(id)
    }

    /// `at` is the submission time in engine time. Without it the order is
    /// stamped with the last observed time and its timeout window opens at the
    /// next sweep.
    fn start_tracking(
        &mut self,
        intent: OrderIntent,
        at: Option<Nanos>,
    ) -> Result<ClientOrderId, TrackerError> {
        if intent.trading_pair.trim().is_empty() {
            return Err(TrackerError::InvalidIntent("empty trading pair".into()));
        }
        if !intent.amount.is_finite() || intent.amount <= 0.0 {
            return Err(TrackerError::InvalidIntent(format!(
                "amount must be positive, got {}",
                intent.amount
            )));
        }
        if intent.order_type == OrderType::Limit && (!intent.price.is_finite() || intent.price <= 0.0)
        {
            return Err(TrackerError::InvalidIntent(format!(
                "limit price must be positive, got {}",
                intent.price
            )));
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let client_order_id = match intent.client_order_id {
            Some(id) => {
                if self.is_known(&id) {
                    return Err(TrackerError::DuplicateClientOrderId(id));
                }
                id
            }
            None => {
                let mut seq = sequence;
                loop {
                    let id = format!(
                        "{}-{}-{}",
                        self.config.client_order_id_prefix,
                        intent.side.tag(),
                        seq
                    );
                    if !self.is_known(&id) {
                        break id;
                    }
                    seq += 1;
                }
            }
        };

        let created_at = at.or(self.now).unwrap_or(0);
        let record = OrderRecord {
            client_order_id: client_order_id.clone(),
            exchange_order_id: None,
            trading_pair: intent.trading_pair,
            side: intent.side,
            order_type: intent.order_type,
            price: intent.price,
            amount: intent.amount,
            created_at,
            status: OrderStatus::PendingCreate,
            filled_amount: 0.0,
            average_fill_price: 0.0,
            cumulative_fee: 0.0,
            last_update: created_at,
            acked_at: None,
            terminal_at: None,
            failure_reason: None,
            cancel_requested_at: None,
            trade_ids: HashSet::new(),
            sequence,
            in_flight_since: at,
        };

        tracing::debug!(
            client_order_id = %client_order_id,
            trading_pair = %record.trading_pair,
            side = ?record.side,
            amount = record.amount,
            "Tracking new order"
        );
        self.orders.insert(client_order_id.clone(), record);
        self.stats.orders_tracked += 1;
        Ok(client_order_id)
    }

    fn anomaly(&mut self, anomaly: Anomaly, event: &Event, detail: &str) -> EventOutcome {
        self.stats.anomalies += 1;
        tracing::warn!(
            anomaly = %anomaly,
            event_type = %event.event_type(),
            order = ?event.order_ref().map(|o| o.to_string()),
            timestamp = event.timestamp,
            detail,
            "Discarding order event"
        );
        EventOutcome::Discarded(anomaly)
    }

    fn process_event(&mut self, event: &Event) -> EventOutcome {
        if event.source == EventSource::OrderTracker {
            return EventOutcome::Ignored;
        }
        let Some(order) = event.order_ref() else {
            return EventOutcome::Ignored;
        };
        // Venue timestamps stamp the record; they never move engine time.
        let now = event.timestamp;

        let client_order_id = if let Some(cid) = &order.client_order_id {
            if self.orders.contains_key(cid) {
                cid.clone()
            } else if self.is_known(cid) {
                return self.anomaly(Anomaly::TerminalOrder, event, "order already archived");
            } else {
                return self.anomaly(Anomaly::UnknownOrder, event, "no such client order id");
            }
        } else if let Some(eid) = &order.exchange_order_id {
            match self.exchange_index.get(eid).cloned() {
                Some(cid) if self.orders.contains_key(&cid) => cid,
                Some(_) => {
                    return self.anomaly(Anomaly::TerminalOrder, event, "order already archived")
                }
                None => {
                    self.stats.events_buffered += 1;
                    tracing::debug!(
                        exchange_order_id = %eid,
                        event_type = %event.event_type(),
                        "Buffering event until exchange id is bound"
                    );
                    self.unmatched.entry(eid.clone()).or_default().push(Unmatched {
                        event: event.clone(),
                        received_at: self.now,
                    });
                    return EventOutcome::Buffered;
                }
            }
        } else {
            return self.anomaly(Anomaly::MissingOrderId, event, "event carries no order id");
        };

        let outcome = self.apply(&client_order_id, event, &order, now);

        // An ack may have bound an exchange id that buffered events wait on.
        if let EventOutcome::Applied { .. } = outcome {
            self.replay_unmatched(&client_order_id);
        }
        outcome
    }

    fn apply(&mut self, cid: &str, event: &Event, order: &OrderRef, now: Nanos) -> EventOutcome {
        let epsilon = self.config.amount_epsilon;
        let Some(status) = self.orders.get(cid).map(|r| r.status) else {
            return self.anomaly(Anomaly::UnknownOrder, event, "no such client order id");
        };
        if status.is_terminal() {
            return self.anomaly(Anomaly::TerminalOrder, event, "order already terminal");
        }

        // Exchange id consistency.
        let bound = self.orders.get(cid).and_then(|r| r.exchange_order_id.clone());
        if let Some(eid) = &order.exchange_order_id {
            match &bound {
                Some(bound) if bound != eid => {
                    return self.anomaly(
                        Anomaly::ConflictingExchangeId,
                        event,
                        "exchange id differs from the bound one",
                    );
                }
                None if self.exchange_id_owner(eid).is_some_and(|owner| owner != cid) => {
                    return self.anomaly(
                        Anomaly::ConflictingExchangeId,
                        event,
                        "exchange id belongs to another order",
                    );
                }
                _ => {}
            }
        }

        // Acknowledged implicitly by a client-id-only update: bind the
        // exchange id once the event is applied.
        let late_exchange_id = if status != OrderStatus::PendingCreate && bound.is_none() {
            order.exchange_order_id.clone()
        } else {
            None
        };

        match &event.payload {
            EventPayload::OrderCreated { .. } => {
                if status == OrderStatus::PendingCreate {
                    self.acknowledge(cid, order.exchange_order_id.clone(), now);
                } else if late_exchange_id.is_none() {
                    return self.anomaly(Anomaly::DuplicateAck, event, "order already acknowledged");
                }
            }
            EventPayload::OrderPartiallyFilled(fill) | EventPayload::OrderFilled(fill) => {
                let completes = matches!(event.payload, EventPayload::OrderFilled(_));
                if !fill.fill_amount.is_finite()
                    || fill.fill_amount <= 0.0
                    || !fill.fill_price.is_finite()
                {
                    return self.anomaly(Anomaly::InvalidFill, event, "non-positive fill");
                }
                let duplicate = match (&fill.trade_id, self.orders.get(cid)) {
                    (Some(tid), Some(record)) => record.trade_ids.contains(tid),
                    _ => false,
                };
                if duplicate {
                    return self.anomaly(Anomaly::DuplicateTrade, event, "trade id already applied");
                }
                if status == OrderStatus::PendingCreate {
                    self.acknowledge(cid, order.exchange_order_id.clone(), now);
                }
                self.fill(cid, fill, completes, epsilon, now);
            }
            EventPayload::OrderCancelled(_) => {
                if status == OrderStatus::PendingCreate {
                    self.acknowledge(cid, order.exchange_order_id.clone(), now);
                }
                self.terminate(cid, OrderStatus::Cancelled, now);
            }
            EventPayload::OrderExpired(_) => {
                if status == OrderStatus::PendingCreate {
                    self.acknowledge(cid, order.exchange_order_id.clone(), now);
                }
                // Expiry of a partially filled order cancels its remainder.
                let target = if status == OrderStatus::PartiallyFilled {
                    OrderStatus::Cancelled
                } else {
                    OrderStatus::Expired
                };
                self.terminate(cid, target, now);
            }
            EventPayload::OrderFailed { reason, .. } => {
                if status != OrderStatus::PendingCreate {
                    return self.anomaly(
                        Anomaly::InvalidTransition,
                        event,
                        "failure reported for an acknowledged order",
                    );
                }
                self.fail(cid, reason.clone(), now);
            }
            EventPayload::MarketOrderFailure { message, .. } => {
                if status != OrderStatus::PendingCreate {
                    return self.anomaly(
                        Anomaly::InvalidTransition,
                        event,
                        "failure reported for an acknowledged order",
                    );
                }
                self.fail(cid, FailureReason::Rejected(message.clone()), now);
            }
            EventPayload::FundingPaymentReceived { .. } => return EventOutcome::Ignored,
        }

        if let Some(eid) = late_exchange_id {
            self.bind_exchange_id(cid, eid);
        }

        let status = self
            .orders
            .get(cid)
            .map(|r| r.status)
            .unwrap_or(OrderStatus::PendingCreate);
        EventOutcome::Applied {
            client_order_id: cid.to_string(),
            status,
        }
    }

    /// Client order id the exchange id is indexed under, active or archived.
    fn exchange_id_owner(&self, eid: &str) -> Option<&ClientOrderId> {
        self.exchange_index.get(eid)
    }

    fn acknowledge(&mut self, cid: &str, exchange_order_id: Option<ExchangeOrderId>, now: Nanos) {
        let Some(record) = self.orders.get_mut(cid) else {
            return;
        };
        if !record.ack(now) {
            return;
        }
        self.stats.orders_acked += 1;
        if let Some(eid) = exchange_order_id {
            self.bind_exchange_id(cid, eid);
        }
        tracing::debug!(
            client_order_id = %cid,
            exchange_order_id = ?self.orders.get(cid).and_then(|r| r.exchange_order_id.as_deref()),
            "Order acknowledged"
        );
    }

    /// Callers check `exchange_id_owner` first; an id is never re-pointed.
    fn bind_exchange_id(&mut self, cid: &str, eid: ExchangeOrderId) {
        let Some(record) = self.orders.get_mut(cid) else {
            return;
        };
        if record.exchange_order_id.is_none() {
            record.exchange_order_id = Some(eid.clone());
            self.exchange_index.entry(eid).or_insert_with(|| cid.to_string());
        }
    }

    fn fill(&mut self, cid: &str, fill: &FillUpdate, completes: bool, epsilon: f64, now: Nanos) {
        let Some(record) = self.orders.get_mut(cid) else {
            return;
        };
        let was_partial = record.status == OrderStatus::PartiallyFilled;
        let applied = record.apply_fill(fill, completes, epsilon, now);
        self.stats.fills_applied += 1;

        if fill.fill_amount - applied > epsilon {
            self.stats.overfills_clamped += 1;
            tracing::warn!(
                client_order_id = %cid,
                reported = fill.fill_amount,
                applied,
                "Fill exceeds remaining amount; clamped"
            );
        }
        match record.status {
            OrderStatus::Filled => {
                self.stats.orders_filled += 1;
                if record.filled_amount + epsilon < record.amount {
                    tracing::warn!(
                        client_order_id = %cid,
                        filled = record.filled_amount,
                        amount = record.amount,
                        "Venue reported completion with unaccounted remainder"
                    );
                }
            }
            OrderStatus::PartiallyFilled if !was_partial => {
                self.stats.orders_partially_filled += 1;
            }
            _ => {}
        }
    }

    fn terminate(&mut self, cid: &str, status: OrderStatus, now: Nanos) {
        let Some(record) = self.orders.get_mut(cid) else {
            return;
        };
        record.finish(status, now);
        match status {
            OrderStatus::Cancelled => self.stats.orders_cancelled += 1,
            OrderStatus::Expired => self.stats.orders_expired += 1,
            _ => {}
        }
        tracing::debug!(client_order_id = %cid, status = %status, "Order finished");
    }

    fn fail(&mut self, cid: &str, reason: FailureReason, now: Nanos) {
        let Some(record) = self.orders.get_mut(cid) else {
            return;
        };
        record.failure_reason = Some(reason);
        record.finish(OrderStatus::Failed, now);
        self.stats.orders_failed += 1;
    }

    fn replay_unmatched(&mut self, cid: &str) {
        let Some(eid) = self.orders.get(cid).and_then(|r| r.exchange_order_id.clone()) else {
            return;
        };
        let Some(pending) = self.unmatched.remove(&eid) else {
            return;
        };
        tracing::debug!(
            client_order_id = %cid,
            exchange_order_id = %eid,
            count = pending.len(),
            "Replaying buffered events"
        );
        for item in pending {
            self.process_event(&item.event);
        }
    }

    /// Periodic maintenance. Returns the events to publish.
    fn sweep(&mut self, ts: Nanos) -> Vec<Event> {
        let now = self.observe_time(ts);
        let timeout = self.config.create_timeout();
        let grace = self.config.terminal_grace();
        let ttl = self.config.unmatched_event_ttl();

        // In-flight timeout.
        let mut timed_out: Vec<(u64, ClientOrderId)> = Vec::new();
        for record in self.orders.values_mut() {
            if record.status != OrderStatus::PendingCreate {
                continue;
            }
            let since = match record.in_flight_since {
                Some(since) => since,
                None => {
                    record.in_flight_since = Some(now);
                    record.created_at = now;
                    record.last_update = record.last_update.max(now);
                    now
                }
            };
            if now - since >= timeout {
                timed_out.push((record.sequence, record.client_order_id.clone()));
            }
        }
        timed_out.sort();

        let mut events = Vec::with_capacity(timed_out.len());
        for (_, cid) in timed_out {
            self.fail(&cid, FailureReason::AckTimeout, now);
            self.stats.ack_timeouts += 1;
            if let Some(record) = self.orders.get(&cid) {
                tracing::warn!(
                    client_order_id = %cid,
                    created_at = record.created_at,
                    timestamp = now,
                    "No venue acknowledgment within timeout; order failed"
                );
                events.push(Event::new(
                    now,
                    EventSource::OrderTracker,
                    EventPayload::OrderFailed {
                        order: record.order_ref(),
                        reason: FailureReason::AckTimeout,
                    },
                ));
            }
        }

        // Buffered events whose ack never came.
        let mut expired_unmatched = 0u64;
        self.unmatched.retain(|eid, items| {
            let before = items.len();
            items.retain_mut(|u| now - *u.received_at.get_or_insert(now) < ttl);
            let dropped = (before - items.len()) as u64;
            if dropped > 0 {
                tracing::warn!(
                    anomaly = %Anomaly::UnmatchedExpired,
                    exchange_order_id = %eid,
                    dropped,
                    "Discarding events for an exchange id never acknowledged"
                );
            }
            expired_unmatched += dropped;
            !items.is_empty()
        });
        self.stats.anomalies += expired_unmatched;

        // Grace-period eviction to the archive.
        let mut evict: Vec<(u64, ClientOrderId)> = self
            .orders
            .values()
            .filter(|r| matches!(r.terminal_at, Some(t) if now - t >= grace))
            .map(|r| (r.sequence, r.client_order_id.clone()))
            .collect();
        evict.sort();
        for (_, cid) in evict {
            if let Some(record) = self.orders.remove(&cid) {
                self.archived_ids.insert(cid);
                self.archive.push_back(record);
                self.stats.orders_archived += 1;
            }
        }
        while self.archive.len() > self.config.archive_capacity {
            if let Some(old) = self.archive.pop_front() {
                self.archived_ids.remove(&old.client_order_id);
                if let Some(eid) = &old.exchange_order_id {
                    self.exchange_index.remove(eid);
                }
            }
        }

        events
    }

    fn reconcile(&mut self, venue_open: &[VenueOpenOrder]) -> ReconciliationReport {
        let now = self.now.unwrap_or(0);
        let mut report = ReconciliationReport::default();
        let mut seen: HashSet<ClientOrderId> = HashSet::new();

        for venue in venue_open {
            let cid = venue
                .client_order_id
                .clone()
                .filter(|c| self.is_known(c))
                .or_else(|| self.exchange_index.get(&venue.exchange_order_id).cloned());

            let Some(cid) = cid else {
                report.unknown_on_venue.push(venue.exchange_order_id.clone());
                continue;
            };
            seen.insert(cid.clone());

            let Some(status) = self.orders.get(&cid).map(|r| r.status) else {
                // Archived, hence terminal.
                report.timed_out_but_live.extend(
                    self.archive
                        .iter()
                        .filter(|r| {
                            r.client_order_id == cid
                                && r.failure_reason == Some(FailureReason::AckTimeout)
                        })
                        .map(|r| r.client_order_id.clone()),
                );
                continue;
            };

            match status {
                OrderStatus::PendingCreate => {
                    if self
                        .exchange_id_owner(&venue.exchange_order_id)
                        .is_some_and(|owner| *owner != cid)
                    {
                        self.stats.anomalies += 1;
                        tracing::warn!(
                            anomaly = %Anomaly::ConflictingExchangeId,
                            client_order_id = %cid,
                            exchange_order_id = %venue.exchange_order_id,
                            "Venue reports an exchange id owned by another order"
                        );
                        continue;
                    }
                    self.acknowledge(&cid, Some(venue.exchange_order_id.clone()), now);
                    self.replay_unmatched(&cid);
                    report.acknowledged.push(cid);
                }
                OrderStatus::Failed => {
                    let timed_out = self
                        .orders
                        .get(&cid)
                        .map(|r| r.failure_reason == Some(FailureReason::AckTimeout))
                        .unwrap_or(false);
                    if timed_out {
                        report.timed_out_but_live.push(cid);
                    }
                }
                _ => {}
            }
        }

        let mut missing: Vec<(u64, ClientOrderId)> = self
            .orders
            .values()
            .filter(|r| r.status.is_open() && !seen.contains(&r.client_order_id))
            .map(|r| (r.sequence, r.client_order_id.clone()))
            .collect();
        missing.sort();
        report.missing_on_venue = missing.into_iter().map(|(_, cid)| cid).collect();

        self.last_reconcile = Some(now);
        if !report.is_clean() {
            tracing::warn!(
                timed_out_but_live = ?report.timed_out_but_live,
                missing_on_venue = ?report.missing_on_venue,
                unknown_on_venue = ?report.unknown_on_venue,
                "Reconciliation found discrepancies"
            );
        }
        report
    }

    fn sorted_snapshots(&self, filter: impl Fn(&OrderRecord) -> bool) -> Vec<OrderRecord> {
        let mut orders: Vec<OrderRecord> =
            self.orders.values().filter(|r| filter(r)).cloned().collect();
        orders.sort_by_key(|r| r.sequence);
        orders
    }
}

/// Shared handle to one order tracker.
///
/// Clones refer to the same state. The tracker is also a `Tickable`: its tick
/// runs the in-flight timeout sweep and grace-period eviction.
#[derive(Clone)]
pub struct OrderTracker {
    name: String,
    state: Arc<Mutex<TrackerState>>,
    bus: EventBus,
}

impl OrderTracker {
    pub fn new(bus: EventBus, config: TrackerConfig) -> Self {
        Self {
            name: "order_tracker".to_string(),
            state: Arc::new(Mutex::new(TrackerState::new(config))),
            bus,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Subscribe to every order-update event type on the bus.
    ///
    /// Handlers hold a weak reference, so dropping every tracker handle
    /// detaches it.
    pub fn attach(&self) -> Vec<SubscriptionId> {
        EventType::ORDER_UPDATES
            .iter()
            .map(|&event_type| {
                let state: Weak<Mutex<TrackerState>> = Arc::downgrade(&self.state);
                self.bus.subscribe(event_type, move |event| {
                    if let Some(state) = state.upgrade() {
                        state.lock().process_event(event);
                    }
                    Ok(())
                })
            })
            .collect()
    }

    /// Create a PENDING_CREATE record and return its client order id.
    ///
    /// The in-flight timeout window opens at the tracker's next sweep. Components
    /// submitting from inside a Clock tick should use `start_tracking_at`.
    pub fn start_tracking(&self, intent: OrderIntent) -> Result<ClientOrderId, TrackerError> {
        self.state.lock().start_tracking(intent, None)
    }

    /// `start_tracking` with the caller's current engine time, for components
    /// that submit from inside their own tick.
    pub fn start_tracking_at(
        &self,
        intent: OrderIntent,
        now: Nanos,
    ) -> Result<ClientOrderId, TrackerError> {
        let mut state = self.state.lock();
        state.observe_time(now);
        state.start_tracking(intent, Some(now))
    }

    /// Apply one venue event. Normally invoked through the bus subscription.
    pub fn process_event(&self, event: &Event) -> EventOutcome {
        self.state.lock().process_event(event)
    }

    /// Mark a cancel request for an order that is still working.
    pub fn start_cancel(&self, client_order_id: &str) -> Result<(), TrackerError> {
        let mut state = self.state.lock();
        let now = state.now.unwrap_or(0);
        let Some(record) = state.orders.get_mut(client_order_id) else {
            return Err(TrackerError::UnknownOrder(client_order_id.to_string()));
        };
        if record.status.is_terminal() {
            return Err(TrackerError::OrderTerminal {
                client_order_id: client_order_id.to_string(),
                status: record.status,
            });
        }
        record.cancel_requested_at = Some(now);
        record.last_update = now;
        Ok(())
    }

    /// Snapshot of an order, active or archived.
    pub fn get_order(&self, client_order_id: &str) -> Option<OrderRecord> {
        let state = self.state.lock();
        if let Some(record) = state.orders.get(client_order_id) {
            return Some(record.clone());
        }
        if !state.archived_ids.contains(client_order_id) {
            return None;
        }
        state
            .archive
            .iter()
            .find(|r| r.client_order_id == client_order_id)
            .cloned()
    }

    pub fn get_order_by_exchange_id(&self, exchange_order_id: &str) -> Option<OrderRecord> {
        let cid = self.state.lock().exchange_index.get(exchange_order_id).cloned()?;
        self.get_order(&cid)
    }

    /// Acknowledged, still-working orders in creation order.
    pub fn open_orders(&self) -> Vec<OrderRecord> {
        self.state.lock().sorted_snapshots(|r| r.status.is_open())
    }

    /// Orders awaiting venue acknowledgment.
    pub fn in_flight_orders(&self) -> Vec<OrderRecord> {
        self.state.lock().sorted_snapshots(|r| r.status.is_in_flight())
    }

    /// Every order in the active map.
    pub fn active_orders(&self) -> Vec<OrderRecord> {
        self.state.lock().sorted_snapshots(|_| true)
    }

    pub fn archived_orders(&self) -> Vec<OrderRecord> {
        self.state.lock().archive.iter().cloned().collect()
    }

    /// Active and archived orders in creation order.
    pub fn all_orders(&self) -> Vec<OrderRecord> {
        let state = self.state.lock();
        let mut orders: Vec<OrderRecord> = state
            .archive
            .iter()
            .chain(state.orders.values())
            .cloned()
            .collect();
        orders.sort_by_key(|r| r.sequence);
        orders
    }

    /// Run the timeout sweep and eviction at `now`, publishing the resulting
    /// events after the state lock is released.
    pub fn sweep(&self, now: Nanos) -> usize {
        let events = self.state.lock().sweep(now);
        let count = events.len();
        for event in events {
            self.bus.publish(event);
        }
        count
    }

    /// Compare tracked orders with the venue's open-order list.
    pub fn reconcile(&self, venue_open: &[VenueOpenOrder]) -> ReconciliationReport {
        self.state.lock().reconcile(venue_open)
    }

    /// Whether `reconcile_interval` has elapsed at `now` since the last
    /// reconciliation. Always due before the first one.
    pub fn reconciliation_due(&self, now: Nanos) -> bool {
        let state = self.state.lock();
        match state.last_reconcile {
            Some(last) => now - last >= state.config.reconcile_interval(),
            None => true,
        }
    }

    pub fn stats(&self) -> TrackerStats {
        self.state.lock().stats.clone()
    }

    pub fn config(&self) -> TrackerConfig {
        self.state.lock().config.clone()
    }
}

impl Tickable for OrderTracker {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TickableKind {
        TickableKind::Service
    }

    fn tick(&mut self, tick: &Tick) -> Result<(), TickError> {
        self.sweep(tick.timestamp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::time::NANOS_PER_SEC;

    const VENUE: &str = "venue";

    fn tracker() -> (EventBus, OrderTracker) {
        let bus = EventBus::new();
        let tracker = OrderTracker::new(bus.clone(), TrackerConfig::default());
        tracker.attach();
        (bus, tracker)
    }

    fn at(secs: i64, payload: EventPayload) -> Event {
        Event::new(secs * NANOS_PER_SEC, EventSource::Connector(VENUE.into()), payload)
    }

    fn ack(secs: i64, cid: &str, eid: &str) -> Event {
        at(
            secs,
            EventPayload::OrderCreated {
                client_order_id: Some(cid.into()),
                exchange_order_id: eid.into(),
            },
        )
    }

    fn fill(order: OrderRef, amount: f64, price: f64, trade_id: Option<&str>) -> FillUpdate {
        FillUpdate {
            order,
            fill_amount: amount,
            fill_price: price,
            fee: 0.0,
            trade_id: trade_id.map(str::to_string),
        }
    }

    fn buy(cid: &str, amount: f64) -> OrderIntent {
        OrderIntent::limit("BTC-USDT", Side::Buy, 100.0, amount).with_client_order_id(cid)
    }

    #[test]
    fn test_full_lifecycle_with_duplicate_fill() {
        let (bus, tracker) = tracker();

        let cid = tracker.start_tracking(buy("co-1", 10.0)).unwrap();
        assert_eq!(cid, "co-1");
        assert_eq!(
            tracker.get_order("co-1").unwrap().status,
            OrderStatus::PendingCreate
        );

        bus.publish(ack(1, "co-1", "ex-42"));
        let order = tracker.get_order("co-1").unwrap();
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.exchange_order_id.as_deref(), Some("ex-42"));

        bus.publish(at(
            2,
            EventPayload::OrderPartiallyFilled(fill(OrderRef::client("co-1"), 4.0, 100.0, None)),
        ));
        let order = tracker.get_order("co-1").unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_amount, 4.0);

        let final_fill = at(
            3,
            EventPayload::OrderFilled(fill(OrderRef::client("co-1"), 6.0, 101.0, None)),
        );
        bus.publish(final_fill.clone());
        let order = tracker.get_order("co-1").unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_amount, 10.0);
        assert!((order.average_fill_price - 100.6).abs() < 1e-9);

        let snapshot = tracker.get_order("co-1").unwrap();
        assert_eq!(
            tracker.process_event(&final_fill),
            EventOutcome::Discarded(Anomaly::TerminalOrder)
        );
        assert_eq!(tracker.get_order("co-1").unwrap(), snapshot);
        assert_eq!(tracker.stats().orders_filled, 1);
    }

    #[test]
    fn test_ack_timeout_fails_exactly_once() {
        let (bus, tracker) = tracker();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        bus.subscribe(EventType::OrderFailed, move |e| {
            sink.lock().push(e.clone());
            Ok(())
        });

        tracker.sweep(0);
        tracker.start_tracking_at(buy("co-2", 1.0), 0).unwrap();

        for secs in 1..10 {
            assert_eq!(tracker.sweep(secs * NANOS_PER_SEC), 0);
        }
        assert_eq!(
            tracker.get_order("co-2").unwrap().status,
            OrderStatus::PendingCreate
        );

        assert_eq!(tracker.sweep(10 * NANOS_PER_SEC), 1);
        for secs in 11..20 {
            assert_eq!(tracker.sweep(secs * NANOS_PER_SEC), 0);
        }

        let order = tracker.get_order("co-2").unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(order.failure_reason, Some(FailureReason::AckTimeout));

        let failures = failures.lock();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].client_order_id(), Some("co-2"));
        assert_eq!(failures[0].source, EventSource::OrderTracker);
        assert_eq!(tracker.stats().anomalies, 0);
    }

    #[test]
    fn test_late_ack_after_timeout_is_discarded() {
        let (bus, tracker) = tracker();
        tracker.sweep(0);
        tracker.start_tracking_at(buy("co-3", 1.0), 0).unwrap();
        tracker.sweep(11 * NANOS_PER_SEC);

        bus.publish(ack(12, "co-3", "ex-3"));
        assert_eq!(tracker.get_order("co-3").unwrap().status, OrderStatus::Failed);
        assert_eq!(tracker.stats().anomalies, 1);

        let report = tracker.reconcile(&[VenueOpenOrder {
            client_order_id: Some("co-3".into()),
            exchange_order_id: "ex-3".into(),
        }]);
        assert_eq!(report.timed_out_but_live, vec!["co-3".to_string()]);
        assert_eq!(tracker.get_order("co-3").unwrap().status, OrderStatus::Failed);
    }

    #[test]
    fn test_order_created_before_first_tick_times_out_from_first_sweep() {
        let (_bus, tracker) = tracker();
        tracker.start_tracking(buy("co-early", 1.0)).unwrap();

        tracker.sweep(1_000 * NANOS_PER_SEC);
        assert_eq!(
            tracker.get_order("co-early").unwrap().status,
            OrderStatus::PendingCreate
        );
        tracker.sweep(1_010 * NANOS_PER_SEC);
        assert_eq!(
            tracker.get_order("co-early").unwrap().status,
            OrderStatus::Failed
        );
    }

    #[test]
    fn test_unknown_order_event_creates_nothing() {
        let (bus, tracker) = tracker();
        bus.publish(at(
            1,
            EventPayload::OrderFilled(fill(OrderRef::client("ghost"), 1.0, 1.0, None)),
        ));
        assert!(tracker.get_order("ghost").is_none());
        assert!(tracker.active_orders().is_empty());
        assert_eq!(tracker.stats().anomalies, 1);
    }

    #[test]
    fn test_duplicate_trade_id_ignored() {
        let (bus, tracker) = tracker();
        tracker.start_tracking(buy("co-4", 10.0)).unwrap();
        bus.publish(ack(1, "co-4", "ex-4"));

        let partial = at(
            2,
            EventPayload::OrderPartiallyFilled(fill(OrderRef::client("co-4"), 3.0, 100.0, Some("t-1"))),
        );
        bus.publish(partial.clone());
        assert_eq!(
            tracker.process_event(&partial),
            EventOutcome::Discarded(Anomaly::DuplicateTrade)
        );

        let order = tracker.get_order("co-4").unwrap();
        assert_eq!(order.filled_amount, 3.0);
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
    }

    #[test]
    fn test_overfill_is_clamped() {
        let (bus, tracker) = tracker();
        tracker.start_tracking(buy("co-5", 5.0)).unwrap();
        bus.publish(ack(1, "co-5", "ex-5"));
        bus.publish(at(
            2,
            EventPayload::OrderPartiallyFilled(fill(OrderRef::client("co-5"), 8.0, 100.0, Some("t-1"))),
        ));

        let order = tracker.get_order("co-5").unwrap();
        assert_eq!(order.filled_amount, 5.0);
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(tracker.stats().overfills_clamped, 1);
    }

    #[test]
    fn test_fill_before_ack_implies_acknowledgment() {
        let (bus, tracker) = tracker();
        tracker.start_tracking(buy("co-6", 2.0)).unwrap();
        bus.publish(at(
            1,
            EventPayload::OrderPartiallyFilled(fill(
                OrderRef::client("co-6").with_exchange_id("ex-6"),
                1.0,
                100.0,
                Some("t-1"),
            )),
        ));

        let order = tracker.get_order("co-6").unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.exchange_order_id.as_deref(), Some("ex-6"));
        assert!(order.acked_at.is_some());
    }

    #[test]
    fn test_exchange_id_only_events_wait_for_ack() {
        let (bus, tracker) = tracker();
        tracker.start_tracking(buy("co-7", 2.0)).unwrap();

        let early = at(
            1,
            EventPayload::OrderPartiallyFilled(fill(OrderRef::exchange("ex-7"), 1.0, 100.0, Some("t-1"))),
        );
        assert_eq!(tracker.process_event(&early), EventOutcome::Buffered);
        assert_eq!(
            tracker.get_order("co-7").unwrap().status,
            OrderStatus::PendingCreate
        );

        bus.publish(ack(2, "co-7", "ex-7"));
        let order = tracker.get_order("co-7").unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_amount, 1.0);

        bus.publish(at(3, EventPayload::OrderCancelled(OrderRef::exchange("ex-7"))));
        assert_eq!(
            tracker.get_order_by_exchange_id("ex-7").unwrap().status,
            OrderStatus::Cancelled
        );
    }

    #[test]
    fn test_unmatched_events_expire() {
        let (_bus, tracker) = tracker();
        tracker.sweep(0);
        let orphan = at(1, EventPayload::OrderCancelled(OrderRef::exchange("ex-x")));
        assert_eq!(tracker.process_event(&orphan), EventOutcome::Buffered);

        tracker.sweep(10 * NANOS_PER_SEC);
        assert_eq!(tracker.stats().anomalies, 1);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let (bus, tracker) = tracker();
        tracker.start_tracking(buy("co-8", 2.0)).unwrap();
        bus.publish(ack(1, "co-8", "ex-8"));
        bus.publish(at(2, EventPayload::OrderCancelled(OrderRef::client("co-8"))));

        for event in [
            ack(3, "co-8", "ex-8"),
            at(4, EventPayload::OrderFilled(fill(OrderRef::client("co-8"), 2.0, 1.0, None))),
            at(5, EventPayload::OrderExpired(OrderRef::client("co-8"))),
            at(
                6,
                EventPayload::OrderFailed {
                    order: OrderRef::client("co-8"),
                    reason: FailureReason::Rejected("late".into()),
                },
            ),
        ] {
            bus.publish(event);
        }

        let order = tracker.get_order("co-8").unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.filled_amount, 0.0);
        assert_eq!(tracker.stats().anomalies, 4);
    }

    #[test]
    fn test_expiry_and_venue_failure() {
        let (bus, tracker) = tracker();
        tracker.start_tracking(buy("co-9", 1.0)).unwrap();
        tracker.start_tracking(buy("co-10", 1.0)).unwrap();
        tracker.start_tracking(buy("co-11", 2.0)).unwrap();

        bus.publish(ack(1, "co-9", "ex-9"));
        bus.publish(at(2, EventPayload::OrderExpired(OrderRef::client("co-9"))));
        bus.publish(at(
            2,
            EventPayload::MarketOrderFailure {
                order: OrderRef::client("co-10"),
                message: "insufficient balance".into(),
            },
        ));
        bus.publish(ack(1, "co-11", "ex-11"));
        bus.publish(at(
            2,
            EventPayload::OrderPartiallyFilled(fill(OrderRef::client("co-11"), 1.0, 100.0, None)),
        ));
        bus.publish(at(3, EventPayload::OrderExpired(OrderRef::client("co-11"))));

        assert_eq!(tracker.get_order("co-9").unwrap().status, OrderStatus::Expired);
        let failed = tracker.get_order("co-10").unwrap();
        assert_eq!(failed.status, OrderStatus::Failed);
        assert_eq!(
            failed.failure_reason,
            Some(FailureReason::Rejected("insufficient balance".into()))
        );
        assert_eq!(tracker.get_order("co-11").unwrap().status, OrderStatus::Cancelled);
    }

    #[test]
    fn test_failure_for_open_order_is_anomaly() {
        let (bus, tracker) = tracker();
        tracker.start_tracking(buy("co-12", 1.0)).unwrap();
        bus.publish(ack(1, "co-12", "ex-12"));
        let failure = at(
            2,
            EventPayload::OrderFailed {
                order: OrderRef::client("co-12"),
                reason: FailureReason::Rejected("?".into()),
            },
        );
        assert_eq!(
            tracker.process_event(&failure),
            EventOutcome::Discarded(Anomaly::InvalidTransition)
        );
        assert_eq!(tracker.get_order("co-12").unwrap().status, OrderStatus::Open);
    }

    #[test]
    fn test_conflicting_exchange_id_rejected() {
        let (bus, tracker) = tracker();
        tracker.start_tracking(buy("co-13", 1.0)).unwrap();
        bus.publish(ack(1, "co-13", "ex-13"));
        let odd = at(
            2,
            EventPayload::OrderCancelled(OrderRef::client("co-13").with_exchange_id("ex-other")),
        );
        assert_eq!(
            tracker.process_event(&odd),
            EventOutcome::Discarded(Anomaly::ConflictingExchangeId)
        );
        assert_eq!(tracker.get_order("co-13").unwrap().status, OrderStatus::Open);
    }

    #[test]
    fn test_grace_eviction_and_archive() {
        let bus = EventBus::new();
        let config = TrackerConfig {
            terminal_grace_secs: 5.0,
            archive_capacity: 1,
            ..TrackerConfig::default()
        };
        let tracker = OrderTracker::new(bus.clone(), config);
        tracker.attach();

        for cid in ["a", "b"] {
            tracker.start_tracking(buy(cid, 1.0)).unwrap();
            bus.publish(ack(1, cid, &format!("ex-{}", cid)));
            bus.publish(at(2, EventPayload::OrderCancelled(OrderRef::client(cid))));
        }

        tracker.sweep(6 * NANOS_PER_SEC);
        assert_eq!(tracker.active_orders().len(), 2);
        tracker.sweep(7 * NANOS_PER_SEC);
        assert!(tracker.active_orders().is_empty());

        // Capacity 1: "a" fell out of the archive, "b" is still found.
        assert!(tracker.get_order("a").is_none());
        assert_eq!(tracker.get_order("b").unwrap().status, OrderStatus::Cancelled);

        // Late duplicate for an archived order is discarded, not resurrected.
        assert_eq!(
            tracker.process_event(&at(8, EventPayload::OrderCancelled(OrderRef::client("b")))),
            EventOutcome::Discarded(Anomaly::TerminalOrder)
        );
        assert!(tracker.active_orders().is_empty());
        assert!(matches!(
            tracker.start_tracking(buy("b", 1.0)),
            Err(TrackerError::DuplicateClientOrderId(_))
        ));
        // Dropped from the archive, so the id is free again.
        assert!(tracker.start_tracking(buy("a", 1.0)).is_ok());
    }

    #[test]
    fn test_generated_ids_and_validation() {
        let (_bus, tracker) = tracker();
        let a = tracker
            .start_tracking(OrderIntent::market("ETH-USDT", Side::Sell, 1.0))
            .unwrap();
        let b = tracker
            .start_tracking(OrderIntent::limit("ETH-USDT", Side::Buy, 10.0, 1.0))
            .unwrap();
        assert_eq!(a, "eng-S-1");
        assert_eq!(b, "eng-B-2");

        assert!(matches!(
            tracker.start_tracking(OrderIntent::limit("ETH-USDT", Side::Buy, 0.0, 1.0)),
            Err(TrackerError::InvalidIntent(_))
        ));
        assert!(matches!(
            tracker.start_tracking(OrderIntent::market("ETH-USDT", Side::Buy, -1.0)),
            Err(TrackerError::InvalidIntent(_))
        ));
        assert!(matches!(
            tracker.start_tracking(buy("eng-S-1", 1.0)),
            Err(TrackerError::DuplicateClientOrderId(_))
        ));
    }

    #[test]
    fn test_start_cancel() {
        let (bus, tracker) = tracker();
        tracker.start_tracking(buy("co-14", 1.0)).unwrap();
        bus.publish(ack(1, "co-14", "ex-14"));
        tracker.sweep(NANOS_PER_SEC);
        tracker.start_cancel("co-14").unwrap();
        assert_eq!(
            tracker.get_order("co-14").unwrap().cancel_requested_at,
            Some(NANOS_PER_SEC)
        );

        bus.publish(at(2, EventPayload::OrderCancelled(OrderRef::client("co-14"))));
        assert!(matches!(
            tracker.start_cancel("co-14"),
            Err(TrackerError::OrderTerminal { .. })
        ));
        assert!(matches!(
            tracker.start_cancel("nope"),
            Err(TrackerError::UnknownOrder(_))
        ));
    }

    #[test]
    fn test_reconcile_reports_discrepancies() {
        let (bus, tracker) = tracker();
        tracker.sweep(0);
        tracker.start_tracking(buy("pending", 1.0)).unwrap();
        tracker.start_tracking(buy("open", 1.0)).unwrap();
        bus.publish(ack(1, "open", "ex-open"));
        assert!(tracker.reconciliation_due(NANOS_PER_SEC));

        let report = tracker.reconcile(&[
            VenueOpenOrder {
                client_order_id: Some("pending".into()),
                exchange_order_id: "ex-pending".into(),
            },
            VenueOpenOrder {
                client_order_id: None,
                exchange_order_id: "ex-stray".into(),
            },
        ]);

        assert_eq!(report.acknowledged, vec!["pending".to_string()]);
        assert_eq!(report.missing_on_venue, vec!["open".to_string()]);
        assert_eq!(report.unknown_on_venue, vec!["ex-stray".to_string()]);
        assert!(!report.is_clean());
        assert_eq!(tracker.get_order("pending").unwrap().status, OrderStatus::Open);
        assert!(!tracker.reconciliation_due(30 * NANOS_PER_SEC));
        assert!(tracker.reconciliation_due(61 * NANOS_PER_SEC));
        assert_eq!(tracker.all_orders().len(), 2);
    }

    #[test]
    fn test_snapshots_are_copies() {
        let (bus, tracker) = tracker();
        tracker.start_tracking(buy("co-15", 1.0)).unwrap();
        let before = tracker.get_order("co-15").unwrap();
        bus.publish(ack(1, "co-15", "ex-15"));
        assert_eq!(before.status, OrderStatus::PendingCreate);
        assert_eq!(tracker.open_orders().len(), 1);
        assert!(tracker.in_flight_orders().is_empty());
    }

    #[test]
    fn test_venue_timestamps_do_not_advance_timeout() {
        let (bus, tracker) = tracker();
        tracker.sweep(0);
        tracker.start_tracking_at(buy("co-16", 1.0), 0).unwrap();

        // Skewed venue clock: 30s ahead of the engine.
        bus.publish(at(30, EventPayload::OrderCancelled(OrderRef::client("ghost"))));
        assert_eq!(
            tracker.process_event(&at(30, EventPayload::OrderExpired(OrderRef::exchange("ex-ghost")))),
            EventOutcome::Buffered
        );

        assert_eq!(tracker.sweep(NANOS_PER_SEC), 0);
        assert_eq!(
            tracker.get_order("co-16").unwrap().status,
            OrderStatus::PendingCreate
        );
        assert_eq!(tracker.sweep(9 * NANOS_PER_SEC), 0);
        assert_eq!(tracker.sweep(10 * NANOS_PER_SEC), 1);
        assert_eq!(
            tracker.get_order("co-16").unwrap().terminal_at,
            Some(10 * NANOS_PER_SEC)
        );
    }

    #[test]
    fn test_untimed_submission_window_opens_at_next_sweep() {
        let (_bus, tracker) = tracker();
        tracker.sweep(4 * NANOS_PER_SEC);
        tracker.start_tracking(buy("co-17", 1.0)).unwrap();

        tracker.sweep(5 * NANOS_PER_SEC);
        assert_eq!(
            tracker.get_order("co-17").unwrap().created_at,
            5 * NANOS_PER_SEC
        );
        assert_eq!(tracker.sweep(14 * NANOS_PER_SEC), 0);
        assert_eq!(tracker.sweep(15 * NANOS_PER_SEC), 1);

        let order = tracker.get_order("co-17").unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(order.terminal_at, Some(15 * NANOS_PER_SEC));
    }

    #[test]
    fn test_late_ack_binds_exchange_id() {
        let (bus, tracker) = tracker();
        tracker.start_tracking(buy("co-18", 10.0)).unwrap();

        bus.publish(at(
            1,
            EventPayload::OrderPartiallyFilled(fill(OrderRef::client("co-18"), 4.0, 100.0, Some("t-1"))),
        ));
        let order = tracker.get_order("co-18").unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert!(order.exchange_order_id.is_none());

        let buffered = at(
            2,
            EventPayload::OrderPartiallyFilled(fill(OrderRef::exchange("ex-18"), 2.0, 100.0, Some("t-2"))),
        );
        assert_eq!(tracker.process_event(&buffered), EventOutcome::Buffered);

        assert_eq!(
            tracker.process_event(&ack(3, "co-18", "ex-18")),
            EventOutcome::Applied {
                client_order_id: "co-18".into(),
                status: OrderStatus::PartiallyFilled,
            }
        );
        let order = tracker.get_order_by_exchange_id("ex-18").unwrap();
        assert_eq!(order.client_order_id, "co-18");
        assert_eq!(order.filled_amount, 6.0);

        bus.publish(at(4, EventPayload::OrderCancelled(OrderRef::exchange("ex-18"))));
        assert_eq!(tracker.get_order("co-18").unwrap().status, OrderStatus::Cancelled);

        let stats = tracker.stats();
        assert_eq!(stats.orders_acked, 1);
        assert_eq!(stats.anomalies, 0);
    }

    #[test]
    fn test_exchange_id_owned_by_another_order_rejected() {
        let (bus, tracker) = tracker();
        tracker.start_tracking(buy("co-19", 1.0)).unwrap();
        tracker.start_tracking(buy("co-20", 1.0)).unwrap();
        bus.publish(ack(1, "co-19", "ex-shared"));

        assert_eq!(
            tracker.process_event(&ack(2, "co-20", "ex-shared")),
            EventOutcome::Discarded(Anomaly::ConflictingExchangeId)
        );
        let implicit = at(
            2,
            EventPayload::OrderPartiallyFilled(fill(
                OrderRef::client("co-20").with_exchange_id("ex-shared"),
                0.5,
                100.0,
                Some("t-1"),
            )),
        );
        assert_eq!(
            tracker.process_event(&implicit),
            EventOutcome::Discarded(Anomaly::ConflictingExchangeId)
        );

        let pending = tracker.get_order("co-20").unwrap();
        assert_eq!(pending.status, OrderStatus::PendingCreate);
        assert!(pending.exchange_order_id.is_none());
        assert_eq!(
            tracker.get_order_by_exchange_id("ex-shared").unwrap().client_order_id,
            "co-19"
        );

        let report = tracker.reconcile(&[VenueOpenOrder {
            client_order_id: Some("co-20".into()),
            exchange_order_id: "ex-shared".into(),
        }]);
        assert!(report.acknowledged.is_empty());
        assert_eq!(
            tracker.get_order("co-20").unwrap().status,
            OrderStatus::PendingCreate
        );
    }
}
