//! Event Model
//!
//! Immutable order-lifecycle and account events relayed by the EventBus.
//! Connectors publish them when a venue condition is confirmed; the order
//! tracker publishes the ones it derives locally (acknowledgment timeouts).

use crate::engine::time::Nanos;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Locally generated order identifier, unique per engine instance.
pub type ClientOrderId = String;

/// Venue-assigned order identifier.
pub type ExchangeOrderId = String;

pub type Price = f64;

pub type Amount = f64;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Short tag used in generated client order ids.
    #[inline]
    pub fn tag(&self) -> &'static str {
        match self {
            Side::Buy => "B",
            Side::Sell => "S",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
}

/// Event type tag. Subscriptions are keyed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    OrderCreated,
    OrderPartiallyFilled,
    OrderFilled,
    OrderCancelled,
    OrderFailed,
    OrderExpired,
    MarketOrderFailure,
    FundingPaymentReceived,
}

impl EventType {
    /// Types that carry an order update the tracker consumes.
    pub const ORDER_UPDATES: [EventType; 7] = [
        EventType::OrderCreated,
        EventType::OrderPartiallyFilled,
        EventType::OrderFilled,
        EventType::OrderCancelled,
        EventType::OrderFailed,
        EventType::OrderExpired,
        EventType::MarketOrderFailure,
    ];
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Who published an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Connector(String),
    Feed(String),
    OrderTracker,
}

impl Default for EventSource {
    fn default() -> Self {
        EventSource::Feed("historical".into())
    }
}

/// Reference to an order as seen by a venue. At least one id should be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRef {
    #[serde(default)]
    pub client_order_id: Option<ClientOrderId>,
    #[serde(default)]
    pub exchange_order_id: Option<ExchangeOrderId>,
}

impl OrderRef {
    pub fn client(id: impl Into<String>) -> Self {
        Self {
            client_order_id: Some(id.into()),
            exchange_order_id: None,
        }
    }

    pub fn exchange(id: impl Into<String>) -> Self {
        Self {
            client_order_id: None,
            exchange_order_id: Some(id.into()),
        }
    }

    pub fn with_exchange_id(mut self, id: impl Into<String>) -> Self {
        self.exchange_order_id = Some(id.into());
        self
    }
}

impl fmt::Display for OrderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.client_order_id, &self.exchange_order_id) {
            (Some(c), Some(e)) => write!(f, "{}/{}", c, e),
            (Some(c), None) => write!(f, "{}", c),
            (None, Some(e)) => write!(f, "exchange:{}", e),
            (None, None) => write!(f, "<unidentified>"),
        }
    }
}

/// A single venue trade against one of our orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillUpdate {
    #[serde(flatten)]
    pub order: OrderRef,
    /// Amount filled by this trade (not cumulative).
    pub fill_amount: Amount,
    pub fill_price: Price,
    #[serde(default)]
    pub fee: f64,
    /// Venue trade id; fills repeating an applied trade id are duplicates.
    #[serde(default)]
    pub trade_id: Option<String>,
}

/// Why an order failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No venue acknowledgment within the in-flight timeout.
    AckTimeout,
    /// Venue rejected the create request.
    Rejected(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AckTimeout => write!(f, "acknowledgment timeout"),
            Self::Rejected(msg) => write!(f, "rejected: {}", msg),
        }
    }
}

/// Tag-specific event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Venue acknowledged the order and assigned an exchange id.
    OrderCreated {
        #[serde(default)]
        client_order_id: Option<ClientOrderId>,
        exchange_order_id: ExchangeOrderId,
    },
    OrderPartiallyFilled(FillUpdate),
    /// Fill that completes the order.
    OrderFilled(FillUpdate),
    OrderCancelled(OrderRef),
    OrderFailed {
        #[serde(flatten)]
        order: OrderRef,
        reason: FailureReason,
    },
    OrderExpired(OrderRef),
    /// Venue-side failure of a submitted order (any order type).
    MarketOrderFailure {
        #[serde(flatten)]
        order: OrderRef,
        message: String,
    },
    FundingPaymentReceived {
        trading_pair: String,
        amount: f64,
        funding_rate: f64,
    },
}

/// Immutable record of something that happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Origination timestamp.
    pub timestamp: Nanos,
    #[serde(default)]
    pub source: EventSource,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(timestamp: Nanos, source: EventSource, payload: EventPayload) -> Self {
        Self {
            timestamp,
            source,
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        match &self.payload {
            EventPayload::OrderCreated { .. } => EventType::OrderCreated,
            EventPayload::OrderPartiallyFilled(_) => EventType::OrderPartiallyFilled,
            EventPayload::OrderFilled(_) => EventType::OrderFilled,
            EventPayload::OrderCancelled(_) => EventType::OrderCancelled,
            EventPayload::OrderFailed { .. } => EventType::OrderFailed,
            EventPayload::OrderExpired(_) => EventType::OrderExpired,
            EventPayload::MarketOrderFailure { .. } => EventType::MarketOrderFailure,
            EventPayload::FundingPaymentReceived { .. } => EventType::FundingPaymentReceived,
        }
    }

    /// Order the event refers to, if it is an order update.
    pub fn order_ref(&self) -> Option<OrderRef> {
        match &self.payload {
            EventPayload::OrderCreated {
                client_order_id,
                exchange_order_id,
            } => Some(OrderRef {
                client_order_id: client_order_id.clone(),
                exchange_order_id: Some(exchange_order_id.clone()),
            }),
            EventPayload::OrderPartiallyFilled(fill) | EventPayload::OrderFilled(fill) => {
                Some(fill.order.clone())
            }
            EventPayload::OrderCancelled(order) | EventPayload::OrderExpired(order) => {
                Some(order.clone())
            }
            EventPayload::OrderFailed { order, .. }
            | EventPayload::MarketOrderFailure { order, .. } => Some(order.clone()),
            EventPayload::FundingPaymentReceived { .. } => None,
        }
    }

    /// Client order id carried by the event, if any.
    pub fn client_order_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::OrderCreated {
                client_order_id, ..
            } => client_order_id.as_deref(),
            EventPayload::OrderPartiallyFilled(fill) | EventPayload::OrderFilled(fill) => {
                fill.order.client_order_id.as_deref()
            }
            EventPayload::OrderCancelled(order) | EventPayload::OrderExpired(order) => {
                order.client_order_id.as_deref()
            }
            EventPayload::OrderFailed { order, .. }
            | EventPayload::MarketOrderFailure { order, .. } => order.client_order_id.as_deref(),
            EventPayload::FundingPaymentReceived { .. } => None,
        }
    }
}
