use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{OrderSide, OrderStatus, VenueOrderId};
use crate::portfolio::PortfolioSnapshot;

/// Bus topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    MarketData,
    OrderStatus,
    Execution,
    Account,
    Diagnostic,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::MarketData,
        Topic::OrderStatus,
        Topic::Execution,
        Topic::Account,
        Topic::Diagnostic,
    ];
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Topic::MarketData => "market_data",
            Topic::OrderStatus => "order_status",
            Topic::Execution => "execution",
            Topic::Account => "account",
            Topic::Diagnostic => "diagnostic",
        };
        write!(f, "{}", s)
    }
}

/// Last trade / mark update for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataEvent {
    pub symbol: String,
    pub price: Decimal,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub volume: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl MarketDataEvent {
    pub fn tick(symbol: &str, price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            price,
            high: None,
            low: None,
            volume: None,
            timestamp,
        }
    }
}

/// Venue status report for one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusEvent {
    pub order_id: VenueOrderId,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub filled_qty: u64,
    pub remaining_qty: u64,
    pub avg_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

/// A single fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub order_id: VenueOrderId,
    pub symbol: String,
    pub side: OrderSide,
    pub fill_qty: u64,
    pub fill_price: Decimal,
    pub commission: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccountEvent {
    /// Read-only portfolio view published by the ledger after every change
    Snapshot(PortfolioSnapshot),
    KillSwitch { engaged: bool, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    Message {
        level: DiagnosticLevel,
        source: String,
        message: String,
        context: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    /// Venue connection state change. `connected: false` is unrecoverable
    /// from the core's point of view and engages the kill switch.
    VenueConnectivity {
        connected: bool,
        detail: String,
        timestamp: DateTime<Utc>,
    },
}

impl DiagnosticEvent {
    pub fn message(level: DiagnosticLevel, source: &str, message: impl Into<String>) -> Self {
        DiagnosticEvent::Message {
            level,
            source: source.to_string(),
            message: message.into(),
            context: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }
}

/// Everything that travels over the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "event", rename_all = "snake_case")]
pub enum BusEvent {
    MarketData(MarketDataEvent),
    OrderStatus(OrderStatusEvent),
    Execution(ExecutionEvent),
    Account(AccountEvent),
    Diagnostic(DiagnosticEvent),
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::MarketData(_) => Topic::MarketData,
            BusEvent::OrderStatus(_) => Topic::OrderStatus,
            BusEvent::Execution(_) => Topic::Execution,
            BusEvent::Account(_) => Topic::Account,
            BusEvent::Diagnostic(_) => Topic::Diagnostic,
        }
    }
}

impl From<MarketDataEvent> for BusEvent {
    fn from(event: MarketDataEvent) -> Self {
        BusEvent::MarketData(event)
    }
}

impl From<OrderStatusEvent> for BusEvent {
    fn from(event: OrderStatusEvent) -> Self {
        BusEvent::OrderStatus(event)
    }
}

impl From<ExecutionEvent> for BusEvent {
    fn from(event: ExecutionEvent) -> Self {
        BusEvent::Execution(event)
    }
}

impl From<AccountEvent> for BusEvent {
    fn from(event: AccountEvent) -> Self {
        BusEvent::Account(event)
    }
}

impl From<DiagnosticEvent> for BusEvent {
    fn from(event: DiagnosticEvent) -> Self {
        BusEvent::Diagnostic(event)
    }
}
