//! Event Model
//!
//! Canonical event types flowing through the engine bus. Every in-process
//! state change is driven by one of these variants, in both live and
//! simulation mode.

use crate::clock::Nanos;
use serde::{Deserialize, Serialize};

/// Locally generated client order id (stable identity of an order).
pub type ClientOid = String;

/// Exchange-assigned order id.
pub type ExchangeOid = String;

pub type Price = f64;
pub type Size = f64;
pub type Symbol = String;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

/// Time-in-force. Gtx is post-only; Rpi is the retail-price-improvement
/// post-only variant with its own tag on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    Gtx,
    Rpi,
}

impl TimeInForce {
    #[inline]
    pub fn is_post_only(&self) -> bool {
        matches!(self, TimeInForce::Gtx | TimeInForce::Rpi)
    }
}

/// A single price level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub price: Price,
    pub size: Size,
}

impl Level {
    #[inline]
    pub fn new(price: Price, size: Size) -> Self {
        Self { price, size }
    }
}

/// Strategy trading intent, pre-validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: Symbol,
    pub side: Side,
    pub price: Price,
    pub volume: Size,
    pub time_in_force: TimeInForce,
}

impl OrderIntent {
    pub fn new(symbol: impl Into<Symbol>, side: Side, price: Price, volume: Size) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            price,
            volume,
            time_in_force: TimeInForce::Gtc,
        }
    }

    pub fn post_only(mut self) -> Self {
        self.time_in_force = TimeInForce::Gtx;
        self
    }

    #[inline]
    pub fn notional(&self) -> f64 {
        self.price * self.volume
    }

    #[inline]
    pub fn is_post_only(&self) -> bool {
        self.time_in_force.is_post_only()
    }

    #[inline]
    pub fn is_rpi(&self) -> bool {
        self.time_in_force == TimeInForce::Rpi
    }
}

/// Wire-level order request handed to a gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_oid: ClientOid,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Price,
    pub volume: Size,
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    pub fn from_intent(client_oid: ClientOid, intent: &OrderIntent) -> Self {
        Self {
            client_oid,
            symbol: intent.symbol.clone(),
            side: intent.side,
            price: intent.price,
            volume: intent.volume,
            time_in_force: intent.time_in_force,
        }
    }
}

/// Cancel request. `order_id` is the exchange oid when known, else the
/// client oid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub symbol: Symbol,
    pub order_id: String,
}

/// Order status as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

/// Normalized order update pushed by a gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrderUpdate {
    pub client_oid: ClientOid,
    pub exchange_oid: ExchangeOid,
    pub symbol: Symbol,
    pub status: ExchangeStatus,
    /// Quantity of this fill increment (0 for non-fill updates).
    pub filled_qty: Size,
    /// Price of this fill increment.
    pub filled_price: Price,
    /// Cumulative filled quantity as known by the exchange.
    pub cum_filled_qty: Size,
    pub update_time: Nanos,
}

/// Top-of-stream book copy emitted by the local book (live) or the
/// replayed depth feed (sim).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookUpdate {
    pub symbol: Symbol,
    pub ts: Nanos,
    /// Sorted best-first (descending price).
    pub bids: Vec<Level>,
    /// Sorted best-first (ascending price).
    pub asks: Vec<Level>,
}

impl BookUpdate {
    #[inline]
    pub fn best_bid(&self) -> Option<Level> {
        self.bids.first().copied()
    }

    #[inline]
    pub fn best_ask(&self) -> Option<Level> {
        self.asks.first().copied()
    }

    pub fn mid_price(&self) -> Option<Price> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
            _ => None,
        }
    }
}

/// Aggregated public trade. `maker_is_buyer = true` means the aggressor
/// sold into resting bids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggTrade {
    pub symbol: Symbol,
    pub trade_id: u64,
    pub price: Price,
    pub qty: Size,
    pub maker_is_buyer: bool,
    pub ts: Nanos,
}

/// Exchange mark price used for margin and unrealised PnL.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarkPriceUpdate {
    pub price: Price,
    pub ts: Nanos,
}

/// One of our fills, synthesised by the OMS from exchange updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeFill {
    pub symbol: Symbol,
    pub client_oid: ClientOid,
    pub trade_id: String,
    pub side: Side,
    pub price: Price,
    pub volume: Size,
    pub ts: Nanos,
}

/// Net position after a fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub symbol: Symbol,
    pub net_position: f64,
    pub avg_price: Price,
}

/// Account state after a recompute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub balance: f64,
    pub equity: f64,
    pub used_margin: f64,
    pub available: f64,
}

/// Position drift found by reconciliation: (local, remote, local - remote).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionDrift {
    pub symbol: Symbol,
    pub local: f64,
    pub remote: f64,
    pub diff: f64,
}

/// Periodic health report from the reconciliation loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub total_exposure: f64,
    pub margin_ratio: f64,
    pub pos_drifts: Vec<PositionDrift>,
    pub order_count_local: usize,
    pub order_count_remote: usize,
    pub is_sync_error: bool,
    pub cancelling_count: usize,
    pub fill_ratio: f64,
    pub ts: Nanos,
}

/// Discriminant used for handler registration on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Book,
    AggTrade,
    MarkPrice,
    ExchangeOrder,
    OrderSnapshot,
    Trade,
    Position,
    Account,
    Health,
}

/// The engine event sum. All components communicate through these.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Book(BookUpdate),
    AggTrade(AggTrade),
    MarkPrice(Symbol, MarkPriceUpdate),
    ExchangeOrder(ExchangeOrderUpdate),
    OrderSnapshot(crate::oms::order::OrderSnapshot),
    Trade(TradeFill),
    Position(PositionUpdate),
    Account(AccountUpdate),
    Health(SystemHealth),
}

impl EngineEvent {
    #[inline]
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::Book(_) => EventKind::Book,
            EngineEvent::AggTrade(_) => EventKind::AggTrade,
            EngineEvent::MarkPrice(..) => EventKind::MarkPrice,
            EngineEvent::ExchangeOrder(_) => EventKind::ExchangeOrder,
            EngineEvent::OrderSnapshot(_) => EventKind::OrderSnapshot,
            EngineEvent::Trade(_) => EventKind::Trade,
            EngineEvent::Position(_) => EventKind::Position,
            EngineEvent::Account(_) => EventKind::Account,
            EngineEvent::Health(_) => EventKind::Health,
        }
    }
}
