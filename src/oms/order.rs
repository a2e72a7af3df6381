//! Order Lifecycle
//!
//! Order record with its status state machine:
//!
//! ```text
//! CREATED -> SUBMITTING -> (PENDING_ACK) -> NEW -> PARTIALLY_FILLED -> FILLED
//! {SUBMITTING, PENDING_ACK, NEW, PARTIALLY_FILLED} -> CANCELLING -> CANCELLED
//! any non-terminal -> REJECTED
//! NEW | PARTIALLY_FILLED -> EXPIRED
//! ```

use crate::clock::Nanos;
use crate::events::{ClientOid, ExchangeOid, OrderIntent, Price, Size};
use serde::{Deserialize, Serialize};

/// Completion tolerance for cumulative fills.
pub const FILL_EPS: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Created,
    Submitting,
    PendingAck,
    New,
    PartiallyFilled,
    Filled,
    Cancelling,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Submitting
                | OrderStatus::PendingAck
                | OrderStatus::New
                | OrderStatus::PartiallyFilled
                | OrderStatus::Cancelling
        )
    }
}

/// One order tracked by the registry. `client_oid` is the stable identity;
/// the exchange id is attached once the venue acks.
#[derive(Debug, Clone)]
pub struct Order {
    pub client_oid: ClientOid,
    pub intent: OrderIntent,
    pub exchange_oid: Option<ExchangeOid>,
    pub status: OrderStatus,
    pub filled_volume: Size,
    pub avg_price: Price,
    cumulative_cost: f64,
    pub created_at: Nanos,
    pub updated_at: Nanos,
    pub error: String,
}

impl Order {
    pub fn new(client_oid: ClientOid, intent: OrderIntent, now: Nanos) -> Self {
        Self {
            client_oid,
            intent,
            exchange_oid: None,
            status: OrderStatus::Created,
            filled_volume: 0.0,
            avg_price: 0.0,
            cumulative_cost: 0.0,
            created_at: now,
            updated_at: now,
            error: String::new(),
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    #[inline]
    pub fn remaining(&self) -> Size {
        (self.intent.volume - self.filled_volume).max(0.0)
    }

    pub fn mark_submitting(&mut self, now: Nanos) {
        self.status = OrderStatus::Submitting;
        self.updated_at = now;
    }

    pub fn mark_pending_ack(&mut self, now: Nanos) {
        if self.status == OrderStatus::Submitting {
            self.status = OrderStatus::PendingAck;
            self.updated_at = now;
        }
    }

    pub fn mark_new(&mut self, exchange_oid: Option<ExchangeOid>, now: Nanos) {
        self.status = OrderStatus::New;
        if let Some(oid) = exchange_oid {
            self.exchange_oid = Some(oid);
        }
        self.updated_at = now;
    }

    /// Accumulate a fill increment and advance the status.
    pub fn add_fill(&mut self, fill_qty: Size, fill_price: Price, now: Nanos) {
        if fill_qty <= 0.0 {
            return;
        }
        self.cumulative_cost += fill_qty * fill_price;
        self.filled_volume += fill_qty;
        if self.filled_volume > 0.0 {
            self.avg_price = self.cumulative_cost / self.filled_volume;
        }
        self.status = if self.filled_volume >= self.intent.volume - FILL_EPS {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = now;
    }

    pub fn mark_cancelling(&mut self, now: Nanos) {
        if self.is_active() {
            self.status = OrderStatus::Cancelling;
            self.updated_at = now;
        }
    }

    pub fn mark_cancelled(&mut self, now: Nanos) {
        if self.status != OrderStatus::Filled {
            self.status = OrderStatus::Cancelled;
            self.updated_at = now;
        }
    }

    pub fn mark_expired(&mut self, now: Nanos) {
        if matches!(self.status, OrderStatus::New | OrderStatus::PartiallyFilled) {
            self.status = OrderStatus::Expired;
            self.updated_at = now;
        } else {
            self.mark_cancelled(now);
        }
    }

    pub fn mark_rejected(&mut self, reason: &str, now: Nanos) {
        if !self.status.is_terminal() {
            self.status = OrderStatus::Rejected;
            self.error = reason.to_string();
            self.updated_at = now;
        }
    }

    pub fn to_snapshot(&self) -> OrderSnapshot {
        OrderSnapshot {
            client_oid: self.client_oid.clone(),
            exchange_oid: self.exchange_oid.clone(),
            symbol: self.intent.symbol.clone(),
            side: self.intent.side,
            status: self.status,
            price: self.intent.price,
            volume: self.intent.volume,
            filled_volume: self.filled_volume,
            avg_price: self.avg_price,
            update_time: self.updated_at,
        }
    }
}

/// Immutable order state copy pushed on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub client_oid: ClientOid,
    pub exchange_oid: Option<ExchangeOid>,
    pub symbol: String,
    pub side: crate::events::Side,
    pub status: OrderStatus,
    pub price: Price,
    pub volume: Size,
    pub filled_volume: Size,
    pub avg_price: Price,
    pub update_time: Nanos,
}
