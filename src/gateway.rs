//! Gateway Abstraction
//!
//! Every venue connection (live, dry-run, simulated) implements [`Gateway`]:
//! async-ish order entry that is safe to call from the OMS path, plus the
//! pull queries the reconciliation loop needs. Market data and order updates
//! flow back through the event bus as typed events.

use crate::book::DepthSnapshot;
use crate::bus::EventBus;
use crate::clock::Nanos;
use crate::events::{
    CancelRequest, EngineEvent, EventKind, ExchangeOid, ExchangeOrderUpdate, ExchangeStatus,
    OrderRequest, Price, Side, Size, Symbol,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Disconnected,
    Connecting,
    Ready,
}

/// Account balance snapshot from the venue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountInfo {
    pub wallet_balance: f64,
    pub initial_margin: f64,
}

/// Position as reported by the venue.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePosition {
    pub symbol: Symbol,
    pub position_amt: f64,
    pub entry_price: Price,
}

/// Open order as reported by the venue.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteOrder {
    pub symbol: Symbol,
    pub exchange_oid: ExchangeOid,
    pub side: Side,
    pub price: Price,
    pub volume: Size,
}

/// Venue connection contract.
///
/// `send_order` must be non-blocking enough to call from the OMS submit path
/// and must return an id unique per request; `None` means the send failed
/// locally and no exchange-side state exists.
pub trait Gateway: Send + Sync {
    fn connect(&self, symbols: &[Symbol]);
    fn close(&self);
    fn state(&self) -> GatewayState;

    fn send_order(&self, req: &OrderRequest) -> Option<ExchangeOid>;
    fn cancel_order(&self, req: &CancelRequest);
    fn cancel_all_orders(&self, symbol: &str);

    fn get_account_info(&self) -> Option<AccountInfo>;
    fn get_all_positions(&self) -> Option<Vec<RemotePosition>>;
    fn get_open_orders(&self) -> Option<Vec<RemoteOrder>>;
    fn get_depth_snapshot(&self, symbol: &str) -> Option<DepthSnapshot>;
}

/// Paper-trading gateway: accepts orders into a local resting book and fills
/// them against live top-of-book crossings. Exercises the whole threaded
/// pipeline without touching a venue.
pub struct DryRunGateway {
    bus: EventBus,
    state: AtomicU8,
    resting: Mutex<HashMap<ExchangeOid, OrderRequest>>,
}

impl DryRunGateway {
    pub fn new(bus: EventBus) -> Arc<Self> {
        let gateway = Arc::new(Self {
            bus: bus.clone(),
            state: AtomicU8::new(0),
            resting: Mutex::new(HashMap::new()),
        });

        // Match resting paper orders on every book update.
        let this = Arc::clone(&gateway);
        bus.register(EventKind::Book, move |event| {
            if let EngineEvent::Book(book) = event {
                this.on_book(book);
            }
        });

        gateway
    }

    fn on_book(&self, book: &crate::events::BookUpdate) {
        let (Some(best_bid), Some(best_ask)) = (book.best_bid(), book.best_ask()) else {
            return;
        };

        let mut filled = Vec::new();
        {
            let mut resting = self.resting.lock();
            resting.retain(|oid, req| {
                if req.symbol != book.symbol {
                    return true;
                }
                let crossed = match req.side {
                    Side::Buy => best_ask.price <= req.price,
                    Side::Sell => best_bid.price >= req.price,
                };
                if crossed {
                    filled.push((oid.clone(), req.clone()));
                }
                !crossed
            });
        }

        for (exchange_oid, req) in filled {
            info!(symbol = %req.symbol, side = ?req.side, price = req.price, "dry-run order filled");
            self.push_update(&req, &exchange_oid, ExchangeStatus::Filled, req.volume, book.ts);
        }
    }

    fn push_update(
        &self,
        req: &OrderRequest,
        exchange_oid: &str,
        status: ExchangeStatus,
        cum_filled: Size,
        ts: Nanos,
    ) {
        let filled_qty = if matches!(
            status,
            ExchangeStatus::Filled | ExchangeStatus::PartiallyFilled
        ) {
            cum_filled
        } else {
            0.0
        };
        self.bus.put(EngineEvent::ExchangeOrder(ExchangeOrderUpdate {
            client_oid: req.client_oid.clone(),
            exchange_oid: exchange_oid.to_string(),
            symbol: req.symbol.clone(),
            status,
            filled_qty,
            filled_price: req.price,
            cum_filled_qty: cum_filled,
            update_time: ts,
        }));
    }
}

impl Gateway for DryRunGateway {
    fn connect(&self, symbols: &[Symbol]) {
        info!(?symbols, "dry-run gateway connected");
        self.state.store(2, Ordering::SeqCst);
    }

    fn close(&self) {
        self.state.store(0, Ordering::SeqCst);
        self.resting.lock().clear();
    }

    fn state(&self) -> GatewayState {
        match self.state.load(Ordering::SeqCst) {
            2 => GatewayState::Ready,
            1 => GatewayState::Connecting,
            _ => GatewayState::Disconnected,
        }
    }

    fn send_order(&self, req: &OrderRequest) -> Option<ExchangeOid> {
        let exchange_oid = Uuid::new_v4().simple().to_string()[..8].to_string();
        self.resting
            .lock()
            .insert(exchange_oid.clone(), req.clone());
        self.push_update(req, &exchange_oid, ExchangeStatus::New, 0.0, 0);
        Some(exchange_oid)
    }

    fn cancel_order(&self, req: &CancelRequest) {
        let removed = self.resting.lock().remove(&req.order_id);
        if let Some(order) = removed {
            self.push_update(&order, &req.order_id, ExchangeStatus::Canceled, 0.0, 0);
        }
    }

    fn cancel_all_orders(&self, symbol: &str) {
        let to_cancel: Vec<ExchangeOid> = {
            let resting = self.resting.lock();
            resting
                .iter()
                .filter(|(_, req)| req.symbol == symbol)
                .map(|(oid, _)| oid.clone())
                .collect()
        };
        for oid in to_cancel {
            self.cancel_order(&CancelRequest {
                symbol: symbol.to_string(),
                order_id: oid,
            });
        }
    }

    fn get_account_info(&self) -> Option<AccountInfo> {
        None
    }

    fn get_all_positions(&self) -> Option<Vec<RemotePosition>> {
        Some(Vec::new())
    }

    fn get_open_orders(&self) -> Option<Vec<RemoteOrder>> {
        let resting = self.resting.lock();
        Some(
            resting
                .iter()
                .map(|(oid, req)| RemoteOrder {
                    symbol: req.symbol.clone(),
                    exchange_oid: oid.clone(),
                    side: req.side,
                    price: req.price,
                    volume: req.volume,
                })
                .collect(),
        )
    }

    fn get_depth_snapshot(&self, _symbol: &str) -> Option<DepthSnapshot> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BookUpdate, Level, TimeInForce};

    fn request(side: Side, price: f64) -> OrderRequest {
        OrderRequest {
            client_oid: "c-1".into(),
            symbol: "BTCUSDT".into(),
            side,
            price,
            volume: 1.0,
            time_in_force: TimeInForce::Gtc,
        }
    }

    fn book(bid: f64, ask: f64) -> EngineEvent {
        EngineEvent::Book(BookUpdate {
            symbol: "BTCUSDT".into(),
            ts: 1,
            bids: vec![Level::new(bid, 1.0)],
            asks: vec![Level::new(ask, 1.0)],
        })
    }

    #[test]
    fn test_dry_run_fills_on_cross() {
        let bus = EventBus::new();
        let gateway = DryRunGateway::new(bus.clone());
        gateway.connect(&["BTCUSDT".into()]);

        let updates = Arc::new(Mutex::new(Vec::new()));
        {
            let updates = Arc::clone(&updates);
            bus.register(EventKind::ExchangeOrder, move |event| {
                if let EngineEvent::ExchangeOrder(u) = event {
                    updates.lock().push(u.clone());
                }
            });
        }

        let oid = gateway.send_order(&request(Side::Buy, 100.0)).unwrap();
        assert!(!oid.is_empty());

        // Ask above our bid: still resting.
        bus.put(book(99.0, 101.0));
        bus.drain_all();
        assert_eq!(gateway.get_open_orders().unwrap().len(), 1);

        // Ask crosses down through our price: filled.
        bus.put(book(99.0, 99.5));
        bus.drain_all();
        assert!(gateway.get_open_orders().unwrap().is_empty());

        let updates = updates.lock();
        assert_eq!(updates.first().unwrap().status, ExchangeStatus::New);
        let last = updates.last().unwrap();
        assert_eq!(last.status, ExchangeStatus::Filled);
        assert_eq!(last.cum_filled_qty, 1.0);
    }

    #[test]
    fn test_dry_run_cancel() {
        let bus = EventBus::new();
        let gateway = DryRunGateway::new(bus.clone());
        let oid = gateway.send_order(&request(Side::Sell, 105.0)).unwrap();
        gateway.cancel_order(&CancelRequest {
            symbol: "BTCUSDT".into(),
            order_id: oid,
        });
        assert!(gateway.get_open_orders().unwrap().is_empty());
    }
}
