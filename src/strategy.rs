//! Strategy Base
//!
//! Strategies talk only to the OMS, through a [`StrategyContext`] that
//! normalises intents against reference data (price/quantity rounding,
//! minimum-notional filtering) and tracks the strategy's own live orders.

use crate::bus::EventBus;
use crate::clock::Nanos;
use crate::events::{
    BookUpdate, ClientOid, EngineEvent, EventKind, OrderIntent, PositionUpdate, Side, TradeFill,
};
use crate::oms::order::OrderSnapshot;
use crate::oms::Oms;
use crate::refdata::RefData;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Event callbacks a strategy implements. All callbacks run on the bus
/// dispatch thread (live) or inside `drain_all` (sim).
pub trait Strategy: Send {
    fn on_book(&mut self, ctx: &mut StrategyContext, book: &BookUpdate);
    fn on_trade(&mut self, _ctx: &mut StrategyContext, _trade: &TradeFill) {}
    fn on_order(&mut self, _ctx: &mut StrategyContext, _snapshot: &OrderSnapshot) {}
    fn on_position(&mut self, _ctx: &mut StrategyContext, _position: &PositionUpdate) {}
}

/// Per-strategy state and OMS access.
pub struct StrategyContext {
    pub name: String,
    oms: Arc<Oms>,
    ref_data: Arc<RefData>,
    /// Net position as last reported by the OMS.
    pub pos: f64,
    /// client_oid -> intent for this strategy's live orders.
    pub active_orders: HashMap<ClientOid, OrderIntent>,
    cancelling: HashSet<ClientOid>,
    /// Event time of the last dispatched event.
    pub now: Nanos,
}

impl StrategyContext {
    pub fn new(name: impl Into<String>, oms: Arc<Oms>, ref_data: Arc<RefData>) -> Self {
        Self {
            name: name.into(),
            oms,
            ref_data,
            pos: 0.0,
            active_orders: HashMap::new(),
            cancelling: HashSet::new(),
            now: 0,
        }
    }

    /// Normalise and submit an intent. Returns `None` when the intent is
    /// filtered locally or rejected by the OMS.
    pub fn send_intent(&mut self, mut intent: OrderIntent) -> Option<ClientOid> {
        intent.price = self.ref_data.round_price(&intent.symbol, intent.price);
        intent.volume = self.ref_data.round_qty(&intent.symbol, intent.volume);

        if let Some(info) = self.ref_data.get(&intent.symbol) {
            if intent.notional() < info.notional_floor() {
                debug!(
                    strategy = %self.name,
                    notional = intent.notional(),
                    "intent filtered below minimum notional"
                );
                return None;
            }
        }

        let client_oid = self.oms.submit_order(intent.clone(), self.now)?;
        self.active_orders.insert(client_oid.clone(), intent);
        Some(client_oid)
    }

    pub fn buy(&mut self, symbol: &str, price: f64, volume: f64) -> Option<ClientOid> {
        self.send_intent(OrderIntent::new(symbol, Side::Buy, price, volume))
    }

    pub fn sell(&mut self, symbol: &str, price: f64, volume: f64) -> Option<ClientOid> {
        self.send_intent(OrderIntent::new(symbol, Side::Sell, price, volume))
    }

    /// Cancel one of this strategy's orders (at most once per order).
    pub fn cancel_order(&mut self, client_oid: &str) {
        if !self.active_orders.contains_key(client_oid) {
            return;
        }
        if !self.cancelling.insert(client_oid.to_string()) {
            return;
        }
        self.oms.cancel_order(client_oid);
    }

    /// Cancel every order this strategy has on a symbol.
    pub fn cancel_all(&mut self, symbol: &str) {
        self.oms.cancel_all_orders(symbol, self.now);
        self.active_orders.retain(|oid, intent| {
            if intent.symbol == symbol {
                self.cancelling.remove(oid);
                false
            } else {
                true
            }
        });
    }

    /// Drop terminal orders from local tracking.
    fn handle_order(&mut self, snapshot: &OrderSnapshot) {
        if snapshot.status.is_terminal() {
            self.active_orders.remove(&snapshot.client_oid);
            self.cancelling.remove(&snapshot.client_oid);
        }
    }

    fn handle_position(&mut self, position: &PositionUpdate) {
        self.pos = position.net_position;
    }
}

/// Register a strategy's callbacks on the bus.
pub fn attach_strategy<S: Strategy + 'static>(
    bus: &EventBus,
    strategy: S,
    ctx: StrategyContext,
) -> Arc<Mutex<(S, StrategyContext)>> {
    let cell = Arc::new(Mutex::new((strategy, ctx)));

    {
        let cell = Arc::clone(&cell);
        bus.register(EventKind::Book, move |event| {
            if let EngineEvent::Book(book) = event {
                let mut guard = cell.lock();
                let (strategy, ctx) = &mut *guard;
                ctx.now = book.ts;
                strategy.on_book(ctx, book);
            }
        });
    }
    {
        let cell = Arc::clone(&cell);
        bus.register(EventKind::Trade, move |event| {
            if let EngineEvent::Trade(trade) = event {
                let mut guard = cell.lock();
                let (strategy, ctx) = &mut *guard;
                ctx.now = trade.ts;
                strategy.on_trade(ctx, trade);
            }
        });
    }
    {
        let cell = Arc::clone(&cell);
        bus.register(EventKind::OrderSnapshot, move |event| {
            if let EngineEvent::OrderSnapshot(snapshot) = event {
                let mut guard = cell.lock();
                let (strategy, ctx) = &mut *guard;
                ctx.now = snapshot.update_time;
                ctx.handle_order(snapshot);
                strategy.on_order(ctx, snapshot);
            }
        });
    }
    {
        let cell = Arc::clone(&cell);
        bus.register(EventKind::Position, move |event| {
            if let EngineEvent::Position(position) = event {
                let mut guard = cell.lock();
                let (strategy, ctx) = &mut *guard;
                ctx.handle_position(position);
                strategy.on_position(ctx, position);
            }
        });
    }

    cell
}

/// Demonstration market maker: symmetric quotes around the mid at a fixed
/// spread, requoted when the mid drifts.
pub struct MidSpreadQuoter {
    pub symbol: String,
    /// Half-spread in basis points.
    pub half_spread_bps: f64,
    pub quote_size: f64,
    last_quote_mid: Option<f64>,
}

impl MidSpreadQuoter {
    pub fn new(symbol: impl Into<String>, half_spread_bps: f64, quote_size: f64) -> Self {
        Self {
            symbol: symbol.into(),
            half_spread_bps,
            quote_size,
            last_quote_mid: None,
        }
    }
}

impl Strategy for MidSpreadQuoter {
    fn on_book(&mut self, ctx: &mut StrategyContext, book: &BookUpdate) {
        if book.symbol != self.symbol {
            return;
        }
        let Some(mid) = book.mid_price() else {
            return;
        };

        let half_spread = mid * self.half_spread_bps * 1e-4;
        // Requote when we have no quotes or the mid escaped the half-spread.
        let stale = match self.last_quote_mid {
            Some(last) => (mid - last).abs() > half_spread,
            None => true,
        };
        if !stale && !ctx.active_orders.is_empty() {
            return;
        }

        ctx.cancel_all(&self.symbol);
        let bid = ctx.buy(&self.symbol, mid - half_spread, self.quote_size);
        let ask = ctx.sell(&self.symbol, mid + half_spread, self.quote_size);
        if bid.is_some() || ask.is_some() {
            self.last_quote_mid = Some(mid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DataCache;
    use crate::config::Config;
    use crate::events::{Level, MarkPriceUpdate};
    use crate::gateway::DryRunGateway;
    use crate::refdata::ContractInfo;

    fn contract() -> ContractInfo {
        ContractInfo {
            symbol: "BTCUSDT".into(),
            tick_size: 0.1,
            step_size: 0.001,
            min_qty: 0.001,
            min_notional: 10.0,
            price_precision: 1,
            qty_precision: 3,
        }
    }

    fn setup() -> (EventBus, Arc<Oms>, Arc<RefData>) {
        let bus = EventBus::new();
        let gateway = DryRunGateway::new(bus.clone());
        let cache = Arc::new(DataCache::new());
        cache.update_mark_price("BTCUSDT", MarkPriceUpdate { price: 100.0, ts: 0 });
        let ref_data = Arc::new(RefData::from_contracts(vec![contract()]));
        let oms = Oms::new(
            bus.clone(),
            gateway,
            cache,
            Arc::clone(&ref_data),
            &Config::default(),
        );
        (bus, oms, ref_data)
    }

    fn book(bid: f64, ask: f64, ts: Nanos) -> EngineEvent {
        EngineEvent::Book(BookUpdate {
            symbol: "BTCUSDT".into(),
            ts,
            bids: vec![Level::new(bid, 5.0)],
            asks: vec![Level::new(ask, 5.0)],
        })
    }

    #[test]
    fn test_context_rounds_and_filters() {
        let (_bus, oms, ref_data) = setup();
        let mut ctx = StrategyContext::new("test", oms, ref_data);

        // Rounded price/qty reach the OMS.
        let oid = ctx
            .send_intent(OrderIntent::new("BTCUSDT", Side::Buy, 100.04, 1.00049))
            .unwrap();
        let intent = ctx.active_orders.get(&oid).unwrap();
        assert_eq!(intent.price, 100.0);
        assert_eq!(intent.volume, 1.0);

        // Sub-notional intents never reach the OMS.
        assert!(ctx
            .send_intent(OrderIntent::new("BTCUSDT", Side::Buy, 100.0, 0.05))
            .is_none());
    }

    #[test]
    fn test_quoter_places_two_sided_quotes() {
        let (bus, oms, ref_data) = setup();
        let ctx = StrategyContext::new("quoter", Arc::clone(&oms), ref_data);
        attach_strategy(&bus, MidSpreadQuoter::new("BTCUSDT", 10.0, 1.0), ctx);

        bus.put(book(99.9, 100.1, 1));
        bus.drain_all();

        let (open_buy, open_sell) = oms.open_quantities("BTCUSDT");
        assert_eq!(open_buy, 1.0);
        assert_eq!(open_sell, 1.0);
    }

    #[test]
    fn test_quoter_requotes_on_drift() {
        let (bus, oms, ref_data) = setup();
        let ctx = StrategyContext::new("quoter", Arc::clone(&oms), ref_data);
        attach_strategy(&bus, MidSpreadQuoter::new("BTCUSDT", 10.0, 1.0), ctx);

        bus.put(book(99.9, 100.1, 1));
        bus.drain_all();
        let (submitted_before, _) = oms.counters();

        // Tiny drift inside the half-spread: no new orders.
        bus.put(book(99.91, 100.11, 2));
        bus.drain_all();
        assert_eq!(oms.counters().0, submitted_before);

        // Large drift: requote.
        bus.put(book(101.0, 101.2, 3));
        bus.drain_all();
        assert!(oms.counters().0 > submitted_before);
    }
}
