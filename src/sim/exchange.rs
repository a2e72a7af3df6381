//! Exchange Emulator
//!
//! Replays recorded depth and trades, and simulates how our own orders would
//! have fared: takers walk the visible book, makers join a FIFO queue whose
//! position decays as the public feed shows volume leaving the level.
//!
//! Queue model: a resting order tracks `queue_ahead`, the visible volume in
//! front of it. Public trades at or through its price reduce `queue_ahead`;
//! once it goes negative the overflow fills us at our resting price. When a
//! depth update shrinks a level without a trade, the shrinkage is applied as
//! probabilistic cancels (`p_cancel`), scaled up with short-term volatility
//! because fast markets cancel harder.

use crate::book::Px;
use crate::bus::EventBus;
use crate::clock::Nanos;
use crate::events::{
    AggTrade, BookUpdate, CancelRequest, EngineEvent, ExchangeOid, ExchangeOrderUpdate,
    ExchangeStatus, OrderRequest, Price, Side, Size, Symbol,
};
use crate::sim::latency::LatencyModel;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

const MID_WINDOW: usize = 100;
const MIN_WINDOW_FOR_VOL: usize = 10;
const QTY_EPS: f64 = 1e-9;

/// One of our orders resting inside the emulator.
#[derive(Debug, Clone)]
pub struct SimOrder {
    pub request: OrderRequest,
    pub exchange_oid: ExchangeOid,
    pub entry_time: Nanos,
    pub initial_queue_vol: Size,
    pub queue_ahead: Size,
    pub filled: Size,
    pub active: bool,
    pub is_maker: bool,
}

impl SimOrder {
    fn new(request: OrderRequest, exchange_oid: ExchangeOid, entry_time: Nanos) -> Self {
        Self {
            request,
            exchange_oid,
            entry_time,
            initial_queue_vol: 0.0,
            queue_ahead: 0.0,
            filled: 0.0,
            active: true,
            is_maker: false,
        }
    }

    #[inline]
    fn remaining(&self) -> Size {
        (self.request.volume - self.filled).max(0.0)
    }
}

#[derive(Debug, Default)]
struct SymbolSim {
    /// Visible book from the latest replayed depth update.
    book_bids: BTreeMap<Px, Size>,
    book_asks: BTreeMap<Px, Size>,
    /// Our resting orders per price, in arrival order.
    bids: BTreeMap<Px, Vec<SimOrder>>,
    asks: BTreeMap<Px, Vec<SimOrder>>,
    mids: VecDeque<f64>,
    volatility: f64,
}

impl SymbolSim {
    fn update_volatility(&mut self, mid: f64) {
        if self.mids.len() == MID_WINDOW {
            self.mids.pop_front();
        }
        self.mids.push_back(mid);
        if self.mids.len() > MIN_WINDOW_FOR_VOL {
            let n = self.mids.len() as f64;
            let mean = self.mids.iter().sum::<f64>() / n;
            let var = self.mids.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n;
            self.volatility = var.sqrt();
        }
    }
}

/// Deterministic exchange stand-in for backtests.
pub struct ExchangeEmulator {
    bus: EventBus,
    latency: Arc<Mutex<LatencyModel>>,
    cancel_base_prob: f64,
    symbols: HashMap<Symbol, SymbolSim>,
    trade_count: u64,
}

impl ExchangeEmulator {
    pub fn new(bus: EventBus, latency: Arc<Mutex<LatencyModel>>, cancel_base_prob: f64) -> Self {
        Self {
            bus,
            latency,
            cancel_base_prob,
            symbols: HashMap::new(),
            trade_count: 0,
        }
    }

    fn sim(&mut self, symbol: &str) -> &mut SymbolSim {
        self.symbols.entry(symbol.to_string()).or_default()
    }

    // -----------------------------------------------------------------
    // Market data replay
    // -----------------------------------------------------------------

    /// Replayed depth update: publish it, decay resting queues against the
    /// level shrinkage, then install the new shadow book.
    pub fn on_depth(&mut self, book: &BookUpdate) {
        self.bus.put(EngineEvent::Book(book.clone()));
        self.latency.lock().record_message(book.ts);

        let cancel_base_prob = self.cancel_base_prob;
        let sim = self.sim(&book.symbol);
        if let Some(mid) = book.mid_price() {
            sim.update_volatility(mid);
        }

        let p_cancel = (cancel_base_prob * (1.0 + 0.5 * sim.volatility)).min(1.0);

        let new_bids: BTreeMap<Px, Size> = book
            .bids
            .iter()
            .map(|l| (Px(l.price), l.size))
            .collect();
        let new_asks: BTreeMap<Px, Size> = book
            .asks
            .iter()
            .map(|l| (Px(l.price), l.size))
            .collect();

        apply_cancel_decay(&mut sim.bids, &sim.book_bids, &new_bids, p_cancel);
        apply_cancel_decay(&mut sim.asks, &sim.book_asks, &new_asks, p_cancel);

        sim.book_bids = new_bids;
        sim.book_asks = new_asks;
    }

    /// Replayed public trade: publish it, then consume the maker queues on
    /// the side the aggressor hit.
    pub fn on_trade(&mut self, trade: &AggTrade) {
        self.bus.put(EngineEvent::AggTrade(trade.clone()));
        self.latency.lock().record_message(trade.ts);

        let mut fills = Vec::new();
        let sim = self.sim(&trade.symbol);
        if trade.maker_is_buyer {
            // Aggressor sold into bids: hit bid queues at prices >= trade
            // price, best (highest) first.
            let prices: Vec<Px> = sim
                .bids
                .range(Px(trade.price)..)
                .rev()
                .map(|(px, _)| *px)
                .collect();
            for px in prices {
                if let Some(orders) = sim.bids.get_mut(&px) {
                    consume_queue(orders, trade.qty, trade.ts, &mut fills);
                }
            }
        } else {
            // Aggressor bought from asks: lowest price first.
            let prices: Vec<Px> = sim
                .asks
                .range(..=Px(trade.price))
                .map(|(px, _)| *px)
                .collect();
            for px in prices {
                if let Some(orders) = sim.asks.get_mut(&px) {
                    consume_queue(orders, trade.qty, trade.ts, &mut fills);
                }
            }
        }

        for fill in fills {
            self.emit_fill(fill);
        }
    }

    // -----------------------------------------------------------------
    // Order flow from the gateway
    // -----------------------------------------------------------------

    /// An order reaches the venue after its simulated latency.
    pub fn on_order_arrival(&mut self, request: &OrderRequest, exchange_oid: &str, now: Nanos) {
        let mut order = SimOrder::new(request.clone(), exchange_oid.to_string(), now);
        let post_only = request.time_in_force.is_post_only();
        let mut fills = Vec::new();

        let crosses = {
            let sim = self.sim(&request.symbol);
            match request.side {
                Side::Buy => sim
                    .book_asks
                    .iter()
                    .next()
                    .map(|(px, _)| request.price >= px.0)
                    .unwrap_or(false),
                Side::Sell => sim
                    .book_bids
                    .iter()
                    .next_back()
                    .map(|(px, _)| request.price <= px.0)
                    .unwrap_or(false),
            }
        };

        if crosses && post_only {
            // GTX/RPI would take: the venue expires it instead.
            self.push_order_status(&order, ExchangeStatus::Expired, 0.0, now);
            return;
        }

        // Venue accepts the order; ack precedes any fills.
        self.push_order_status(&order, ExchangeStatus::New, 0.0, now);

        if crosses {
            let sim = self.sim(&request.symbol);
            match request.side {
                Side::Buy => match_taker(&mut order, &mut sim.book_asks, true, now, &mut fills),
                Side::Sell => match_taker(&mut order, &mut sim.book_bids, false, now, &mut fills),
            }
        }

        let residual = order.active;
        if residual && request.time_in_force == crate::events::TimeInForce::Ioc {
            order.active = false;
            let cum = order.filled;
            for fill in fills {
                self.emit_fill(fill);
            }
            self.push_order_status(&order, ExchangeStatus::Canceled, cum, now);
            return;
        }

        if residual {
            // Residual joins the maker queue behind the visible volume.
            order.is_maker = true;
            let sim = self.sim(&request.symbol);
            let (book_side, queue_side) = match request.side {
                Side::Buy => (&sim.book_bids, &mut sim.bids),
                Side::Sell => (&sim.book_asks, &mut sim.asks),
            };
            let queue_vol = book_side.get(&Px(request.price)).copied().unwrap_or(0.0);
            order.initial_queue_vol = queue_vol;
            order.queue_ahead = queue_vol;
            debug!(
                symbol = %request.symbol,
                price = request.price,
                queue_ahead = queue_vol,
                "sim order joined maker queue"
            );
            queue_side.entry(Px(request.price)).or_default().push(order);
        }

        for fill in fills {
            self.emit_fill(fill);
        }
    }

    /// A cancel reaches the venue.
    pub fn on_cancel_arrival(&mut self, request: &CancelRequest, now: Nanos) {
        let sim = self.sim(&request.symbol);
        let mut cancelled: Option<SimOrder> = None;
        for queues in [&mut sim.bids, &mut sim.asks] {
            for orders in queues.values_mut() {
                if let Some(order) = orders
                    .iter_mut()
                    .find(|o| o.active && o.exchange_oid == request.order_id)
                {
                    order.active = false;
                    cancelled = Some(order.clone());
                    break;
                }
            }
            if cancelled.is_some() {
                break;
            }
        }

        if let Some(order) = cancelled {
            self.push_order_status(&order, ExchangeStatus::Canceled, order.filled, now);
        }
    }

    /// A chaos-injected rejection reaches the strategy side.
    pub fn on_order_reject(&mut self, request: &OrderRequest, exchange_oid: &str, now: Nanos) {
        let order = SimOrder::new(request.clone(), exchange_oid.to_string(), now);
        self.push_order_status(&order, ExchangeStatus::Rejected, 0.0, now);
    }

    // -----------------------------------------------------------------
    // Event emission
    // -----------------------------------------------------------------

    fn emit_fill(&mut self, fill: QueueFill) {
        self.trade_count += 1;
        let status = if fill.completed {
            ExchangeStatus::Filled
        } else {
            ExchangeStatus::PartiallyFilled
        };
        self.bus.put(EngineEvent::ExchangeOrder(ExchangeOrderUpdate {
            client_oid: fill.client_oid,
            exchange_oid: fill.exchange_oid,
            symbol: fill.symbol,
            status,
            filled_qty: fill.qty,
            filled_price: fill.price,
            cum_filled_qty: fill.cum_filled,
            update_time: fill.ts,
        }));
    }

    fn push_order_status(
        &self,
        order: &SimOrder,
        status: ExchangeStatus,
        cum_filled: Size,
        now: Nanos,
    ) {
        self.bus.put(EngineEvent::ExchangeOrder(ExchangeOrderUpdate {
            client_oid: order.request.client_oid.clone(),
            exchange_oid: order.exchange_oid.clone(),
            symbol: order.request.symbol.clone(),
            status,
            filled_qty: 0.0,
            filled_price: order.request.price,
            cum_filled_qty: cum_filled,
            update_time: now,
        }));
    }

    /// Number of fill events produced so far.
    pub fn fill_count(&self) -> u64 {
        self.trade_count
    }

    #[cfg(test)]
    pub(crate) fn resting_order(&self, symbol: &str, exchange_oid: &str) -> Option<SimOrder> {
        let sim = self.symbols.get(symbol)?;
        for queues in [&sim.bids, &sim.asks] {
            for orders in queues.values() {
                if let Some(order) = orders.iter().find(|o| o.exchange_oid == exchange_oid) {
                    return Some(order.clone());
                }
            }
        }
        None
    }
}

/// One fill produced by the queue or taker model.
struct QueueFill {
    client_oid: String,
    exchange_oid: ExchangeOid,
    symbol: Symbol,
    qty: Size,
    price: Price,
    cum_filled: Size,
    completed: bool,
    ts: Nanos,
}

fn record_fill(order: &mut SimOrder, qty: Size, price: Price, ts: Nanos, fills: &mut Vec<QueueFill>) {
    order.filled += qty;
    let completed = order.filled >= order.request.volume - QTY_EPS;
    if completed {
        order.active = false;
    }
    fills.push(QueueFill {
        client_oid: order.request.client_oid.clone(),
        exchange_oid: order.exchange_oid.clone(),
        symbol: order.request.symbol.clone(),
        qty,
        price,
        cum_filled: order.filled,
        completed,
        ts,
    });
}

/// Walk the opposite book in price order, consuming visible liquidity until
/// the order is filled or its limit price stops it.
fn match_taker(
    order: &mut SimOrder,
    book_side: &mut BTreeMap<Px, Size>,
    is_buy: bool,
    ts: Nanos,
    fills: &mut Vec<QueueFill>,
) {
    let prices: Vec<Px> = if is_buy {
        book_side.keys().copied().collect()
    } else {
        book_side.keys().rev().copied().collect()
    };

    for px in prices {
        if is_buy && px.0 > order.request.price {
            break;
        }
        if !is_buy && px.0 < order.request.price {
            break;
        }

        let available = book_side.get(&px).copied().unwrap_or(0.0);
        let fill_qty = available.min(order.remaining());
        if fill_qty > 0.0 {
            record_fill(order, fill_qty, px.0, ts, fills);
            let left = available - fill_qty;
            if left <= QTY_EPS {
                book_side.remove(&px);
            } else {
                book_side.insert(px, left);
            }
        }
        if !order.active {
            break;
        }
    }
}

/// A public trade of `trade_qty` consumed the front of the real queue at one
/// price level; every resting order moves up by that amount, and any
/// overflow past an order's `queue_ahead` fills it.
fn consume_queue(orders: &mut Vec<SimOrder>, trade_qty: Size, ts: Nanos, fills: &mut Vec<QueueFill>) {
    for order in orders.iter_mut() {
        if !order.active {
            continue;
        }
        let prev_queue = order.queue_ahead;
        order.queue_ahead -= trade_qty;
        if order.queue_ahead < 0.0 {
            let covered = if prev_queue >= 0.0 {
                -order.queue_ahead
            } else {
                trade_qty
            };
            let fill_qty = covered.min(order.remaining());
            if fill_qty > 0.0 {
                record_fill(order, fill_qty, order.request.price, ts, fills);
            }
        }
    }
}

/// Depth shrank at a level without trades: treat the difference as cancels
/// spread across the queue, each resting order losing up to
/// `delta * p_cancel` of its `queue_ahead`.
fn apply_cancel_decay(
    queues: &mut BTreeMap<Px, Vec<SimOrder>>,
    old_book: &BTreeMap<Px, Size>,
    new_book: &BTreeMap<Px, Size>,
    p_cancel: f64,
) {
    for (px, orders) in queues.iter_mut() {
        if orders.is_empty() {
            continue;
        }
        let old_vol = old_book.get(px).copied().unwrap_or(0.0);
        let new_vol = new_book.get(px).copied().unwrap_or(0.0);
        if new_vol < old_vol {
            let delta = old_vol - new_vol;
            for order in orders.iter_mut() {
                if order.active && order.queue_ahead > 0.0 {
                    order.queue_ahead = (order.queue_ahead - delta * p_cancel).max(0.0);
                }
            }
        }
    }
}
