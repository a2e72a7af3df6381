//! OMS Core
//!
//! The single source of truth for orders, net positions, open-order exposure
//! and margin. All order state lives behind one mutex; critical sections are
//! short and never call the gateway or push bus events while held. Event
//! emission and I/O always happen after release.

use crate::account::AccountManager;
use crate::bus::EventBus;
use crate::cache::DataCache;
use crate::clock::{Nanos, NANOS_PER_MILLI};
use crate::config::Config;
use crate::events::{
    AccountUpdate, CancelRequest, ClientOid, EngineEvent, ExchangeOid, ExchangeOrderUpdate,
    ExchangeStatus, OrderIntent, OrderRequest, PositionDrift, SystemHealth, TradeFill,
};
use crate::exposure::ExposureManager;
use crate::gateway::Gateway;
use crate::oms::order::{Order, OrderStatus, FILL_EPS};
use crate::oms::watchdog::AckWatchdog;
use crate::refdata::RefData;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Position drift below this is reconciliation noise.
const DRIFT_EPS: f64 = 1e-6;
/// Local vs remote open-order counts may differ transiently by this much.
const ORDER_COUNT_TOLERANCE: usize = 2;
const RECONCILE_PERIOD: Duration = Duration::from_secs(5);

struct OmsState {
    /// Ordered by client oid so full recomputes iterate deterministically.
    orders: BTreeMap<ClientOid, Order>,
    exchange_index: HashMap<ExchangeOid, ClientOid>,
    exposure: ExposureManager,
    account: AccountManager,
    submitted_count: u64,
    filled_count: u64,
}

/// OMS engine: submit/cancel entry points, exchange-update routing and the
/// reconciliation loop.
pub struct Oms {
    bus: EventBus,
    gateway: Arc<dyn Gateway>,
    cache: Arc<DataCache>,
    ref_data: Arc<RefData>,
    state: Mutex<OmsState>,
    pub watchdog: AckWatchdog,
    active: AtomicBool,
    reconcile_worker: Mutex<Option<JoinHandle<()>>>,
    max_pos_notional: f64,
    max_order_qty: f64,
    taker_fee: f64,
    /// Sim mode numbers oids sequentially so replays are reproducible.
    sequential_oids: bool,
    oid_seq: AtomicU64,
}

impl Oms {
    pub fn new(
        bus: EventBus,
        gateway: Arc<dyn Gateway>,
        cache: Arc<DataCache>,
        ref_data: Arc<RefData>,
        config: &Config,
    ) -> Arc<Self> {
        let oms = Arc::new(Self {
            bus: bus.clone(),
            gateway,
            cache,
            ref_data,
            state: Mutex::new(OmsState {
                orders: BTreeMap::new(),
                exchange_index: HashMap::new(),
                exposure: ExposureManager::new(),
                account: AccountManager::new(
                    config.account.initial_balance_usdt,
                    config.account.leverage,
                ),
                submitted_count: 0,
                filled_count: 0,
            }),
            watchdog: AckWatchdog::new(),
            active: AtomicBool::new(true),
            reconcile_worker: Mutex::new(None),
            max_pos_notional: config.risk.limits.max_pos_notional,
            max_order_qty: config.risk.limits.max_order_qty,
            taker_fee: config.backtest.taker_fee,
            sequential_oids: config.mode == crate::config::Mode::Sim,
            oid_seq: AtomicU64::new(0),
        });

        // Route gateway order updates into the engine, stamped with the
        // exchange update time so sim and live share the code path.
        let this = Arc::clone(&oms);
        bus.register(crate::events::EventKind::ExchangeOrder, move |event| {
            if let EngineEvent::ExchangeOrder(update) = event {
                this.on_exchange_update(update);
            }
        });

        oms
    }

    // -----------------------------------------------------------------
    // Order entry
    // -----------------------------------------------------------------

    /// Validate, risk-check and hand an intent to the gateway.
    ///
    /// Returns the client oid on acceptance, `None` on any local rejection.
    /// Steps up to the counter increment run under the lock; the gateway
    /// call does not.
    pub fn submit_order(&self, intent: OrderIntent, now: Nanos) -> Option<ClientOid> {
        let client_oid = if self.sequential_oids {
            format!("c-{:08}", self.oid_seq.fetch_add(1, Ordering::SeqCst) + 1)
        } else {
            Uuid::new_v4().to_string()
        };

        let account_update = {
            let mut state = self.state.lock();

            if !self.validate_params(&intent) {
                warn!(?intent, "order rejected: invalid parameters");
                return None;
            }

            let notional = intent.notional();
            if !state.account.check_margin(notional) {
                warn!(
                    symbol = %intent.symbol,
                    notional,
                    available = state.account.available,
                    "order rejected: insufficient margin"
                );
                return None;
            }

            if let Err(err) = state.exposure.check_risk(
                &intent.symbol,
                intent.side,
                intent.volume,
                self.max_pos_notional,
                self.cache.mark_price(&intent.symbol),
            ) {
                warn!(%err, "order rejected: exposure limit");
                return None;
            }

            let mut order = Order::new(client_oid.clone(), intent.clone(), now);
            order.mark_submitting(now);
            state.orders.insert(client_oid.clone(), order);
            let update = recompute(&mut state, &self.cache);
            state.submitted_count += 1;
            update
        };
        self.bus.put(EngineEvent::Account(account_update));

        // Gateway I/O outside the lock.
        let request = OrderRequest::from_intent(client_oid.clone(), &intent);
        match self.gateway.send_order(&request) {
            Some(exchange_oid) => {
                self.watchdog
                    .on_order_submitted(&exchange_oid, &intent.symbol, now);
                let mut state = self.state.lock();
                state
                    .exchange_index
                    .insert(exchange_oid.clone(), client_oid.clone());
                if let Some(order) = state.orders.get_mut(&client_oid) {
                    order.exchange_oid = Some(exchange_oid);
                    order.mark_pending_ack(now);
                }
            }
            None => {
                let account_update = {
                    let mut state = self.state.lock();
                    if let Some(order) = state.orders.get_mut(&client_oid) {
                        order.mark_rejected("gateway send failed", now);
                    }
                    recompute(&mut state, &self.cache)
                };
                self.bus.put(EngineEvent::Account(account_update));
                warn!(%client_oid, "gateway send failed; order rejected locally");
            }
        }

        Some(client_oid)
    }

    /// Request a cancel. The status moves to CANCELLING only when the
    /// matching exchange update arrives.
    pub fn cancel_order(&self, client_oid: &str) {
        let request = {
            let state = self.state.lock();
            let Some(order) = state.orders.get(client_oid) else {
                return;
            };
            if !order.is_active() {
                return;
            }
            CancelRequest {
                symbol: order.intent.symbol.clone(),
                order_id: order
                    .exchange_oid
                    .clone()
                    .unwrap_or_else(|| client_oid.to_string()),
            }
        };
        self.gateway.cancel_order(&request);
    }

    /// Fire-and-forget venue-side cancel of everything on a symbol, with an
    /// optimistic local CANCELLING so the orders are not reused before
    /// confirmations arrive.
    pub fn cancel_all_orders(&self, symbol: &str, now: Nanos) {
        self.gateway.cancel_all_orders(symbol);
        let mut state = self.state.lock();
        for order in state.orders.values_mut() {
            if order.intent.symbol == symbol && order.is_active() {
                order.mark_cancelling(now);
            }
        }
    }

    fn validate_params(&self, intent: &OrderIntent) -> bool {
        if intent.price <= 0.0 || intent.volume <= 0.0 {
            return false;
        }
        if intent.volume > self.max_order_qty {
            return false;
        }
        if let Some(info) = self.ref_data.get(&intent.symbol) {
            if intent.notional() < info.notional_floor() {
                return false;
            }
        }
        true
    }

    // -----------------------------------------------------------------
    // Exchange updates
    // -----------------------------------------------------------------

    /// Apply a normalized exchange order update: status routing, incremental
    /// fill computation, exposure/account recompute and event emission.
    pub fn on_exchange_update(&self, update: &ExchangeOrderUpdate) {
        let now = update.update_time;
        let mut events: Vec<EngineEvent> = Vec::new();

        {
            let mut state = self.state.lock();

            let client_oid = if state.orders.contains_key(&update.client_oid) {
                update.client_oid.clone()
            } else if let Some(oid) = state.exchange_index.get(&update.exchange_oid) {
                oid.clone()
            } else {
                return;
            };

            let Some(order) = state.orders.get_mut(&client_oid) else {
                return;
            };
            let prev_status = order.status;
            let symbol = order.intent.symbol.clone();
            let side = order.intent.side;
            let mut delta_qty = 0.0;

            match update.status {
                ExchangeStatus::New => {
                    order.mark_new(
                        (!update.exchange_oid.is_empty()).then(|| update.exchange_oid.clone()),
                        now,
                    );
                    if !update.exchange_oid.is_empty() {
                        state
                            .exchange_index
                            .insert(update.exchange_oid.clone(), client_oid.clone());
                    }
                }
                ExchangeStatus::Canceled => order.mark_cancelled(now),
                ExchangeStatus::Expired => order.mark_expired(now),
                ExchangeStatus::Rejected => order.mark_rejected("exchange rejected", now),
                ExchangeStatus::Filled | ExchangeStatus::PartiallyFilled => {
                    delta_qty = update.cum_filled_qty - order.filled_volume;
                    if delta_qty > FILL_EPS {
                        order.add_fill(delta_qty, update.filled_price, now);
                        state.filled_count += 1;
                        state
                            .exposure
                            .on_fill(&symbol, side, delta_qty, update.filled_price);
                        let fee = delta_qty * update.filled_price * self.taker_fee;
                        state.account.apply_fill_cash(0.0, fee);

                        events.push(EngineEvent::Trade(TradeFill {
                            symbol: symbol.clone(),
                            client_oid: client_oid.clone(),
                            trade_id: format!("t-{}", now / NANOS_PER_MILLI),
                            side,
                            price: update.filled_price,
                            volume: delta_qty,
                            ts: now,
                        }));
                    } else {
                        delta_qty = 0.0;
                    }
                }
            }

            let order = state.orders.get(&client_oid).expect("order present");
            let status = order.status;
            let snapshot = order.to_snapshot();
            if let Some(exchange_oid) = order.exchange_oid.clone() {
                self.watchdog.on_order_update(&exchange_oid, status, now);
            }

            let account_update = recompute(&mut state, &self.cache);
            events.push(EngineEvent::Account(account_update));

            if status != prev_status || update.status == ExchangeStatus::PartiallyFilled {
                events.push(EngineEvent::OrderSnapshot(snapshot));
                if delta_qty > 0.0 {
                    events.push(EngineEvent::Position(state.exposure.position_update(&symbol)));
                }
            }
        }

        for event in events {
            self.bus.put(event);
        }
    }

    // -----------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------

    /// One reconciliation pass: pull remote state, diff against local,
    /// publish a health report. Returns `None` when the gateway queries fail.
    pub fn reconcile_once(&self, now: Nanos) -> Option<SystemHealth> {
        // I/O first, lock second.
        let remote_positions = self.gateway.get_all_positions()?;
        let remote_orders = self.gateway.get_open_orders()?;

        let health = {
            let state = self.state.lock();

            let remote_map: HashMap<&str, f64> = remote_positions
                .iter()
                .filter(|p| p.position_amt != 0.0)
                .map(|p| (p.symbol.as_str(), p.position_amt))
                .collect();

            let mut symbols: Vec<&str> = remote_map.keys().copied().collect();
            let mut pos_drifts = Vec::new();
            let mut total_exposure = 0.0;

            for (symbol, _) in state.exposure.nonzero_positions() {
                if !symbols.contains(&symbol.as_str()) {
                    symbols.push(symbol.as_str());
                }
            }
            for symbol in symbols {
                let local = state.exposure.get(symbol).net_position;
                let remote = remote_map.get(symbol).copied().unwrap_or(0.0);
                if (local - remote).abs() > DRIFT_EPS {
                    pos_drifts.push(PositionDrift {
                        symbol: symbol.to_string(),
                        local,
                        remote,
                        diff: local - remote,
                    });
                }
                if let Some(mark) = self.cache.mark_price(symbol) {
                    total_exposure += local.abs() * mark;
                }
            }

            let mut order_count_local: usize = 0;
            let mut cancelling_count = 0;
            for order in state.orders.values() {
                if order.is_active() {
                    order_count_local += 1;
                    if order.status == OrderStatus::Cancelling {
                        cancelling_count += 1;
                    }
                }
            }

            let order_count_remote = remote_orders.len();
            let is_sync_error = !pos_drifts.is_empty()
                || order_count_local.abs_diff(order_count_remote) > ORDER_COUNT_TOLERANCE;

            let fill_ratio = if state.submitted_count > 0 {
                state.filled_count as f64 / state.submitted_count as f64
            } else {
                0.0
            };

            SystemHealth {
                total_exposure,
                margin_ratio: state.account.margin_ratio(),
                pos_drifts,
                order_count_local,
                order_count_remote,
                is_sync_error,
                cancelling_count,
                fill_ratio,
                ts: now,
            }
        };

        if health.is_sync_error {
            warn!(
                drifts = health.pos_drifts.len(),
                local = health.order_count_local,
                remote = health.order_count_remote,
                "reconciliation drift detected"
            );
        }
        self.bus.put(EngineEvent::Health(health.clone()));
        Some(health)
    }

    /// Forced sync: clear exposure and refill it from the exchange's
    /// authoritative snapshot. Idempotent.
    pub fn sync_with_exchange(&self) {
        info!("OMS syncing with exchange");
        let remote_account = self.gateway.get_account_info();
        let remote_positions = self.gateway.get_all_positions();

        let (account_update, position_updates) = {
            let mut state = self.state.lock();
            state.exposure.clear();

            if let Some(account) = remote_account {
                state.account.force_sync(account.wallet_balance);
            }

            let mut position_updates = Vec::new();
            if let Some(positions) = remote_positions {
                for p in positions {
                    if p.position_amt != 0.0 {
                        state
                            .exposure
                            .force_sync(&p.symbol, p.position_amt, p.entry_price);
                        position_updates.push(state.exposure.position_update(&p.symbol));
                    }
                }
            }

            let account_update = recompute(&mut state, &self.cache);
            (account_update, position_updates)
        };

        self.bus.put(EngineEvent::Account(account_update));
        for update in position_updates {
            self.bus.put(EngineEvent::Position(update));
        }
        info!("OMS sync complete");
    }

    /// Spawn the periodic reconciliation loop (live mode).
    pub fn start_reconciler(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("oms-reconcile".into())
            .spawn(move || {
                while this.active.load(Ordering::SeqCst) {
                    std::thread::sleep(RECONCILE_PERIOD);
                    if !this.active.load(Ordering::SeqCst) {
                        break;
                    }
                    this.reconcile_once(crate::oms::watchdog::wall_clock_nanos());
                }
            })
            .expect("spawn oms-reconcile");
        *self.reconcile_worker.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.watchdog.stop();
        if let Some(handle) = self.reconcile_worker.lock().take() {
            let _ = handle.join();
        }
    }

    // -----------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------

    pub fn order_status(&self, client_oid: &str) -> Option<OrderStatus> {
        self.state.lock().orders.get(client_oid).map(|o| o.status)
    }

    pub fn net_position(&self, symbol: &str) -> f64 {
        self.state.lock().exposure.get(symbol).net_position
    }

    pub fn open_quantities(&self, symbol: &str) -> (f64, f64) {
        let state = self.state.lock();
        let exposure = state.exposure.get(symbol);
        (exposure.open_buy_qty, exposure.open_sell_qty)
    }

    pub fn account_snapshot(&self) -> AccountUpdate {
        let state = self.state.lock();
        AccountUpdate {
            balance: state.account.balance,
            equity: state.account.equity,
            used_margin: state.account.used_margin,
            available: state.account.available,
        }
    }

    pub fn counters(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.submitted_count, state.filled_count)
    }

    pub fn active_order_count(&self) -> usize {
        self.state
            .lock()
            .orders
            .values()
            .filter(|o| o.is_active())
            .count()
    }
}

/// Recompute open-order aggregates and the account. Must run under the OMS
/// lock after any change to the active-order set.
fn recompute(state: &mut OmsState, cache: &DataCache) -> AccountUpdate {
    let OmsState {
        orders,
        exposure,
        account,
        ..
    } = state;
    exposure.update_open_orders(orders.values());
    account.calculate(exposure, cache)
}
