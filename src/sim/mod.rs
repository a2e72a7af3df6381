//! Deterministic Simulation Engine
//!
//! Event-time backtesting over recorded depth/trade tables, driving the same
//! bus, OMS and strategy code as live trading. Determinism contract: all
//! time comes from the replayed stream, all randomness from one seeded
//! ChaCha RNG, and every causal consequence of a sim event is drained from
//! the bus before logical time advances.

pub mod engine;
pub mod exchange;
pub mod gateway;
pub mod latency;
pub mod loader;

pub use engine::{SimAction, SimScheduler, PRIO_GATEWAY, PRIO_MARKET_DATA, PRIO_TIMER};
pub use exchange::ExchangeEmulator;
pub use gateway::ChaosGateway;
pub use latency::LatencyModel;
pub use loader::DataLoader;

use crate::bus::EventBus;
use crate::cache::DataCache;
use crate::clock::EventClock;
use crate::config::Config;
use crate::events::{EngineEvent, EventKind, TradeFill};
use crate::oms::Oms;
use crate::refdata::RefData;
use crate::strategy::{attach_strategy, Strategy, StrategyContext};
use anyhow::{ensure, Context, Result};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Final state of a backtest run.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestReport {
    pub balance: f64,
    pub equity: f64,
    pub net_position: f64,
    pub submitted: u64,
    pub filled: u64,
    pub trades: Vec<TradeFill>,
}

/// Wire the full engine against the emulator and replay one symbol's
/// recorded data through it.
pub fn run_backtest<S: Strategy + 'static>(
    config: &Config,
    data_dir: impl AsRef<Path>,
    symbol: &str,
    strategy: S,
) -> Result<BacktestReport> {
    let ref_data = Arc::new(RefData::from_contracts(config.contracts.clone()));
    ensure!(
        ref_data.get(symbol).is_some(),
        "no reference data for {symbol}; refusing to trade without tick/step sizes"
    );

    let bus = EventBus::new();
    let cache = Arc::new(DataCache::new());

    // Cache updates run before any strategy sees the event.
    {
        let cache = Arc::clone(&cache);
        bus.register(EventKind::Book, move |event| {
            if let EngineEvent::Book(book) = event {
                cache.update_book(book.clone());
            }
        });
    }
    {
        let cache = Arc::clone(&cache);
        bus.register(EventKind::AggTrade, move |event| {
            if let EngineEvent::AggTrade(trade) = event {
                cache.update_trade(trade.clone());
            }
        });
    }
    {
        let cache = Arc::clone(&cache);
        bus.register(EventKind::MarkPrice, move |event| {
            if let EngineEvent::MarkPrice(symbol, update) = event {
                cache.update_mark_price(symbol, *update);
            }
        });
    }

    let scheduler = Arc::new(Mutex::new(SimScheduler::new()));
    let clock = Arc::new(Mutex::new(EventClock::new(0)));
    let latency = Arc::new(Mutex::new(LatencyModel::new(
        config.backtest.latency_base_ms,
        config.backtest.latency_sigma,
    )));
    let rng = Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(config.backtest.seed)));

    let chaos = Arc::new(ChaosGateway::new(
        Arc::clone(&scheduler),
        Arc::clone(&clock),
        Arc::clone(&latency),
        Arc::clone(&rng),
        config.chaos.packet_loss_rate,
        config.chaos.order_reject_rate,
    ));

    let oms = Oms::new(
        bus.clone(),
        chaos,
        Arc::clone(&cache),
        Arc::clone(&ref_data),
        config,
    );

    let trades = Arc::new(Mutex::new(Vec::new()));
    {
        let trades = Arc::clone(&trades);
        bus.register(EventKind::Trade, move |event| {
            if let EngineEvent::Trade(trade) = event {
                trades.lock().push(trade.clone());
            }
        });
    }

    let ctx = StrategyContext::new("backtest", Arc::clone(&oms), Arc::clone(&ref_data));
    attach_strategy(&bus, strategy, ctx);

    let loader = DataLoader::new(data_dir, symbol);
    let scheduled = loader
        .load_and_schedule(&mut scheduler.lock())
        .context("loading recorded data")?;
    info!(scheduled, "starting backtest run");

    let mut emulator = ExchangeEmulator::new(
        bus.clone(),
        Arc::clone(&latency),
        config.backtest.cancel_base_prob,
    );
    run_loop(&bus, &scheduler, &clock, &mut emulator);

    let account = oms.account_snapshot();
    let (submitted, filled) = oms.counters();
    let report = BacktestReport {
        balance: account.balance,
        equity: account.equity,
        net_position: oms.net_position(symbol),
        submitted,
        filled,
        trades: std::mem::take(&mut *trades.lock()),
    };
    info!(
        balance = report.balance,
        net_position = report.net_position,
        trades = report.trades.len(),
        "backtest complete"
    );
    Ok(report)
}

/// The simulator core: pop, advance time, dispatch, drain. Every event
/// produced while handling a sim event is fully dispatched before the next
/// sim event fires.
pub fn run_loop(
    bus: &EventBus,
    scheduler: &Arc<Mutex<SimScheduler>>,
    clock: &Arc<Mutex<EventClock>>,
    emulator: &mut ExchangeEmulator,
) {
    loop {
        // Locks are released before dispatch: handlers reschedule and read
        // the clock.
        let event = scheduler.lock().pop();
        let Some(event) = event else { break };
        clock.lock().update(event.ts);
        let now = clock.lock().now();

        match event.action {
            SimAction::Depth(book) => emulator.on_depth(&book),
            SimAction::Trade(trade) => emulator.on_trade(&trade),
            SimAction::OrderArrival(request, exchange_oid) => {
                emulator.on_order_arrival(&request, &exchange_oid, now)
            }
            SimAction::CancelArrival(request) => emulator.on_cancel_arrival(&request, now),
            SimAction::OrderReject(request, exchange_oid) => {
                emulator.on_order_reject(&request, &exchange_oid, now)
            }
        }

        bus.drain_all();
    }
}
