//! End-to-end engine tests: recorded-data replay through the full
//! bus/OMS/emulator pipeline, reconciliation drift handling, and run-to-run
//! determinism.

use parking_lot::Mutex;
use perp_maker::book::DepthSnapshot;
use perp_maker::bus::EventBus;
use perp_maker::cache::DataCache;
use perp_maker::clock::{Nanos, NANOS_PER_SEC};
use perp_maker::config::{Config, Mode};
use perp_maker::events::{
    BookUpdate, CancelRequest, EngineEvent, EventKind, ExchangeOrderUpdate, ExchangeStatus,
    OrderIntent, OrderRequest, Side,
};
use perp_maker::gateway::{AccountInfo, Gateway, GatewayState, RemoteOrder, RemotePosition};
use perp_maker::oms::reconciler::AutoReconciler;
use perp_maker::oms::Oms;
use perp_maker::refdata::{ContractInfo, RefData};
use perp_maker::sim::run_backtest;
use perp_maker::strategy::MidSpreadQuoter;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

fn contract() -> ContractInfo {
    ContractInfo {
        symbol: "BTCUSDT".into(),
        tick_size: 0.1,
        step_size: 0.001,
        min_qty: 0.001,
        min_notional: 5.0,
        price_precision: 1,
        qty_precision: 3,
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.mode = Mode::Sim;
    config.contracts = vec![contract()];
    config
}

/// Deterministic synthetic session: a slowly drifting book plus prints that
/// sweep both sides hard enough to reach resting quotes.
fn write_fixture(dir: &Path, rows: usize) {
    let mut depth = std::fs::File::create(dir.join("BTCUSDT_depth.jsonl")).unwrap();
    let mut trades = std::fs::File::create(dir.join("BTCUSDT_trades.jsonl")).unwrap();

    for i in 0..rows {
        let ts = 1_000 + (i as i64) * 250;
        // Price walks up then down a few ticks, deterministically.
        let step = match (i / 8) % 4 {
            0 => i % 8,
            1 => 8 - i % 8,
            2 => i % 8,
            _ => 8 - i % 8,
        } as f64;
        let bid = 100.0 + step * 0.1;
        let ask = bid + 0.2;
        writeln!(
            depth,
            r#"{{"ts_ms":{ts},"bid1_p":{bid:.1},"bid1_v":4.0,"bid2_p":{:.1},"bid2_v":6.0,"ask1_p":{ask:.1},"ask1_v":4.0,"ask2_p":{:.1},"ask2_v":6.0}}"#,
            bid - 0.1,
            ask + 0.1,
        )
        .unwrap();

        // Every other tick, a print sweeps one side at the touch.
        if i % 2 == 1 {
            let sell_side = (i / 2) % 2 == 0;
            let (price, maker_is_buyer) = if sell_side { (bid, true) } else { (ask, false) };
            writeln!(
                trades,
                r#"{{"ts_ms":{},"price":{price:.1},"qty":6.0,"maker_is_buyer":{maker_is_buyer}}}"#,
                ts + 100,
            )
            .unwrap();
        }
    }
}

#[test]
fn test_replay_produces_fills() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path(), 64);

    let report = run_backtest(
        &config(),
        dir.path(),
        "BTCUSDT",
        MidSpreadQuoter::new("BTCUSDT", 10.0, 1.0),
    )
    .unwrap();

    assert!(report.submitted > 0, "strategy never quoted");
    assert!(!report.trades.is_empty(), "no fills out of the emulator");
    // Fees were debited for every fill.
    assert!(report.balance < 10_000.0);
    // Volume accounting holds: net position equals the signed sum of fills.
    let signed: f64 = report
        .trades
        .iter()
        .map(|t| t.side.sign() * t.volume)
        .sum();
    assert!((report.net_position - signed).abs() < 1e-9);
}

#[test]
fn test_same_seed_same_run() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path(), 64);

    let run = |seed: u64| {
        let mut config = config();
        config.backtest.seed = seed;
        run_backtest(
            &config,
            dir.path(),
            "BTCUSDT",
            MidSpreadQuoter::new("BTCUSDT", 10.0, 1.0),
        )
        .unwrap()
    };

    let a = run(42);
    let b = run(42);
    assert_eq!(a.trades, b.trades);
    assert_eq!(a.balance.to_bits(), b.balance.to_bits());
    assert_eq!(a.net_position.to_bits(), b.net_position.to_bits());
    assert_eq!(a.submitted, b.submitted);
    assert_eq!(a.filled, b.filled);
}

#[test]
fn test_chaos_run_is_stable_and_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path(), 64);

    let run = || {
        let mut config = config();
        config.chaos.packet_loss_rate = 0.3;
        config.chaos.order_reject_rate = 0.2;
        run_backtest(
            &config,
            dir.path(),
            "BTCUSDT",
            MidSpreadQuoter::new("BTCUSDT", 10.0, 1.0),
        )
        .unwrap()
    };

    let a = run();
    let b = run();
    assert_eq!(a.trades, b.trades);
    assert_eq!(a.balance.to_bits(), b.balance.to_bits());
}

#[test]
fn test_backtest_requires_reference_data() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(dir.path(), 8);

    let mut config = config();
    config.contracts.clear();
    let err = run_backtest(
        &config,
        dir.path(),
        "BTCUSDT",
        MidSpreadQuoter::new("BTCUSDT", 10.0, 1.0),
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("reference data"));
}

// ---------------------------------------------------------------------
// Reconciliation drift scenario against a scriptable venue
// ---------------------------------------------------------------------

#[derive(Default)]
struct ScriptedVenue {
    positions: Mutex<Vec<RemotePosition>>,
    balance: Mutex<Option<f64>>,
    next_id: Mutex<u64>,
}

impl Gateway for ScriptedVenue {
    fn connect(&self, _symbols: &[String]) {}
    fn close(&self) {}
    fn state(&self) -> GatewayState {
        GatewayState::Ready
    }

    fn send_order(&self, _req: &OrderRequest) -> Option<String> {
        let mut next = self.next_id.lock();
        *next += 1;
        Some(format!("ex-{}", *next))
    }

    fn cancel_order(&self, _req: &CancelRequest) {}
    fn cancel_all_orders(&self, _symbol: &str) {}

    fn get_account_info(&self) -> Option<AccountInfo> {
        self.balance.lock().map(|b| AccountInfo {
            wallet_balance: b,
            initial_margin: 0.0,
        })
    }

    fn get_all_positions(&self) -> Option<Vec<RemotePosition>> {
        Some(self.positions.lock().clone())
    }

    fn get_open_orders(&self) -> Option<Vec<RemoteOrder>> {
        Some(Vec::new())
    }

    fn get_depth_snapshot(&self, _symbol: &str) -> Option<DepthSnapshot> {
        None
    }
}

fn fill_update(client_oid: &str, cum: f64, price: f64, ts: Nanos) -> ExchangeOrderUpdate {
    ExchangeOrderUpdate {
        client_oid: client_oid.into(),
        exchange_oid: String::new(),
        symbol: "BTCUSDT".into(),
        status: ExchangeStatus::Filled,
        filled_qty: 0.0,
        filled_price: price,
        cum_filled_qty: cum,
        update_time: ts,
    }
}

#[test]
fn test_persistent_drift_forces_sync_through_bus() {
    let bus = EventBus::new();
    let venue = Arc::new(ScriptedVenue::default());
    let cache = Arc::new(DataCache::new());
    cache.update_mark_price(
        "BTCUSDT",
        perp_maker::events::MarkPriceUpdate { price: 100.0, ts: 0 },
    );
    let ref_data = Arc::new(RefData::from_contracts(vec![contract()]));

    let oms = Oms::new(
        bus.clone(),
        venue.clone() as Arc<dyn Gateway>,
        Arc::clone(&cache),
        ref_data,
        &config(),
    );
    let reconciler = AutoReconciler::new(Arc::clone(&oms));
    reconciler.attach(&bus);

    // Local fill of +1.0; the venue claims +1.5.
    let oid = oms
        .submit_order(
            OrderIntent::new("BTCUSDT", Side::Buy, 100.0, 1.0),
            0,
        )
        .unwrap();
    oms.on_exchange_update(&fill_update(&oid, 1.0, 100.0, 1));
    venue.positions.lock().push(RemotePosition {
        symbol: "BTCUSDT".into(),
        position_amt: 1.5,
        entry_price: 100.0,
    });

    // First pass reports the drift but does not sync yet.
    let health = oms.reconcile_once(NANOS_PER_SEC).unwrap();
    assert!(health.is_sync_error);
    assert_eq!(health.pos_drifts.len(), 1);
    bus.drain_all();
    assert!((oms.net_position("BTCUSDT") - 1.0).abs() < 1e-9);

    // Drift persists past the 10s threshold: the reconciler forces a sync
    // and local position snaps to the venue's value.
    oms.reconcile_once(12 * NANOS_PER_SEC).unwrap();
    bus.drain_all();
    assert_eq!(reconciler.forced_sync_count(), 1);
    assert!((oms.net_position("BTCUSDT") - 1.5).abs() < 1e-9);

    // A clean pass right after: no drift, no further syncs.
    let health = oms.reconcile_once(13 * NANOS_PER_SEC).unwrap();
    assert!(!health.is_sync_error);
    bus.drain_all();
    assert_eq!(reconciler.forced_sync_count(), 1);
}

// ---------------------------------------------------------------------
// Cancel-all round trip through the dry-run gateway
// ---------------------------------------------------------------------

#[test]
fn test_cancel_all_round_trip_clears_open_exposure() {
    let bus = EventBus::new();
    let gateway = perp_maker::gateway::DryRunGateway::new(bus.clone());
    let cache = Arc::new(DataCache::new());
    let ref_data = Arc::new(RefData::from_contracts(vec![contract()]));

    let oms = Oms::new(
        bus.clone(),
        gateway,
        Arc::clone(&cache),
        ref_data,
        &config(),
    );

    // Prime the mark price through the bus, as the live feed would.
    bus.put(EngineEvent::Book(BookUpdate {
        symbol: "BTCUSDT".into(),
        ts: 1,
        bids: vec![perp_maker::events::Level::new(99.9, 5.0)],
        asks: vec![perp_maker::events::Level::new(100.1, 5.0)],
    }));
    {
        let cache = Arc::clone(&cache);
        bus.register(EventKind::Book, move |event| {
            if let EngineEvent::Book(book) = event {
                cache.update_book(book.clone());
            }
        });
    }
    bus.drain_all();

    let intents = [
        OrderIntent::new("BTCUSDT", Side::Buy, 99.0, 1.0),
        OrderIntent::new("BTCUSDT", Side::Buy, 98.0, 1.0),
        OrderIntent::new("BTCUSDT", Side::Sell, 101.0, 1.0),
    ];
    for intent in intents {
        oms.submit_order(intent, 2).unwrap();
    }
    bus.drain_all();
    let (open_buy, open_sell) = oms.open_quantities("BTCUSDT");
    assert_eq!((open_buy, open_sell), (2.0, 1.0));

    // Venue-side cancel-all plus confirmations leaves no open exposure.
    oms.cancel_all_orders("BTCUSDT", 3);
    bus.drain_all();
    assert_eq!(oms.open_quantities("BTCUSDT"), (0.0, 0.0));
    assert_eq!(oms.active_order_count(), 0);
}

// ---------------------------------------------------------------------
// Lost packets surface through the ACK watchdog
// ---------------------------------------------------------------------

#[test]
fn test_lost_order_packet_times_out() {
    let bus = EventBus::new();
    let venue = Arc::new(ScriptedVenue::default());
    let cache = Arc::new(DataCache::new());
    cache.update_mark_price(
        "BTCUSDT",
        perp_maker::events::MarkPriceUpdate { price: 100.0, ts: 0 },
    );
    let ref_data = Arc::new(RefData::from_contracts(vec![contract()]));
    let oms = Oms::new(
        bus,
        venue as Arc<dyn Gateway>,
        cache,
        ref_data,
        &config(),
    );

    // The venue returned an id but no update ever arrives (lost packet).
    let _oid = oms
        .submit_order(
            OrderIntent::new("BTCUSDT", Side::Buy, 100.0, 1.0),
            0,
        )
        .unwrap();
    assert_eq!(oms.watchdog.monitored_count(), 1);
    assert!(oms.watchdog.check_now(4 * NANOS_PER_SEC).is_none());
    assert!(oms.watchdog.check_now(6 * NANOS_PER_SEC).is_some());
}
