//! ACK Watchdog
//!
//! Tracks submitted orders until the exchange acknowledges them. An order
//! with no ack within `ACK_TIMEOUT` means the order stream is broken or the
//! venue dropped the request; the watchdog surfaces that as a dirty signal
//! for the auto-reconciler instead of guessing.

use crate::clock::{Nanos, NANOS_PER_SEC};
use crate::events::{ExchangeOid, Symbol};
use crate::oms::order::OrderStatus;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::error;

pub const ACK_TIMEOUT: Nanos = 5 * NANOS_PER_SEC;

pub type DirtyCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone)]
struct MonitoredOrder {
    symbol: Symbol,
    submit_time: Nanos,
    last_ack_time: Nanos,
}

struct WatchdogInner {
    monitored: Mutex<HashMap<ExchangeOid, MonitoredOrder>>,
    dirty_callback: Mutex<Option<DirtyCallback>>,
    active: AtomicBool,
}

/// Submission monitor with an optional background poll loop (live mode) and
/// an explicit [`AckWatchdog::check_now`] entry point (sim and tests).
pub struct AckWatchdog {
    inner: Arc<WatchdogInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for AckWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl AckWatchdog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                monitored: Mutex::new(HashMap::new()),
                dirty_callback: Mutex::new(None),
                active: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn set_dirty_callback(&self, callback: DirtyCallback) {
        *self.inner.dirty_callback.lock() = Some(callback);
    }

    /// Start monitoring a submission.
    pub fn on_order_submitted(&self, exchange_oid: &str, symbol: &str, now: Nanos) {
        self.inner.monitored.lock().insert(
            exchange_oid.to_string(),
            MonitoredOrder {
                symbol: symbol.to_string(),
                submit_time: now,
                last_ack_time: 0,
            },
        );
    }

    /// Record an exchange-side update. Terminal transitions stop monitoring.
    pub fn on_order_update(&self, exchange_oid: &str, status: OrderStatus, now: Nanos) {
        let mut monitored = self.inner.monitored.lock();
        if status.is_terminal() {
            monitored.remove(exchange_oid);
        } else if let Some(entry) = monitored.get_mut(exchange_oid) {
            entry.last_ack_time = now;
        }
    }

    /// Scan for unacked submissions older than [`ACK_TIMEOUT`]. Fires the
    /// dirty callback once per detection and reports the affected order.
    pub fn check_now(&self, now: Nanos) -> Option<ExchangeOid> {
        check_inner(&self.inner, now)
    }

    pub fn monitored_count(&self) -> usize {
        self.inner.monitored.lock().len()
    }

    /// Spawn the live-mode poll loop (1 s period, wall-clock time).
    pub fn start(&self) {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("ack-watchdog".into())
            .spawn(move || {
                while inner.active.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_secs(1));
                    check_inner(&inner, wall_clock_nanos());
                }
            })
            .expect("spawn ack-watchdog");
        *self.worker.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn check_inner(inner: &WatchdogInner, now: Nanos) -> Option<ExchangeOid> {
    let timed_out = {
        let monitored = inner.monitored.lock();
        monitored
            .iter()
            .find(|(_, info)| info.last_ack_time == 0 && now - info.submit_time > ACK_TIMEOUT)
            .map(|(oid, info)| (oid.clone(), info.symbol.clone()))
    };

    let (oid, symbol) = timed_out?;
    error!(exchange_oid = %oid, %symbol, "order ACK timeout; order stream dirty");
    if let Some(callback) = inner.dirty_callback.lock().clone() {
        callback("order ACK timeout");
    }
    Some(oid)
}

/// Wall-clock time as `Nanos` (live mode only; the simulator never calls
/// this).
pub fn wall_clock_nanos() -> Nanos {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as Nanos)
        .unwrap_or(0)
}
