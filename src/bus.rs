//! Event Bus
//!
//! FIFO queue of [`EngineEvent`]s with synchronous dispatch to registered
//! handlers. Two modes:
//!
//! - **Threaded** (live): `start()` spawns a worker that pops with a bounded
//!   wait and runs handlers on the worker thread; producers never block.
//! - **Drain-all** (sim): `drain_all()` dispatches every queued event and any
//!   descendants produced during dispatch, until the queue is empty. This is
//!   the primitive the simulator relies on: all causal effects of a sim event
//!   are observed before logical time advances.
//!
//! A panicking handler is caught and logged; it never blocks other handlers
//! or stops the bus. Registration order defines dispatch order per kind.

use crate::events::{EngineEvent, EventKind};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::error;

pub type Handler = Box<dyn Fn(&EngineEvent) + Send + Sync>;

const POP_WAIT: Duration = Duration::from_secs(1);

struct BusInner {
    queue: Mutex<VecDeque<EngineEvent>>,
    available: Condvar,
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
    active: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to the engine event bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                handlers: RwLock::new(HashMap::new()),
                active: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Enqueue an event. Non-blocking.
    pub fn put(&self, event: EngineEvent) {
        self.inner.queue.lock().push_back(event);
        self.inner.available.notify_one();
    }

    /// Register a handler for one event kind. Handlers registered first are
    /// dispatched first.
    pub fn register<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
    }

    /// Start the threaded dispatch worker (live mode).
    pub fn start(&self) {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("event-bus".into())
            .spawn(move || {
                while inner.active.load(Ordering::SeqCst) {
                    let event = {
                        let mut queue = inner.queue.lock();
                        if queue.is_empty() {
                            let _ = inner.available.wait_for(&mut queue, POP_WAIT);
                        }
                        queue.pop_front()
                    };
                    if let Some(event) = event {
                        dispatch(&inner, &event);
                    }
                }
            })
            .expect("spawn event-bus worker");
        *self.inner.worker.lock() = Some(handle);
    }

    /// Stop the worker and join it. Queued events are left in place.
    pub fn stop(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
        self.inner.available.notify_all();
        if let Some(handle) = self.inner.worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Dispatch every queued event, and any events produced while handling
    /// them, until the queue is empty (sim mode).
    pub fn drain_all(&self) {
        loop {
            let event = self.inner.queue.lock().pop_front();
            match event {
                Some(event) => dispatch(&self.inner, &event),
                None => break,
            }
        }
    }

    /// Number of queued, not-yet-dispatched events.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

fn dispatch(inner: &BusInner, event: &EngineEvent) {
    let handlers = inner.handlers.read();
    let Some(list) = handlers.get(&event.kind()) else {
        return;
    };
    for handler in list {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic".into());
            error!(kind = ?event.kind(), %msg, "event handler panicked; event dropped for this handler");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AggTrade, BookUpdate, Level};
    use std::sync::atomic::AtomicUsize;

    fn book_event(ts: i64) -> EngineEvent {
        EngineEvent::Book(BookUpdate {
            symbol: "BTCUSDT".into(),
            ts,
            bids: vec![Level::new(99.0, 1.0)],
            asks: vec![Level::new(100.0, 1.0)],
        })
    }

    fn trade_event() -> EngineEvent {
        EngineEvent::AggTrade(AggTrade {
            symbol: "BTCUSDT".into(),
            trade_id: 1,
            price: 100.0,
            qty: 1.0,
            maker_is_buyer: false,
            ts: 0,
        })
    }

    #[test]
    fn test_drain_all_dispatches_descendants() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        // The book handler produces a trade event; drain_all must dispatch it
        // in the same drain.
        {
            let bus2 = bus.clone();
            bus.register(EventKind::Book, move |_| {
                bus2.put(trade_event());
            });
        }
        {
            let seen = Arc::clone(&seen);
            bus.register(EventKind::AggTrade, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.put(book_event(1));
        bus.drain_all();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.pending(), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.register(EventKind::Book, |_| panic!("boom"));
        {
            let seen = Arc::clone(&seen);
            bus.register(EventKind::Book, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.put(book_event(1));
        bus.drain_all();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registration_order_is_dispatch_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.register(EventKind::Book, move |_| {
                order.lock().push(tag);
            });
        }

        bus.put(book_event(1));
        bus.drain_all();
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_threaded_mode_delivers() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = Arc::clone(&seen);
            bus.register(EventKind::Book, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.start();
        for ts in 0..10 {
            bus.put(book_event(ts));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.load(Ordering::SeqCst) < 10 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        bus.stop();
        assert_eq!(seen.load(Ordering::SeqCst), 10);
    }
}
