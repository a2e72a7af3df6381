//! Auto-Reconciler
//!
//! Watches the health stream for a persistently dirty system and promotes it
//! into a forced `sync_with_exchange()`. Short-lived drift (network wobble,
//! in-flight fills) heals on its own; only drift older than the threshold
//! triggers a sync, and syncs are rate-limited by a cooldown so a flapping
//! venue cannot put the engine into a reset loop.

use crate::clock::{Nanos, NANOS_PER_SEC};
use crate::events::{EngineEvent, EventKind, SystemHealth};
use crate::oms::engine::Oms;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_DIRTY_THRESHOLD: Nanos = 10 * NANOS_PER_SEC;
pub const DEFAULT_COOLDOWN: Nanos = 10 * NANOS_PER_SEC;

#[derive(Debug, Default)]
struct ReconcilerState {
    first_dirty_time: Option<Nanos>,
    last_sync_time: Option<Nanos>,
    forced_syncs: u64,
}

/// Promotes persistent DIRTY health into a forced exchange sync.
pub struct AutoReconciler {
    oms: Arc<Oms>,
    state: Mutex<ReconcilerState>,
    dirty_threshold: Nanos,
    cooldown: Nanos,
}

impl AutoReconciler {
    pub fn new(oms: Arc<Oms>) -> Arc<Self> {
        Self::with_thresholds(oms, DEFAULT_DIRTY_THRESHOLD, DEFAULT_COOLDOWN)
    }

    pub fn with_thresholds(oms: Arc<Oms>, dirty_threshold: Nanos, cooldown: Nanos) -> Arc<Self> {
        Arc::new(Self {
            oms,
            state: Mutex::new(ReconcilerState::default()),
            dirty_threshold,
            cooldown,
        })
    }

    /// Subscribe to health reports on the bus.
    pub fn attach(self: &Arc<Self>, bus: &crate::bus::EventBus) {
        let this = Arc::clone(self);
        bus.register(EventKind::Health, move |event| {
            if let EngineEvent::Health(health) = event {
                this.observe(health);
            }
        });
    }

    /// Route the ACK watchdog's timeout signal into the dirty timer.
    pub fn attach_watchdog(self: &Arc<Self>, oms: &Oms) {
        let this = Arc::clone(self);
        oms.watchdog.set_dirty_callback(Arc::new(move |reason| {
            this.mark_dirty(reason, crate::oms::watchdog::wall_clock_nanos());
        }));
    }

    /// Feed one health report; forces a sync when dirtiness has persisted
    /// past the threshold and the cooldown has elapsed.
    pub fn observe(&self, health: &SystemHealth) {
        let now = health.ts;
        let should_sync = {
            let mut state = self.state.lock();

            if let Some(last) = state.last_sync_time {
                if now - last < self.cooldown {
                    return;
                }
            }

            if !health.is_sync_error {
                state.first_dirty_time = None;
                return;
            }

            let first = *state.first_dirty_time.get_or_insert(now);
            if now - first > self.dirty_threshold {
                state.last_sync_time = Some(now);
                state.first_dirty_time = None;
                state.forced_syncs += 1;
                true
            } else {
                false
            }
        };

        if should_sync {
            warn!("system dirty past threshold; forcing exchange sync");
            self.oms.sync_with_exchange();
            info!("auto-reconciliation complete");
        }
    }

    /// External dirty signal (ACK watchdog). Starts the dirty timer if the
    /// system was clean.
    pub fn mark_dirty(&self, reason: &str, now: Nanos) {
        warn!(%reason, "dirty signal");
        let mut state = self.state.lock();
        state.first_dirty_time.get_or_insert(now);
    }

    pub fn forced_sync_count(&self) -> u64 {
        self.state.lock().forced_syncs
    }
}
