//! Chaos Gateway
//!
//! The simulator-side [`Gateway`]: assigns ids immediately (the async-send
//! illusion), then injects packet loss, rejects and latency before the
//! request reaches the emulator. Lost packets get no response at all, which
//! is exactly what the ACK watchdog exists to catch.

use crate::book::DepthSnapshot;
use crate::clock::{EventClock, Nanos};
use crate::events::{CancelRequest, ExchangeOid, OrderRequest, Symbol};
use crate::gateway::{AccountInfo, Gateway, GatewayState, RemoteOrder, RemotePosition};
use crate::sim::engine::{SimAction, SimScheduler, PRIO_GATEWAY};
use crate::sim::latency::LatencyModel;
use parking_lot::Mutex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tracing::debug;

pub struct ChaosGateway {
    scheduler: Arc<Mutex<SimScheduler>>,
    clock: Arc<Mutex<EventClock>>,
    latency: Arc<Mutex<LatencyModel>>,
    rng: Arc<Mutex<ChaCha8Rng>>,
    loss_rate: f64,
    reject_rate: f64,
    /// Sequential ids keep replays byte-identical.
    next_id: Mutex<u64>,
}

impl ChaosGateway {
    pub fn new(
        scheduler: Arc<Mutex<SimScheduler>>,
        clock: Arc<Mutex<EventClock>>,
        latency: Arc<Mutex<LatencyModel>>,
        rng: Arc<Mutex<ChaCha8Rng>>,
        loss_rate: f64,
        reject_rate: f64,
    ) -> Self {
        Self {
            scheduler,
            clock,
            latency,
            rng,
            loss_rate,
            reject_rate,
            next_id: Mutex::new(0),
        }
    }

    fn next_exchange_oid(&self) -> ExchangeOid {
        let mut next = self.next_id.lock();
        *next += 1;
        format!("e-{:08}", *next)
    }

    fn arrival_time(&self) -> Nanos {
        let now = self.clock.lock().now();
        let latency = {
            let model = self.latency.lock();
            let mut rng = self.rng.lock();
            model.sample(&mut rng)
        };
        now + latency
    }
}

impl Gateway for ChaosGateway {
    fn connect(&self, _symbols: &[Symbol]) {}

    fn close(&self) {}

    fn state(&self) -> GatewayState {
        GatewayState::Ready
    }

    fn send_order(&self, req: &OrderRequest) -> Option<ExchangeOid> {
        // Id is assigned before anything can go wrong, like an async send
        // that succeeded locally.
        let exchange_oid = self.next_exchange_oid();

        let draw: f64 = self.rng.lock().gen();
        if draw < self.loss_rate {
            // Dropped on the wire: no arrival, no reject, nothing. The ACK
            // watchdog will flag it.
            debug!(%exchange_oid, "chaos: order packet lost");
            return Some(exchange_oid);
        }

        let at = self.arrival_time();
        let action = if draw < self.loss_rate + self.reject_rate {
            debug!(%exchange_oid, "chaos: order rejected");
            SimAction::OrderReject(req.clone(), exchange_oid.clone())
        } else {
            SimAction::OrderArrival(req.clone(), exchange_oid.clone())
        };
        self.scheduler.lock().schedule(at, PRIO_GATEWAY, action);
        Some(exchange_oid)
    }

    fn cancel_order(&self, req: &CancelRequest) {
        let draw: f64 = self.rng.lock().gen();
        if draw < self.loss_rate {
            debug!(order_id = %req.order_id, "chaos: cancel packet lost");
            return;
        }
        let at = self.arrival_time();
        self.scheduler
            .lock()
            .schedule(at, PRIO_GATEWAY, SimAction::CancelArrival(req.clone()));
    }

    fn cancel_all_orders(&self, symbol: &str) {
        // The venue-side bulk cancel has no sim counterpart; strategies
        // cancel per order.
        debug!(%symbol, "sim gateway ignoring cancel_all");
    }

    fn get_account_info(&self) -> Option<AccountInfo> {
        None
    }

    fn get_all_positions(&self) -> Option<Vec<RemotePosition>> {
        None
    }

    fn get_open_orders(&self) -> Option<Vec<RemoteOrder>> {
        None
    }

    fn get_depth_snapshot(&self, _symbol: &str) -> Option<DepthSnapshot> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Side, TimeInForce};
    use rand::SeedableRng;

    fn gateway(loss: f64, reject: f64) -> (ChaosGateway, Arc<Mutex<SimScheduler>>) {
        let scheduler = Arc::new(Mutex::new(SimScheduler::new()));
        let clock = Arc::new(Mutex::new(EventClock::new(0)));
        let latency = Arc::new(Mutex::new(LatencyModel::new(10.0, 0.5)));
        let rng = Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(9)));
        let gateway = ChaosGateway::new(
            Arc::clone(&scheduler),
            clock,
            latency,
            rng,
            loss,
            reject,
        );
        (gateway, scheduler)
    }

    fn request() -> OrderRequest {
        OrderRequest {
            client_oid: "c-1".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            price: 100.0,
            volume: 1.0,
            time_in_force: TimeInForce::Gtc,
        }
    }

    #[test]
    fn test_normal_send_schedules_arrival() {
        let (gateway, scheduler) = gateway(0.0, 0.0);
        let oid = gateway.send_order(&request()).unwrap();
        assert_eq!(oid, "e-00000001");

        let mut scheduler = scheduler.lock();
        assert_eq!(scheduler.len(), 1);
        let event = scheduler.pop().unwrap();
        assert!(event.ts > 0);
        assert_eq!(event.priority, PRIO_GATEWAY);
        assert!(matches!(event.action, SimAction::OrderArrival(..)));
    }

    #[test]
    fn test_full_loss_schedules_nothing() {
        let (gateway, scheduler) = gateway(1.0, 0.0);
        // Still returns an id: the send itself "succeeded".
        assert!(gateway.send_order(&request()).is_some());
        gateway.cancel_order(&CancelRequest {
            symbol: "BTCUSDT".into(),
            order_id: "x".into(),
        });
        assert!(scheduler.lock().is_empty());
    }

    #[test]
    fn test_full_reject_schedules_reject() {
        let (gateway, scheduler) = gateway(0.0, 1.0);
        gateway.send_order(&request()).unwrap();
        let event = scheduler.lock().pop().unwrap();
        assert!(matches!(event.action, SimAction::OrderReject(..)));
    }
}
