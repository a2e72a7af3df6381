//! Simulation Scheduler
//!
//! Event-time min-heap ordered by `(timestamp, priority, seq)`. The insertion
//! sequence number breaks remaining ties so two runs over the same data pop
//! events in exactly the same order.

use crate::clock::Nanos;
use crate::events::{AggTrade, BookUpdate, CancelRequest, ExchangeOid, OrderRequest};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Market data replay.
pub const PRIO_MARKET_DATA: u8 = 0;
/// Gateway-originated order/cancel arrivals.
pub const PRIO_GATEWAY: u8 = 5;
/// Scheduled timers.
pub const PRIO_TIMER: u8 = 10;

/// What happens when a sim event fires. A closed enum instead of callbacks:
/// dispatch is inline and deterministic.
#[derive(Debug, Clone)]
pub enum SimAction {
    Depth(BookUpdate),
    Trade(AggTrade),
    OrderArrival(OrderRequest, ExchangeOid),
    CancelArrival(CancelRequest),
    OrderReject(OrderRequest, ExchangeOid),
}

#[derive(Debug)]
pub struct SimEvent {
    pub ts: Nanos,
    pub priority: u8,
    seq: u64,
    pub action: SimAction,
}

impl PartialEq for SimEvent {
    fn eq(&self, other: &Self) -> bool {
        self.ts == other.ts && self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for SimEvent {}

impl PartialOrd for SimEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SimEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ts
            .cmp(&other.ts)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Priority queue of future sim events.
#[derive(Debug, Default)]
pub struct SimScheduler {
    heap: BinaryHeap<Reverse<SimEvent>>,
    next_seq: u64,
}

impl SimScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, ts: Nanos, priority: u8, action: SimAction) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(SimEvent {
            ts,
            priority,
            seq,
            action,
        }));
    }

    pub fn pop(&mut self) -> Option<SimEvent> {
        self.heap.pop().map(|Reverse(event)| event)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Level;

    fn depth(ts: Nanos) -> SimAction {
        SimAction::Depth(BookUpdate {
            symbol: "BTCUSDT".into(),
            ts,
            bids: vec![Level::new(99.0, 1.0)],
            asks: vec![Level::new(100.0, 1.0)],
        })
    }

    #[test]
    fn test_orders_by_time_then_priority_then_seq() {
        let mut scheduler = SimScheduler::new();
        scheduler.schedule(200, PRIO_MARKET_DATA, depth(200));
        scheduler.schedule(100, PRIO_TIMER, depth(100));
        scheduler.schedule(100, PRIO_MARKET_DATA, depth(100));
        scheduler.schedule(100, PRIO_GATEWAY, depth(100));

        let popped: Vec<(Nanos, u8)> = std::iter::from_fn(|| scheduler.pop())
            .map(|e| (e.ts, e.priority))
            .collect();
        assert_eq!(
            popped,
            vec![
                (100, PRIO_MARKET_DATA),
                (100, PRIO_GATEWAY),
                (100, PRIO_TIMER),
                (200, PRIO_MARKET_DATA)
            ]
        );
    }

    #[test]
    fn test_same_key_pops_in_insertion_order() {
        let mut scheduler = SimScheduler::new();
        for _ in 0..3 {
            scheduler.schedule(100, PRIO_MARKET_DATA, depth(100));
        }
        let mut last_seq = None;
        while let Some(event) = scheduler.pop() {
            if let Some(prev) = last_seq {
                assert!(event.seq > prev);
            }
            last_seq = Some(event.seq);
        }
    }
}
