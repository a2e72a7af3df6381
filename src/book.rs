//! Local Order Book
//!
//! Reconstructs per-symbol exchange depth from a REST snapshot plus the
//! sequenced delta stream, with strict gap detection.
//!
//! Stream contract (Binance futures style): a delta carries
//! `U` (first update id), `u` (final update id) and `pu` (the previous
//! delta's final id). After a snapshot with id `L`:
//!
//! 1. deltas with `u < L` are dropped;
//! 2. the first applied delta must satisfy `U <= L+1 <= u`;
//! 3. every later delta must satisfy `pu == last_update_id`.
//!
//! Any violation marks the book uninitialised and surfaces [`BookError::Gap`];
//! deltas arriving while uninitialised are buffered so a resync can replay
//! them after the fresh snapshot lands.

use crate::clock::Nanos;
use crate::events::{BookUpdate, Level, Price, Size, Symbol};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info};

/// Total-ordered price key for the book maps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Px(pub f64);

impl Eq for Px {}

impl PartialOrd for Px {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Px {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Sequenced incremental depth update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthDelta {
    pub symbol: Symbol,
    /// First update id in this packet (`U`).
    pub first_update_id: u64,
    /// Final update id in this packet (`u`).
    pub final_update_id: u64,
    /// Final update id of the previous packet (`pu`).
    pub prev_final_update_id: u64,
    /// (price, size) pairs; size 0 removes the level.
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub ts: Nanos,
}

/// Full depth snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub symbol: Symbol,
    pub last_update_id: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub ts: Nanos,
}

/// Book stream failure.
#[derive(Debug, Clone, PartialEq)]
pub enum BookError {
    /// Sequence gap: the stream skipped updates and the book can no longer
    /// be trusted. Carries (local last_update_id, packet pu).
    Gap {
        symbol: Symbol,
        local: u64,
        prev_id: u64,
    },
}

impl fmt::Display for BookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookError::Gap {
                symbol,
                local,
                prev_id,
            } => write!(
                f,
                "order book gap for {symbol}: local={local}, packet pu={prev_id}"
            ),
        }
    }
}

impl std::error::Error for BookError {}

/// Per-symbol L2 book rebuilt from snapshot + deltas.
#[derive(Debug)]
pub struct LocalOrderBook {
    pub symbol: Symbol,
    bids: BTreeMap<Px, Size>,
    asks: BTreeMap<Px, Size>,
    pub last_update_id: u64,
    pub initialized: bool,
    /// True until the first delta after a snapshot has been accepted; the
    /// bridging predicate only applies to that delta.
    bridged: bool,
    /// Deltas captured while waiting for a snapshot (initial sync or resync).
    buffer: Vec<DepthDelta>,
}

impl LocalOrderBook {
    pub fn new(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            initialized: false,
            bridged: false,
            buffer: Vec::new(),
        }
    }

    /// Install a snapshot and replay the buffered deltas against it.
    ///
    /// Idempotent: calling again with a newer snapshot simply rebuilds.
    pub fn install_snapshot(&mut self, snapshot: &DepthSnapshot) -> Result<(), BookError> {
        self.bids.clear();
        self.asks.clear();
        for level in &snapshot.bids {
            if level.size > 0.0 {
                self.bids.insert(Px(level.price), level.size);
            }
        }
        for level in &snapshot.asks {
            if level.size > 0.0 {
                self.asks.insert(Px(level.price), level.size);
            }
        }
        self.last_update_id = snapshot.last_update_id;
        self.initialized = true;
        self.bridged = false;
        info!(
            symbol = %self.symbol,
            last_update_id = snapshot.last_update_id,
            buffered = self.buffer.len(),
            "order book snapshot installed"
        );

        let buffered = std::mem::take(&mut self.buffer);
        for delta in &buffered {
            self.process_delta(delta)?;
        }
        Ok(())
    }

    /// Process one incoming delta.
    ///
    /// Returns `Ok(true)` when the delta was applied, `Ok(false)` when it was
    /// buffered or dropped as stale, `Err(Gap)` when the stream is broken
    /// (the book is then uninitialised and the caller must resync).
    pub fn process_delta(&mut self, delta: &DepthDelta) -> Result<bool, BookError> {
        if !self.initialized {
            self.buffer.push(delta.clone());
            return Ok(false);
        }

        // Stale packet from before the snapshot: drop silently.
        if delta.final_update_id < self.last_update_id {
            return Ok(false);
        }

        if self.bridged {
            if delta.prev_final_update_id != self.last_update_id {
                return Err(self.mark_gap(delta.prev_final_update_id));
            }
        } else {
            // First delta after a snapshot: the packet must straddle
            // last_update_id + 1.
            let next = self.last_update_id + 1;
            if delta.first_update_id > next || delta.final_update_id < next {
                return Err(self.mark_gap(delta.prev_final_update_id));
            }
        }

        self.apply(delta);
        self.bridged = true;
        self.last_update_id = delta.final_update_id;
        Ok(true)
    }

    /// Drop local state and start buffering for a fresh snapshot. Safe to
    /// call repeatedly (resync in flight).
    pub fn begin_resync(&mut self) {
        if self.initialized {
            debug!(symbol = %self.symbol, "order book resync requested");
        }
        self.initialized = false;
        self.bridged = false;
    }

    fn mark_gap(&mut self, prev_id: u64) -> BookError {
        error!(
            symbol = %self.symbol,
            local = self.last_update_id,
            packet_pu = prev_id,
            "order book gap detected; book flagged uninitialised"
        );
        self.initialized = false;
        self.bridged = false;
        BookError::Gap {
            symbol: self.symbol.clone(),
            local: self.last_update_id,
            prev_id,
        }
    }

    fn apply(&mut self, delta: &DepthDelta) {
        for level in &delta.bids {
            if level.size == 0.0 {
                self.bids.remove(&Px(level.price));
            } else {
                self.bids.insert(Px(level.price), level.size);
            }
        }
        for level in &delta.asks {
            if level.size == 0.0 {
                self.asks.remove(&Px(level.price));
            } else {
                self.asks.insert(Px(level.price), level.size);
            }
        }
    }

    #[inline]
    pub fn best_bid(&self) -> Option<Level> {
        self.bids
            .iter()
            .next_back()
            .map(|(px, size)| Level::new(px.0, *size))
    }

    #[inline]
    pub fn best_ask(&self) -> Option<Level> {
        self.asks
            .iter()
            .next()
            .map(|(px, size)| Level::new(px.0, *size))
    }

    /// Copy of the current book as a bus event. `None` while uninitialised so
    /// stale state never reaches strategies.
    pub fn snapshot_event(&self, ts: Nanos) -> Option<BookUpdate> {
        if !self.initialized {
            return None;
        }
        Some(BookUpdate {
            symbol: self.symbol.clone(),
            ts,
            bids: self
                .bids
                .iter()
                .rev()
                .map(|(px, size)| Level::new(px.0, *size))
                .collect(),
            asks: self
                .asks
                .iter()
                .map(|(px, size)| Level::new(px.0, *size))
                .collect(),
        })
    }

    #[inline]
    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    #[cfg(test)]
    pub(crate) fn level_size(&self, side: crate::events::Side, price: Price) -> Option<Size> {
        match side {
            crate::events::Side::Buy => self.bids.get(&Px(price)).copied(),
            crate::events::Side::Sell => self.asks.get(&Px(price)).copied(),
        }
    }
}

/// Live-path wiring: routes gateway deltas through per-symbol books, emits
/// book events to the bus, and pulls a fresh snapshot from the gateway when
/// a gap fires. Resync is idempotent; deltas arriving while a resync is in
/// flight are buffered by the book itself.
pub struct BookManager {
    bus: crate::bus::EventBus,
    gateway: std::sync::Arc<dyn crate::gateway::Gateway>,
    books: parking_lot::Mutex<std::collections::HashMap<Symbol, LocalOrderBook>>,
}

impl BookManager {
    pub fn new(
        bus: crate::bus::EventBus,
        gateway: std::sync::Arc<dyn crate::gateway::Gateway>,
    ) -> Self {
        Self {
            bus,
            gateway,
            books: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Feed one delta. Emits the updated book copy on success; on a gap,
    /// kicks off a resync instead (the gap itself was already logged).
    pub fn on_delta(&self, delta: &DepthDelta) {
        let result = {
            let mut books = self.books.lock();
            let book = books
                .entry(delta.symbol.clone())
                .or_insert_with(|| LocalOrderBook::new(delta.symbol.clone()));
            match book.process_delta(delta) {
                Ok(true) => Ok(book.snapshot_event(delta.ts)),
                Ok(false) => Ok(None),
                Err(err) => Err(err),
            }
        };

        match result {
            Ok(Some(event)) => self.bus.put(crate::events::EngineEvent::Book(event)),
            Ok(None) => {}
            Err(BookError::Gap { .. }) => self.resync(&delta.symbol),
        }
    }

    /// Pull a fresh snapshot and rebuild. Gateway I/O happens without the
    /// book lock held; a failed pull leaves the book buffering for the next
    /// attempt.
    pub fn resync(&self, symbol: &str) {
        self.books
            .lock()
            .entry(symbol.to_string())
            .or_insert_with(|| LocalOrderBook::new(symbol.to_string()))
            .begin_resync();

        let Some(snapshot) = self.gateway.get_depth_snapshot(symbol) else {
            error!(%symbol, "depth snapshot unavailable; book stays uninitialised");
            return;
        };

        let event = {
            let mut books = self.books.lock();
            let book = books
                .entry(symbol.to_string())
                .or_insert_with(|| LocalOrderBook::new(symbol.to_string()));
            match book.install_snapshot(&snapshot) {
                Ok(()) => book.snapshot_event(snapshot.ts),
                // Buffered replay hit another gap; the next delta buffers and
                // a later resync will catch up.
                Err(BookError::Gap { .. }) => None,
            }
        };
        if let Some(event) = event {
            self.bus.put(crate::events::EngineEvent::Book(event));
        }
    }

    pub fn is_initialized(&self, symbol: &str) -> bool {
        self.books
            .lock()
            .get(symbol)
            .map(|b| b.initialized)
            .unwrap_or(false)
    }
}
