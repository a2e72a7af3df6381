//! Market Data Cache
//!
//! Latest book, mark price and trade per symbol. Single writer (the gateway
//! or the replay feed), many readers (risk checks, account recompute).
//! Constructed once at startup and passed around as an `Arc` handle.

use crate::events::{AggTrade, BookUpdate, MarkPriceUpdate, Price, Symbol};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct CacheState {
    books: HashMap<Symbol, BookUpdate>,
    mark_prices: HashMap<Symbol, MarkPriceUpdate>,
    last_trades: HashMap<Symbol, AggTrade>,
}

/// Shared read-mostly market data cache.
#[derive(Default)]
pub struct DataCache {
    state: RwLock<CacheState>,
}

impl DataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_book(&self, book: BookUpdate) {
        self.state.write().books.insert(book.symbol.clone(), book);
    }

    pub fn update_mark_price(&self, symbol: &str, update: MarkPriceUpdate) {
        self.state
            .write()
            .mark_prices
            .insert(symbol.to_string(), update);
    }

    pub fn update_trade(&self, trade: AggTrade) {
        self.state
            .write()
            .last_trades
            .insert(trade.symbol.clone(), trade);
    }

    /// Mark price for margin/PnL. Falls back to the cached book mid when the
    /// exchange mark is not yet known; `None` when neither is available.
    pub fn mark_price(&self, symbol: &str) -> Option<Price> {
        let state = self.state.read();
        if let Some(mp) = state.mark_prices.get(symbol) {
            return Some(mp.price);
        }
        state.books.get(symbol).and_then(|b| b.mid_price())
    }

    pub fn book(&self, symbol: &str) -> Option<BookUpdate> {
        self.state.read().books.get(symbol).cloned()
    }

    pub fn last_trade(&self, symbol: &str) -> Option<AggTrade> {
        self.state.read().last_trades.get(symbol).cloned()
    }
}
