//! Account Manager
//!
//! Balance, equity, used margin and available funds. Everything except the
//! realised balance is recomputed on demand from exposure and mark prices,
//! which is cheap relative to event rates and immune to drift from missed
//! increments.

use crate::cache::DataCache;
use crate::events::AccountUpdate;
use crate::exposure::ExposureManager;

/// Margin and equity accounting for one account.
#[derive(Debug)]
pub struct AccountManager {
    /// Realised balance; only fills and fees mutate it.
    pub balance: f64,
    pub leverage: f64,
    pub equity: f64,
    pub used_margin: f64,
    pub available: f64,
}

impl AccountManager {
    pub fn new(initial_balance: f64, leverage: f64) -> Self {
        Self {
            balance: initial_balance,
            leverage,
            equity: initial_balance,
            used_margin: 0.0,
            available: initial_balance,
        }
    }

    /// Realised PnL and fees mutate the balance only; everything else is
    /// derived in [`AccountManager::calculate`].
    pub fn apply_fill_cash(&mut self, realized_pnl: f64, fee: f64) {
        self.balance += realized_pnl - fee;
    }

    /// Full recompute from exposure and mark prices.
    ///
    /// Order margin is conservative: both sides of a double-sided quote are
    /// treated as fully margined.
    pub fn calculate(&mut self, exposure: &ExposureManager, cache: &DataCache) -> AccountUpdate {
        let mut unrealized = 0.0;
        let mut position_margin = 0.0;
        let mut order_margin = 0.0;

        for (symbol, e) in exposure.nonzero_positions() {
            let Some(mark) = cache.mark_price(symbol) else {
                continue;
            };
            unrealized += (mark - e.avg_price) * e.net_position;
            position_margin += e.net_position.abs() * mark / self.leverage;
        }

        for (symbol, e) in exposure.all() {
            let open_qty = e.open_buy_qty + e.open_sell_qty;
            if open_qty <= 0.0 {
                continue;
            }
            let Some(mark) = cache.mark_price(symbol) else {
                continue;
            };
            order_margin += open_qty * mark / self.leverage;
        }

        self.equity = self.balance + unrealized;
        self.used_margin = position_margin + order_margin;
        self.available = (self.equity - self.used_margin).max(0.0);

        AccountUpdate {
            balance: self.balance,
            equity: self.equity,
            used_margin: self.used_margin,
            available: self.available,
        }
    }

    /// Pre-trade margin check against the last recompute.
    #[inline]
    pub fn check_margin(&self, notional: f64) -> bool {
        self.available >= notional / self.leverage
    }

    /// Overwrite the realised balance from the exchange's account snapshot.
    pub fn force_sync(&mut self, balance: f64) {
        self.balance = balance;
        self.equity = balance;
    }

    pub fn margin_ratio(&self) -> f64 {
        if self.equity != 0.0 {
            self.used_margin / self.equity
        } else {
            0.0
        }
    }
}
