//! Exposure Manager
//!
//! Single source of truth for net positions, average entry prices and
//! open-order exposure, plus the pre-trade worst-case risk check.
//!
//! A market maker holds two-sided quotes; under a one-sided sweep only one
//! side fills while the other is cancelled, so the risk check takes the
//! larger of the two extremes (all buys fill vs. all sells fill).

use crate::events::{PositionUpdate, Price, Side, Size, Symbol};
use crate::oms::order::Order;
use std::collections::BTreeMap;
use std::fmt;

const POSITION_EPS: f64 = 1e-9;

/// Per-symbol exposure state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SymbolExposure {
    /// Signed net position (positive = long).
    pub net_position: f64,
    /// Average entry price; zero iff the position is flat.
    pub avg_price: Price,
    /// Remaining volume across active buy orders.
    pub open_buy_qty: Size,
    /// Remaining volume across active sell orders.
    pub open_sell_qty: Size,
}

/// Pre-trade risk rejection.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskError {
    MarkPriceUnavailable { symbol: Symbol },
    ExposureLimit {
        symbol: Symbol,
        worst_long: f64,
        worst_short: f64,
        worst_notional: f64,
        limit: f64,
    },
}

impl fmt::Display for RiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskError::MarkPriceUnavailable { symbol } => {
                write!(f, "mark price unavailable for {symbol}")
            }
            RiskError::ExposureLimit {
                symbol,
                worst_long,
                worst_short,
                worst_notional,
                limit,
            } => write!(
                f,
                "exposure limit for {symbol}: worst_long={worst_long:.4} worst_short={worst_short:.4} notional={worst_notional:.2} > {limit:.2}"
            ),
        }
    }
}

impl std::error::Error for RiskError {}

/// Authoritative net position / open-order aggregate tracker. Ordered map so
/// aggregate recomputation sums in a reproducible order.
#[derive(Debug, Default)]
pub struct ExposureManager {
    symbols: BTreeMap<Symbol, SymbolExposure>,
}

impl ExposureManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The only way net position changes.
    ///
    /// Average price: increasing positions blend in the fill, decreasing
    /// positions keep it, a sign flip resets it to the fill price, and a
    /// flat position clears it.
    pub fn on_fill(&mut self, symbol: &str, side: Side, qty: Size, price: Price) {
        let entry = self.symbols.entry(symbol.to_string()).or_default();
        let current = entry.net_position;
        let signed_qty = side.sign() * qty;

        let increasing = current == 0.0 || current.signum() == signed_qty.signum();
        if increasing {
            let total_value = current.abs() * entry.avg_price + qty * price;
            let total_qty = current.abs() + qty;
            if total_qty > 0.0 {
                entry.avg_price = total_value / total_qty;
            }
        }

        entry.net_position += signed_qty;

        if entry.net_position.abs() < POSITION_EPS {
            entry.net_position = 0.0;
            entry.avg_price = 0.0;
        } else if (current > 0.0 && entry.net_position < 0.0)
            || (current < 0.0 && entry.net_position > 0.0)
        {
            entry.avg_price = price;
        }
    }

    /// Full recompute of the open-order aggregates from the active-order
    /// table. Called under the OMS lock whenever the active set changes.
    pub fn update_open_orders<'a>(&mut self, orders: impl Iterator<Item = &'a Order>) {
        for exposure in self.symbols.values_mut() {
            exposure.open_buy_qty = 0.0;
            exposure.open_sell_qty = 0.0;
        }
        for order in orders {
            if !order.is_active() {
                continue;
            }
            let remaining = order.intent.volume - order.filled_volume;
            if remaining <= 0.0 {
                continue;
            }
            let entry = self.symbols.entry(order.intent.symbol.clone()).or_default();
            match order.intent.side {
                Side::Buy => entry.open_buy_qty += remaining,
                Side::Sell => entry.open_sell_qty += remaining,
            }
        }
    }

    /// Double-sided worst-case exposure check for a candidate order.
    pub fn check_risk(
        &self,
        symbol: &str,
        side: Side,
        volume: Size,
        max_pos_notional: f64,
        mark_price: Option<Price>,
    ) -> Result<(), RiskError> {
        let Some(mark) = mark_price.filter(|p| *p > 0.0) else {
            return Err(RiskError::MarkPriceUnavailable {
                symbol: symbol.to_string(),
            });
        };

        let exposure = self.get(symbol);
        let new_buy = if side == Side::Buy { volume } else { 0.0 };
        let new_sell = if side == Side::Sell { volume } else { 0.0 };

        let worst_long = exposure.net_position + exposure.open_buy_qty + new_buy;
        let worst_short = exposure.net_position - exposure.open_sell_qty - new_sell;
        let worst_notional = worst_long.abs().max(worst_short.abs()) * mark;

        if worst_notional > max_pos_notional {
            return Err(RiskError::ExposureLimit {
                symbol: symbol.to_string(),
                worst_long,
                worst_short,
                worst_notional,
                limit: max_pos_notional,
            });
        }
        Ok(())
    }

    /// Overwrite a symbol's position from the exchange's authoritative
    /// snapshot.
    pub fn force_sync(&mut self, symbol: &str, net_position: f64, avg_price: Price) {
        let entry = self.symbols.entry(symbol.to_string()).or_default();
        entry.net_position = net_position;
        entry.avg_price = avg_price;
    }

    /// Drop all positions and aggregates (start of a forced sync).
    pub fn clear(&mut self) {
        self.symbols.clear();
    }

    #[inline]
    pub fn get(&self, symbol: &str) -> SymbolExposure {
        self.symbols.get(symbol).copied().unwrap_or_default()
    }

    pub fn position_update(&self, symbol: &str) -> PositionUpdate {
        let exposure = self.get(symbol);
        PositionUpdate {
            symbol: symbol.to_string(),
            net_position: exposure.net_position,
            avg_price: exposure.avg_price,
        }
    }

    /// Symbols with a non-zero net position.
    pub fn nonzero_positions(&self) -> impl Iterator<Item = (&Symbol, &SymbolExposure)> {
        self.symbols.iter().filter(|(_, e)| e.net_position != 0.0)
    }

    /// All tracked symbols (for margin over open orders).
    pub fn all(&self) -> impl Iterator<Item = (&Symbol, &SymbolExposure)> {
        self.symbols.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increasing_position_blends_avg() {
        let mut exposure = ExposureManager::new();
        exposure.on_fill("BTCUSDT", Side::Buy, 1.0, 100.0);
        exposure.on_fill("BTCUSDT", Side::Buy, 1.0, 110.0);
        let e = exposure.get("BTCUSDT");
        assert_eq!(e.net_position, 2.0);
        assert!((e.avg_price - 105.0).abs() < 1e-12);
    }

    #[test]
    fn test_decreasing_keeps_avg() {
        let mut exposure = ExposureManager::new();
        exposure.on_fill("BTCUSDT", Side::Buy, 2.0, 100.0);
        exposure.on_fill("BTCUSDT", Side::Sell, 1.0, 120.0);
        let e = exposure.get("BTCUSDT");
        assert_eq!(e.net_position, 1.0);
        assert_eq!(e.avg_price, 100.0);
    }

    #[test]
    fn test_flat_position_clears_avg() {
        let mut exposure = ExposureManager::new();
        exposure.on_fill("BTCUSDT", Side::Buy, 1.0, 100.0);
        exposure.on_fill("BTCUSDT", Side::Sell, 1.0, 105.0);
        let e = exposure.get("BTCUSDT");
        assert_eq!(e.net_position, 0.0);
        assert_eq!(e.avg_price, 0.0);
    }

    #[test]
    fn test_sign_flip_resets_avg_to_fill_price() {
        let mut exposure = ExposureManager::new();
        exposure.on_fill("BTCUSDT", Side::Buy, 1.0, 100.0);
        exposure.on_fill("BTCUSDT", Side::Sell, 3.0, 95.0);
        let e = exposure.get("BTCUSDT");
        assert_eq!(e.net_position, -2.0);
        assert_eq!(e.avg_price, 95.0);
    }

    #[test]
    fn test_net_position_is_sum_of_signed_fills() {
        let mut exposure = ExposureManager::new();
        let fills = [
            (Side::Buy, 1.5, 100.0),
            (Side::Sell, 0.5, 101.0),
            (Side::Buy, 0.25, 99.0),
            (Side::Sell, 2.0, 98.0),
        ];
        let mut expected = 0.0;
        for (side, qty, price) in fills {
            exposure.on_fill("BTCUSDT", side, qty, price);
            expected += side.sign() * qty;
        }
        assert!((exposure.get("BTCUSDT").net_position - expected).abs() < 1e-12);
    }

    #[test]
    fn test_worst_case_risk_two_sided() {
        // current=+3, open_buy=2, open_sell=4, mark=100, limit=1000.
        let mut exposure = ExposureManager::new();
        exposure.force_sync("BTCUSDT", 3.0, 100.0);
        let entry = exposure.symbols.get_mut("BTCUSDT").unwrap();
        entry.open_buy_qty = 2.0;
        entry.open_sell_qty = 4.0;

        // New SELL 2: worst_long=5, worst_short=-3 -> 500 < 1000, accept.
        assert!(exposure
            .check_risk("BTCUSDT", Side::Sell, 2.0, 1000.0, Some(100.0))
            .is_ok());

        // New BUY 6: worst_long=11 -> 1100 > 1000, reject.
        let err = exposure
            .check_risk("BTCUSDT", Side::Buy, 6.0, 1000.0, Some(100.0))
            .unwrap_err();
        assert!(matches!(err, RiskError::ExposureLimit { .. }));
    }

    #[test]
    fn test_risk_rejects_without_mark_price() {
        let exposure = ExposureManager::new();
        let err = exposure
            .check_risk("BTCUSDT", Side::Buy, 1.0, 1000.0, None)
            .unwrap_err();
        assert!(matches!(err, RiskError::MarkPriceUnavailable { .. }));
    }

    #[test]
    fn test_risk_monotone_in_open_qty() {
        // Growing either open aggregate never reduces the reported worst
        // exposure.
        let mut exposure = ExposureManager::new();
        exposure.force_sync("BTCUSDT", 1.0, 100.0);
        let mut previous_worst = 0.0;
        for open_buy in [0.0, 2.0, 4.0, 8.0] {
            exposure.symbols.get_mut("BTCUSDT").unwrap().open_buy_qty = open_buy;
            let err = exposure
                .check_risk("BTCUSDT", Side::Buy, 1.0, 0.0, Some(100.0))
                .unwrap_err();
            let RiskError::ExposureLimit { worst_notional, .. } = err else {
                panic!("expected exposure rejection");
            };
            assert!(worst_notional >= previous_worst);
            previous_worst = worst_notional;
        }
    }
}
