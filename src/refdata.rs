//! Contract Reference Data
//!
//! Tick size, lot size and notional floors per contract, with the rounding
//! rules every outgoing intent must pass through. Trading without this table
//! is unsafe, so startup aborts when it cannot be built.

use crate::events::{Price, Size, Symbol};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Exchange-wide minimum notional floor (USDT) applied on top of per-contract
/// values.
pub const NOTIONAL_FLOOR: f64 = 5.0;

/// Static trading rules for one contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractInfo {
    pub symbol: Symbol,
    pub tick_size: f64,
    pub step_size: f64,
    pub min_qty: f64,
    pub min_notional: f64,
    pub price_precision: u32,
    pub qty_precision: u32,
}

impl ContractInfo {
    /// Effective minimum notional for this contract.
    #[inline]
    pub fn notional_floor(&self) -> f64 {
        self.min_notional.max(NOTIONAL_FLOOR)
    }
}

/// Read-mostly table of contract rules, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct RefData {
    contracts: HashMap<Symbol, ContractInfo>,
}

impl RefData {
    pub fn from_contracts(contracts: Vec<ContractInfo>) -> Self {
        Self {
            contracts: contracts
                .into_iter()
                .map(|c| (c.symbol.clone(), c))
                .collect(),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&ContractInfo> {
        self.contracts.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Round a price to the contract's price precision.
    pub fn round_price(&self, symbol: &str, price: Price) -> Price {
        match self.contracts.get(symbol) {
            Some(info) => round_dp(price, info.price_precision),
            None => price,
        }
    }

    /// Floor a quantity to the contract's step size, then round to its
    /// quantity precision. Flooring keeps us inside balance and position
    /// limits.
    pub fn round_qty(&self, symbol: &str, qty: Size) -> Size {
        let Some(info) = self.contracts.get(symbol) else {
            return qty;
        };
        if info.step_size <= 0.0 {
            return qty;
        }
        let steps = (qty / info.step_size).floor();
        round_dp(steps * info.step_size, info.qty_precision)
    }
}

#[inline]
fn round_dp(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}
