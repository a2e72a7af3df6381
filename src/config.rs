//! Engine Configuration
//!
//! TOML-backed configuration covering run mode, risk limits, the simulated
//! account, backtest/chaos knobs and the contract reference-data table.

use crate::refdata::ContractInfo;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Run mode for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Live,
    DryRun,
    Sim,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Sim
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    pub max_pos_notional: f64,
    pub max_order_qty: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_pos_notional: 20_000.0,
            max_order_qty: 1_000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub limits: RiskLimits,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            limits: RiskLimits::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub initial_balance_usdt: f64,
    pub leverage: f64,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            initial_balance_usdt: 10_000.0,
            leverage: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub taker_fee: f64,
    pub latency_base_ms: f64,
    pub latency_sigma: f64,
    pub cancel_base_prob: f64,
    /// RNG seed shared by the chaos gateway and the latency model. A fixed
    /// seed makes two runs over the same data byte-identical.
    pub seed: u64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            taker_fee: 0.0005,
            latency_base_ms: 10.0,
            latency_sigma: 0.5,
            cancel_base_prob: 0.5,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    pub packet_loss_rate: f64,
    pub order_reject_rate: f64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            packet_loss_rate: 0.0,
            order_reject_rate: 0.0,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    pub risk: RiskConfig,
    pub account: AccountConfig,
    pub backtest: BacktestConfig,
    pub chaos: ChaosConfig,
    pub contracts: Vec<ContractInfo>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }
}
