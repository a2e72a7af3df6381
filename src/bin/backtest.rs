//! Backtest runner: replay recorded market data through the full engine.
//!
//! Usage: `backtest <config.toml> <data_dir> <symbol>`

use anyhow::{bail, Context, Result};
use perp_maker::config::Config;
use perp_maker::logging;
use perp_maker::sim::run_backtest;
use perp_maker::strategy::MidSpreadQuoter;

fn main() -> Result<()> {
    logging::init("info");

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 4 {
        bail!("usage: {} <config.toml> <data_dir> <symbol>", args[0]);
    }
    let (config_path, data_dir, symbol) = (&args[1], &args[2], &args[3]);

    let config = Config::from_path(config_path).context("loading configuration")?;
    if config.contracts.is_empty() {
        bail!("no contracts configured; trading without tick/step sizes is unsafe");
    }

    let strategy = MidSpreadQuoter::new(symbol.clone(), 10.0, 0.01);
    let report = run_backtest(&config, data_dir, symbol, strategy)?;

    println!("=== backtest report ===");
    println!("balance        {:>14.4}", report.balance);
    println!("equity         {:>14.4}", report.equity);
    println!("net position   {:>14.6}", report.net_position);
    println!("orders sent    {:>14}", report.submitted);
    println!("fill events    {:>14}", report.filled);
    println!("trades         {:>14}", report.trades.len());
    if report.submitted > 0 {
        println!(
            "fill ratio     {:>14.4}",
            report.filled as f64 / report.submitted as f64
        );
    }
    Ok(())
}
