//! Recorded Data Loader
//!
//! Reads per-symbol depth and trade tables (JSON-lines, one row per line)
//! and schedules them into the simulator at market-data priority.
//!
//! Depth rows carry the top five levels as `bidN_p`/`bidN_v` and
//! `askN_p`/`askN_v`; missing deeper levels are zero and treated as no
//! liquidity. Trade rows are `ts_ms, price, qty, maker_is_buyer`.

use crate::clock::{Nanos, NANOS_PER_MILLI};
use crate::events::{AggTrade, BookUpdate, Level, Symbol};
use crate::sim::engine::{SimAction, SimScheduler, PRIO_MARKET_DATA};
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;
use tracing::info;

/// One recorded depth row (top five levels each side).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthRow {
    pub ts_ms: i64,
    pub bid1_p: f64,
    pub bid1_v: f64,
    pub bid2_p: f64,
    pub bid2_v: f64,
    pub bid3_p: f64,
    pub bid3_v: f64,
    pub bid4_p: f64,
    pub bid4_v: f64,
    pub bid5_p: f64,
    pub bid5_v: f64,
    pub ask1_p: f64,
    pub ask1_v: f64,
    pub ask2_p: f64,
    pub ask2_v: f64,
    pub ask3_p: f64,
    pub ask3_v: f64,
    pub ask4_p: f64,
    pub ask4_v: f64,
    pub ask5_p: f64,
    pub ask5_v: f64,
}

impl DepthRow {
    fn to_book(&self, symbol: &str) -> BookUpdate {
        let bid_levels = [
            (self.bid1_p, self.bid1_v),
            (self.bid2_p, self.bid2_v),
            (self.bid3_p, self.bid3_v),
            (self.bid4_p, self.bid4_v),
            (self.bid5_p, self.bid5_v),
        ];
        let ask_levels = [
            (self.ask1_p, self.ask1_v),
            (self.ask2_p, self.ask2_v),
            (self.ask3_p, self.ask3_v),
            (self.ask4_p, self.ask4_v),
            (self.ask5_p, self.ask5_v),
        ];
        BookUpdate {
            symbol: symbol.to_string(),
            ts: self.ts_ms * NANOS_PER_MILLI,
            bids: bid_levels
                .iter()
                .filter(|&&(p, _)| p > 0.0)
                .map(|&(p, v)| Level::new(p, v))
                .collect(),
            asks: ask_levels
                .iter()
                .filter(|&&(p, _)| p > 0.0)
                .map(|&(p, v)| Level::new(p, v))
                .collect(),
        }
    }
}

/// One recorded trade row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeRow {
    pub ts_ms: i64,
    pub price: f64,
    pub qty: f64,
    pub maker_is_buyer: bool,
}

/// Loads recorded market data and schedules it for replay.
pub struct DataLoader {
    data_dir: std::path::PathBuf,
    symbol: Symbol,
}

impl DataLoader {
    pub fn new(data_dir: impl AsRef<Path>, symbol: impl Into<Symbol>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            symbol: symbol.into(),
        }
    }

    /// Read `{symbol}_depth.jsonl` and `{symbol}_trades.jsonl`, merge them in
    /// timestamp order (stable across equal timestamps) and schedule
    /// everything at market-data priority.
    pub fn load_and_schedule(&self, scheduler: &mut SimScheduler) -> Result<usize> {
        let depth_path = self.data_dir.join(format!("{}_depth.jsonl", self.symbol));
        let trade_path = self.data_dir.join(format!("{}_trades.jsonl", self.symbol));

        let depth_rows: Vec<DepthRow> = read_jsonl(&depth_path)
            .with_context(|| format!("loading depth table {}", depth_path.display()))?;
        let trade_rows: Vec<TradeRow> = read_jsonl(&trade_path)
            .with_context(|| format!("loading trade table {}", trade_path.display()))?;
        ensure!(
            !depth_rows.is_empty(),
            "depth table {} is empty",
            depth_path.display()
        );

        let mut events: Vec<(Nanos, SimAction)> = Vec::with_capacity(depth_rows.len() + trade_rows.len());
        for row in &depth_rows {
            let book = row.to_book(&self.symbol);
            events.push((book.ts, SimAction::Depth(book)));
        }
        for (i, row) in trade_rows.iter().enumerate() {
            let trade = AggTrade {
                symbol: self.symbol.clone(),
                trade_id: i as u64 + 1,
                price: row.price,
                qty: row.qty,
                maker_is_buyer: row.maker_is_buyer,
                ts: row.ts_ms * NANOS_PER_MILLI,
            };
            events.push((trade.ts, SimAction::Trade(trade)));
        }

        events.sort_by_key(|(ts, _)| *ts);
        let count = events.len();
        for (ts, action) in events {
            scheduler.schedule(ts, PRIO_MARKET_DATA, action);
        }

        info!(
            symbol = %self.symbol,
            depth = depth_rows.len(),
            trades = trade_rows.len(),
            "recorded data scheduled"
        );
        Ok(count)
    }
}

fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = std::io::BufReader::new(file);
    let mut rows = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: bad row", path.display(), lineno + 1))?;
        rows.push(row);
    }
    Ok(rows)
}
