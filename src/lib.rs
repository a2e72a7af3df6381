//! perp-maker: crypto-futures market-making engine core.
//!
//! Four subsystems form the nucleus:
//!
//! - **Event bus** ([`bus`]): FIFO dispatch of typed events; a threaded
//!   worker in live mode, `drain_all` under the simulator.
//! - **Local order book** ([`book`]): snapshot + sequenced deltas with
//!   strict gap detection and buffered resync.
//! - **OMS** ([`oms`], with [`exposure`] and [`account`]): single source of
//!   truth for orders, net positions, open-order exposure and margin, plus
//!   reconciliation against the exchange.
//! - **Simulator** ([`sim`]): deterministic event-time scheduler with a
//!   queue-position matching emulator, chaos gateway and latency model,
//!   driving the same downstream code paths as live trading.

pub mod account;
pub mod book;
pub mod bus;
pub mod cache;
pub mod clock;
pub mod config;
pub mod events;
pub mod exposure;
pub mod gateway;
pub mod logging;
pub mod oms;
pub mod refdata;
pub mod sim;
pub mod strategy;

pub use bus::EventBus;
pub use clock::{EventClock, Nanos};
pub use config::Config;
pub use events::{EngineEvent, EventKind, Side};
pub use oms::Oms;
