//! Order Management System
//!
//! Order registry and lifecycle, submit/cancel entry points, exchange-update
//! routing, the ACK watchdog and the reconciliation machinery.

pub mod engine;
pub mod order;
pub mod reconciler;
pub mod watchdog;

pub use engine::Oms;
pub use order::{Order, OrderSnapshot, OrderStatus};
pub use reconciler::AutoReconciler;
pub use watchdog::{AckWatchdog, ACK_TIMEOUT};
