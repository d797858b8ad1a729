//! Order execution: the lifecycle state machine and its bookkeeping.
//!
//! `book` tracks orders and positions, `executor` drives one intent from
//! placement to settlement, `reconciliation` re-polls whatever the
//! executor left open at the start of every tick.

pub mod book;
pub mod executor;
pub mod reconciliation;

pub use book::{FillOutcome, TradeBook};
pub use executor::{ExecutionReport, OrderExecutor};
pub use reconciliation::{ReconcileOutcome, Reconciler};
