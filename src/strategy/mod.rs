//! Strategy evaluation.
//!
//! `indicators` holds the pure series math, `signal` maps a strategy
//! kind onto a buy/sell/neutral call, and `engine` turns that call into
//! at most one sized order intent per strategy per tick.

pub mod engine;
pub mod indicators;
pub mod signal;

pub use engine::{decide, entry_quantity, evaluate};
pub use signal::Signal;
