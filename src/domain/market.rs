use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Position;

/// Latest traded price for one instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub instrument_code: String,
    pub price: Decimal,
    pub as_of: DateTime<Utc>,
}

impl Quote {
    pub fn new(instrument_code: &str, price: Decimal) -> Self {
        Self {
            instrument_code: instrument_code.to_string(),
            price,
            as_of: Utc::now(),
        }
    }
}

/// One daily bar of price history, oldest-first when in a series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

/// One holding line of a brokerage balance statement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceLine {
    pub instrument_code: String,
    pub name: String,
    pub quantity: Decimal,
    pub average_price: Decimal,
    pub current_price: Decimal,
    pub pnl_pct: Decimal,
    pub sellable_quantity: Decimal,
}

/// Broker-reported account balance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account_id: String,
    pub cash: Decimal,
    pub holdings: Vec<BalanceLine>,
    pub as_of: DateTime<Utc>,
}

/// Read-only account view exposed to collaborators, consistent with the
/// last completed tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub cash: Decimal,
    pub positions: Vec<Position>,
    pub as_of: DateTime<Utc>,
}
