use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::{AccountBalance, Candle, Order, OrderAck, OrderFillReport, OrderIntent, Quote};
use crate::error::{GambitError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Kis,
    Paper,
}

impl BrokerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kis => "kis",
            Self::Paper => "paper",
        }
    }
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BrokerKind {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "kis" | "korea-investment" => Ok(Self::Kis),
            "paper" | "sim" => Ok(Self::Paper),
            _ => Err("invalid broker kind; expected kis|paper"),
        }
    }
}

pub fn parse_broker_kind(raw: &str) -> Result<BrokerKind> {
    BrokerKind::from_str(raw).map_err(|e| GambitError::Validation(e.to_string()))
}

/// Uniform interface over heterogeneous broker wire protocols. Every
/// implementation routes each call through the broker's rate limiter,
/// authenticates via the credential cache, maps protocol errors into the
/// crate taxonomy, and retries exactly once with a fresh token after an
/// auth rejection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn kind(&self) -> BrokerKind;

    fn broker_id(&self) -> &str;

    fn account_id(&self) -> &str;

    /// Force credential issuance without any other side effect. Used at
    /// startup and as the per-tick probe while a broker is suspended.
    async fn authenticate(&self) -> Result<()>;

    async fn fetch_balance(&self) -> Result<AccountBalance>;

    async fn fetch_quote(&self, instrument_code: &str) -> Result<Quote>;

    /// Recent daily history, oldest first, at least `count` bars when the
    /// venue has them.
    async fn fetch_candles(&self, instrument_code: &str, count: usize) -> Result<Vec<Candle>>;

    /// Idempotent from the caller's perspective: resubmitting an intent
    /// whose idempotency key the broker already accepted returns the
    /// original acknowledgment.
    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderAck>;

    async fn fetch_order_status(&self, broker_order_id: &str) -> Result<OrderFillReport>;

    /// Cancel an acknowledged order. Ok(false) means the broker no longer
    /// considers it cancellable.
    async fn cancel_order(&self, order: &Order) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_broker_kind_accepts_aliases() {
        assert_eq!(
            parse_broker_kind("kis").expect("kis should parse"),
            BrokerKind::Kis
        );
        assert_eq!(
            parse_broker_kind("SIM").expect("sim alias should parse"),
            BrokerKind::Paper
        );
    }

    #[test]
    fn parse_broker_kind_rejects_unknown_value() {
        assert!(parse_broker_kind("robinhood").is_err());
    }
}
