use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trading rule variants, each carrying its own parameters. The engine
/// only knows the entry/exit shape of each kind; parameter values are
/// opaque user configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyKind {
    /// Fast/slow moving-average crossover, optionally confirmed by a
    /// signal-line average of the fast-slow difference. `signal = 0`
    /// disables confirmation.
    MaCross {
        fast: usize,
        slow: usize,
        signal: usize,
    },
    /// RSI band re-entry: buy when RSI climbs back out of the oversold
    /// band, reversal when it drops back out of the overbought band.
    Rsi {
        period: usize,
        overbought: Decimal,
        oversold: Decimal,
    },
    /// Breakout of the prior `lookback`-period extremes.
    Breakout { lookback: usize },
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::MaCross { .. } => "ma_cross",
            StrategyKind::Rsi { .. } => "rsi",
            StrategyKind::Breakout { .. } => "breakout",
        }
    }

    /// Check the parameters for values the indicators cannot work with.
    /// Zero-length averages and inverted bands come straight from user
    /// configuration, so they are validation failures, not panics.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            StrategyKind::MaCross { fast, slow, .. } => {
                if *fast == 0 || *slow == 0 {
                    return Err("moving-average periods must be positive".to_string());
                }
                if fast >= slow {
                    return Err("fast period must be shorter than slow period".to_string());
                }
            }
            StrategyKind::Rsi {
                period,
                overbought,
                oversold,
            } => {
                if *period == 0 {
                    return Err("rsi period must be positive".to_string());
                }
                if oversold >= overbought {
                    return Err("oversold band must sit below overbought band".to_string());
                }
            }
            StrategyKind::Breakout { lookback } => {
                if *lookback == 0 {
                    return Err("breakout lookback must be positive".to_string());
                }
            }
        }
        Ok(())
    }

    /// Number of candles the kind needs before every indicator it uses is
    /// warm, including the previous bar consulted for cross detection.
    pub fn history_window(&self) -> usize {
        match self {
            StrategyKind::MaCross { slow, signal, .. } => slow + (*signal).max(1),
            StrategyKind::Rsi { period, .. } => period + 2,
            StrategyKind::Breakout { lookback } => lookback + 1,
        }
    }
}

/// One user-defined strategy, immutable for the duration of a tick.
/// Repository updates take effect at the next tick boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySpec {
    pub id: String,
    pub broker_id: String,
    pub instrument_code: String,
    #[serde(flatten)]
    pub kind: StrategyKind,
    /// Exit threshold, percent above entry.
    pub take_profit_pct: Decimal,
    /// Exit threshold, percent below entry. Stored positive.
    pub stop_loss_pct: Decimal,
    pub investment_amount: Decimal,
    /// Minimum tradable increment for the instrument.
    #[serde(default = "default_lot_size")]
    pub lot_size: Decimal,
    pub is_active: bool,
}

fn default_lot_size() -> Decimal {
    Decimal::ONE
}
