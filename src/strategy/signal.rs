//! Turns a strategy kind plus candle history into a directional call.

use rust_decimal::Decimal;

use crate::domain::{Candle, StrategyKind};
use crate::error::{GambitError, Result};

use super::indicators::{rolling_max, rolling_min, rsi, sma};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Buy,
    Sell,
    Neutral,
}

/// Evaluate one strategy kind against chronological candles. History
/// shorter than the kind's warm-up window is a data failure, not a
/// neutral read.
pub fn evaluate(kind: &StrategyKind, candles: &[Candle]) -> Result<Signal> {
    if let Err(problem) = kind.validate() {
        return Err(GambitError::Validation(format!(
            "{}: {}",
            kind.name(),
            problem
        )));
    }
    let window = kind.history_window();
    if candles.len() < window {
        return Err(GambitError::DataUnavailable(format!(
            "{} needs {} candles, got {}",
            kind.name(),
            window,
            candles.len()
        )));
    }
    match kind {
        StrategyKind::MaCross { fast, slow, signal } => {
            Ok(ma_cross(candles, *fast, *slow, *signal))
        }
        StrategyKind::Rsi {
            period,
            overbought,
            oversold,
        } => Ok(rsi_band(candles, *period, *overbought, *oversold)),
        StrategyKind::Breakout { lookback } => Ok(breakout(candles, *lookback)),
    }
}

fn ma_cross(candles: &[Candle], fast: usize, slow: usize, signal: usize) -> Signal {
    let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
    let fast_ma = sma(&closes, fast);
    let slow_ma = sma(&closes, slow);
    let n = closes.len();

    let diff_at = |i: usize| Some(fast_ma[i]? - slow_ma[i]?);
    let (prev, curr) = match (diff_at(n - 2), diff_at(n - 1)) {
        (Some(prev), Some(curr)) => (prev, curr),
        _ => return Signal::Neutral,
    };

    if prev <= Decimal::ZERO && curr > Decimal::ZERO {
        // Golden cross. With a signal period set, the cross only counts
        // when the difference sits on or above its own signal line.
        if signal > 0 {
            match signal_line(&fast_ma, &slow_ma, signal, n - 1) {
                Some(line) if curr >= line => Signal::Buy,
                _ => Signal::Neutral,
            }
        } else {
            Signal::Buy
        }
    } else if prev >= Decimal::ZERO && curr < Decimal::ZERO {
        Signal::Sell
    } else {
        Signal::Neutral
    }
}

/// SMA of the fast-slow difference over the trailing `signal` bars
/// ending at `at`. `None` while any bar in that stretch is still cold.
fn signal_line(
    fast_ma: &[Option<Decimal>],
    slow_ma: &[Option<Decimal>],
    signal: usize,
    at: usize,
) -> Option<Decimal> {
    if at + 1 < signal {
        return None;
    }
    let mut sum = Decimal::ZERO;
    for i in (at + 1 - signal)..=at {
        sum += fast_ma[i]? - slow_ma[i]?;
    }
    Some(sum / Decimal::from(signal as u64))
}

fn rsi_band(candles: &[Candle], period: usize, overbought: Decimal, oversold: Decimal) -> Signal {
    let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
    let series = rsi(&closes, period);
    let n = closes.len();

    let (prev, curr) = match (series[n - 2], series[n - 1]) {
        (Some(prev), Some(curr)) => (prev, curr),
        _ => return Signal::Neutral,
    };

    if prev < oversold && curr >= oversold {
        Signal::Buy
    } else if prev > overbought && curr <= overbought {
        Signal::Sell
    } else {
        Signal::Neutral
    }
}

fn breakout(candles: &[Candle], lookback: usize) -> Signal {
    let n = candles.len();
    let highs: Vec<Decimal> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<Decimal> = candles.iter().map(|c| c.low).collect();

    // Extremes of the `lookback` bars ending at the previous bar, so the
    // current bar never competes with itself.
    let prior_high = match rolling_max(&highs, lookback)[n - 2] {
        Some(v) => v,
        None => return Signal::Neutral,
    };
    let prior_low = match rolling_min(&lows, lookback)[n - 2] {
        Some(v) => v,
        None => return Signal::Neutral,
    };

    let new_high = highs[n - 1] > prior_high;
    let new_low = lows[n - 1] < prior_low;
    match (new_high, new_low) {
        (true, false) => Signal::Buy,
        (false, true) => Signal::Sell,
        _ => Signal::Neutral,
    }
}
