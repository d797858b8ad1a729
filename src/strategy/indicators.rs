//! Pure indicator math over price series.
//!
//! Every function returns a vector aligned with its input, `None` until
//! the indicator has seen enough values to be warm. Callers index from
//! the end and compare adjacent bars for cross detection.

use rust_decimal::Decimal;

/// Simple moving average over the trailing `period` values.
pub fn sma(values: &[Decimal], period: usize) -> Vec<Option<Decimal>> {
    let n = values.len();
    let mut out = vec![None; n];
    if period == 0 || n < period {
        return out;
    }
    let divisor = Decimal::from(period as u64);
    let mut running: Decimal = values[..period].iter().copied().sum();
    out[period - 1] = Some(running / divisor);
    for i in period..n {
        running += values[i] - values[i - period];
        out[i] = Some(running / divisor);
    }
    out
}

/// RSI with simple (not Wilder-smoothed) averages of gains and losses.
/// Warm from index `period`, since `period` deltas need `period + 1`
/// closes. A loss-free window reads as 100.
pub fn rsi(closes: &[Decimal], period: usize) -> Vec<Option<Decimal>> {
    let n = closes.len();
    let mut out = vec![None; n];
    if period == 0 || n <= period {
        return out;
    }
    let hundred = Decimal::from(100);
    let divisor = Decimal::from(period as u64);
    let mut gain_sum = Decimal::ZERO;
    let mut loss_sum = Decimal::ZERO;
    for i in 1..n {
        let delta = closes[i] - closes[i - 1];
        if delta >= Decimal::ZERO {
            gain_sum += delta;
        } else {
            loss_sum -= delta;
        }
        if i > period {
            let old = closes[i - period] - closes[i - period - 1];
            if old >= Decimal::ZERO {
                gain_sum -= old;
            } else {
                loss_sum += old;
            }
        }
        if i >= period {
            let avg_gain = gain_sum / divisor;
            let avg_loss = loss_sum / divisor;
            out[i] = Some(if avg_loss.is_zero() {
                hundred
            } else {
                hundred - hundred / (Decimal::ONE + avg_gain / avg_loss)
            });
        }
    }
    out
}

/// Maximum over the trailing `window` values, inclusive of the current
/// index.
pub fn rolling_max(values: &[Decimal], window: usize) -> Vec<Option<Decimal>> {
    rolling_extreme(values, window, |slice| slice.iter().copied().max())
}

/// Minimum over the trailing `window` values, inclusive of the current
/// index.
pub fn rolling_min(values: &[Decimal], window: usize) -> Vec<Option<Decimal>> {
    rolling_extreme(values, window, |slice| slice.iter().copied().min())
}

fn rolling_extreme(
    values: &[Decimal],
    window: usize,
    pick: impl Fn(&[Decimal]) -> Option<Decimal>,
) -> Vec<Option<Decimal>> {
    let n = values.len();
    let mut out = vec![None; n];
    if window == 0 || n < window {
        return out;
    }
    for i in (window - 1)..n {
        out[i] = pick(&values[i + 1 - window..=i]);
    }
    out
}
