//! Per-strategy evaluation: market data in, at most one order intent out.
//!
//! Entries size themselves from the configured investment amount floored
//! to the instrument's lot. Exits obey a fixed priority: stop-loss first,
//! then take-profit, then the kind's reversal signal line, so a single
//! tick never emits more than one exit for a strategy.

use rust_decimal::Decimal;
use tracing::debug;

use crate::broker::BrokerClient;
use crate::domain::{Candle, OrderIntent, OrderReason, Position, Quote, StrategySpec};
use crate::error::Result;

use super::signal::{self, Signal};

/// Fetch market data for one strategy and decide its intent. Fetch
/// failures bubble up so the caller can contain them per strategy.
pub async fn evaluate(
    client: &dyn BrokerClient,
    spec: &StrategySpec,
    position: Option<&Position>,
) -> Result<Option<OrderIntent>> {
    let quote = client.fetch_quote(&spec.instrument_code).await?;
    let candles = client
        .fetch_candles(&spec.instrument_code, spec.kind.history_window())
        .await?;
    decide(spec, position, &quote, &candles)
}

/// Pure decision core, separated from the fetches for testability.
pub fn decide(
    spec: &StrategySpec,
    position: Option<&Position>,
    quote: &Quote,
    candles: &[Candle],
) -> Result<Option<OrderIntent>> {
    let signal = signal::evaluate(&spec.kind, candles)?;
    match position {
        Some(position) => Ok(exit_intent(spec, position, quote.price, signal)),
        None if signal == Signal::Buy => Ok(entry_intent(spec, quote.price)),
        None => Ok(None),
    }
}

fn exit_intent(
    spec: &StrategySpec,
    position: &Position,
    price: Decimal,
    signal: Signal,
) -> Option<OrderIntent> {
    let entry = position.average_entry_price;
    let hundred = Decimal::from(100);

    if spec.stop_loss_pct > Decimal::ZERO
        && price <= entry * (Decimal::ONE - spec.stop_loss_pct / hundred)
    {
        return Some(OrderIntent::exit(
            &spec.id,
            &spec.broker_id,
            &spec.instrument_code,
            position.quantity,
            OrderReason::StopLoss,
        ));
    }
    if spec.take_profit_pct > Decimal::ZERO
        && price >= entry * (Decimal::ONE + spec.take_profit_pct / hundred)
    {
        return Some(OrderIntent::exit(
            &spec.id,
            &spec.broker_id,
            &spec.instrument_code,
            position.quantity,
            OrderReason::TakeProfit,
        ));
    }
    if signal == Signal::Sell {
        return Some(OrderIntent::exit(
            &spec.id,
            &spec.broker_id,
            &spec.instrument_code,
            position.quantity,
            OrderReason::Signal,
        ));
    }
    None
}

fn entry_intent(spec: &StrategySpec, price: Decimal) -> Option<OrderIntent> {
    let quantity = entry_quantity(spec.investment_amount, price, spec.lot_size);
    if quantity <= Decimal::ZERO {
        debug!(
            strategy_id = %spec.id,
            instrument_code = %spec.instrument_code,
            %price,
            investment = %spec.investment_amount,
            "buy signal sized to zero quantity, skipping"
        );
        return None;
    }
    Some(OrderIntent::entry(
        &spec.id,
        &spec.broker_id,
        &spec.instrument_code,
        quantity,
    ))
}

/// Shares affordable with `investment` at `price`, floored to a whole
/// multiple of `lot`.
pub fn entry_quantity(investment: Decimal, price: Decimal, lot: Decimal) -> Decimal {
    if price <= Decimal::ZERO || lot <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (investment / price / lot).floor() * lot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StrategyKind;
    use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
    use rust_decimal_macros::dec;

    fn spec(kind: StrategyKind) -> StrategySpec {
        StrategySpec {
            id: "strat-1".to_string(),
            broker_id: "kis".to_string(),
            instrument_code: "005930".to_string(),
            kind,
            take_profit_pct: dec!(5),
            stop_loss_pct: dec!(3),
            investment_amount: dec!(1_000_000),
            lot_size: dec!(1),
            is_active: true,
        }
    }

    fn position(entry: Decimal) -> Position {
        Position {
            strategy_id: "strat-1".to_string(),
            instrument_code: "005930".to_string(),
            quantity: dec!(14),
            average_entry_price: entry,
            opened_at: Utc::now(),
        }
    }

    fn flat_candles(closes: &[i64]) -> Vec<Candle> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let price = Decimal::from(*c);
                Candle {
                    date: start + ChronoDuration::days(i as i64),
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: 1_000,
                }
            })
            .collect()
    }

    fn neutral_kind() -> StrategyKind {
        StrategyKind::Rsi {
            period: 3,
            overbought: dec!(70),
            oversold: dec!(30),
        }
    }

    // RSI over these bars stays inside the bands on the last two reads.
    fn neutral_candles() -> Vec<Candle> {
        flat_candles(&[100, 101, 99, 102, 100])
    }

    // Dead cross on the final bar.
    fn sell_kind() -> StrategyKind {
        StrategyKind::MaCross {
            fast: 2,
            slow: 3,
            signal: 0,
        }
    }

    fn sell_candles() -> Vec<Candle> {
        flat_candles(&[10, 11, 12, 13, 2])
    }

    #[test]
    fn test_entry_quantity_floors_to_lot() {
        assert_eq!(entry_quantity(dec!(1_000_000), dec!(70_000), dec!(1)), dec!(14));
        assert_eq!(entry_quantity(dec!(1_000_000), dec!(70_000), dec!(10)), dec!(10));
        assert_eq!(entry_quantity(dec!(50_000), dec!(70_000), dec!(1)), dec!(0));
        assert_eq!(entry_quantity(dec!(1_000_000), dec!(0), dec!(1)), dec!(0));
    }

    #[test]
    fn test_stop_loss_beats_reversal() {
        let spec = spec(sell_kind());
        let quote = Quote::new("005930", dec!(9));
        // Entry 10, stop band at 9.7. Price 9 trips both the stop and
        // the dead cross; the stop wins.
        let intent = decide(&spec, Some(&position(dec!(10))), &quote, &sell_candles())
            .unwrap()
            .unwrap();
        assert_eq!(intent.reason, OrderReason::StopLoss);
        assert_eq!(intent.quantity, dec!(14));
    }

    #[test]
    fn test_take_profit_beats_reversal() {
        let spec = spec(sell_kind());
        let quote = Quote::new("005930", dec!(11));
        // Entry 10: +10% clears take-profit while the candles dead-cross.
        let intent = decide(&spec, Some(&position(dec!(10))), &quote, &sell_candles())
            .unwrap()
            .unwrap();
        assert_eq!(intent.reason, OrderReason::TakeProfit);
    }

    #[test]
    fn test_reversal_exit_when_bands_quiet() {
        let spec = spec(sell_kind());
        let quote = Quote::new("005930", dec!(10));
        let intent = decide(&spec, Some(&position(dec!(10))), &quote, &sell_candles())
            .unwrap()
            .unwrap();
        assert_eq!(intent.reason, OrderReason::Signal);
        assert_eq!(intent.side, crate::domain::OrderSide::Sell);
    }

    #[test]
    fn test_positioned_strategy_never_reenters() {
        let kind = StrategyKind::MaCross {
            fast: 2,
            slow: 3,
            signal: 0,
        };
        let spec = spec(kind);
        let quote = Quote::new("005930", dec!(20));
        // Golden cross with an open position and quiet bands: no intent.
        let candles = flat_candles(&[10, 9, 8, 7, 20]);
        let intent = decide(&spec, Some(&position(dec!(20))), &quote, &candles).unwrap();
        assert!(intent.is_none());
    }

    #[test]
    fn test_flat_strategy_ignores_sell_signal() {
        let spec = spec(sell_kind());
        let quote = Quote::new("005930", dec!(10));
        let intent = decide(&spec, None, &quote, &sell_candles()).unwrap();
        assert!(intent.is_none());
    }

    #[test]
    fn test_neutral_candles_no_intent_either_way() {
        let spec = spec(neutral_kind());
        let quote = Quote::new("005930", dec!(100));
        assert!(decide(&spec, None, &quote, &neutral_candles())
            .unwrap()
            .is_none());
        assert!(
            decide(&spec, Some(&position(dec!(100))), &quote, &neutral_candles())
                .unwrap()
                .is_none()
        );
    }
}
