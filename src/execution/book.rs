//! In-memory book of orders and positions.
//!
//! Shared by the executor, the reconciler, and the orchestrator. One
//! non-terminal order per strategy is the serialization invariant; the
//! book is where everyone checks it.

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use rust_decimal::Decimal;
use tracing::warn;

use crate::domain::{Order, OrderFillReport, OrderSide, Position, PositionChange};
use crate::error::Result;

/// What one recorded fill report changed: the order as the book now
/// holds it and the position event, if the fill opened or closed one.
#[derive(Debug)]
pub struct FillOutcome {
    pub order: Order,
    pub change: Option<PositionChange>,
}

#[derive(Default)]
pub struct TradeBook {
    /// Keyed by client order id.
    orders: DashMap<String, Order>,
    /// Keyed by strategy id.
    positions: DashMap<String, Position>,
    /// Orders reconciliation has given up on. They stay non-terminal in
    /// `orders` and keep their strategy blocked until an operator steps
    /// in.
    stalled: DashSet<String>,
    /// Strategies inside the evaluate-and-submit window of the current
    /// tick.
    claimed: DashSet<String>,
}

impl TradeBook {
    pub fn new() -> Self {
        Self::default()
    }

    // --- orders ---

    pub fn upsert_order(&self, order: Order) {
        self.orders.insert(order.client_order_id.clone(), order);
    }

    pub fn order(&self, client_order_id: &str) -> Option<Order> {
        self.orders.get(client_order_id).map(|o| o.clone())
    }

    /// Non-terminal orders that reconciliation should still poll.
    pub fn reconcilable_orders(&self) -> Vec<Order> {
        self.orders
            .iter()
            .filter(|entry| {
                !entry.value().status.is_terminal()
                    && entry.value().broker_order_id.is_some()
                    && !self.stalled.contains(entry.key())
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn active_order_count(&self) -> usize {
        self.orders
            .iter()
            .filter(|entry| !entry.value().status.is_terminal())
            .count()
    }

    /// True when the strategy has a live order (including stalled ones)
    /// or is mid-submission on this tick.
    pub fn is_strategy_busy(&self, strategy_id: &str) -> bool {
        if self.claimed.contains(strategy_id) {
            return true;
        }
        self.orders.iter().any(|entry| {
            entry.value().strategy_id == strategy_id && !entry.value().status.is_terminal()
        })
    }

    /// Claim the submission window for a strategy. Returns false when the
    /// strategy is already busy, which the caller treats as "skip".
    pub fn claim_strategy(&self, strategy_id: &str) -> bool {
        if !self.claimed.insert(strategy_id.to_string()) {
            return false;
        }
        let live = self.orders.iter().any(|entry| {
            entry.value().strategy_id == strategy_id && !entry.value().status.is_terminal()
        });
        if live {
            self.claimed.remove(strategy_id);
            return false;
        }
        true
    }

    pub fn release_strategy(&self, strategy_id: &str) {
        self.claimed.remove(strategy_id);
    }

    pub fn mark_stalled(&self, client_order_id: &str) {
        self.stalled.insert(client_order_id.to_string());
    }

    /// Fold a broker fill report into the book's order entry and the
    /// strategy's position in one step. The delta is computed against
    /// the stored order while its entry is held, never against a
    /// caller's copy, so two observers of the same report (executor
    /// poll, reconciliation pass) fold it into the position exactly
    /// once. Returns `None` when the report carries nothing new.
    pub fn record_fill(
        &self,
        client_order_id: &str,
        report: &OrderFillReport,
    ) -> Result<Option<FillOutcome>> {
        let mut entry = match self.orders.get_mut(client_order_id) {
            Some(entry) => entry,
            None => {
                warn!(%client_order_id, "fill report for untracked order");
                return Ok(None);
            }
        };
        let delta = report.filled_quantity - entry.filled_quantity;
        if delta <= Decimal::ZERO {
            return Ok(None);
        }
        entry.apply_fill(report.filled_quantity, report.average_price)?;
        let change = self.apply_position_delta(&entry, delta, report.average_price);
        Ok(Some(FillOutcome {
            order: entry.clone(),
            change,
        }))
    }

    pub fn stalled_order_count(&self) -> usize {
        self.stalled.len()
    }

    // --- positions ---

    pub fn position(&self, strategy_id: &str) -> Option<Position> {
        self.positions.get(strategy_id).map(|p| p.clone())
    }

    pub fn positions(&self) -> Vec<Position> {
        self.positions.iter().map(|p| p.value().clone()).collect()
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    /// Fold a fill increment into the strategy's position. Buy fills
    /// open or grow it with a weighted average price; sell fills shrink
    /// it and close it at zero.
    fn apply_position_delta(
        &self,
        order: &Order,
        delta: Decimal,
        fill_price: Option<Decimal>,
    ) -> Option<PositionChange> {
        if delta <= Decimal::ZERO {
            return None;
        }
        let price = fill_price.or(order.avg_fill_price).unwrap_or(Decimal::ZERO);

        match order.side {
            OrderSide::Buy => {
                let mut opened = None;
                let mut position = self
                    .positions
                    .entry(order.strategy_id.clone())
                    .or_insert_with(|| {
                        let position = Position {
                            strategy_id: order.strategy_id.clone(),
                            instrument_code: order.instrument_code.clone(),
                            quantity: Decimal::ZERO,
                            average_entry_price: Decimal::ZERO,
                            opened_at: Utc::now(),
                        };
                        opened = Some(());
                        position
                    });
                let total = position.quantity + delta;
                position.average_entry_price = if total.is_zero() {
                    Decimal::ZERO
                } else {
                    (position.quantity * position.average_entry_price + delta * price) / total
                };
                position.quantity = total;
                let snapshot = position.clone();
                drop(position);
                opened.map(|_| PositionChange::Opened(snapshot))
            }
            OrderSide::Sell => {
                let closed = match self.positions.get_mut(&order.strategy_id) {
                    Some(mut position) => {
                        position.quantity -= delta;
                        position.quantity <= Decimal::ZERO
                    }
                    None => {
                        warn!(
                            strategy_id = %order.strategy_id,
                            instrument_code = %order.instrument_code,
                            "sell fill with no tracked position"
                        );
                        return None;
                    }
                };
                if closed {
                    self.positions.remove(&order.strategy_id);
                    Some(PositionChange::Closed {
                        strategy_id: order.strategy_id.clone(),
                        instrument_code: order.instrument_code.clone(),
                        quantity: order.filled_quantity,
                        exit_price: fill_price.or(order.avg_fill_price),
                        reason: order.reason,
                        closed_at: Utc::now(),
                    })
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderAck, OrderIntent, OrderReason, OrderStatus};
    use rust_decimal_macros::dec;

    fn buy_order(strategy_id: &str) -> Order {
        let intent = OrderIntent::entry(strategy_id, "kis", "005930", dec!(10));
        Order::from_intent(&intent)
    }

    fn sell_order(strategy_id: &str, quantity: Decimal) -> Order {
        let intent = OrderIntent::exit(
            strategy_id,
            "kis",
            "005930",
            quantity,
            OrderReason::TakeProfit,
        );
        let mut order = Order::from_intent(&intent);
        order.filled_quantity = quantity;
        order
    }

    #[test]
    fn test_buy_fills_open_then_grow_position() {
        let book = TradeBook::new();
        let order = buy_order("s1");

        let first = book.apply_position_delta(&order, dec!(4), Some(dec!(100)));
        assert!(matches!(first, Some(PositionChange::Opened(_))));

        let second = book.apply_position_delta(&order, dec!(6), Some(dec!(110)));
        assert!(second.is_none());

        let position = book.position("s1").unwrap();
        assert_eq!(position.quantity, dec!(10));
        // 4 @ 100 + 6 @ 110 = 1060 / 10
        assert_eq!(position.average_entry_price, dec!(106));
    }

    #[test]
    fn test_sell_fill_closes_at_zero() {
        let book = TradeBook::new();
        book.apply_position_delta(&buy_order("s1"), dec!(10), Some(dec!(100)));

        let sell = sell_order("s1", dec!(10));
        let change = book.apply_position_delta(&sell, dec!(10), Some(dec!(105)));
        match change {
            Some(PositionChange::Closed {
                quantity,
                exit_price,
                reason,
                ..
            }) => {
                assert_eq!(quantity, dec!(10));
                assert_eq!(exit_price, Some(dec!(105)));
                assert_eq!(reason, OrderReason::TakeProfit);
            }
            other => panic!("expected close, got {:?}", other),
        }
        assert!(book.position("s1").is_none());
    }

    #[test]
    fn test_partial_sell_keeps_position_open() {
        let book = TradeBook::new();
        book.apply_position_delta(&buy_order("s1"), dec!(10), Some(dec!(100)));

        let sell = sell_order("s1", dec!(10));
        let change = book.apply_position_delta(&sell, dec!(4), Some(dec!(105)));
        assert!(change.is_none());
        assert_eq!(book.position("s1").unwrap().quantity, dec!(6));
    }

    #[test]
    fn test_same_report_folds_into_position_once() {
        let book = TradeBook::new();
        let intent = OrderIntent::entry("s1", "kis", "005930", dec!(5));
        let mut order = Order::from_intent(&intent);
        let id = order.client_order_id.clone();
        order
            .acknowledge(&OrderAck {
                broker_order_id: "B1".to_string(),
                forwarding_org_no: None,
                accepted_at: Utc::now(),
            })
            .unwrap();
        book.upsert_order(order);

        let report = OrderFillReport {
            broker_order_id: "B1".to_string(),
            requested_quantity: dec!(5),
            filled_quantity: dec!(5),
            remaining_quantity: dec!(0),
            average_price: Some(dec!(100)),
        };

        let first = book.record_fill(&id, &report).unwrap().unwrap();
        assert_eq!(first.order.status, OrderStatus::Filled);
        assert!(matches!(first.change, Some(PositionChange::Opened(_))));

        // A second observer of the same broker report sees no new delta.
        assert!(book.record_fill(&id, &report).unwrap().is_none());
        assert_eq!(book.position("s1").unwrap().quantity, dec!(5));
    }

    #[test]
    fn test_claim_refused_while_order_live() {
        let book = TradeBook::new();
        let mut order = buy_order("s1");
        order.status = crate::domain::OrderStatus::Submitted;
        book.upsert_order(order);

        assert!(!book.claim_strategy("s1"));
        assert!(book.is_strategy_busy("s1"));
        assert!(book.claim_strategy("s2"));
        assert!(!book.claim_strategy("s2"));
        book.release_strategy("s2");
        assert!(book.claim_strategy("s2"));
    }

    #[test]
    fn test_stalled_orders_leave_reconcile_set_but_stay_busy() {
        let book = TradeBook::new();
        let mut order = buy_order("s1");
        order.status = crate::domain::OrderStatus::Submitted;
        order.broker_order_id = Some("B1".to_string());
        let id = order.client_order_id.clone();
        book.upsert_order(order);

        assert_eq!(book.reconcilable_orders().len(), 1);
        book.mark_stalled(&id);
        assert!(book.reconcilable_orders().is_empty());
        assert!(book.is_strategy_busy("s1"));
    }
}
