//! Start-of-tick order reconciliation.
//!
//! Orders left open by the executor (poll timeout, process interruption)
//! are re-polled here every tick so fills that landed between ticks are
//! never dropped. An order that stays open past the attempt cap is
//! marked stalled: it stops being polled, keeps its strategy blocked,
//! and is escalated to the operator exactly once.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::broker::BrokerClient;
use crate::domain::{Order, PositionChange};
use crate::error::GambitError;
use crate::execution::TradeBook;

/// What one reconciliation pass found.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub checked: usize,
    pub completed: Vec<Order>,
    pub changes: Vec<PositionChange>,
    /// Orders that crossed the attempt cap on this pass.
    pub stalled: Vec<Order>,
    /// Broker-wide failures hit while polling, for suspension handling.
    pub broker_errors: HashMap<String, GambitError>,
}

pub struct Reconciler {
    book: Arc<TradeBook>,
    attempt_cap: u32,
    attempts: DashMap<String, u32>,
}

impl Reconciler {
    pub fn new(book: Arc<TradeBook>, attempt_cap: u32) -> Self {
        Self {
            book,
            attempt_cap: attempt_cap.max(1),
            attempts: DashMap::new(),
        }
    }

    /// Poll every open order once against its broker.
    pub async fn reconcile(
        &self,
        brokers: &HashMap<String, Arc<dyn BrokerClient>>,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        for mut order in self.book.reconcilable_orders() {
            let broker_order_id = match order.broker_order_id.clone() {
                Some(id) => id,
                None => continue,
            };
            let client = match brokers.get(&order.broker_id) {
                Some(client) => client,
                None => {
                    warn!(
                        broker_id = %order.broker_id,
                        client_order_id = %order.client_order_id,
                        "open order references unknown broker"
                    );
                    continue;
                }
            };
            if outcome.broker_errors.contains_key(&order.broker_id) {
                // Broker already failed this pass; retry next tick.
                continue;
            }
            outcome.checked += 1;

            match client.fetch_order_status(&broker_order_id).await {
                Ok(report) => {
                    match self.book.record_fill(&order.client_order_id, &report) {
                        Ok(Some(fill)) => {
                            if let Some(change) = fill.change {
                                outcome.changes.push(change);
                            }
                            order = fill.order;
                            info!(
                                client_order_id = %order.client_order_id,
                                filled = %order.filled_quantity,
                                status = %order.status,
                                "reconciliation picked up fills"
                            );
                        }
                        Ok(None) => {
                            // Nothing new; take the book's view in case the
                            // executor settled the order meanwhile.
                            if let Some(stored) = self.book.order(&order.client_order_id) {
                                order = stored;
                            }
                        }
                        Err(err) => {
                            warn!(
                                client_order_id = %order.client_order_id,
                                error = %err,
                                "reconciliation fill did not apply"
                            );
                        }
                    }
                    if order.status.is_terminal() {
                        self.attempts.remove(&order.client_order_id);
                        outcome.completed.push(order);
                        continue;
                    }
                }
                Err(err) if err.is_auth() => {
                    outcome.broker_errors.insert(order.broker_id.clone(), err);
                    continue;
                }
                Err(err) => {
                    debug!(
                        client_order_id = %order.client_order_id,
                        error = %err,
                        "reconciliation poll failed"
                    );
                }
            }

            // Still open after this pass.
            let attempts = {
                let mut entry = self
                    .attempts
                    .entry(order.client_order_id.clone())
                    .or_insert(0);
                *entry += 1;
                *entry
            };
            if attempts >= self.attempt_cap {
                self.book.mark_stalled(&order.client_order_id);
                self.attempts.remove(&order.client_order_id);
                warn!(
                    client_order_id = %order.client_order_id,
                    broker_order_id = %broker_order_id,
                    strategy_id = %order.strategy_id,
                    attempts,
                    "order unreachable after attempt cap, escalating"
                );
                outcome.stalled.push(order);
            }
        }

        outcome
    }
}
