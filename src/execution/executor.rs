//! Order lifecycle driver.
//!
//! Takes an intent through placement and fill polling. Transient
//! placement failures retry with exponential backoff up to the
//! configured cap, after which the order is rejected with the last
//! transient reason. A timed-out poll leaves the order non-terminal for
//! start-of-tick reconciliation; nothing here ever cancels an
//! acknowledged order.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::broker::BrokerClient;
use crate::config::EngineConfig;
use crate::domain::{Order, OrderAck, OrderIntent, OrderStatus, PositionChange};
use crate::error::{GambitError, Result};
use crate::execution::TradeBook;

/// Final word on one executed intent: the order as the book now holds
/// it, plus any position changes its fills produced.
#[derive(Debug)]
pub struct ExecutionReport {
    pub order: Order,
    pub changes: Vec<PositionChange>,
}

pub struct OrderExecutor {
    client: Arc<dyn BrokerClient>,
    book: Arc<TradeBook>,
    config: EngineConfig,
}

impl OrderExecutor {
    pub fn new(client: Arc<dyn BrokerClient>, book: Arc<TradeBook>, config: EngineConfig) -> Self {
        Self {
            client,
            book,
            config,
        }
    }

    /// Submit an intent and track it until filled or timed out.
    pub async fn execute(&self, intent: &OrderIntent) -> Result<ExecutionReport> {
        let mut order = Order::from_intent(intent);
        self.book.upsert_order(order.clone());

        match self.submit_with_retry(intent).await {
            Ok(ack) => {
                order.acknowledge(&ack)?;
                self.book.upsert_order(order.clone());
                info!(
                    strategy_id = %order.strategy_id,
                    client_order_id = %order.client_order_id,
                    broker_order_id = %ack.broker_order_id,
                    side = %order.side,
                    quantity = %order.requested_quantity,
                    reason = %order.reason,
                    "order acknowledged"
                );
            }
            Err(SubmitFailure::Rejected(reason)) => {
                order.transition(OrderStatus::Rejected)?;
                order.error = Some(reason.clone());
                self.book.upsert_order(order.clone());
                warn!(
                    strategy_id = %order.strategy_id,
                    client_order_id = %order.client_order_id,
                    %reason,
                    "order rejected by broker"
                );
                return Ok(ExecutionReport {
                    order,
                    changes: Vec::new(),
                });
            }
            Err(SubmitFailure::RetriesExhausted { attempts, last }) => {
                order.transition(OrderStatus::Rejected)?;
                order.error = Some(format!(
                    "transient failure after {} attempts: {}",
                    attempts, last
                ));
                self.book.upsert_order(order.clone());
                warn!(
                    strategy_id = %order.strategy_id,
                    client_order_id = %order.client_order_id,
                    attempts,
                    error = %last,
                    "order gave up after transient failures"
                );
                return Ok(ExecutionReport {
                    order,
                    changes: Vec::new(),
                });
            }
            Err(SubmitFailure::Fatal(err)) => {
                // Never reached the broker in a retryable way. Withdraw
                // the order locally and let the caller handle the error.
                order.transition(OrderStatus::Cancelled)?;
                order.error = Some(err.to_string());
                self.book.upsert_order(order.clone());
                return Err(err);
            }
        }

        let changes = self.poll_until_settled(&mut order).await;
        Ok(ExecutionReport { order, changes })
    }

    async fn submit_with_retry(
        &self,
        intent: &OrderIntent,
    ) -> std::result::Result<OrderAck, SubmitFailure> {
        let max_attempts = self.config.max_order_retries.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.client.place_order(intent).await {
                Ok(ack) => return Ok(ack),
                Err(GambitError::RejectedOrder(reason)) => {
                    return Err(SubmitFailure::Rejected(reason));
                }
                Err(err) if err.is_transient() => {
                    if attempt >= max_attempts {
                        return Err(SubmitFailure::RetriesExhausted {
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    let delay =
                        Duration::from_millis(self.config.retry_base_delay_ms * (1 << attempt));
                    warn!(
                        strategy_id = %intent.strategy_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient placement failure, backing off"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(SubmitFailure::Fatal(err)),
            }
        }
    }

    /// Poll fills until the order completes or the per-order window
    /// closes. Poll errors are tolerated inside the window; an order
    /// still open at the deadline is left for reconciliation.
    async fn poll_until_settled(&self, order: &mut Order) -> Vec<PositionChange> {
        let deadline = Instant::now() + Duration::from_millis(self.config.order_timeout_ms);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut changes = Vec::new();

        let broker_order_id = match order.broker_order_id.clone() {
            Some(id) => id,
            None => return changes,
        };

        loop {
            match self.client.fetch_order_status(&broker_order_id).await {
                Ok(report) => {
                    match self.book.record_fill(&order.client_order_id, &report) {
                        Ok(Some(fill)) => {
                            *order = fill.order;
                            if let Some(change) = fill.change {
                                changes.push(change);
                            }
                        }
                        Ok(None) => {
                            // No new delta. The reconciler may have folded
                            // this report in already; take the book's view
                            // so a terminal status ends the loop.
                            if let Some(stored) = self.book.order(&order.client_order_id) {
                                *order = stored;
                            }
                        }
                        Err(err) => {
                            warn!(
                                client_order_id = %order.client_order_id,
                                error = %err,
                                "fill report did not apply"
                            );
                        }
                    }
                    if order.status.is_terminal() {
                        info!(
                            client_order_id = %order.client_order_id,
                            broker_order_id = %broker_order_id,
                            filled = %order.filled_quantity,
                            "order settled"
                        );
                        return changes;
                    }
                }
                Err(err) if err.is_auth() => {
                    warn!(
                        client_order_id = %order.client_order_id,
                        error = %err,
                        "auth failure while polling fills, deferring to reconciliation"
                    );
                    return changes;
                }
                Err(err) => {
                    debug!(
                        client_order_id = %order.client_order_id,
                        error = %err,
                        "fill poll failed, will retry"
                    );
                }
            }

            if Instant::now() + poll_interval > deadline {
                debug!(
                    client_order_id = %order.client_order_id,
                    status = %order.status,
                    filled = %order.filled_quantity,
                    "order still open at poll deadline, handing to reconciliation"
                );
                return changes;
            }
            sleep(poll_interval).await;
        }
    }
}

enum SubmitFailure {
    Rejected(String),
    RetriesExhausted { attempts: u32, last: String },
    Fatal(GambitError),
}
