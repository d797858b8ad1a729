use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GambitError, Result};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Why an intent was emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderReason {
    Signal,
    TakeProfit,
    StopLoss,
    Manual,
}

impl std::fmt::Display for OrderReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderReason::Signal => write!(f, "signal"),
            OrderReason::TakeProfit => write!(f, "take_profit"),
            OrderReason::StopLoss => write!(f, "stop_loss"),
            OrderReason::Manual => write!(f, "manual"),
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Order created but not yet submitted
    Pending,
    /// Order acknowledged by the broker
    Submitted,
    /// Order partially filled
    PartiallyFilled,
    /// Order fully filled
    Filled,
    /// Order rejected by the broker or abandoned after retries
    Rejected,
    /// Order cancelled
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Submitted | OrderStatus::PartiallyFilled
        )
    }

    /// Legal transitions of the order lifecycle. Terminal states accept
    /// nothing.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match self {
            Pending => matches!(next, Submitted | Rejected | Cancelled),
            Submitted => matches!(next, PartiallyFilled | Filled | Rejected | Cancelled),
            PartiallyFilled => matches!(next, Filled | Cancelled),
            Filled | Rejected | Cancelled => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// A proposed trade, produced by the strategy engine (or an operator) and
/// consumed exactly once by the order executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub id: Uuid,
    pub strategy_id: String,
    pub broker_id: String,
    pub instrument_code: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub reason: OrderReason,
    pub created_at: DateTime<Utc>,
}

impl OrderIntent {
    pub fn entry(strategy_id: &str, broker_id: &str, instrument_code: &str, quantity: Decimal) -> Self {
        Self::new(
            strategy_id,
            broker_id,
            instrument_code,
            OrderSide::Buy,
            quantity,
            OrderReason::Signal,
        )
    }

    pub fn exit(
        strategy_id: &str,
        broker_id: &str,
        instrument_code: &str,
        quantity: Decimal,
        reason: OrderReason,
    ) -> Self {
        Self::new(
            strategy_id,
            broker_id,
            instrument_code,
            OrderSide::Sell,
            quantity,
            reason,
        )
    }

    fn new(
        strategy_id: &str,
        broker_id: &str,
        instrument_code: &str,
        side: OrderSide,
        quantity: Decimal,
        reason: OrderReason,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy_id: strategy_id.to_string(),
            broker_id: broker_id.to_string(),
            instrument_code: instrument_code.to_string(),
            side,
            quantity,
            order_type: OrderType::Market,
            limit_price: None,
            reason,
            created_at: Utc::now(),
        }
    }

    /// Client-side idempotency key for this intent.
    pub fn idempotency_key(&self) -> String {
        format!("intent-{}", self.id)
    }
}

/// Broker acknowledgment of a placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub broker_order_id: String,
    /// Exchange forwarding organization number, required by some brokers
    /// for cancellation.
    pub forwarding_org_no: Option<String>,
    pub accepted_at: DateTime<Utc>,
}

/// Broker-side view of an order, returned by status polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFillReport {
    pub broker_order_id: String,
    pub requested_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub remaining_quantity: Decimal,
    /// Average fill price when the venue reports one.
    pub average_price: Option<Decimal>,
}

/// Order tracked by the execution state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub broker_order_id: Option<String>,
    pub forwarding_org_no: Option<String>,
    pub strategy_id: String,
    pub broker_id: String,
    pub instrument_code: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub reason: OrderReason,
    pub requested_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub submitted_at: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn from_intent(intent: &OrderIntent) -> Self {
        let now = Utc::now();
        Self {
            client_order_id: intent.idempotency_key(),
            broker_order_id: None,
            forwarding_org_no: None,
            strategy_id: intent.strategy_id.clone(),
            broker_id: intent.broker_id.clone(),
            instrument_code: intent.instrument_code.clone(),
            side: intent.side,
            order_type: intent.order_type,
            reason: intent.reason,
            requested_quantity: intent.quantity,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            status: OrderStatus::Pending,
            submitted_at: None,
            last_update: now,
            error: None,
            created_at: now,
        }
    }

    /// Advance the lifecycle. Rejects anything the state machine does not
    /// allow, which keeps terminal states absorbing.
    pub fn transition(&mut self, next: OrderStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(GambitError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.last_update = Utc::now();
        Ok(())
    }

    /// Record broker acknowledgment, moving Pending to Submitted.
    pub fn acknowledge(&mut self, ack: &OrderAck) -> Result<()> {
        self.transition(OrderStatus::Submitted)?;
        self.broker_order_id = Some(ack.broker_order_id.clone());
        self.forwarding_org_no = ack.forwarding_org_no.clone();
        self.submitted_at = Some(ack.accepted_at);
        Ok(())
    }

    /// Fold a fill report into the order. Progressive partial fills update
    /// quantity in place; reaching the requested quantity completes the
    /// order.
    pub fn apply_fill(&mut self, filled: Decimal, price: Option<Decimal>) -> Result<()> {
        if filled < self.filled_quantity {
            // Broker reports are cumulative, never regressing.
            return Ok(());
        }
        self.filled_quantity = filled;
        if price.is_some() {
            self.avg_fill_price = price;
        }
        if filled >= self.requested_quantity {
            if self.status != OrderStatus::Filled {
                self.transition(OrderStatus::Filled)?;
            }
        } else if filled > Decimal::ZERO && self.status == OrderStatus::Submitted {
            self.transition(OrderStatus::PartiallyFilled)?;
        } else {
            self.last_update = Utc::now();
        }
        Ok(())
    }

    pub fn is_fully_filled(&self) -> bool {
        self.status == OrderStatus::Filled && self.filled_quantity >= self.requested_quantity
    }

    /// Calculate fill percentage
    pub fn fill_pct(&self) -> Decimal {
        if self.requested_quantity.is_zero() {
            return Decimal::ZERO;
        }
        self.filled_quantity / self.requested_quantity * Decimal::from(100)
    }
}

/// Open position held for a strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub strategy_id: String,
    pub instrument_code: String,
    pub quantity: Decimal,
    pub average_entry_price: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        (current_price - self.average_entry_price) * self.quantity
    }

    /// Signed percentage move of the quote against the entry price.
    pub fn price_change_pct(&self, current_price: Decimal) -> Decimal {
        if self.average_entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (current_price - self.average_entry_price) / self.average_entry_price
            * Decimal::from(100)
    }
}

/// Position lifecycle event recorded through the strategy repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PositionChange {
    Opened(Position),
    Closed {
        strategy_id: String,
        instrument_code: String,
        quantity: Decimal,
        exit_price: Option<Decimal>,
        reason: OrderReason,
        closed_at: DateTime<Utc>,
    },
}
