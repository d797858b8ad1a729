//! In-memory paper broker.
//!
//! Implements the broker trait against scripted market data and fill
//! behavior, so the engine can run dry (`kind = "paper"` in config) and
//! so tests can drive every order outcome deterministically. Instruments
//! with no scripted series get a deterministic synthetic price walk.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Local, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::broker::{BrokerClient, BrokerKind};
use crate::domain::{
    AccountBalance, BalanceLine, Candle, Order, OrderAck, OrderFillReport, OrderIntent, OrderSide,
    Quote,
};
use crate::error::{GambitError, Result};
use crate::throttle::RateLimiter;

/// Index where the synthetic walk's "today" sits. History counts back
/// from here and live quotes continue forward from it.
const SYNTH_ORIGIN: u64 = 256;

/// How the paper broker treats an order after placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillBehavior {
    /// Acknowledge and report fully filled on the first status poll.
    Immediate,
    /// Report `fill` shares for the first `partial_polls` status polls,
    /// then fully filled. `u32::MAX` leaves the order stuck partial.
    Partial { fill: Decimal, partial_polls: u32 },
    /// Refuse the order at placement.
    Reject { reason: String },
    /// Fail placement with a transient error `failures` times, then
    /// accept and fill immediately.
    TransientTimes { failures: u32 },
}

impl Default for FillBehavior {
    fn default() -> Self {
        FillBehavior::Immediate
    }
}

#[derive(Debug, Clone)]
pub struct PaperOrder {
    pub broker_order_id: String,
    pub instrument_code: String,
    pub side: OrderSide,
    pub requested_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub price: Decimal,
    pub status_polls: u32,
    pub cancelled: bool,
    behavior: FillBehavior,
}

#[derive(Debug, Clone, Default)]
struct Holding {
    quantity: Decimal,
    average_price: Decimal,
}

pub struct PaperBroker {
    broker_id: String,
    account_id: String,
    limiter: Arc<RateLimiter>,
    auth_ok: AtomicBool,
    cash: std::sync::Mutex<Decimal>,
    holdings: DashMap<String, Holding>,
    quotes: DashMap<String, Decimal>,
    candles: DashMap<String, Vec<Candle>>,
    behaviors: DashMap<String, FillBehavior>,
    default_behavior: std::sync::Mutex<FillBehavior>,
    transient_left: DashMap<String, u32>,
    orders: DashMap<String, PaperOrder>,
    acked: DashMap<String, OrderAck>,
    next_order_no: AtomicU64,
    placements: AtomicU64,
    quote_polls: DashMap<String, u64>,
}

impl PaperBroker {
    pub fn new(broker_id: &str, account_id: &str, limiter: Arc<RateLimiter>) -> Self {
        Self {
            broker_id: broker_id.to_string(),
            account_id: account_id.to_string(),
            limiter,
            auth_ok: AtomicBool::new(true),
            cash: std::sync::Mutex::new(dec!(10_000_000)),
            holdings: DashMap::new(),
            quotes: DashMap::new(),
            candles: DashMap::new(),
            behaviors: DashMap::new(),
            default_behavior: std::sync::Mutex::new(FillBehavior::Immediate),
            transient_left: DashMap::new(),
            orders: DashMap::new(),
            acked: DashMap::new(),
            next_order_no: AtomicU64::new(1),
            placements: AtomicU64::new(0),
            quote_polls: DashMap::new(),
        }
    }

    // --- scripting surface ---

    pub fn set_auth_ok(&self, ok: bool) {
        self.auth_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_cash(&self, cash: Decimal) {
        *self.cash.lock().unwrap_or_else(|p| p.into_inner()) = cash;
    }

    pub fn set_quote(&self, instrument_code: &str, price: Decimal) {
        self.quotes.insert(instrument_code.to_string(), price);
    }

    pub fn clear_quote(&self, instrument_code: &str) {
        self.quotes.remove(instrument_code);
        self.candles.remove(instrument_code);
    }

    pub fn set_candles(&self, instrument_code: &str, candles: Vec<Candle>) {
        self.candles.insert(instrument_code.to_string(), candles);
    }

    /// Script a flat candle per close, ending yesterday. Open, high and
    /// low collapse onto the close so only cross logic sees structure.
    pub fn set_closes(&self, instrument_code: &str, closes: &[Decimal]) {
        let today = Local::now().date_naive();
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, close)| Candle {
                date: today - ChronoDuration::days((closes.len() - i) as i64),
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: 1_000,
            })
            .collect();
        self.set_candles(instrument_code, candles);
    }

    pub fn set_behavior(&self, instrument_code: &str, behavior: FillBehavior) {
        self.behaviors.insert(instrument_code.to_string(), behavior);
    }

    pub fn set_default_behavior(&self, behavior: FillBehavior) {
        *self
            .default_behavior
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = behavior;
    }

    // --- inspection surface ---

    pub fn placement_count(&self) -> u64 {
        self.placements.load(Ordering::SeqCst)
    }

    pub fn order_snapshot(&self, broker_order_id: &str) -> Option<PaperOrder> {
        self.orders.get(broker_order_id).map(|o| o.clone())
    }

    pub fn orders(&self) -> Vec<PaperOrder> {
        self.orders.iter().map(|o| o.value().clone()).collect()
    }

    // --- internals ---

    fn ensure_auth(&self) -> Result<()> {
        if self.auth_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GambitError::Auth(format!(
                "paper broker '{}' credentials revoked",
                self.broker_id
            )))
        }
    }

    fn behavior_for(&self, instrument_code: &str) -> FillBehavior {
        self.behaviors
            .get(instrument_code)
            .map(|b| b.value().clone())
            .unwrap_or_else(|| {
                self.default_behavior
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone()
            })
    }

    fn take_transient_failure(&self, instrument_code: &str, failures: u32) -> bool {
        let mut left = self
            .transient_left
            .entry(instrument_code.to_string())
            .or_insert(failures);
        if *left > 0 {
            *left -= 1;
            true
        } else {
            false
        }
    }

    /// Deterministic walk for unscripted instruments: base level from the
    /// instrument code hash, a slow cycle on top.
    fn synthetic_close(&self, instrument_code: &str, index: u64) -> Decimal {
        let digest = Sha256::digest(instrument_code.as_bytes());
        let base = 10_000 + (u64::from(digest[0]) * 256 + u64::from(digest[1])) % 50_000;
        let phase = u64::from(digest[2]) % 20;
        let angle = (index + phase) as f64 * std::f64::consts::TAU / 20.0;
        let level = base as f64 * (1.0 + 0.05 * angle.sin());
        Decimal::from_f64_retain(level.round()).unwrap_or_else(|| Decimal::from(base))
    }

    fn current_price(&self, instrument_code: &str) -> Result<Decimal> {
        if let Some(price) = self.quotes.get(instrument_code) {
            return Ok(*price.value());
        }
        if let Some(candles) = self.candles.get(instrument_code) {
            if let Some(last) = candles.value().last() {
                return Ok(last.close);
            }
            return Err(GambitError::DataUnavailable(format!(
                "no market data scripted for {}",
                instrument_code
            )));
        }
        let polls = self
            .quote_polls
            .get(instrument_code)
            .map(|p| *p.value())
            .unwrap_or(0);
        Ok(self.synthetic_close(instrument_code, SYNTH_ORIGIN + polls))
    }

    fn apply_fill_delta(&self, order: &PaperOrder, delta: Decimal) {
        if delta <= Decimal::ZERO {
            return;
        }
        let notional = delta * order.price;
        let mut cash = self.cash.lock().unwrap_or_else(|p| p.into_inner());
        match order.side {
            OrderSide::Buy => {
                *cash -= notional;
                let mut holding = self
                    .holdings
                    .entry(order.instrument_code.clone())
                    .or_default();
                let total_qty = holding.quantity + delta;
                holding.average_price = if total_qty.is_zero() {
                    Decimal::ZERO
                } else {
                    (holding.quantity * holding.average_price + notional) / total_qty
                };
                holding.quantity = total_qty;
            }
            OrderSide::Sell => {
                *cash += notional;
                let emptied = match self.holdings.get_mut(&order.instrument_code) {
                    Some(mut holding) => {
                        holding.quantity -= delta;
                        holding.quantity <= Decimal::ZERO
                    }
                    None => false,
                };
                if emptied {
                    self.holdings.remove(&order.instrument_code);
                }
            }
        }
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Paper
    }

    fn broker_id(&self) -> &str {
        &self.broker_id
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn authenticate(&self) -> Result<()> {
        let _permit = self.limiter.acquire().await?;
        self.ensure_auth()
    }

    async fn fetch_balance(&self) -> Result<AccountBalance> {
        let _permit = self.limiter.acquire().await?;
        self.ensure_auth()?;

        let mut holdings = Vec::new();
        for entry in self.holdings.iter() {
            let code = entry.key();
            let holding = entry.value();
            let current = self.current_price(code)?;
            let pnl_pct = if holding.average_price.is_zero() {
                Decimal::ZERO
            } else {
                (current - holding.average_price) / holding.average_price * dec!(100)
            };
            holdings.push(BalanceLine {
                instrument_code: code.clone(),
                name: format!("PAPER {}", code),
                quantity: holding.quantity,
                average_price: holding.average_price,
                current_price: current,
                pnl_pct,
                sellable_quantity: holding.quantity,
            });
        }

        Ok(AccountBalance {
            account_id: self.account_id.clone(),
            cash: *self.cash.lock().unwrap_or_else(|p| p.into_inner()),
            holdings,
            as_of: Utc::now(),
        })
    }

    async fn fetch_quote(&self, instrument_code: &str) -> Result<Quote> {
        let _permit = self.limiter.acquire().await?;
        self.ensure_auth()?;
        let price = self.current_price(instrument_code)?;
        *self
            .quote_polls
            .entry(instrument_code.to_string())
            .or_insert(0) += 1;
        Ok(Quote::new(instrument_code, price))
    }

    async fn fetch_candles(&self, instrument_code: &str, count: usize) -> Result<Vec<Candle>> {
        let _permit = self.limiter.acquire().await?;
        self.ensure_auth()?;

        if let Some(scripted) = self.candles.get(instrument_code) {
            let scripted = scripted.value();
            let start = scripted.len().saturating_sub(count);
            return Ok(scripted[start..].to_vec());
        }
        if self.quotes.contains_key(instrument_code) {
            return Err(GambitError::DataUnavailable(format!(
                "no candle history scripted for {}",
                instrument_code
            )));
        }

        let today = Local::now().date_naive();
        let start = SYNTH_ORIGIN.saturating_sub(count as u64);
        let candles = (0..count)
            .map(|i| {
                let close = self.synthetic_close(instrument_code, start + i as u64);
                Candle {
                    date: today - ChronoDuration::days((count - i) as i64),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 10_000,
                }
            })
            .collect();
        Ok(candles)
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderAck> {
        let key = intent.idempotency_key();
        if let Some(ack) = self.acked.get(&key) {
            debug!(
                broker_id = %self.broker_id,
                idempotency_key = %key,
                "replaying paper acknowledgment"
            );
            return Ok(ack.clone());
        }

        let _permit = self.limiter.acquire().await?;
        self.ensure_auth()?;

        let behavior = self.behavior_for(&intent.instrument_code);
        match &behavior {
            FillBehavior::Reject { reason } => {
                return Err(GambitError::RejectedOrder(reason.clone()));
            }
            FillBehavior::TransientTimes { failures } => {
                if self.take_transient_failure(&intent.instrument_code, *failures) {
                    return Err(GambitError::TransientBroker(format!(
                        "paper broker '{}' simulated outage",
                        self.broker_id
                    )));
                }
            }
            _ => {}
        }

        let price = match intent.limit_price {
            Some(limit) => limit,
            None => self.current_price(&intent.instrument_code)?,
        };
        let seq = self.next_order_no.fetch_add(1, Ordering::SeqCst);
        let broker_order_id = format!("P{:08}", seq);

        self.orders.insert(
            broker_order_id.clone(),
            PaperOrder {
                broker_order_id: broker_order_id.clone(),
                instrument_code: intent.instrument_code.clone(),
                side: intent.side,
                requested_quantity: intent.quantity,
                filled_quantity: Decimal::ZERO,
                price,
                status_polls: 0,
                cancelled: false,
                behavior,
            },
        );

        let ack = OrderAck {
            broker_order_id,
            forwarding_org_no: None,
            accepted_at: Utc::now(),
        };
        self.acked.insert(key, ack.clone());
        self.placements.fetch_add(1, Ordering::SeqCst);
        Ok(ack)
    }

    async fn fetch_order_status(&self, broker_order_id: &str) -> Result<OrderFillReport> {
        let _permit = self.limiter.acquire().await?;
        self.ensure_auth()?;

        let (report, fill_delta, order_view) = {
            let mut order = self.orders.get_mut(broker_order_id).ok_or_else(|| {
                GambitError::DataUnavailable(format!(
                    "paper broker has no order {}",
                    broker_order_id
                ))
            })?;
            order.status_polls += 1;

            let target = if order.cancelled {
                order.filled_quantity
            } else {
                match order.behavior {
                    FillBehavior::Partial {
                        fill,
                        partial_polls,
                    } if order.status_polls <= partial_polls => {
                        fill.min(order.requested_quantity)
                    }
                    _ => order.requested_quantity,
                }
            };

            let delta = target - order.filled_quantity;
            order.filled_quantity = target;
            (
                OrderFillReport {
                    broker_order_id: broker_order_id.to_string(),
                    requested_quantity: order.requested_quantity,
                    filled_quantity: target,
                    remaining_quantity: order.requested_quantity - target,
                    average_price: Some(order.price),
                },
                delta,
                order.clone(),
            )
        };

        self.apply_fill_delta(&order_view, fill_delta);
        Ok(report)
    }

    async fn cancel_order(&self, order: &Order) -> Result<bool> {
        let _permit = self.limiter.acquire().await?;
        self.ensure_auth()?;

        let broker_order_id = match order.broker_order_id.as_deref() {
            Some(id) => id,
            None => return Ok(false),
        };
        match self.orders.get_mut(broker_order_id) {
            Some(mut paper) => {
                if paper.filled_quantity >= paper.requested_quantity {
                    warn!(
                        broker_id = %self.broker_id,
                        %broker_order_id,
                        "cancel requested for fully filled paper order"
                    );
                    return Ok(false);
                }
                paper.cancelled = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
