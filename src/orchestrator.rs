//! Tick driver and engine wiring.
//!
//! One `Engine` owns the broker set, the trade book, and the execution
//! machinery, and advances everything on a fixed interval: reconcile
//! open orders, probe suspended brokers, evaluate active strategies
//! under a bounded fan-out, publish health. Per-strategy failures stay
//! per-strategy; an exhausted auth failure suspends only its broker.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::broker::BrokerClient;
use crate::config::EngineConfig;
use crate::coordination::{EnginePhase, ShutdownController};
use crate::domain::{AccountSnapshot, OrderIntent, OrderStatus, StrategySpec};
use crate::error::{GambitError, OrderError, Result};
use crate::execution::{ExecutionReport, OrderExecutor, Reconciler, TradeBook};
use crate::repository::StrategyRepository;
use crate::services::{AlertEvent, AlertSeverity, AlertSink, HealthState, SnapshotProvider};
use crate::strategy;
use crate::throttle::RateLimiterRegistry;

pub struct Engine {
    config: EngineConfig,
    brokers: HashMap<String, Arc<dyn BrokerClient>>,
    executors: HashMap<String, OrderExecutor>,
    repository: Arc<dyn StrategyRepository>,
    book: Arc<TradeBook>,
    reconciler: Reconciler,
    alerts: Arc<dyn AlertSink>,
    limiters: Arc<RateLimiterRegistry>,
    health: Arc<HealthState>,
    shutdown: Arc<ShutdownController>,
    suspended: DashSet<String>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        brokers: HashMap<String, Arc<dyn BrokerClient>>,
        repository: Arc<dyn StrategyRepository>,
        alerts: Arc<dyn AlertSink>,
        limiters: Arc<RateLimiterRegistry>,
        health: Arc<HealthState>,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        let book = Arc::new(TradeBook::new());
        let executors = brokers
            .iter()
            .map(|(broker_id, client)| {
                (
                    broker_id.clone(),
                    OrderExecutor::new(client.clone(), book.clone(), config.clone()),
                )
            })
            .collect();
        let reconciler = Reconciler::new(book.clone(), config.reconcile_attempt_cap);

        Self {
            config,
            brokers,
            executors,
            repository,
            book,
            reconciler,
            alerts,
            limiters,
            health,
            shutdown,
            suspended: DashSet::new(),
        }
    }

    pub fn book(&self) -> &Arc<TradeBook> {
        &self.book
    }

    pub fn is_broker_suspended(&self, broker_id: &str) -> bool {
        self.suspended.contains(broker_id)
    }

    /// Drive ticks until a stop is requested. A graceful stop lets the
    /// tick in progress finish; a forced stop abandons it at the next
    /// await point without touching broker-acknowledged orders.
    pub async fn run(&self) -> Result<()> {
        let mut token = self.shutdown.subscribe();
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Mirror phase changes into the health feed as they happen, so a
        // drain requested mid-tick is visible before the tick finishes.
        let phase_mirror = {
            let health = self.health.clone();
            let mut watch = self.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    let phase = watch.changed().await;
                    health.set_phase(phase).await;
                    if phase == EnginePhase::Stopped {
                        break;
                    }
                }
            })
        };

        info!(
            tick_interval_secs = self.config.tick_interval_secs,
            brokers = self.brokers.len(),
            "trading engine started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !token.is_running() {
                        break;
                    }
                    let mut stop = token.clone();
                    tokio::select! {
                        _ = stop.wait_for(EnginePhase::Stopped) => {
                            warn!("forced stop abandoned the tick in progress");
                            break;
                        }
                        _ = self.tick_once() => {}
                    }
                }
                phase = token.changed() => {
                    if phase != EnginePhase::Running {
                        break;
                    }
                }
            }
        }

        phase_mirror.abort();
        let phase = self.shutdown.phase();
        self.health.set_phase(phase).await;
        info!(%phase, "trading engine stopped");
        Ok(())
    }

    /// One full evaluation cycle. Public so the binary's loop and the
    /// integration tests drive the same code path.
    pub async fn tick_once(&self) {
        let started = std::time::Instant::now();

        self.reconcile_open_orders().await;
        self.probe_suspended_brokers().await;

        match self.repository.list_active_strategies().await {
            Ok(specs) => {
                let count = specs.len();
                futures::stream::iter(specs)
                    .for_each_concurrent(
                        self.config.max_concurrent_evaluations.max(1),
                        |spec| self.evaluate_one(spec),
                    )
                    .await;
                debug!(
                    strategies = count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tick complete"
                );
            }
            Err(err) => {
                warn!(error = %err, "strategy listing failed, no evaluations this tick");
            }
        }

        self.publish_health().await;
    }

    /// Submit an operator intent through the same claim, idempotency,
    /// and retry path as automated ones. Refused while the strategy has
    /// an order in flight or its broker is suspended.
    pub async fn submit_manual_intent(&self, intent: OrderIntent) -> Result<String> {
        if self.suspended.contains(&intent.broker_id) {
            return Err(GambitError::BrokerSuspended(intent.broker_id.clone()));
        }
        if !self.executors.contains_key(&intent.broker_id) {
            return Err(GambitError::Validation(format!(
                "unknown broker '{}'",
                intent.broker_id
            )));
        }
        if !self.book.claim_strategy(&intent.strategy_id) {
            return Err(OrderError::AlreadyInFlight {
                strategy_id: intent.strategy_id.clone(),
            }
            .into());
        }

        info!(
            strategy_id = %intent.strategy_id,
            broker_id = %intent.broker_id,
            side = %intent.side,
            quantity = %intent.quantity,
            "manual intent accepted"
        );
        let result = self.execute_claimed(&intent).await;
        self.book.release_strategy(&intent.strategy_id);
        result.map(|report| report.order.client_order_id)
    }

    /// Broker balance merged with engine-tracked positions, consistent
    /// with the last completed tick.
    pub async fn get_account_snapshot(&self, account_id: &str) -> Result<AccountSnapshot> {
        let client = self
            .brokers
            .values()
            .find(|client| client.account_id() == account_id)
            .ok_or_else(|| {
                GambitError::Validation(format!("no broker trades account '{account_id}'"))
            })?;

        let balance = client.fetch_balance().await?;
        Ok(AccountSnapshot {
            account_id: account_id.to_string(),
            cash: balance.cash,
            positions: self.book.positions(),
            as_of: Utc::now(),
        })
    }

    // --- tick internals ---

    async fn reconcile_open_orders(&self) {
        let outcome = self.reconciler.reconcile(&self.brokers).await;

        for change in outcome.changes {
            if let Err(err) = self.repository.record_position_change(change).await {
                warn!(error = %err, "position change not recorded");
            }
        }
        for order in &outcome.stalled {
            self.alerts
                .send(
                    AlertEvent::new(
                        AlertSeverity::Critical,
                        "Order unreachable",
                        &format!(
                            "order {} ({} {}) not reconciled after {} attempts; manual intervention required",
                            order.client_order_id,
                            order.side,
                            order.instrument_code,
                            self.config.reconcile_attempt_cap
                        ),
                    )
                    .for_broker(&order.broker_id)
                    .for_strategy(&order.strategy_id),
                )
                .await;
        }
        for (broker_id, err) in &outcome.broker_errors {
            if err.is_auth() {
                self.suspend_broker(broker_id, err).await;
            }
        }
    }

    /// One credential probe per suspended broker per tick; success lifts
    /// the suspension.
    async fn probe_suspended_brokers(&self) {
        let suspended: Vec<String> = self.suspended.iter().map(|id| id.clone()).collect();
        for broker_id in suspended {
            let client = match self.brokers.get(&broker_id) {
                Some(client) => client,
                None => continue,
            };
            match client.authenticate().await {
                Ok(()) => {
                    self.suspended.remove(&broker_id);
                    self.alerts
                        .send(
                            AlertEvent::new(
                                AlertSeverity::Info,
                                "Broker resumed",
                                &format!("credentials restored for '{broker_id}', trading resumed"),
                            )
                            .for_broker(&broker_id),
                        )
                        .await;
                }
                Err(err) => {
                    debug!(%broker_id, error = %err, "suspension probe failed");
                }
            }
        }
    }

    async fn evaluate_one(&self, spec: StrategySpec) {
        if self.suspended.contains(&spec.broker_id) {
            debug!(
                strategy_id = %spec.id,
                broker_id = %spec.broker_id,
                "broker suspended, strategy skipped"
            );
            return;
        }
        let client = match self.brokers.get(&spec.broker_id) {
            Some(client) => client.clone(),
            None => {
                warn!(
                    strategy_id = %spec.id,
                    broker_id = %spec.broker_id,
                    "strategy references unknown broker"
                );
                return;
            }
        };
        if !self.book.claim_strategy(&spec.id) {
            debug!(strategy_id = %spec.id, "order in flight, strategy skipped");
            return;
        }

        let position = self.book.position(&spec.id);
        match strategy::evaluate(client.as_ref(), &spec, position.as_ref()).await {
            Ok(Some(intent)) => {
                if let Err(err) = self.execute_claimed(&intent).await {
                    if err.is_auth() {
                        self.suspend_broker(&spec.broker_id, &err).await;
                    } else {
                        warn!(strategy_id = %spec.id, error = %err, "intent execution failed");
                    }
                }
            }
            Ok(None) => {}
            Err(err) if err.is_auth() => {
                self.suspend_broker(&spec.broker_id, &err).await;
            }
            Err(err) => {
                warn!(
                    strategy_id = %spec.id,
                    instrument_code = %spec.instrument_code,
                    error = %err,
                    "strategy skipped this tick"
                );
            }
        }
        self.book.release_strategy(&spec.id);
    }

    /// Execute an intent whose strategy claim the caller already holds.
    async fn execute_claimed(&self, intent: &OrderIntent) -> Result<ExecutionReport> {
        let executor = self.executors.get(&intent.broker_id).ok_or_else(|| {
            GambitError::Validation(format!("unknown broker '{}'", intent.broker_id))
        })?;

        let report = executor.execute(intent).await?;
        for change in report.changes.iter().cloned() {
            if let Err(err) = self.repository.record_position_change(change).await {
                warn!(error = %err, "position change not recorded");
            }
        }
        if report.order.status == OrderStatus::Rejected {
            self.alerts
                .send(
                    AlertEvent::new(
                        AlertSeverity::Error,
                        "Order rejected",
                        report
                            .order
                            .error
                            .as_deref()
                            .unwrap_or("rejected without a reason"),
                    )
                    .for_broker(&intent.broker_id)
                    .for_strategy(&intent.strategy_id),
                )
                .await;
        }
        Ok(report)
    }

    async fn suspend_broker(&self, broker_id: &str, err: &GambitError) {
        if self.suspended.insert(broker_id.to_string()) {
            self.alerts
                .send(
                    AlertEvent::new(
                        AlertSeverity::Error,
                        "Broker suspended",
                        &format!("trading suspended for '{broker_id}': {err}"),
                    )
                    .for_broker(broker_id),
                )
                .await;
        }
    }

    async fn publish_health(&self) {
        for (broker_id, saturation) in self.limiters.saturation_snapshot().await {
            let suspended = self.suspended.contains(&broker_id);
            self.health
                .set_broker(&broker_id, saturation, suspended)
                .await;
        }
        self.health
            .record_tick(
                self.book.open_position_count(),
                self.book.active_order_count(),
                self.book.stalled_order_count(),
            )
            .await;
    }
}

#[async_trait]
impl SnapshotProvider for Engine {
    async fn account_snapshot(&self, account_id: &str) -> Result<AccountSnapshot> {
        self.get_account_snapshot(account_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FillBehavior, PaperBroker};
    use crate::config::RateLimitConfig;
    use crate::domain::StrategyKind;
    use crate::repository::InMemoryStrategyRepository;
    use crate::services::LogAlertSink;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Harness {
        engine: Engine,
        repo: Arc<InMemoryStrategyRepository>,
        papers: HashMap<String, Arc<PaperBroker>>,
    }

    fn cross_kind() -> StrategyKind {
        StrategyKind::MaCross {
            fast: 2,
            slow: 3,
            signal: 0,
        }
    }

    fn spec(id: &str, broker_id: &str, instrument: &str) -> StrategySpec {
        StrategySpec {
            id: id.to_string(),
            broker_id: broker_id.to_string(),
            instrument_code: instrument.to_string(),
            kind: cross_kind(),
            take_profit_pct: dec!(50),
            stop_loss_pct: dec!(30),
            investment_amount: dec!(300),
            lot_size: dec!(1),
            is_active: true,
        }
    }

    /// Closes whose fast/slow SMAs golden-cross on the final bar.
    fn crossing_closes() -> Vec<Decimal> {
        vec![dec!(10), dec!(10), dec!(10), dec!(2), dec!(30)]
    }

    async fn harness(broker_ids: &[&str]) -> Harness {
        let limiters = Arc::new(RateLimiterRegistry::new());
        let mut brokers: HashMap<String, Arc<dyn BrokerClient>> = HashMap::new();
        let mut papers = HashMap::new();
        for broker_id in broker_ids {
            limiters.register(
                broker_id,
                &RateLimitConfig {
                    capacity: 1_000,
                    refill_per_sec: 1_000.0,
                    acquire_timeout_ms: 1_000,
                },
            );
            let paper = Arc::new(PaperBroker::new(
                broker_id,
                "00000000-01",
                limiters.get(broker_id).unwrap(),
            ));
            papers.insert(broker_id.to_string(), paper.clone());
            brokers.insert(broker_id.to_string(), paper);
        }

        let repo = Arc::new(InMemoryStrategyRepository::new());
        let config = EngineConfig {
            tick_interval_secs: 1,
            retry_base_delay_ms: 1,
            order_timeout_ms: 200,
            poll_interval_ms: 10,
            ..EngineConfig::default()
        };
        let engine = Engine::new(
            config,
            brokers,
            repo.clone(),
            Arc::new(LogAlertSink),
            limiters,
            Arc::new(HealthState::new(180)),
            Arc::new(ShutdownController::new()),
        );
        Harness {
            engine,
            repo,
            papers,
        }
    }

    #[tokio::test]
    async fn test_tick_opens_position_once() {
        let h = harness(&["paper"]).await;
        h.papers["paper"].set_closes("005930", &crossing_closes());
        h.repo.upsert(spec("s1", "paper", "005930")).await;

        h.engine.tick_once().await;
        let position = h.engine.book().position("s1").expect("entry should fill");
        assert_eq!(position.quantity, dec!(10));

        // Signal is still bullish on the next tick but the strategy is
        // positioned, so nothing new is placed.
        h.engine.tick_once().await;
        assert_eq!(h.papers["paper"].placement_count(), 1);
    }

    #[tokio::test]
    async fn test_misconfigured_strategy_does_not_block_others() {
        let h = harness(&["paper"]).await;
        h.papers["paper"].set_closes("005930", &crossing_closes());

        let mut bad = spec("bad", "paper", "005930");
        bad.kind = StrategyKind::Breakout { lookback: 0 };
        h.repo.upsert(bad).await;
        h.repo.upsert(spec("good", "paper", "005930")).await;

        // The zero-lookback strategy fails validation and is skipped; the
        // healthy one still trades on the same tick.
        h.engine.tick_once().await;
        assert!(h.engine.book().position("bad").is_none());
        assert_eq!(h.engine.book().position("good").unwrap().quantity, dec!(10));
    }

    #[tokio::test]
    async fn test_auth_failure_isolated_per_broker() {
        let h = harness(&["a", "b"]).await;
        h.papers["a"].set_auth_ok(false);
        h.papers["a"].set_closes("005930", &crossing_closes());
        h.papers["b"].set_closes("005930", &crossing_closes());
        h.repo.upsert(spec("sa", "a", "005930")).await;
        h.repo.upsert(spec("sb", "b", "005930")).await;

        h.engine.tick_once().await;
        assert!(h.engine.is_broker_suspended("a"));
        assert!(!h.engine.is_broker_suspended("b"));
        assert!(h.engine.book().position("sa").is_none());
        assert!(h.engine.book().position("sb").is_some());

        // Restored credentials lift the suspension on the next probe.
        h.papers["a"].set_auth_ok(true);
        h.engine.tick_once().await;
        assert!(!h.engine.is_broker_suspended("a"));
        assert!(h.engine.book().position("sa").is_some());
    }

    #[tokio::test]
    async fn test_manual_intent_refused_while_order_in_flight() {
        let h = harness(&["paper"]).await;
        h.papers["paper"].set_quote("005930", dec!(100));
        h.papers["paper"].set_behavior(
            "005930",
            FillBehavior::Partial {
                fill: dec!(1),
                partial_polls: u32::MAX,
            },
        );

        let first = OrderIntent::entry("manual-1", "paper", "005930", dec!(5));
        let id = h.engine.submit_manual_intent(first).await.unwrap();
        assert!(!id.is_empty());

        // The stuck-partial order keeps the strategy busy.
        let second = OrderIntent::entry("manual-1", "paper", "005930", dec!(5));
        let err = h.engine.submit_manual_intent(second).await.unwrap_err();
        assert!(matches!(err, GambitError::OrderExecution(_)));
    }

    #[tokio::test]
    async fn test_manual_intent_refused_for_suspended_broker() {
        let h = harness(&["a"]).await;
        h.papers["a"].set_auth_ok(false);
        h.papers["a"].set_closes("005930", &crossing_closes());
        h.repo.upsert(spec("sa", "a", "005930")).await;
        h.engine.tick_once().await;
        assert!(h.engine.is_broker_suspended("a"));

        let intent = OrderIntent::entry("manual-1", "a", "005930", dec!(1));
        let err = h.engine.submit_manual_intent(intent).await.unwrap_err();
        assert!(matches!(err, GambitError::BrokerSuspended(_)));
    }

    #[tokio::test]
    async fn test_account_snapshot_merges_cash_and_positions() {
        let h = harness(&["paper"]).await;
        h.papers["paper"].set_cash(dec!(1_000));
        h.papers["paper"].set_closes("005930", &crossing_closes());
        h.repo.upsert(spec("s1", "paper", "005930")).await;
        h.engine.tick_once().await;

        let snapshot = h.engine.get_account_snapshot("00000000-01").await.unwrap();
        assert_eq!(snapshot.positions.len(), 1);
        // 10 shares at 30 spent from scripted cash.
        assert_eq!(snapshot.cash, dec!(700));

        let missing = h.engine.get_account_snapshot("99999999-99").await;
        assert!(matches!(missing, Err(GambitError::Validation(_))));
    }

    #[tokio::test]
    async fn test_graceful_stop_ends_run_loop() {
        let h = harness(&["paper"]).await;
        let controller = h.engine.shutdown.clone();

        let run = async { h.engine.run().await };
        let stop = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            controller.request_drain();
        };
        let (run_result, ()) = tokio::join!(run, stop);
        run_result.unwrap();
        assert_eq!(controller.phase(), EnginePhase::Draining);
    }
}
