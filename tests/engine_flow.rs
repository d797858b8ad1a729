//! End-to-end tick flows against the paper broker.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use gambit::adapters::{FillBehavior, PaperBroker};
use gambit::broker::BrokerClient;
use gambit::config::{EngineConfig, RateLimitConfig};
use gambit::coordination::ShutdownController;
use gambit::domain::{OrderIntent, OrderStatus, PositionChange, StrategyKind, StrategySpec};
use gambit::orchestrator::Engine;
use gambit::repository::InMemoryStrategyRepository;
use gambit::services::{HealthState, LogAlertSink};
use gambit::throttle::RateLimiterRegistry;

struct Rig {
    engine: Engine,
    repo: Arc<InMemoryStrategyRepository>,
    papers: HashMap<String, Arc<PaperBroker>>,
}

fn rig(broker_ids: &[&str]) -> Rig {
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
            &format!("{broker_id}0000-01"),
            limiters.get(broker_id).unwrap(),
        ));
        papers.insert(broker_id.to_string(), paper.clone());
        brokers.insert(broker_id.to_string(), paper);
    }

    let repo = Arc::new(InMemoryStrategyRepository::new());
    let engine = Engine::new(
        EngineConfig {
            tick_interval_secs: 1,
            max_order_retries: 3,
            retry_base_delay_ms: 1,
            order_timeout_ms: 300,
            poll_interval_ms: 10,
            ..EngineConfig::default()
        },
        brokers,
        repo.clone(),
        Arc::new(LogAlertSink),
        limiters,
        Arc::new(HealthState::new(180)),
        Arc::new(ShutdownController::new()),
    );
    Rig {
        engine,
        repo,
        papers,
    }
}

fn ma_spec(id: &str, broker_id: &str, instrument: &str) -> StrategySpec {
    StrategySpec {
        id: id.to_string(),
        broker_id: broker_id.to_string(),
        instrument_code: instrument.to_string(),
        kind: StrategyKind::MaCross {
            fast: 2,
            slow: 3,
            signal: 0,
        },
        take_profit_pct: dec!(50),
        stop_loss_pct: dec!(3),
        investment_amount: dec!(300),
        lot_size: dec!(1),
        is_active: true,
    }
}

/// Fast SMA crosses above the slow one on the final bar; last close 30.
fn golden_cross_closes() -> Vec<Decimal> {
    vec![dec!(10), dec!(10), dec!(10), dec!(2), dec!(30)]
}

/// 28 bars sliding down one point per bar, then a spike to 300. Long
/// enough to warm a 5/20 crossover with a 9-bar signal line; the spike
/// flips the fast-slow difference positive and clears its own average.
fn confirmed_cross_closes() -> Vec<Decimal> {
    let mut closes: Vec<Decimal> = (0..28).map(|i| Decimal::from(150 - i)).collect();
    closes.push(dec!(300));
    closes
}

#[tokio::test]
async fn entry_on_cross_then_stop_loss_exit() {
    let rig = rig(&["paper"]);
    let paper = &rig.papers["paper"];
    paper.set_closes("005930", &golden_cross_closes());
    rig.repo.upsert(ma_spec("s1", "paper", "005930")).await;

    // Tick 1: golden cross, entry of floor(300 / 30) = 10 shares at 30.
    rig.engine.tick_once().await;
    let position = rig.engine.book().position("s1").expect("entry filled");
    assert_eq!(position.quantity, dec!(10));
    assert_eq!(position.average_entry_price, dec!(30));

    // Tick 2: signal still bullish, position already open, no re-entry.
    rig.engine.tick_once().await;
    assert_eq!(paper.placement_count(), 1);

    // Price gaps under the 3% stop band (30 * 0.97 = 29.1). The candles
    // still read bullish; the stop must win over the signal.
    paper.set_quote("005930", dec!(29));
    rig.engine.tick_once().await;
    assert!(rig.engine.book().position("s1").is_none());

    let journal = rig.repo.position_changes().await;
    assert_eq!(journal.len(), 2);
    match &journal[1] {
        PositionChange::Closed {
            reason, quantity, ..
        } => {
            assert_eq!(reason.to_string(), "stop_loss");
            assert_eq!(*quantity, dec!(10));
        }
        other => panic!("expected close, got {:?}", other),
    }
}

#[tokio::test]
async fn standard_ma_cross_parameters_enter_on_confirmed_cross() {
    let rig = rig(&["paper"]);
    let paper = &rig.papers["paper"];
    paper.set_closes("005930", &confirmed_cross_closes());

    let mut spec = ma_spec("s1", "paper", "005930");
    spec.kind = StrategyKind::MaCross {
        fast: 5,
        slow: 20,
        signal: 9,
    };
    spec.investment_amount = dec!(3_000);
    rig.repo.upsert(spec).await;

    // The spike puts the 5-bar average 19.2 over the 20-bar one while
    // the 9-bar signal line is still negative, so the cross is confirmed
    // and floor(3000 / 300) = 10 shares go on at the last close.
    rig.engine.tick_once().await;
    let position = rig.engine.book().position("s1").expect("entry filled");
    assert_eq!(position.quantity, dec!(10));
    assert_eq!(position.average_entry_price, dec!(300));

    rig.engine.tick_once().await;
    assert_eq!(paper.placement_count(), 1);
}

#[tokio::test]
async fn transient_placement_failures_retry_to_a_single_fill() {
    let rig = rig(&["paper"]);
    let paper = &rig.papers["paper"];
    paper.set_closes("005930", &golden_cross_closes());
    paper.set_behavior("005930", FillBehavior::TransientTimes { failures: 2 });
    rig.repo.upsert(ma_spec("s1", "paper", "005930")).await;

    rig.engine.tick_once().await;

    // Two simulated outages, then one accepted order; never a duplicate.
    assert_eq!(paper.placement_count(), 1);
    let position = rig.engine.book().position("s1").expect("entry filled");
    assert_eq!(position.quantity, dec!(10));
}

#[tokio::test]
async fn auth_outage_suspends_one_broker_and_spares_the_rest() {
    let rig = rig(&["alpha", "beta"]);
    rig.papers["alpha"].set_auth_ok(false);
    rig.papers["alpha"].set_closes("005930", &golden_cross_closes());
    rig.papers["beta"].set_closes("005930", &golden_cross_closes());
    rig.repo.upsert(ma_spec("sa", "alpha", "005930")).await;
    rig.repo.upsert(ma_spec("sb", "beta", "005930")).await;

    rig.engine.tick_once().await;
    assert!(rig.engine.is_broker_suspended("alpha"));
    assert!(!rig.engine.is_broker_suspended("beta"));
    assert!(rig.engine.book().position("sa").is_none());
    assert!(rig.engine.book().position("sb").is_some());

    // While suspended, alpha's strategies are skipped without broker calls.
    rig.engine.tick_once().await;
    assert_eq!(rig.papers["alpha"].placement_count(), 0);

    // Credentials come back; the start-of-tick probe resumes trading.
    rig.papers["alpha"].set_auth_ok(true);
    rig.engine.tick_once().await;
    assert!(!rig.engine.is_broker_suspended("alpha"));
    assert!(rig.engine.book().position("sa").is_some());
}

#[tokio::test]
async fn rejected_entry_leaves_strategy_flat_and_retryable() {
    let rig = rig(&["paper"]);
    let paper = &rig.papers["paper"];
    paper.set_closes("005930", &golden_cross_closes());
    paper.set_behavior(
        "005930",
        FillBehavior::Reject {
            reason: "insufficient cash".to_string(),
        },
    );
    rig.repo.upsert(ma_spec("s1", "paper", "005930")).await;

    rig.engine.tick_once().await;
    assert!(rig.engine.book().position("s1").is_none());

    // A rejection is terminal for that order; the next tick can try again.
    paper.set_behavior("005930", FillBehavior::Immediate);
    rig.engine.tick_once().await;
    assert!(rig.engine.book().position("s1").is_some());
}

#[tokio::test]
async fn manual_intent_flows_through_executor_and_snapshot() {
    let rig = rig(&["paper"]);
    let paper = &rig.papers["paper"];
    paper.set_cash(dec!(1_000));
    paper.set_quote("035720", dec!(50));

    let intent = OrderIntent::entry("manual-1", "paper", "035720", dec!(4));
    let client_order_id = rig.engine.submit_manual_intent(intent).await.unwrap();

    let order = rig.engine.book().order(&client_order_id).unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.filled_quantity, dec!(4));

    let snapshot = rig
        .engine
        .get_account_snapshot("paper0000-01")
        .await
        .unwrap();
    assert_eq!(snapshot.cash, dec!(800));
    assert_eq!(snapshot.positions.len(), 1);
    assert_eq!(snapshot.positions[0].quantity, dec!(4));
}

#[tokio::test]
async fn stuck_order_escalates_after_reconcile_cap() {
    let rig = rig(&["paper"]);
    let paper = &rig.papers["paper"];
    paper.set_quote("005930", dec!(100));
    paper.set_behavior(
        "005930",
        FillBehavior::Partial {
            fill: dec!(1),
            partial_polls: u32::MAX,
        },
    );

    let intent = OrderIntent::entry("s1", "paper", "005930", dec!(5));
    rig.engine.submit_manual_intent(intent).await.unwrap();

    // The executor leaves the stuck-partial order to reconciliation; the
    // default cap of 5 passes later it stalls and blocks the strategy.
    for _ in 0..6 {
        rig.engine.tick_once().await;
    }
    assert_eq!(rig.engine.book().stalled_order_count(), 1);
    assert!(rig.engine.book().is_strategy_busy("s1"));
}
