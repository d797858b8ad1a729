//! Health and status feed.
//!
//! The engine writes its observable state here after every tick; the
//! axum server reads it for liveness/readiness probes and for the
//! operator-facing status JSON. Readiness is staleness-aware: a process
//! that is alive but has not completed a tick recently is not ready.

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::HealthConfig;
use crate::coordination::EnginePhase;
use crate::domain::AccountSnapshot;
use crate::error::{GambitError, Result};

/// Account snapshot lookup, implemented by the engine. Kept as a trait
/// so the server does not depend on the orchestrator type.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn account_snapshot(&self, account_id: &str) -> Result<AccountSnapshot>;
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerHealth {
    /// Rate-limiter bucket consumption, 0.0 idle to 1.0 drained.
    pub limiter_saturation: f64,
    pub suspended: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub phase: String,
    pub uptime_seconds: i64,
    pub last_successful_tick: Option<DateTime<Utc>>,
    pub ticks_completed: u64,
    pub open_positions: usize,
    pub active_orders: usize,
    pub stalled_orders: usize,
    pub brokers: BTreeMap<String, BrokerHealth>,
}

pub struct HealthState {
    started_at: DateTime<Utc>,
    phase: RwLock<EnginePhase>,
    last_successful_tick: RwLock<Option<DateTime<Utc>>>,
    ticks_completed: AtomicU64,
    open_positions: AtomicUsize,
    active_orders: AtomicUsize,
    stalled_orders: AtomicUsize,
    brokers: RwLock<BTreeMap<String, BrokerHealth>>,
    staleness_secs: i64,
}

impl HealthState {
    pub fn new(staleness_secs: u64) -> Self {
        Self {
            started_at: Utc::now(),
            phase: RwLock::new(EnginePhase::Running),
            last_successful_tick: RwLock::new(None),
            ticks_completed: AtomicU64::new(0),
            open_positions: AtomicUsize::new(0),
            active_orders: AtomicUsize::new(0),
            stalled_orders: AtomicUsize::new(0),
            brokers: RwLock::new(BTreeMap::new()),
            staleness_secs: staleness_secs as i64,
        }
    }

    pub async fn set_phase(&self, phase: EnginePhase) {
        *self.phase.write().await = phase;
    }

    /// Record one completed tick plus the book counts it left behind.
    pub async fn record_tick(&self, open_positions: usize, active_orders: usize, stalled: usize) {
        *self.last_successful_tick.write().await = Some(Utc::now());
        self.ticks_completed.fetch_add(1, Ordering::SeqCst);
        self.open_positions.store(open_positions, Ordering::SeqCst);
        self.active_orders.store(active_orders, Ordering::SeqCst);
        self.stalled_orders.store(stalled, Ordering::SeqCst);
    }

    pub async fn set_broker(&self, broker_id: &str, saturation: f64, suspended: bool) {
        self.brokers.write().await.insert(
            broker_id.to_string(),
            BrokerHealth {
                limiter_saturation: saturation,
                suspended,
            },
        );
    }

    /// Ready means at least one tick completed and the latest one is
    /// within the staleness threshold.
    pub async fn is_ready(&self) -> bool {
        match *self.last_successful_tick.read().await {
            Some(last) => (Utc::now() - last).num_seconds() <= self.staleness_secs,
            None => false,
        }
    }

    pub async fn snapshot(&self) -> HealthResponse {
        HealthResponse {
            phase: self.phase.read().await.to_string(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
            last_successful_tick: *self.last_successful_tick.read().await,
            ticks_completed: self.ticks_completed.load(Ordering::SeqCst),
            open_positions: self.open_positions.load(Ordering::SeqCst),
            active_orders: self.active_orders.load(Ordering::SeqCst),
            stalled_orders: self.stalled_orders.load(Ordering::SeqCst),
            brokers: self.brokers.read().await.clone(),
        }
    }
}

#[derive(Clone)]
struct ServerState {
    health: Arc<HealthState>,
    snapshots: Arc<dyn SnapshotProvider>,
}

pub struct HealthServer {
    state: ServerState,
    port: u16,
}

impl HealthServer {
    pub fn new(
        health: Arc<HealthState>,
        snapshots: Arc<dyn SnapshotProvider>,
        config: &HealthConfig,
    ) -> Self {
        Self {
            state: ServerState { health, snapshots },
            port: config.port,
        }
    }

    pub async fn run(self) -> Result<()> {
        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/snapshot/:account", get(snapshot_handler))
            .with_state(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!(%addr, "health server listening");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| GambitError::Internal(format!("health server: {e}")))
    }
}

async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.health.snapshot().await)
}

async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readiness_handler(State(state): State<ServerState>) -> impl IntoResponse {
    if state.health.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn snapshot_handler(
    State(state): State<ServerState>,
    Path(account): Path<String>,
) -> impl IntoResponse {
    match state.snapshots.account_snapshot(&account).await {
        Ok(snapshot) => (StatusCode::OK, Json(serde_json::json!(snapshot))),
        Err(GambitError::Validation(message)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": message })),
        ),
        Err(err) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({ "error": err.to_string() })),
        ),
    }
}
