//! Strategy repository seam.
//!
//! Persistent storage of strategies and the position audit trail belongs
//! to an external collaborator; the engine only needs to list what is
//! active at a tick boundary and report position changes back. The
//! in-memory implementation wires up tests, paper runs, and any caller
//! that has not brought its own store.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

use crate::domain::{PositionChange, StrategySpec};
use crate::error::Result;

#[async_trait]
pub trait StrategyRepository: Send + Sync {
    /// Strategies to evaluate on the next tick. Called once per tick, so
    /// create/update/delete in the backing store takes effect at the next
    /// tick boundary and never mid-evaluation.
    async fn list_active_strategies(&self) -> Result<Vec<StrategySpec>>;

    /// Record a position open or close produced by a fill.
    async fn record_position_change(&self, change: PositionChange) -> Result<()>;
}

/// RwLock-backed repository. Positions changes are journaled in arrival
/// order for inspection.
#[derive(Default)]
pub struct InMemoryStrategyRepository {
    strategies: RwLock<HashMap<String, StrategySpec>>,
    journal: RwLock<Vec<PositionChange>>,
}

impl InMemoryStrategyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, spec: StrategySpec) {
        self.strategies.write().await.insert(spec.id.clone(), spec);
    }

    pub async fn remove(&self, strategy_id: &str) -> Option<StrategySpec> {
        self.strategies.write().await.remove(strategy_id)
    }

    pub async fn position_changes(&self) -> Vec<PositionChange> {
        self.journal.read().await.clone()
    }
}

#[async_trait]
impl StrategyRepository for InMemoryStrategyRepository {
    async fn list_active_strategies(&self) -> Result<Vec<StrategySpec>> {
        let strategies = self.strategies.read().await;
        let mut active: Vec<StrategySpec> = strategies
            .values()
            .filter(|spec| spec.is_active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }

    async fn record_position_change(&self, change: PositionChange) -> Result<()> {
        match &change {
            PositionChange::Opened(position) => info!(
                strategy_id = %position.strategy_id,
                instrument_code = %position.instrument_code,
                quantity = %position.quantity,
                entry = %position.average_entry_price,
                "position opened"
            ),
            PositionChange::Closed {
                strategy_id,
                instrument_code,
                quantity,
                reason,
                ..
            } => info!(
                %strategy_id,
                %instrument_code,
                %quantity,
                %reason,
                "position closed"
            ),
        }
        self.journal.write().await.push(change);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StrategyKind;
    use rust_decimal_macros::dec;

    fn spec(id: &str, active: bool) -> StrategySpec {
        StrategySpec {
            id: id.to_string(),
            broker_id: "paper".to_string(),
            instrument_code: "005930".to_string(),
            kind: StrategyKind::Breakout { lookback: 5 },
            take_profit_pct: dec!(5),
            stop_loss_pct: dec!(3),
            investment_amount: dec!(100_000),
            lot_size: dec!(1),
            is_active: active,
        }
    }

    #[tokio::test]
    async fn test_only_active_strategies_listed() {
        let repo = InMemoryStrategyRepository::new();
        repo.upsert(spec("b", true)).await;
        repo.upsert(spec("a", true)).await;
        repo.upsert(spec("c", false)).await;

        let active = repo.list_active_strategies().await.unwrap();
        let ids: Vec<&str> = active.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_remove_deletes() {
        let repo = InMemoryStrategyRepository::new();
        repo.upsert(spec("a", true)).await;
        let mut updated = spec("a", true);
        updated.investment_amount = dec!(200_000);
        repo.upsert(updated).await;

        let active = repo.list_active_strategies().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].investment_amount, dec!(200_000));

        assert!(repo.remove("a").await.is_some());
        assert!(repo.list_active_strategies().await.unwrap().is_empty());
    }
}
