//! Engine shutdown coordination.
//!
//! One watch channel carries the engine phase. A graceful stop moves to
//! `Draining`: the tick in progress finishes, in-flight order
//! submissions complete, and no new tick starts. A forced stop moves to
//! `Stopped`: evaluation tasks are abandoned at their next await point.
//! Neither path cancels an order the broker has acknowledged; that only
//! ever happens through an explicit `cancel_order` call.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnginePhase {
    Running,
    Draining,
    Stopped,
}

impl EnginePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnginePhase::Running => "running",
            EnginePhase::Draining => "draining",
            EnginePhase::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub struct ShutdownController {
    phase_tx: watch::Sender<EnginePhase>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        let (phase_tx, _) = watch::channel(EnginePhase::Running);
        Self { phase_tx }
    }

    pub fn subscribe(&self) -> ShutdownToken {
        ShutdownToken {
            phase_rx: self.phase_tx.subscribe(),
        }
    }

    pub fn phase(&self) -> EnginePhase {
        *self.phase_tx.borrow()
    }

    /// Request a graceful stop. Phases only move forward; a drain request
    /// after a forced stop is ignored.
    pub fn request_drain(&self) {
        self.advance(EnginePhase::Draining);
    }

    /// Force an immediate stop.
    pub fn force_stop(&self) {
        self.advance(EnginePhase::Stopped);
    }

    fn advance(&self, target: EnginePhase) {
        self.phase_tx.send_if_modified(|phase| {
            if *phase < target {
                info!(from = %phase, to = %target, "engine phase change");
                *phase = target;
                true
            } else {
                false
            }
        });
    }
}

/// Per-task view of the engine phase.
#[derive(Clone)]
pub struct ShutdownToken {
    phase_rx: watch::Receiver<EnginePhase>,
}

impl ShutdownToken {
    pub fn phase(&self) -> EnginePhase {
        *self.phase_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.phase() == EnginePhase::Running
    }

    /// Wait for the next phase change. Resolves with the current phase if
    /// the controller is gone.
    pub async fn changed(&mut self) -> EnginePhase {
        let _ = self.phase_rx.changed().await;
        *self.phase_rx.borrow()
    }

    /// Wait until the phase reaches `target` or beyond.
    pub async fn wait_for(&mut self, target: EnginePhase) {
        while *self.phase_rx.borrow() < target {
            if self.phase_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// SIGINT/SIGTERM drain the engine; a second signal forces the stop.
pub fn install_signal_handlers(controller: Arc<ShutdownController>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received, draining");
        controller.request_drain();

        wait_for_signal().await;
        warn!("second shutdown signal, forcing stop");
        controller.force_stop();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, "SIGTERM handler unavailable, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_only_advance() {
        let controller = ShutdownController::new();
        assert_eq!(controller.phase(), EnginePhase::Running);

        controller.request_drain();
        assert_eq!(controller.phase(), EnginePhase::Draining);

        controller.force_stop();
        assert_eq!(controller.phase(), EnginePhase::Stopped);

        // Late drain request cannot roll the phase back.
        controller.request_drain();
        assert_eq!(controller.phase(), EnginePhase::Stopped);
    }

    #[tokio::test]
    async fn test_token_observes_phase_change() {
        let controller = ShutdownController::new();
        let mut token = controller.subscribe();
        assert!(token.is_running());

        controller.request_drain();
        assert_eq!(token.changed().await, EnginePhase::Draining);
    }

    #[tokio::test]
    async fn test_wait_for_skips_intermediate_phase() {
        let controller = Arc::new(ShutdownController::new());
        let mut token = controller.subscribe();

        let waiter = tokio::spawn(async move {
            token.wait_for(EnginePhase::Stopped).await;
        });

        controller.request_drain();
        controller.force_stop();
        waiter.await.unwrap();
    }
}
