//! Cross-cutting services: operator alerting and the health/status feed.

pub mod alerts;
pub mod health;

pub use alerts::{build_alert_sink, AlertEvent, AlertSeverity, AlertSink, LogAlertSink, WebhookAlertSink};
pub use health::{BrokerHealth, HealthResponse, HealthServer, HealthState, SnapshotProvider};
