//! Operator alerting sink.
//!
//! Terminal failures (rejected orders, exhausted auth, unreachable
//! orders) are pushed here rather than buried in logs. The webhook sink
//! is fire-and-forget: a delivery failure warns once and never blocks
//! the tick that raised the alert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::AlertConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One operator-visible event with enough context to act on.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    pub raised_at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(severity: AlertSeverity, title: &str, message: &str) -> Self {
        Self {
            severity,
            title: title.to_string(),
            message: message.to_string(),
            broker_id: None,
            strategy_id: None,
            raised_at: Utc::now(),
        }
    }

    pub fn for_broker(mut self, broker_id: &str) -> Self {
        self.broker_id = Some(broker_id.to_string());
        self
    }

    pub fn for_strategy(mut self, strategy_id: &str) -> Self {
        self.strategy_id = Some(strategy_id.to_string());
        self
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, event: AlertEvent);
}

/// Default sink: severity-mapped tracing output.
#[derive(Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, event: AlertEvent) {
        let broker = event.broker_id.as_deref().unwrap_or("-");
        let strategy = event.strategy_id.as_deref().unwrap_or("-");
        match event.severity {
            AlertSeverity::Info => info!(
                broker_id = broker,
                strategy_id = strategy,
                title = %event.title,
                "{}",
                event.message
            ),
            AlertSeverity::Warning => warn!(
                broker_id = broker,
                strategy_id = strategy,
                title = %event.title,
                "{}",
                event.message
            ),
            AlertSeverity::Error | AlertSeverity::Critical => error!(
                broker_id = broker,
                strategy_id = strategy,
                severity = %event.severity,
                title = %event.title,
                "{}",
                event.message
            ),
        }
    }
}

/// Posts each event as JSON to a configured webhook. Falls back to the
/// log sink's behavior for its own delivery failures.
pub struct WebhookAlertSink {
    http: Client,
    webhook_url: String,
    log: LogAlertSink,
}

impl WebhookAlertSink {
    pub fn new(webhook_url: &str) -> Self {
        Self {
            http: Client::new(),
            webhook_url: webhook_url.to_string(),
            log: LogAlertSink,
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, event: AlertEvent) {
        self.log.send(event.clone()).await;

        match self
            .http
            .post(&self.webhook_url)
            .json(&event)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(
                status = %response.status(),
                title = %event.title,
                "alert webhook refused delivery"
            ),
            Err(err) => warn!(
                error = %err,
                title = %event.title,
                "alert webhook unreachable"
            ),
        }
    }
}

/// Sink selection from config: webhook when a URL is set, logs otherwise.
pub fn build_alert_sink(config: &AlertConfig) -> Arc<dyn AlertSink> {
    match &config.webhook_url {
        Some(url) => Arc::new(WebhookAlertSink::new(url)),
        None => Arc::new(LogAlertSink),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(AlertSeverity::Info < AlertSeverity::Warning);
        assert!(AlertSeverity::Warning < AlertSeverity::Error);
        assert!(AlertSeverity::Error < AlertSeverity::Critical);
    }

    #[test]
    fn test_event_context_builders() {
        let event = AlertEvent::new(AlertSeverity::Error, "Order rejected", "insufficient cash")
            .for_broker("kis")
            .for_strategy("strat-1");
        assert_eq!(event.broker_id.as_deref(), Some("kis"));
        assert_eq!(event.strategy_id.as_deref(), Some("strat-1"));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["severity"], "error");
        assert_eq!(json["broker_id"], "kis");
    }

    #[test]
    fn test_sink_selection_follows_config() {
        let logging_only = build_alert_sink(&AlertConfig { webhook_url: None });
        // Only checks construction; delivery paths are exercised by the
        // log sink test below and the engine tests.
        drop(logging_only);

        let webhook = build_alert_sink(&AlertConfig {
            webhook_url: Some("https://alerts.example/hook".to_string()),
        });
        drop(webhook);
    }

    #[tokio::test]
    async fn test_log_sink_accepts_all_severities() {
        let sink = LogAlertSink;
        for severity in [
            AlertSeverity::Info,
            AlertSeverity::Warning,
            AlertSeverity::Error,
            AlertSeverity::Critical,
        ] {
            sink.send(AlertEvent::new(severity, "t", "m")).await;
        }
    }
}
