use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    /// Broker connections keyed by broker id.
    pub brokers: HashMap<String, BrokerConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Seconds between evaluation ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Upper bound on strategies evaluated concurrently within a tick
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_evaluations: usize,
    /// Retry cap for transient order-submission failures
    #[serde(default = "default_max_retries")]
    pub max_order_retries: u32,
    /// Base delay for exponential retry backoff
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    /// How long to poll for fills after an order is acknowledged before
    /// leaving it to reconciliation
    #[serde(default = "default_order_timeout")]
    pub order_timeout_ms: u64,
    /// Polling interval for order status in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Reconciliation attempts per order before escalating to the alert
    /// sink
    #[serde(default = "default_reconcile_cap")]
    pub reconcile_attempt_cap: u32,
    /// Refresh a cached token this many seconds before it expires
    #[serde(default = "default_refresh_margin")]
    pub token_refresh_margin_secs: i64,
}

fn default_tick_interval() -> u64 {
    60
}

fn default_max_concurrent() -> usize {
    8
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    100
}

fn default_order_timeout() -> u64 {
    5000
}

fn default_poll_interval() -> u64 {
    500
}

fn default_reconcile_cap() -> u32 {
    5
}

fn default_refresh_margin() -> i64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            max_concurrent_evaluations: default_max_concurrent(),
            max_order_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            order_timeout_ms: default_order_timeout(),
            poll_interval_ms: default_poll_interval(),
            reconcile_attempt_cap: default_reconcile_cap(),
            token_refresh_margin_secs: default_refresh_margin(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
    /// Readiness turns stale when the last successful tick is older than
    /// this
    #[serde(default = "default_staleness")]
    pub staleness_secs: u64,
}

fn default_health_enabled() -> bool {
    true
}

fn default_health_port() -> u16 {
    8080
}

fn default_staleness() -> u64 {
    180
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            port: default_health_port(),
            staleness_secs: default_staleness(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AlertConfig {
    /// Optional webhook receiving terminal-failure alerts as JSON
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Wire protocol: "kis" or "paper"
    pub kind: String,
    #[serde(default)]
    pub app_key: String,
    #[serde(default)]
    pub app_secret: String,
    /// Account number, "XXXXXXXX-XX" or 10 digits
    #[serde(default)]
    pub account_id: String,
    /// Override the protocol's default base URL
    #[serde(default)]
    pub base_url: Option<String>,
    /// Route to the broker's virtual (paper) account endpoints
    #[serde(default)]
    pub virtual_account: bool,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum burst size of the token bucket
    #[serde(default = "default_rate_capacity")]
    pub capacity: u32,
    /// Sustained requests per second
    #[serde(default = "default_rate_refill")]
    pub refill_per_sec: f64,
    /// Deadline for permit acquisition before RateLimitTimeout
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
}

fn default_rate_capacity() -> u32 {
    20
}

fn default_rate_refill() -> f64 {
    19.0
}

fn default_acquire_timeout() -> u64 {
    5000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            refill_per_sec: default_rate_refill(),
            acquire_timeout_ms: default_acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("engine.tick_interval_secs", 60)?
            .set_default("engine.max_concurrent_evaluations", 8)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("GAMBIT_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (GAMBIT_BROKERS__KIS__APP_KEY, etc.)
            .add_source(
                Environment::with_prefix("GAMBIT")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Configuration for a self-contained paper-trading run
    pub fn paper_defaults() -> Self {
        let mut brokers = HashMap::new();
        brokers.insert(
            "paper".to_string(),
            BrokerConfig {
                kind: "paper".to_string(),
                app_key: String::new(),
                app_secret: String::new(),
                account_id: "00000000-01".to_string(),
                base_url: None,
                virtual_account: true,
                rate_limit: RateLimitConfig::default(),
            },
        );

        Self {
            engine: EngineConfig {
                tick_interval_secs: 5,
                ..EngineConfig::default()
            },
            health: HealthConfig::default(),
            alerts: AlertConfig::default(),
            brokers,
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.engine.tick_interval_secs == 0 {
            errors.push("engine.tick_interval_secs must be positive".to_string());
        }

        if self.engine.max_concurrent_evaluations == 0 {
            errors.push("engine.max_concurrent_evaluations must be positive".to_string());
        }

        if self.engine.max_order_retries == 0 {
            errors.push("engine.max_order_retries must be positive".to_string());
        }

        if self.engine.token_refresh_margin_secs < 0 {
            errors.push("engine.token_refresh_margin_secs must not be negative".to_string());
        }

        if self.brokers.is_empty() {
            errors.push("at least one broker must be configured".to_string());
        }

        for (broker_id, broker) in &self.brokers {
            match broker.kind.as_str() {
                "kis" => {
                    if broker.app_key.is_empty() {
                        errors.push(format!("brokers.{broker_id}.app_key is required"));
                    }
                    if broker.app_secret.is_empty() {
                        errors.push(format!("brokers.{broker_id}.app_secret is required"));
                    }
                    if broker.account_id.replace('-', "").len() != 10 {
                        errors.push(format!(
                            "brokers.{broker_id}.account_id must be 10 digits (XXXXXXXX-XX)"
                        ));
                    }
                }
                "paper" => {}
                other => {
                    errors.push(format!("brokers.{broker_id}.kind '{other}' is not supported"));
                }
            }

            if broker.rate_limit.capacity == 0 {
                errors.push(format!("brokers.{broker_id}.rate_limit.capacity must be positive"));
            }
            if broker.rate_limit.refill_per_sec <= 0.0 {
                errors.push(format!(
                    "brokers.{broker_id}.rate_limit.refill_per_sec must be positive"
                ));
            }
        }

        if let Some(url) = &self.alerts.webhook_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push("alerts.webhook_url must be an http(s) URL".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
