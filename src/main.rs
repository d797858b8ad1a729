use clap::{Parser, Subcommand};
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gambit::auth::CredentialCache;
use gambit::broker::build_brokers;
use gambit::config::{AppConfig, LoggingConfig};
use gambit::coordination::{install_signal_handlers, ShutdownController};
use gambit::domain::{StrategyKind, StrategySpec};
use gambit::orchestrator::Engine;
use gambit::repository::InMemoryStrategyRepository;
use gambit::services::{build_alert_sink, HealthServer, HealthState};
use gambit::throttle::RateLimiterRegistry;

#[derive(Parser)]
#[command(name = "gambit", version, about = "Automated trading engine for Korean equities")]
struct Cli {
    /// Directory holding default.toml and environment overlays
    #[arg(long, default_value = "config", env = "GAMBIT_CONFIG_DIR")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine against the configured brokers
    Run,
    /// Run against the in-memory paper broker with demo strategies
    Paper,
    /// Load and validate configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Run => {
            let config = match load_config(&cli.config_dir) {
                Ok(config) => config,
                Err(code) => return code,
            };
            init_tracing(&config.logging);
            run_engine(config, Arc::new(InMemoryStrategyRepository::new())).await
        }
        Command::Paper => {
            let config = AppConfig::paper_defaults();
            init_tracing(&config.logging);
            let repository = Arc::new(InMemoryStrategyRepository::new());
            seed_demo_strategies(&repository).await;
            run_engine(config, repository).await
        }
        Command::CheckConfig => check_config(&cli.config_dir),
    }
}

fn load_config(config_dir: &PathBuf) -> Result<AppConfig, ExitCode> {
    let config = AppConfig::load_from(config_dir).map_err(|err| {
        eprintln!("failed to load configuration: {err}");
        ExitCode::FAILURE
    })?;
    if let Err(problems) = config.validate() {
        eprintln!("configuration is invalid:");
        for problem in problems {
            eprintln!("  - {problem}");
        }
        return Err(ExitCode::FAILURE);
    }
    Ok(config)
}

fn check_config(config_dir: &PathBuf) -> ExitCode {
    match load_config(config_dir) {
        Ok(config) => {
            println!(
                "configuration ok: {} broker(s), tick every {}s",
                config.brokers.len(),
                config.engine.tick_interval_secs
            );
            ExitCode::SUCCESS
        }
        Err(code) => code,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_engine(
    config: AppConfig,
    repository: Arc<InMemoryStrategyRepository>,
) -> ExitCode {
    let cache = Arc::new(CredentialCache::new(config.engine.token_refresh_margin_secs));
    let limiters = Arc::new(RateLimiterRegistry::new());
    let brokers = match build_brokers(&config, cache, &limiters) {
        Ok(brokers) => brokers,
        Err(err) => {
            error!(error = %err, "broker construction failed");
            return ExitCode::FAILURE;
        }
    };

    let alerts = build_alert_sink(&config.alerts);
    let health = Arc::new(HealthState::new(config.health.staleness_secs));
    let shutdown = Arc::new(ShutdownController::new());

    let engine = Arc::new(Engine::new(
        config.engine.clone(),
        brokers,
        repository,
        alerts,
        limiters,
        health.clone(),
        shutdown.clone(),
    ));

    if config.health.enabled {
        let server = HealthServer::new(health, engine.clone(), &config.health);
        tokio::spawn(async move {
            if let Err(err) = server.run().await {
                error!(error = %err, "health server exited");
            }
        });
    }

    install_signal_handlers(shutdown);

    match engine.run().await {
        Ok(()) => {
            info!("engine exited cleanly");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "engine exited with error");
            ExitCode::FAILURE
        }
    }
}

/// A small mixed book for paper runs; the paper broker serves each
/// instrument a deterministic synthetic price series.
async fn seed_demo_strategies(repository: &InMemoryStrategyRepository) {
    let demos = [
        StrategySpec {
            id: "demo-ma-005930".to_string(),
            broker_id: "paper".to_string(),
            instrument_code: "005930".to_string(),
            kind: StrategyKind::MaCross {
                fast: 5,
                slow: 20,
                signal: 9,
            },
            take_profit_pct: dec!(5),
            stop_loss_pct: dec!(3),
            investment_amount: dec!(1_000_000),
            lot_size: dec!(1),
            is_active: true,
        },
        StrategySpec {
            id: "demo-rsi-035720".to_string(),
            broker_id: "paper".to_string(),
            instrument_code: "035720".to_string(),
            kind: StrategyKind::Rsi {
                period: 14,
                overbought: dec!(70),
                oversold: dec!(30),
            },
            take_profit_pct: dec!(8),
            stop_loss_pct: dec!(4),
            investment_amount: dec!(500_000),
            lot_size: dec!(1),
            is_active: true,
        },
        StrategySpec {
            id: "demo-brk-000660".to_string(),
            broker_id: "paper".to_string(),
            instrument_code: "000660".to_string(),
            kind: StrategyKind::Breakout { lookback: 20 },
            take_profit_pct: dec!(10),
            stop_loss_pct: dec!(5),
            investment_amount: dec!(500_000),
            lot_size: dec!(1),
            is_active: true,
        },
    ];
    for spec in demos {
        repository.upsert(spec).await;
    }
}
