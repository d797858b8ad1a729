//! Gambit: an automated trading engine for Korean equities.
//!
//! The engine evaluates configured strategies against broker market data
//! on a fixed tick, sizes and submits orders through rate-limited broker
//! adapters, and tracks every order through an explicit lifecycle with
//! start-of-tick reconciliation. Brokers misbehave independently: an
//! auth outage suspends one broker while the rest keep trading.

pub mod adapters;
pub mod auth;
pub mod broker;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod execution;
pub mod orchestrator;
pub mod repository;
pub mod services;
pub mod strategy;
pub mod throttle;

pub use config::AppConfig;
pub use error::{GambitError, OrderError, Result};
pub use orchestrator::Engine;
pub use repository::{InMemoryStrategyRepository, StrategyRepository};
