//! Configuration management for the request shield.
//!
//! This module handles loading and validating application configuration
//! from defaults, an optional configuration file and environment variables.

use std::env;

use config::{Config as ConfigBuilder, Environment, File};
use thiserror::Error;

use crate::models::Config;

pub use crate::models::{MetricsConfig, MonitoringConfig, RateLimitConfig, ServerConfig};

/// Errors that can occur while building the configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Load configuration from defaults, `CONFIG_FILE` and `SHIELD_*` environment variables
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());
    build_config(
        ConfigBuilder::builder().add_source(File::with_name(&config_file).required(false)),
        environment(),
    )
}

/// `SHIELD_RATE_LIMIT__MAX_REQUESTS=50` sets `rate_limit.max_requests`
fn environment() -> Environment {
    Environment::with_prefix("SHIELD")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

fn build_config(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
    environment: Environment,
) -> Result<Config, ConfigError> {
    let defaults = Config::default();

    let config = builder
        .add_source(environment)
        .set_default("server.host", defaults.server.host.clone())?
        .set_default("server.port", i64::from(defaults.server.port))?
        .set_default("rate_limit.enabled", defaults.rate_limit.enabled)?
        .set_default("rate_limit.window_ms", defaults.rate_limit.window_ms as i64)?
        .set_default("rate_limit.max_requests", i64::from(defaults.rate_limit.max_requests))?
        .set_default(
            "rate_limit.cleanup_interval_secs",
            defaults.rate_limit.cleanup_interval_secs as i64,
        )?
        .set_default(
            "monitoring.max_events_history",
            defaults.monitoring.max_events_history as i64,
        )?
        .set_default("monitoring.default_rules", defaults.monitoring.default_rules)?
        .set_default(
            "monitoring.suspicious_window_ms",
            defaults.monitoring.suspicious_window_ms as i64,
        )?
        .set_default(
            "monitoring.notification_capacity",
            defaults.monitoring.notification_capacity as i64,
        )?
        .set_default(
            "monitoring.block_duration_secs",
            defaults.monitoring.block_duration_secs as i64,
        )?
        .set_default("metrics.enabled", defaults.metrics.enabled)?
        .build()?;

    let config: Config = config.try_deserialize()?;
    config.validate().map_err(ConfigError::Invalid)?;
    Ok(config)
}
