use serde::{Deserialize, Serialize};

/// Longest accepted window, 30 days in milliseconds
pub const MAX_WINDOW_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Rate limit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether the request guard consults the limiter
    pub enabled: bool,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Requests allowed per key within one window
    pub max_requests: u32,
    /// Interval between background sweeps of expired entries, in seconds
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            max_requests: 100,
            cleanup_interval_secs: 60,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Security event monitoring configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Maximum number of events kept in memory
    pub max_events_history: usize,
    /// Register the built-in threat rules at startup
    pub default_rules: bool,
    /// Trailing window used by the suspicious-source check, in milliseconds
    pub suspicious_window_ms: u64,
    /// Buffer size of the notification broadcast channel
    pub notification_capacity: usize,
    /// How long a source stays blocked after a block request, in seconds
    pub block_duration_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            max_events_history: 10_000,
            default_rules: true,
            suspicious_window_ms: 300_000,
            notification_capacity: 1024,
            block_duration_secs: 900,
        }
    }
}

/// Prometheus export configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to install the Prometheus recorder
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Rate limit configuration
    pub rate_limit: RateLimitConfig,
    /// Event monitoring configuration
    pub monitoring: MonitoringConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

impl Config {
    /// Check every constraint and report all violations together
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.trim().is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if self.rate_limit.window_ms == 0 {
            errors.push("rate_limit.window_ms must be greater than 0".to_string());
        }
        if self.rate_limit.window_ms > MAX_WINDOW_MS {
            errors.push(format!("rate_limit.window_ms must be at most {}", MAX_WINDOW_MS));
        }
        if self.rate_limit.max_requests == 0 {
            errors.push("rate_limit.max_requests must be greater than 0".to_string());
        }
        if self.rate_limit.cleanup_interval_secs == 0 {
            errors.push("rate_limit.cleanup_interval_secs must be greater than 0".to_string());
        }
        if self.monitoring.max_events_history == 0 {
            errors.push("monitoring.max_events_history must be greater than 0".to_string());
        }
        if self.monitoring.notification_capacity == 0 {
            errors.push("monitoring.notification_capacity must be greater than 0".to_string());
        }
        if self.monitoring.suspicious_window_ms == 0 {
            errors.push("monitoring.suspicious_window_ms must be greater than 0".to_string());
        }
        if self.monitoring.suspicious_window_ms > MAX_WINDOW_MS {
            errors.push(format!(
                "monitoring.suspicious_window_ms must be at most {}",
                MAX_WINDOW_MS
            ));
        }
        if self.monitoring.block_duration_secs.saturating_mul(1000) > MAX_WINDOW_MS {
            errors.push(format!(
                "monitoring.block_duration_secs must be at most {}",
                MAX_WINDOW_MS / 1000
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
