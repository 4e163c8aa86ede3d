//! Core functionality for the request shield.
//!
//! This module contains the security event pipeline: rate limiting, the
//! bounded security event log, incremental metrics, threat rules and reporting.

pub mod analytics;
pub mod clock;
pub mod events;
pub mod monitoring;
pub mod rate_limiter;
pub mod report;
pub mod rule_engine;

pub use analytics::{MetricsAggregator, SecurityMetrics, SourceCount};
pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{DetailValue, EventMetadata, NewSecurityEvent, SecurityEvent, SecurityEventType, Severity};
pub use monitoring::{
    BlockRequest, LoggingObserver, SecurityAlert, SecurityMonitor, SecurityNotification,
    SecurityObserver, ThreatDetection,
};
pub use rate_limiter::{MemoryStore, RateLimitDecision, RateLimitStats, RateLimitStore, RateLimiter};
pub use report::{SecurityReport, ThreatCount};
pub use rule_engine::{
    condition_fn, default_rules, EventHistory, GlobalThreshold, RuleAction, RuleEngine,
    RuleEngineError, RuleInfo, SourceThreshold, ThreatCondition, ThreatRule,
};
