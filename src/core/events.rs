//! Security event types shared by the event log, the rule engine and reporting.
//!
//! Events are created exclusively by [`SecurityMonitor::record_event`](crate::core::SecurityMonitor::record_event),
//! which assigns the id and timestamp. Collaborators only ever build a [`NewSecurityEvent`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of security occurrences the pipeline understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventType {
    RateLimitExceeded,
    SuspiciousInput,
    AuthenticationFailure,
    UnauthorizedAccess,
    SqlInjectionAttempt,
    XssAttempt,
    CsrfTokenMismatch,
    FileUploadViolation,
    SecurityHeaderMissing,
    MalformedRequest,
    BruteForceAttempt,
    AnomalousBehavior,
}

impl SecurityEventType {
    /// Every variant, in declaration order
    pub const ALL: [SecurityEventType; 12] = [
        SecurityEventType::RateLimitExceeded,
        SecurityEventType::SuspiciousInput,
        SecurityEventType::AuthenticationFailure,
        SecurityEventType::UnauthorizedAccess,
        SecurityEventType::SqlInjectionAttempt,
        SecurityEventType::XssAttempt,
        SecurityEventType::CsrfTokenMismatch,
        SecurityEventType::FileUploadViolation,
        SecurityEventType::SecurityHeaderMissing,
        SecurityEventType::MalformedRequest,
        SecurityEventType::BruteForceAttempt,
        SecurityEventType::AnomalousBehavior,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::SuspiciousInput => "SUSPICIOUS_INPUT",
            Self::AuthenticationFailure => "AUTHENTICATION_FAILURE",
            Self::UnauthorizedAccess => "UNAUTHORIZED_ACCESS",
            Self::SqlInjectionAttempt => "SQL_INJECTION_ATTEMPT",
            Self::XssAttempt => "XSS_ATTEMPT",
            Self::CsrfTokenMismatch => "CSRF_TOKEN_MISMATCH",
            Self::FileUploadViolation => "FILE_UPLOAD_VIOLATION",
            Self::SecurityHeaderMissing => "SECURITY_HEADER_MISSING",
            Self::MalformedRequest => "MALFORMED_REQUEST",
            Self::BruteForceAttempt => "BRUTE_FORCE_ATTEMPT",
            Self::AnomalousBehavior => "ANOMALOUS_BEHAVIOR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|ty| ty.as_str().eq_ignore_ascii_case(value))
    }
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|sev| sev.as_str().eq_ignore_ascii_case(value))
    }

    /// High or critical
    pub fn is_elevated(&self) -> bool {
        *self >= Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value kinds allowed in an event's `details` map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DetailValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<DetailValue>),
}

impl From<&str> for DetailValue {
    fn from(value: &str) -> Self {
        DetailValue::Text(value.to_string())
    }
}

impl From<String> for DetailValue {
    fn from(value: String) -> Self {
        DetailValue::Text(value)
    }
}

impl From<i64> for DetailValue {
    fn from(value: i64) -> Self {
        DetailValue::Integer(value)
    }
}

impl From<u32> for DetailValue {
    fn from(value: u32) -> Self {
        DetailValue::Integer(i64::from(value))
    }
}

impl From<f64> for DetailValue {
    fn from(value: f64) -> Self {
        DetailValue::Float(value)
    }
}

impl From<bool> for DetailValue {
    fn from(value: bool) -> Self {
        DetailValue::Bool(value)
    }
}

pub type EventDetails = BTreeMap<String, DetailValue>;

/// Request context attached to an event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Event descriptor supplied by collaborators; id and timestamp are assigned at record time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSecurityEvent {
    #[serde(rename = "type")]
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub source: String,
    #[serde(default)]
    pub details: EventDetails,
    #[serde(default)]
    pub metadata: EventMetadata,
}

impl NewSecurityEvent {
    pub fn new(event_type: SecurityEventType, severity: Severity, source: impl Into<String>) -> Self {
        Self {
            event_type,
            severity,
            source: source.into(),
            details: EventDetails::new(),
            metadata: EventMetadata::default(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<DetailValue>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A recorded security event. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub source: String,
    pub details: EventDetails,
    pub metadata: EventMetadata,
}

impl SecurityEvent {
    pub(crate) fn from_descriptor(id: String, timestamp: DateTime<Utc>, event: NewSecurityEvent) -> Self {
        Self {
            id,
            timestamp,
            event_type: event.event_type,
            severity: event.severity,
            source: event.source,
            details: event.details,
            metadata: event.metadata,
        }
    }

    pub fn detail(&self, key: &str) -> Option<&DetailValue> {
        self.details.get(key)
    }
}
