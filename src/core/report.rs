//! Point-in-time security reports over a time range of the event log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::events::{SecurityEvent, SecurityEventType, Severity};

const TOP_THREATS_LIMIT: usize = 10;
/// Reporting heuristic; coarser than the live suspicious-source check
const SUSPICIOUS_SOURCE_THRESHOLD: usize = 10;
const HIGH_SEVERITY_THRESHOLD: usize = 10;
const INJECTION_THRESHOLD: usize = 5;
const AUTH_FAILURE_THRESHOLD: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub total_events: usize,
    pub critical_events: usize,
    pub high_events: usize,
    pub unique_sources: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreatCount {
    #[serde(rename = "type")]
    pub event_type: SecurityEventType,
    pub count: usize,
}

/// Summary of the events recorded within a period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityReport {
    pub generated_at: DateTime<Utc>,
    pub period: ReportPeriod,
    pub summary: ReportSummary,
    pub top_threats: Vec<ThreatCount>,
    pub suspicious_sources: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Build a report over the events with `start <= timestamp <= end`
pub fn generate_report<'a>(
    events: impl IntoIterator<Item = &'a SecurityEvent>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    generated_at: DateTime<Utc>,
) -> SecurityReport {
    let mut summary = ReportSummary {
        total_events: 0,
        critical_events: 0,
        high_events: 0,
        unique_sources: 0,
    };
    // first-seen order is kept so ties sort deterministically
    let mut type_counts: Vec<ThreatCount> = Vec::new();
    let mut source_counts: Vec<(&str, usize)> = Vec::new();
    let mut source_index: HashMap<&str, usize> = HashMap::new();

    for event in events
        .into_iter()
        .filter(|event| event.timestamp >= start && event.timestamp <= end)
    {
        summary.total_events += 1;
        match event.severity {
            Severity::Critical => summary.critical_events += 1,
            Severity::High => summary.high_events += 1,
            _ => {}
        }

        match type_counts.iter_mut().find(|t| t.event_type == event.event_type) {
            Some(threat) => threat.count += 1,
            None => type_counts.push(ThreatCount {
                event_type: event.event_type,
                count: 1,
            }),
        }

        let index = *source_index.entry(event.source.as_str()).or_insert_with(|| {
            source_counts.push((event.source.as_str(), 0));
            source_counts.len() - 1
        });
        source_counts[index].1 += 1;
    }

    summary.unique_sources = source_counts.len();

    let count_of = |event_type: SecurityEventType| {
        type_counts
            .iter()
            .find(|t| t.event_type == event_type)
            .map_or(0, |t| t.count)
    };
    let recommendations = recommendations(
        &summary,
        count_of(SecurityEventType::SqlInjectionAttempt) + count_of(SecurityEventType::XssAttempt),
        count_of(SecurityEventType::AuthenticationFailure),
    );

    type_counts.sort_by(|a, b| b.count.cmp(&a.count));
    type_counts.truncate(TOP_THREATS_LIMIT);

    let suspicious_sources = source_counts
        .into_iter()
        .filter(|(_, count)| *count > SUSPICIOUS_SOURCE_THRESHOLD)
        .map(|(source, _)| source.to_string())
        .collect();

    SecurityReport {
        generated_at,
        period: ReportPeriod { start, end },
        summary,
        top_threats: type_counts,
        suspicious_sources,
        recommendations,
    }
}

fn recommendations(summary: &ReportSummary, injection_attempts: usize, auth_failures: usize) -> Vec<String> {
    let mut recommendations = Vec::new();

    if summary.critical_events > 0 {
        recommendations.push(format!(
            "Urgent: {} critical security events detected. Investigate immediately and consider blocking the sources involved.",
            summary.critical_events
        ));
    }
    if summary.high_events > HIGH_SEVERITY_THRESHOLD {
        recommendations.push(format!(
            "{} high-severity events detected. Consider tightening security policies and rate limits.",
            summary.high_events
        ));
    }
    if injection_attempts > INJECTION_THRESHOLD {
        recommendations.push(format!(
            "{} injection attempts (SQL injection and XSS) detected. Review input validation and sanitization rules.",
            injection_attempts
        ));
    }
    if auth_failures > AUTH_FAILURE_THRESHOLD {
        recommendations.push(format!(
            "{} authentication failures detected. Consider enforcing an account lockout policy or multi-factor authentication.",
            auth_failures
        ));
    }

    recommendations
}
