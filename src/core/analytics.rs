//! Security metrics for the request shield.
//!
//! Metrics are maintained incrementally as events are recorded instead of being
//! recomputed from the event log.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::events::{SecurityEvent, SecurityEventType, Severity};

const RECENT_EVENTS_LIMIT: usize = 10;
const TOP_SOURCES_LIMIT: usize = 10;

/// Event count for one source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCount {
    pub source: String,
    pub count: u64,
}

/// Snapshot of the derived security metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityMetrics {
    pub total_events: u64,
    pub events_by_type: BTreeMap<SecurityEventType, u64>,
    pub events_by_severity: BTreeMap<Severity, u64>,
    /// Most recent last
    pub recent_events: Vec<SecurityEvent>,
    /// Descending by count
    pub top_sources: Vec<SourceCount>,
}

impl Default for SecurityMetrics {
    fn default() -> Self {
        Self {
            total_events: 0,
            events_by_type: SecurityEventType::ALL.iter().map(|ty| (*ty, 0)).collect(),
            events_by_severity: Severity::ALL.iter().map(|sev| (*sev, 0)).collect(),
            recent_events: Vec::new(),
            top_sources: Vec::new(),
        }
    }
}

/// Incremental metrics over the event stream
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    metrics: SecurityMetrics,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one recorded event into the metrics
    pub fn record(&mut self, event: &SecurityEvent) {
        let metrics = &mut self.metrics;
        metrics.total_events += 1;
        *metrics.events_by_type.entry(event.event_type).or_insert(0) += 1;
        *metrics.events_by_severity.entry(event.severity).or_insert(0) += 1;

        metrics.recent_events.push(event.clone());
        if metrics.recent_events.len() > RECENT_EVENTS_LIMIT {
            let excess = metrics.recent_events.len() - RECENT_EVENTS_LIMIT;
            metrics.recent_events.drain(..excess);
        }

        match metrics
            .top_sources
            .iter_mut()
            .find(|entry| entry.source == event.source)
        {
            Some(entry) => entry.count += 1,
            None => metrics.top_sources.push(SourceCount {
                source: event.source.clone(),
                count: 1,
            }),
        }
        // stable: ties keep their first-seen order
        metrics.top_sources.sort_by(|a, b| b.count.cmp(&a.count));
        metrics.top_sources.truncate(TOP_SOURCES_LIMIT);

        metrics::increment_counter!(
            "shield_events_total",
            "type" => event.event_type.as_str(),
            "severity" => event.severity.as_str()
        );
    }

    /// Copy of the current metrics
    pub fn snapshot(&self) -> SecurityMetrics {
        self.metrics.clone()
    }

    pub fn total_events(&self) -> u64 {
        self.metrics.total_events
    }

    pub fn reset(&mut self) {
        self.metrics = SecurityMetrics::default();
    }
}
