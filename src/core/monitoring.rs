//! Security event monitoring for the request shield.
//!
//! [`SecurityMonitor`] is the security event log: a bounded, insertion-ordered
//! history of events. Recording an event updates the metrics, runs the threat
//! rules and notifies observers before the call returns.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::analytics::{MetricsAggregator, SecurityMetrics};
use crate::core::clock::{Clock, SystemClock};
use crate::core::events::{NewSecurityEvent, SecurityEvent, SecurityEventType, Severity};
use crate::core::report::{self, SecurityReport};
use crate::core::rule_engine::{
    default_rules, EventHistory, RuleAction, RuleEngine, RuleEngineError, RuleInfo, RuleOutcome,
    ThreatRule,
};
use crate::models::MonitoringConfig;

/// More than this many high or critical events in the window marks a source as suspicious
const SUSPICIOUS_EVENT_THRESHOLD: usize = 5;

/// A rule fired
#[derive(Debug, Clone, Serialize)]
pub struct ThreatDetection {
    pub rule_id: String,
    pub rule_name: String,
    pub rule_description: String,
    pub action: RuleAction,
    pub severity: Severity,
    /// The event whose recording triggered the rule
    pub trigger: SecurityEvent,
    /// The anomalous-behavior event appended on behalf of the rule
    pub event: SecurityEvent,
}

/// A fired rule asks for `source` to be blocked
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockRequest {
    pub source: String,
    pub rule_id: String,
    pub rule_name: String,
}

/// A fired rule asks for operator attention
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityAlert {
    pub source: String,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub message: String,
}

/// Notifications emitted while recording an event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum SecurityNotification {
    EventRecorded(SecurityEvent),
    ThreatDetected(ThreatDetection),
    BlockRequested(BlockRequest),
    SecurityAlert(SecurityAlert),
}

/// Receives notifications synchronously, in emission order
#[cfg_attr(test, mockall::automock)]
pub trait SecurityObserver: Send + Sync {
    fn notify(&self, notification: &SecurityNotification);
}

/// Observer that writes threats, block requests and alerts to the log
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl SecurityObserver for LoggingObserver {
    fn notify(&self, notification: &SecurityNotification) {
        match notification {
            SecurityNotification::EventRecorded(_) => {}
            SecurityNotification::ThreatDetected(threat) => info!(
                "Threat detected by rule {} from {} (trigger {})",
                threat.rule_id, threat.trigger.source, threat.trigger.id
            ),
            SecurityNotification::BlockRequested(block) => warn!(
                "Block requested for {} by rule {}",
                block.source, block.rule_id
            ),
            SecurityNotification::SecurityAlert(alert) => warn!(
                "Security alert [{}] {}: {}",
                alert.severity, alert.rule_name, alert.message
            ),
        }
    }
}

/// Security event log with metrics, threat rules and notifications
pub struct SecurityMonitor {
    events: VecDeque<SecurityEvent>,
    capacity: usize,
    aggregator: MetricsAggregator,
    rules: RuleEngine,
    observers: Vec<Arc<dyn SecurityObserver>>,
    notifier: broadcast::Sender<SecurityNotification>,
    clock: Arc<dyn Clock>,
}

impl SecurityMonitor {
    /// Create a new monitor using wall-clock time
    pub fn new(config: &MonitoringConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &MonitoringConfig, clock: Arc<dyn Clock>) -> Self {
        let (notifier, _) = broadcast::channel(config.notification_capacity.max(1));
        let mut monitor = Self {
            events: VecDeque::new(),
            capacity: config.max_events_history.max(1),
            aggregator: MetricsAggregator::new(),
            rules: RuleEngine::new(),
            observers: Vec::new(),
            notifier,
            clock,
        };

        if config.default_rules {
            for rule in default_rules() {
                // default ids are distinct and the engine starts empty
                let _ = monitor.rules.add_rule(rule);
            }
        }

        monitor
    }

    /// Record an event, evaluate the threat rules and notify observers
    pub fn record_event(&mut self, event: NewSecurityEvent) -> SecurityEvent {
        let now = self.record_time();
        let event = self.append(event, now);
        let mut notifications = vec![SecurityNotification::EventRecorded(event.clone())];

        // each rule sees the events synthesized for the rules registered before it
        for index in 0..self.rules.len() {
            let outcome = {
                let history = EventHistory::new(&self.events, now);
                self.rules.evaluate_rule(index, &event, &history)
            };

            match outcome {
                None => {}
                Some(RuleOutcome::Fired(rule)) => {
                    self.on_rule_fired(rule, &event, now, &mut notifications)
                }
                Some(RuleOutcome::Faulted { rule, error }) => {
                    warn!("Threat rule {} failed: {}", rule.id, error);
                    self.append(
                        NewSecurityEvent::new(
                            SecurityEventType::AnomalousBehavior,
                            Severity::Low,
                            event.source.clone(),
                        )
                        .with_detail("internal", true)
                        .with_detail("rule_id", rule.id)
                        .with_detail("rule_name", rule.name)
                        .with_detail("error", error)
                        .with_detail("trigger_event_id", event.id.clone()),
                        now,
                    );
                }
            }
        }

        self.dispatch(&notifications);
        event
    }

    fn on_rule_fired(
        &mut self,
        rule: RuleInfo,
        trigger: &SecurityEvent,
        now: DateTime<Utc>,
        notifications: &mut Vec<SecurityNotification>,
    ) {
        info!("Threat rule {} fired on event {}", rule.id, trigger.id);

        // appended directly, so the synthesized event never re-enters rule evaluation
        let synthesized = self.append(
            NewSecurityEvent::new(
                SecurityEventType::AnomalousBehavior,
                rule.severity,
                trigger.source.clone(),
            )
            .with_detail("rule_id", rule.id.clone())
            .with_detail("rule_name", rule.name.clone())
            .with_detail("rule_description", rule.description.clone())
            .with_detail("trigger_event_id", trigger.id.clone())
            .with_detail("action", rule.action.as_str()),
            now,
        );

        notifications.push(SecurityNotification::ThreatDetected(ThreatDetection {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            rule_description: rule.description.clone(),
            action: rule.action,
            severity: rule.severity,
            trigger: trigger.clone(),
            event: synthesized,
        }));

        match rule.action {
            RuleAction::Block => {
                notifications.push(SecurityNotification::BlockRequested(BlockRequest {
                    source: trigger.source.clone(),
                    rule_id: rule.id,
                    rule_name: rule.name,
                }))
            }
            RuleAction::Alert => {
                notifications.push(SecurityNotification::SecurityAlert(SecurityAlert {
                    source: trigger.source.clone(),
                    message: format!("{} triggered by {}", rule.description, trigger.source),
                    rule_id: rule.id,
                    rule_name: rule.name,
                    severity: rule.severity,
                }))
            }
            RuleAction::Log => {}
        }
    }

    /// Timestamps never go backwards in insertion order
    fn record_time(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        match self.events.back() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        }
    }

    fn append(&mut self, event: NewSecurityEvent, now: DateTime<Utc>) -> SecurityEvent {
        let event = SecurityEvent::from_descriptor(Uuid::new_v4().to_string(), now, event);
        self.events.push_back(event.clone());
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
        self.aggregator.record(&event);
        debug!(
            "Recorded {} event {} from {} ({})",
            event.event_type, event.id, event.source, event.severity
        );
        event
    }

    fn dispatch(&self, notifications: &[SecurityNotification]) {
        for notification in notifications {
            for observer in &self.observers {
                observer.notify(notification);
            }
            // no subscribers is not an error
            let _ = self.notifier.send(notification.clone());
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn SecurityObserver>) {
        self.observers.push(observer);
    }

    /// Subscribe to notifications emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SecurityNotification> {
        self.notifier.subscribe()
    }

    pub fn add_rule(&mut self, rule: ThreatRule) -> Result<(), RuleEngineError> {
        self.rules.add_rule(rule)
    }

    pub fn remove_rule(&mut self, id: &str) -> bool {
        self.rules.remove_rule(id)
    }

    pub fn rules(&self) -> Vec<RuleInfo> {
        self.rules.rules()
    }

    /// The most recent `limit` events, oldest first
    pub fn recent_events(&self, limit: usize) -> Vec<SecurityEvent> {
        let skip = self.events.len().saturating_sub(limit);
        self.events.iter().skip(skip).cloned().collect()
    }

    /// The most recent `limit` events of `event_type`, oldest first
    pub fn events_by_type(&self, event_type: SecurityEventType, limit: usize) -> Vec<SecurityEvent> {
        self.last_matching(limit, |event| event.event_type == event_type)
    }

    /// The most recent `limit` events of `severity`, oldest first
    pub fn events_by_severity(&self, severity: Severity, limit: usize) -> Vec<SecurityEvent> {
        self.last_matching(limit, |event| event.severity == severity)
    }

    fn last_matching(&self, limit: usize, matches: impl Fn(&SecurityEvent) -> bool) -> Vec<SecurityEvent> {
        let mut events: Vec<_> = self
            .events
            .iter()
            .rev()
            .filter(|event| matches(event))
            .take(limit)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    /// Events with `start <= timestamp <= end`
    pub fn events_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<SecurityEvent> {
        self.events
            .iter()
            .filter(|event| event.timestamp >= start && event.timestamp <= end)
            .cloned()
            .collect()
    }

    /// Whether `source` produced more than five high or critical events in the trailing `window`
    pub fn is_suspicious_source(&self, source: &str, window: Duration) -> bool {
        let history = EventHistory::new(&self.events, self.clock.now());
        history
            .within(window)
            .filter(|event| event.source == source && event.severity.is_elevated())
            .take(SUSPICIOUS_EVENT_THRESHOLD + 1)
            .count()
            > SUSPICIOUS_EVENT_THRESHOLD
    }

    pub fn metrics(&self) -> SecurityMetrics {
        self.aggregator.snapshot()
    }

    /// Summarise the events recorded within `[start, end]`
    pub fn generate_report(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> SecurityReport {
        report::generate_report(self.events.iter(), start, end, self.clock.now())
    }

    /// Drop every event, zero the metrics and forget rule cooldowns
    pub fn clear(&mut self) {
        self.events.clear();
        self.aggregator.reset();
        self.rules.clear_cooldowns();
        info!("Security monitor cleared");
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
