//! Threat rule engine for the request shield.
//!
//! Rules are evaluated in registration order against the event history every
//! time a qualifying event is recorded. A rule that fired stays silent until its
//! cooldown has elapsed.
//!
//! Conditions receive the whole history but are expected to stay
//! O(recent relevant events): use [`EventHistory::within`] to walk back from the
//! newest event and stop at the edge of the window instead of scanning
//! everything.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::events::{SecurityEvent, SecurityEventType, Severity};

/// Errors that can occur during rule registration and evaluation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleEngineError {
    #[error("Rule evaluation error: {0}")]
    Evaluation(String),
    #[error("Rule already registered: {0}")]
    DuplicateRule(String),
    #[error("Invalid rule: {0}")]
    InvalidRule(String),
}

/// What a fired rule asks the adapter layer to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Log,
    Alert,
    Block,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Log => "log",
            RuleAction::Alert => "alert",
            RuleAction::Block => "block",
        }
    }
}

/// Read-only view of the event log handed to rule conditions
#[derive(Debug, Clone, Copy)]
pub struct EventHistory<'a> {
    events: &'a VecDeque<SecurityEvent>,
    now: DateTime<Utc>,
}

impl<'a> EventHistory<'a> {
    pub fn new(events: &'a VecDeque<SecurityEvent>, now: DateTime<Utc>) -> Self {
        Self { events, now }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Every event, oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &'a SecurityEvent> + 'a {
        self.events.iter()
    }

    /// Events no older than `window`, newest first. Stops at the first older event.
    /// A window reaching past the representable range covers the whole history.
    pub fn within(&self, window: Duration) -> impl Iterator<Item = &'a SecurityEvent> + 'a {
        let cutoff = self
            .now
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.events
            .iter()
            .rev()
            .take_while(move |event| event.timestamp >= cutoff)
    }
}

/// Predicate deciding whether a rule fires
pub trait ThreatCondition: Send + Sync {
    fn evaluate(&self, history: &EventHistory<'_>) -> Result<bool, RuleEngineError>;
}

impl<F> ThreatCondition for F
where
    F: Fn(&EventHistory<'_>) -> Result<bool, RuleEngineError> + Send + Sync,
{
    fn evaluate(&self, history: &EventHistory<'_>) -> Result<bool, RuleEngineError> {
        self(history)
    }
}

/// Pins a closure to the [`ThreatCondition`] signature so it can be used as a rule condition
pub fn condition_fn<F>(condition: F) -> F
where
    F: Fn(&EventHistory<'_>) -> Result<bool, RuleEngineError> + Send + Sync,
{
    condition
}

/// Fires when any single source produced `threshold` events of `event_type` within `window`
#[derive(Debug, Clone)]
pub struct SourceThreshold {
    pub event_type: SecurityEventType,
    pub threshold: usize,
    pub window: Duration,
}

impl ThreatCondition for SourceThreshold {
    fn evaluate(&self, history: &EventHistory<'_>) -> Result<bool, RuleEngineError> {
        let mut per_source: HashMap<&str, usize> = HashMap::new();
        for event in history
            .within(self.window)
            .filter(|event| event.event_type == self.event_type)
        {
            let count = per_source.entry(event.source.as_str()).or_insert(0);
            *count += 1;
            if *count >= self.threshold {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Fires when `threshold` events of `event_type` occurred within `window`, from any source
#[derive(Debug, Clone)]
pub struct GlobalThreshold {
    pub event_type: SecurityEventType,
    pub threshold: usize,
    pub window: Duration,
}

impl ThreatCondition for GlobalThreshold {
    fn evaluate(&self, history: &EventHistory<'_>) -> Result<bool, RuleEngineError> {
        let count = history
            .within(self.window)
            .filter(|event| event.event_type == self.event_type)
            .take(self.threshold)
            .count();
        Ok(count >= self.threshold)
    }
}

/// A registered detection policy
#[derive(Clone)]
pub struct ThreatRule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub event_types: Vec<SecurityEventType>,
    pub condition: Arc<dyn ThreatCondition>,
    pub action: RuleAction,
    pub severity: Severity,
    pub cooldown: Duration,
}

impl ThreatRule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        condition: impl ThreatCondition + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            event_types: Vec::new(),
            condition: Arc::new(condition),
            action: RuleAction::Log,
            severity: Severity::Medium,
            cooldown: Duration::zero(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn on(mut self, event_types: impl IntoIterator<Item = SecurityEventType>) -> Self {
        self.event_types.extend(event_types);
        self
    }

    pub fn action(mut self, action: RuleAction) -> Self {
        self.action = action;
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    fn watches(&self, event_type: SecurityEventType) -> bool {
        self.event_types.contains(&event_type)
    }

    pub fn info(&self) -> RuleInfo {
        RuleInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            event_types: self.event_types.clone(),
            action: self.action,
            severity: self.severity,
            cooldown_ms: self.cooldown.num_milliseconds(),
        }
    }
}

impl fmt::Debug for ThreatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreatRule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("event_types", &self.event_types)
            .field("action", &self.action)
            .field("severity", &self.severity)
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

/// Serializable description of a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub event_types: Vec<SecurityEventType>,
    pub action: RuleAction,
    pub severity: Severity,
    pub cooldown_ms: i64,
}

/// Result of evaluating one rule against a new event
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Fired(RuleInfo),
    Faulted { rule: RuleInfo, error: String },
}

/// Ordered rule set plus cooldown state
#[derive(Debug, Default)]
pub struct RuleEngine {
    rules: Vec<ThreatRule>,
    last_fired: HashMap<String, DateTime<Utc>>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule; ids must be unique
    pub fn add_rule(&mut self, rule: ThreatRule) -> Result<(), RuleEngineError> {
        if rule.id.trim().is_empty() {
            return Err(RuleEngineError::InvalidRule("rule id must not be empty".to_string()));
        }
        if rule.cooldown < Duration::zero() {
            return Err(RuleEngineError::InvalidRule(format!(
                "rule {} has a negative cooldown",
                rule.id
            )));
        }
        if self.rules.iter().any(|existing| existing.id == rule.id) {
            return Err(RuleEngineError::DuplicateRule(rule.id));
        }
        info!("Registered threat rule {} ({})", rule.id, rule.name);
        self.rules.push(rule);
        Ok(())
    }

    /// Remove a rule and forget its cooldown
    pub fn remove_rule(&mut self, id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.id != id);
        self.last_fired.remove(id);
        let removed = self.rules.len() != before;
        if removed {
            info!("Removed threat rule {}", id);
        }
        removed
    }

    pub fn rules(&self) -> Vec<RuleInfo> {
        self.rules.iter().map(ThreatRule::info).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn last_fired(&self, id: &str) -> Option<DateTime<Utc>> {
        self.last_fired.get(id).copied()
    }

    pub fn clear_cooldowns(&mut self) {
        self.last_fired.clear();
    }

    /// Evaluate every rule watching `trigger`'s type, in registration order
    pub fn evaluate(&mut self, trigger: &SecurityEvent, history: &EventHistory<'_>) -> Vec<RuleOutcome> {
        (0..self.rules.len())
            .filter_map(|index| self.evaluate_rule(index, trigger, history))
            .collect()
    }

    /// Evaluate the rule at `index` in registration order. `None` when it does not
    /// watch the trigger's type, is cooling down or its condition does not hold.
    pub fn evaluate_rule(
        &mut self,
        index: usize,
        trigger: &SecurityEvent,
        history: &EventHistory<'_>,
    ) -> Option<RuleOutcome> {
        let now = history.now();
        let rule = self.rules.get(index)?;
        if !rule.watches(trigger.event_type) {
            return None;
        }
        if let Some(last) = self.last_fired.get(&rule.id) {
            if now - *last < rule.cooldown {
                return None;
            }
        }

        let result = catch_unwind(AssertUnwindSafe(|| rule.condition.evaluate(history)))
            .unwrap_or_else(|panic| Err(RuleEngineError::Evaluation(panic_message(&*panic))));

        match result {
            Ok(true) => {
                self.last_fired.insert(rule.id.clone(), now);
                metrics::increment_counter!("shield_threats_total", "rule" => rule.id.clone());
                Some(RuleOutcome::Fired(rule.info()))
            }
            Ok(false) => None,
            Err(err) => Some(RuleOutcome::Faulted {
                rule: rule.info(),
                error: err.to_string(),
            }),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("condition panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("condition panicked: {}", message)
    } else {
        "condition panicked".to_string()
    }
}

pub const BRUTE_FORCE_RULE_ID: &str = "brute_force_detection";
pub const INJECTION_RULE_ID: &str = "injection_pattern_detection";
pub const RATE_LIMIT_ABUSE_RULE_ID: &str = "rate_limit_abuse";

/// The built-in rule set
pub fn default_rules() -> Vec<ThreatRule> {
    vec![
        ThreatRule::new(
            BRUTE_FORCE_RULE_ID,
            "Brute Force Attack Detection",
            SourceThreshold {
                event_type: SecurityEventType::AuthenticationFailure,
                threshold: 5,
                window: Duration::minutes(5),
            },
        )
        .description("5 or more authentication failures from one source within 5 minutes")
        .on([SecurityEventType::AuthenticationFailure])
        .action(RuleAction::Block)
        .severity(Severity::High)
        .cooldown(Duration::minutes(10)),
        ThreatRule::new(
            INJECTION_RULE_ID,
            "SQL Injection Pattern Detection",
            GlobalThreshold {
                event_type: SecurityEventType::SqlInjectionAttempt,
                threshold: 3,
                window: Duration::minutes(10),
            },
        )
        .description("3 or more SQL injection attempts within 10 minutes")
        .on([SecurityEventType::SqlInjectionAttempt])
        .action(RuleAction::Alert)
        .severity(Severity::High)
        .cooldown(Duration::minutes(5)),
        ThreatRule::new(
            RATE_LIMIT_ABUSE_RULE_ID,
            "Rate Limit Abuse Detection",
            SourceThreshold {
                event_type: SecurityEventType::RateLimitExceeded,
                threshold: 10,
                window: Duration::hours(1),
            },
        )
        .description("10 or more rate limit violations from one source within an hour")
        .on([SecurityEventType::RateLimitExceeded])
        .action(RuleAction::Block)
        .severity(Severity::Medium)
        .cooldown(Duration::minutes(30)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::NewSecurityEvent;

    fn push(
        events: &mut VecDeque<SecurityEvent>,
        at: DateTime<Utc>,
        event_type: SecurityEventType,
        source: &str,
    ) -> SecurityEvent {
        let event = SecurityEvent::from_descriptor(
            format!("evt-{}", events.len()),
            at,
            NewSecurityEvent::new(event_type, Severity::Medium, source),
        );
        events.push_back(event.clone());
        event
    }

    #[test]
    fn test_within_stops_at_window_edge() {
        let now = Utc::now();
        let mut events = VecDeque::new();
        push(&mut events, now - Duration::minutes(20), SecurityEventType::XssAttempt, "a");
        push(&mut events, now - Duration::minutes(4), SecurityEventType::XssAttempt, "a");
        push(&mut events, now, SecurityEventType::XssAttempt, "a");

        let history = EventHistory::new(&events, now);
        let ids: Vec<_> = history.within(Duration::minutes(5)).map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["evt-2", "evt-1"]);
    }

    #[test]
    fn test_within_oversized_window_covers_everything() {
        let now = Utc::now();
        let mut events = VecDeque::new();
        push(&mut events, now - Duration::days(400), SecurityEventType::XssAttempt, "a");
        push(&mut events, now, SecurityEventType::XssAttempt, "a");

        let history = EventHistory::new(&events, now);
        let window = Duration::milliseconds(i64::MAX);
        assert_eq!(history.within(window).count(), 2);
    }

    #[test]
    fn test_source_threshold_counts_per_source() {
        let now = Utc::now();
        let mut events = VecDeque::new();
        for source in ["a", "b", "a", "b", "a"] {
            push(&mut events, now, SecurityEventType::AuthenticationFailure, source);
        }
        let condition = SourceThreshold {
            event_type: SecurityEventType::AuthenticationFailure,
            threshold: 3,
            window: Duration::minutes(5),
        };
        assert_eq!(condition.evaluate(&EventHistory::new(&events, now)), Ok(true));

        let condition = SourceThreshold { threshold: 4, ..condition };
        assert_eq!(condition.evaluate(&EventHistory::new(&events, now)), Ok(false));
    }

    #[test]
    fn test_global_threshold_ignores_old_events() {
        let now = Utc::now();
        let mut events = VecDeque::new();
        push(&mut events, now - Duration::minutes(11), SecurityEventType::SqlInjectionAttempt, "a");
        push(&mut events, now - Duration::minutes(1), SecurityEventType::SqlInjectionAttempt, "b");
        push(&mut events, now, SecurityEventType::SqlInjectionAttempt, "c");

        let condition = GlobalThreshold {
            event_type: SecurityEventType::SqlInjectionAttempt,
            threshold: 3,
            window: Duration::minutes(10),
        };
        assert_eq!(condition.evaluate(&EventHistory::new(&events, now)), Ok(false));
    }

    #[test]
    fn test_cooldown_suppresses_until_elapsed() {
        let mut engine = RuleEngine::new();
        engine
            .add_rule(
                ThreatRule::new("always", "Always", condition_fn(|_| Ok(true)))
                    .on([SecurityEventType::MalformedRequest])
                    .cooldown(Duration::seconds(30)),
            )
            .unwrap();

        let start = Utc::now();
        let mut events = VecDeque::new();
        let trigger = push(&mut events, start, SecurityEventType::MalformedRequest, "a");

        let fired = engine.evaluate(&trigger, &EventHistory::new(&events, start));
        assert_eq!(fired.len(), 1);

        let almost = start + Duration::seconds(29);
        assert!(engine.evaluate(&trigger, &EventHistory::new(&events, almost)).is_empty());

        let exactly = start + Duration::seconds(30);
        assert_eq!(engine.evaluate(&trigger, &EventHistory::new(&events, exactly)).len(), 1);
        assert_eq!(engine.last_fired("always"), Some(exactly));
    }

    #[test]
    fn test_unwatched_types_are_not_evaluated() {
        let mut engine = RuleEngine::new();
        engine
            .add_rule(
                ThreatRule::new("xss", "Xss", condition_fn(|_| Ok(true)))
                    .on([SecurityEventType::XssAttempt]),
            )
            .unwrap();

        let now = Utc::now();
        let mut events = VecDeque::new();
        let trigger = push(&mut events, now, SecurityEventType::SqlInjectionAttempt, "a");
        assert!(engine.evaluate(&trigger, &EventHistory::new(&events, now)).is_empty());
    }

    #[test]
    fn test_faulty_rule_does_not_stop_others() {
        let mut engine = RuleEngine::new();
        engine
            .add_rule(
                ThreatRule::new("broken", "Broken", condition_fn(|_| {
                    Err(RuleEngineError::Evaluation("boom".to_string()))
                }))
                .on([SecurityEventType::XssAttempt]),
            )
            .unwrap();
        engine
            .add_rule(
                ThreatRule::new("panicky", "Panicky", condition_fn(|_| panic!("bad rule")))
                .on([SecurityEventType::XssAttempt]),
            )
            .unwrap();
        engine
            .add_rule(
                ThreatRule::new("ok", "Ok", condition_fn(|_| Ok(true)))
                    .on([SecurityEventType::XssAttempt]),
            )
            .unwrap();

        let now = Utc::now();
        let mut events = VecDeque::new();
        let trigger = push(&mut events, now, SecurityEventType::XssAttempt, "a");
        let outcomes = engine.evaluate(&trigger, &EventHistory::new(&events, now));

        assert_eq!(outcomes.len(), 3);
        assert!(matches!(&outcomes[0], RuleOutcome::Faulted { error, .. } if error.contains("boom")));
        assert!(matches!(&outcomes[1], RuleOutcome::Faulted { error, .. } if error.contains("bad rule")));
        assert!(matches!(&outcomes[2], RuleOutcome::Fired(info) if info.id == "ok"));
        assert!(engine.last_fired("broken").is_none());
    }

    #[test]
    fn test_duplicate_and_removal() {
        let mut engine = RuleEngine::new();
        for rule in default_rules() {
            engine.add_rule(rule).unwrap();
        }
        assert_eq!(engine.len(), 3);

        let duplicate = default_rules().remove(0);
        assert_eq!(
            engine.add_rule(duplicate),
            Err(RuleEngineError::DuplicateRule(BRUTE_FORCE_RULE_ID.to_string()))
        );

        assert!(engine.remove_rule(INJECTION_RULE_ID));
        assert!(!engine.remove_rule(INJECTION_RULE_ID));
        let ids: Vec<_> = engine.rules().into_iter().map(|rule| rule.id).collect();
        assert_eq!(ids, vec![BRUTE_FORCE_RULE_ID, RATE_LIMIT_ABUSE_RULE_ID]);
    }
}
