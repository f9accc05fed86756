//! Event rules and the responses they produce.
//!
//! Conditions are a typed union over the event fields a rule may inspect.
//! A rule matches when every one of its conditions holds; a rule with no
//! conditions matches every event.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{EventType, Severity, SystemEvent};

/// Static condition -> action mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRule {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Conjunctive conditions; empty matches everything
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,

    /// Actions run in order when the rule matches
    #[serde(default)]
    pub actions: Vec<RuleAction>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Lower value = evaluated first
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_enabled() -> bool {
    true
}
fn default_priority() -> u32 {
    100
}

impl EventRule {
    pub fn new(id: impl Into<String>, priority: u32) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            conditions: Vec::new(),
            actions: Vec::new(),
            enabled: true,
            priority,
        }
    }

    pub fn when(mut self, condition: RuleCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn then(mut self, action: RuleAction) -> Self {
        self.actions.push(action);
        self
    }

    /// Every condition must hold
    pub fn matches(&self, event: &SystemEvent) -> bool {
        self.conditions.iter().all(|c| c.matches(event))
    }
}

/// A single typed condition over an event field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Event type equality
    Type { equals: EventType },

    /// Severity membership
    Severity { any_of: BTreeSet<Severity> },

    /// Inclusive escalation-level range
    EscalationLevel {
        #[serde(default)]
        min: u8,
        #[serde(default = "default_max_level")]
        max: u8,
    },

    /// Any keyword appears in title or description (case-insensitive)
    Keywords { any_of: Vec<String> },

    /// Any affected system contains the substring (case-insensitive)
    AffectedSystem { contains: String },
}

fn default_max_level() -> u8 {
    super::events::MAX_ESCALATION_LEVEL
}

impl RuleCondition {
    pub fn severity_in(severities: impl IntoIterator<Item = Severity>) -> Self {
        Self::Severity {
            any_of: severities.into_iter().collect(),
        }
    }

    pub fn keywords<S: Into<String>>(keywords: impl IntoIterator<Item = S>) -> Self {
        Self::Keywords {
            any_of: keywords.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, event: &SystemEvent) -> bool {
        match self {
            Self::Type { equals } => event.event_type == *equals,
            Self::Severity { any_of } => any_of.contains(&event.severity),
            Self::EscalationLevel { min, max } => {
                (*min..=*max).contains(&event.escalation_level)
            }
            Self::Keywords { any_of } => {
                if any_of.is_empty() {
                    return true;
                }
                let text = event.searchable_text();
                any_of.iter().any(|k| text.contains(&k.to_lowercase()))
            }
            Self::AffectedSystem { contains } => {
                let needle = contains.to_lowercase();
                event
                    .affected_systems
                    .iter()
                    .any(|s| s.to_lowercase().contains(&needle))
            }
        }
    }
}

/// An action to take when a rule matches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,

    /// Handler, contact or resource the action is aimed at
    #[serde(default)]
    pub target: String,

    /// Run immediately, or after `delay_ms`
    #[serde(default = "default_immediate")]
    pub immediate: bool,

    #[serde(default)]
    pub delay_ms: u64,

    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

fn default_immediate() -> bool {
    true
}

impl RuleAction {
    pub fn new(action_type: ActionType, target: impl Into<String>) -> Self {
        Self {
            action_type,
            target: target.into(),
            immediate: true,
            delay_ms: 0,
            parameters: serde_json::Map::new(),
        }
    }

    pub fn delayed(mut self, delay_ms: u64) -> Self {
        self.immediate = false;
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(|v| v.as_u64())
    }
}

/// Kinds of rule actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Record the event in the log
    Log,
    /// Notify a contact (through a handler when one is registered)
    Notify,
    /// Raise a health alert
    Alert,
    /// Create a logistics operation
    Deploy,
    /// Add responders to the event
    Assign,
    /// Demand follow-up; forces escalation
    Escalate,
    /// Dispatch to a registered handler
    Custom,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Log => "log",
            Self::Notify => "notify",
            Self::Alert => "alert",
            Self::Deploy => "deploy",
            Self::Assign => "assign",
            Self::Escalate => "escalate",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Record of one executed action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseAction {
    pub action_type: ActionType,
    pub target: String,
    pub success: bool,
    pub message: String,
    pub requires_follow_up: bool,
    pub executed_at: DateTime<Utc>,
}

/// Outcome of applying one matched rule to one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResponse {
    pub id: Uuid,
    pub event_id: Uuid,
    pub rule_id: String,
    pub actions: Vec<ResponseAction>,
    pub success: bool,
    pub requires_follow_up: bool,
    pub created_at: DateTime<Utc>,
}

impl EventResponse {
    pub fn from_actions(event_id: Uuid, rule_id: impl Into<String>, actions: Vec<ResponseAction>) -> Self {
        let success = actions.iter().all(|a| a.success);
        let requires_follow_up = actions.iter().any(|a| a.requires_follow_up);
        Self {
            id: Uuid::new_v4(),
            event_id,
            rule_id: rule_id.into(),
            actions,
            success,
            requires_follow_up,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::EventDraft;

    fn event(level: u8) -> SystemEvent {
        SystemEvent::from_draft(
            EventDraft::new(EventType::Security, Severity::Critical, "Port scan on Relay-7")
                .with_description("Repeated probes from external host")
                .with_escalation_level(level)
                .affecting("relay-network"),
        )
    }

    #[test]
    fn test_empty_rule_matches_everything() {
        assert!(EventRule::new("catch-all", 1000).matches(&event(0)));
    }

    #[test]
    fn test_conditions_are_conjunctive() {
        let rule = EventRule::new("sec", 1)
            .when(RuleCondition::Type { equals: EventType::Security })
            .when(RuleCondition::severity_in([Severity::Critical, Severity::Emergency]));
        assert!(rule.matches(&event(0)));

        let rule = rule.when(RuleCondition::EscalationLevel { min: 5, max: 10 });
        assert!(!rule.matches(&event(2)));
        assert!(rule.matches(&event(8)));
    }

    #[test]
    fn test_keyword_and_system_matching() {
        let e = event(0);
        assert!(RuleCondition::keywords(["PROBES"]).matches(&e));
        assert!(!RuleCondition::keywords(["flood"]).matches(&e));
        assert!(RuleCondition::AffectedSystem { contains: "relay".into() }.matches(&e));
        assert!(!RuleCondition::AffectedSystem { contains: "grid".into() }.matches(&e));
    }

    #[test]
    fn test_rule_yaml() {
        let yaml = r#"
id: critical-security
priority: 10
conditions:
  - field: type
    equals: security
  - field: severity
    any_of: [critical, emergency]
  - field: escalation_level
    min: 3
actions:
  - type: notify
    target: soc-oncall
  - type: deploy
    target: response-team
    immediate: false
    delay_ms: 50
    parameters:
      resource_kind: personnel
      units: 2
"#;
        let rule: EventRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.priority, 10);
        assert!(rule.enabled);
        assert_eq!(rule.conditions.len(), 3);
        assert_eq!(
            rule.conditions[2],
            RuleCondition::EscalationLevel { min: 3, max: 10 }
        );
        assert!(!rule.actions[1].immediate);
        assert_eq!(rule.actions[1].param_u64("units"), Some(2));
    }

    #[test]
    fn test_response_flags() {
        let ok = ResponseAction {
            action_type: ActionType::Log,
            target: String::new(),
            success: true,
            message: "logged".into(),
            requires_follow_up: false,
            executed_at: Utc::now(),
        };
        let follow_up = ResponseAction {
            action_type: ActionType::Escalate,
            requires_follow_up: true,
            ..ok.clone()
        };

        let response = EventResponse::from_actions(Uuid::new_v4(), "r", vec![ok.clone()]);
        assert!(response.success && !response.requires_follow_up);

        let response = EventResponse::from_actions(Uuid::new_v4(), "r", vec![ok, follow_up]);
        assert!(response.success && response.requires_follow_up);
    }
}
