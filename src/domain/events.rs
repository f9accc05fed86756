//! System events and their lifecycle.
//!
//! Events are never deleted. Every change is a status transition, and each
//! transition is recorded as an [`EventTransition`] so the audit trail can
//! be replayed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Highest escalation level an event can reach
pub const MAX_ESCALATION_LEVEL: u8 = 10;

/// An event awaiting (or having received) an automated response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: Uuid,

    /// When the event was submitted
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "type")]
    pub event_type: EventType,

    pub severity: Severity,

    /// Component or producer that raised the event
    pub source: String,

    pub title: String,

    pub description: String,

    /// Opaque payload supplied by the producer
    pub data: serde_json::Value,

    pub affected_systems: Vec<String>,

    /// 0..=10, non-decreasing while the event is open
    pub escalation_level: u8,

    pub status: EventStatus,

    pub assigned_responders: Vec<String>,

    /// Why the event was resolved (set only on resolution)
    pub resolution: Option<ResolutionReason>,

    pub resolved_by: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl SystemEvent {
    /// Create a pending event from submitted fields
    pub fn from_draft(draft: EventDraft) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            timestamp: now,
            event_type: draft.event_type,
            severity: draft.severity,
            source: draft.source,
            title: draft.title,
            description: draft.description,
            data: draft.data,
            affected_systems: draft.affected_systems,
            escalation_level: draft.escalation_level.min(MAX_ESCALATION_LEVEL),
            status: EventStatus::Pending,
            assigned_responders: Vec::new(),
            resolution: None,
            resolved_by: None,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Apply a status transition, returning the audit record for it
    pub fn transition(&mut self, to: EventStatus, note: Option<String>) -> CoreResult<EventTransition> {
        if self.status == EventStatus::Resolved && to == EventStatus::Resolved {
            return Err(CoreError::already_resolved("event", self.id));
        }
        if !self.status.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                kind: "event",
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        let from = self.status;
        self.status = to;
        self.updated_at = Utc::now();

        Ok(EventTransition {
            event_id: self.id,
            from,
            to,
            escalation_level: self.escalation_level,
            at: self.updated_at,
            note,
        })
    }

    /// Raise the escalation level by one, capped at [`MAX_ESCALATION_LEVEL`]
    pub fn bump_escalation(&mut self) -> u8 {
        self.escalation_level = self.escalation_level.saturating_add(1).min(MAX_ESCALATION_LEVEL);
        self.escalation_level
    }

    pub fn assign(&mut self, responder: impl Into<String>) {
        let responder = responder.into();
        if !self.assigned_responders.contains(&responder) {
            self.assigned_responders.push(responder);
        }
    }

    /// Title and description, lower-cased, for keyword matching
    pub fn searchable_text(&self) -> String {
        format!("{} {}", self.title, self.description).to_lowercase()
    }
}

/// Fields accepted by `event.submit`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    #[serde(rename = "type")]
    pub event_type: EventType,

    pub severity: Severity,

    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub data: serde_json::Value,

    #[serde(default)]
    pub affected_systems: Vec<String>,

    #[serde(default)]
    pub escalation_level: u8,
}

impl EventDraft {
    pub fn new(event_type: EventType, severity: Severity, title: impl Into<String>) -> Self {
        Self {
            event_type,
            severity,
            source: String::new(),
            title: title.into(),
            description: String::new(),
            data: serde_json::Value::Null,
            affected_systems: Vec::new(),
            escalation_level: 0,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_escalation_level(mut self, level: u8) -> Self {
        self.escalation_level = level;
        self
    }

    pub fn affecting(mut self, system: impl Into<String>) -> Self {
        self.affected_systems.push(system.into());
        self
    }
}

/// Categories of system events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Security,
    Weather,
    System,
    Agent,
    Prediction,
    User,
    Emergency,
}

/// Event severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
    Emergency,
}

/// Lifecycle of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Resolved,
    Escalated,
    Cancelled,
}

impl EventStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Cancelled)
    }

    fn can_transition_to(self, to: Self) -> bool {
        use EventStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Resolved)
                | (Pending, Cancelled)
                | (Processing, Resolved)
                | (Processing, Escalated)
                | (Escalated, Resolved)
                | (Escalated, Cancelled)
        )
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// How an event came to be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionReason {
    /// No enabled rule matched; default handling applied
    NoMatchingRule,
    /// A rule matched and all of its actions succeeded
    ActionsSucceeded,
    /// Resolved by an operator
    Manual,
}

/// One entry of the append-only event audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTransition {
    pub event_id: Uuid,
    pub from: EventStatus,
    pub to: EventStatus,
    pub escalation_level: u8,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> SystemEvent {
        SystemEvent::from_draft(EventDraft::new(
            EventType::Security,
            Severity::Critical,
            "Intrusion detected",
        ))
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Emergency > Severity::Critical);
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_escalation_is_capped() {
        let mut e = event();
        e.escalation_level = 9;
        assert_eq!(e.bump_escalation(), 10);
        assert_eq!(e.bump_escalation(), 10);
    }

    #[test]
    fn test_draft_level_is_clamped() {
        let e = SystemEvent::from_draft(
            EventDraft::new(EventType::System, Severity::Low, "x").with_escalation_level(42),
        );
        assert_eq!(e.escalation_level, MAX_ESCALATION_LEVEL);
    }

    #[test]
    fn test_resolved_twice_is_already_resolved() {
        let mut e = event();
        e.transition(EventStatus::Resolved, None).unwrap();
        let err = e.transition(EventStatus::Resolved, None).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyResolved { .. }));
    }

    #[test]
    fn test_illegal_transition() {
        let mut e = event();
        assert!(e.transition(EventStatus::Escalated, None).is_err());
        assert_eq!(e.status, EventStatus::Pending);
    }

    #[test]
    fn test_draft_parses_type_field() {
        let draft: EventDraft = serde_json::from_str(
            r#"{"type":"security","severity":"critical","title":"t","escalation_level":8}"#,
        )
        .unwrap();
        assert_eq!(draft.event_type, EventType::Security);
        assert_eq!(draft.escalation_level, 8);
    }
}
