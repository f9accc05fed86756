//! Health alerts and their escalation chains.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::Severity;

/// Fields accepted when raising an alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRequest {
    pub severity: Severity,

    /// Component or source that breached
    pub source: String,

    pub title: String,

    #[serde(default)]
    pub message: String,

    /// Ordered contact chain; tier `n` notifies `contacts[n]`
    #[serde(default)]
    pub contacts: Vec<String>,

    /// Seconds without acknowledgement before escalating
    #[serde(default)]
    pub escalation_secs: Option<u64>,

    #[serde(default)]
    pub max_level: Option<u8>,

    /// Event that triggered the alert, if any
    #[serde(default)]
    pub event_id: Option<Uuid>,
}

impl AlertRequest {
    pub fn new(severity: Severity, source: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            severity,
            source: source.into(),
            title: title.into(),
            message: String::new(),
            contacts: Vec::new(),
            escalation_secs: None,
            max_level: None,
            event_id: None,
        }
    }

    pub fn with_contacts<S: Into<String>>(mut self, contacts: impl IntoIterator<Item = S>) -> Self {
        self.contacts = contacts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn escalating_after(mut self, secs: u64, max_level: u8) -> Self {
        self.escalation_secs = Some(secs);
        self.max_level = Some(max_level);
        self
    }
}

/// One notification sent for an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    pub level: u8,
    pub contact: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub id: Uuid,
    pub severity: Severity,
    pub source: String,
    pub title: String,
    pub message: String,
    pub event_id: Option<Uuid>,

    pub triggered_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,

    pub escalation_level: u8,
    pub max_level: u8,
    pub escalation_secs: u64,
    /// When the current tier was notified
    pub last_escalated_at: DateTime<Utc>,

    pub contacts: Vec<String>,
    /// Append-only notification history
    pub notifications: Vec<AlertNotification>,
}

impl HealthAlert {
    pub fn raise(request: AlertRequest, default_escalation_secs: u64, default_max_level: u8) -> Self {
        let now = Utc::now();
        let mut alert = Self {
            id: Uuid::new_v4(),
            severity: request.severity,
            source: request.source,
            title: request.title,
            message: request.message,
            event_id: request.event_id,
            triggered_at: now,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            escalation_level: 0,
            max_level: request.max_level.unwrap_or(default_max_level),
            escalation_secs: request.escalation_secs.unwrap_or(default_escalation_secs),
            last_escalated_at: now,
            contacts: request.contacts,
            notifications: Vec::new(),
        };
        alert.notify_current_tier(now);
        alert
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }

    /// Open, unacknowledged alerts are subject to escalation
    pub fn awaiting_escalation(&self) -> bool {
        !self.is_resolved() && !self.is_acknowledged()
    }

    /// When the next tier is due; `None` if the interval overflows the calendar
    pub fn next_escalation_at(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.escalation_secs).ok()?;
        self.last_escalated_at.checked_add_signed(Duration::try_seconds(secs)?)
    }

    pub fn escalation_due(&self, now: DateTime<Utc>) -> bool {
        self.awaiting_escalation()
            && self.escalation_level < self.max_level
            && self.next_escalation_at().map_or(false, |due| now >= due)
    }

    /// Move to the next tier and append a notification; returns false at `max_level`
    pub fn escalate(&mut self, now: DateTime<Utc>) -> bool {
        if self.escalation_level >= self.max_level {
            return false;
        }
        self.escalation_level += 1;
        self.last_escalated_at = now;
        self.notify_current_tier(now);
        true
    }

    /// Contact for the current tier; the last contact covers tiers past the end
    pub fn current_contact(&self) -> Option<&str> {
        if self.contacts.is_empty() {
            return None;
        }
        let idx = (self.escalation_level as usize).min(self.contacts.len() - 1);
        Some(self.contacts[idx].as_str())
    }

    fn notify_current_tier(&mut self, now: DateTime<Utc>) {
        if let Some(contact) = self.current_contact().map(str::to_string) {
            self.notifications.push(AlertNotification {
                level: self.escalation_level,
                contact,
                sent_at: now,
            });
        }
    }
}
