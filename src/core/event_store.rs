//! In-memory event store with an optional append-only audit log.
//!
//! Events are never removed; every status change is appended to the audit
//! trail. When an audit path is configured, each record is also written as
//! newline-delimited JSON (JSONL) for inspection and replay.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{
    EventDraft, EventResponse, EventStatus, EventTransition, EventType, ResolutionReason, Severity,
    SystemEvent,
};
use crate::error::{CoreError, CoreResult};

/// One line of the audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum AuditRecord {
    Submitted { event: SystemEvent },
    Transition { transition: EventTransition },
    Response { response: EventResponse },
}

/// File-based audit log using JSONL format
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Open (creating parent directories) an audit log at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create audit directory: {}", parent.display()))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record to the log
    pub async fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open audit log: {}", self.path.display()))?;

        let json = serde_json::to_string(record).context("Failed to serialize audit record")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write audit record")?;
        file.flush().await.context("Failed to flush audit record")?;

        Ok(())
    }

    /// Replay all records in order
    pub async fn replay(&self) -> Result<Vec<AuditRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open audit log: {}", self.path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse audit record: {}", line))?;
            records.push(record);
        }

        Ok(records)
    }
}

/// Filters for `event.list`; unset fields match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(rename = "type")]
    pub event_type: Option<EventType>,
    pub severity: Option<Severity>,
    pub status: Option<EventStatus>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EventFilter {
    fn matches(&self, event: &SystemEvent) -> bool {
        self.event_type.map_or(true, |t| event.event_type == t)
            && self.severity.map_or(true, |s| event.severity == s)
            && self.status.map_or(true, |s| event.status == s)
            && self.since.map_or(true, |since| event.timestamp >= since)
    }
}

/// Counts over every stored event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    /// Highest escalation level among open events
    pub max_open_escalation: u8,
}

#[derive(Default)]
struct StoreState {
    events: HashMap<Uuid, SystemEvent>,
    transitions: Vec<EventTransition>,
    responses: Vec<EventResponse>,
}

/// Holds every SystemEvent and its lifecycle
pub struct EventStore {
    state: RwLock<StoreState>,
    audit: Option<AuditLog>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    /// Create a memory-only store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            audit: None,
        }
    }

    /// Create a store that mirrors every change to `audit`
    pub fn with_audit_log(audit: AuditLog) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            audit: Some(audit),
        }
    }

    pub fn audit_log(&self) -> Option<&AuditLog> {
        self.audit.as_ref()
    }

    /// Accept an event; it is always queued as `pending`
    pub async fn submit(&self, draft: EventDraft) -> Uuid {
        let event = SystemEvent::from_draft(draft);
        let id = event.id;
        info!(
            event_id = %id,
            event_type = ?event.event_type,
            severity = ?event.severity,
            "Event submitted"
        );

        let mut state = self.state.write().await;
        self.record(AuditRecord::Submitted { event: event.clone() }).await;
        state.events.insert(id, event);
        id
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<SystemEvent> {
        self.state
            .read()
            .await
            .events
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::unknown("event", id))
    }

    /// Events matching `filter`, newest first
    pub async fn list(&self, filter: &EventFilter) -> Vec<SystemEvent> {
        let state = self.state.read().await;
        let mut events: Vec<SystemEvent> = state
            .events
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        events
    }

    /// Pending events ordered by severity desc, escalation level desc, then age
    pub async fn pending_ordered(&self) -> Vec<SystemEvent> {
        let state = self.state.read().await;
        let mut pending: Vec<SystemEvent> = state
            .events
            .values()
            .filter(|e| e.status == EventStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.escalation_level.cmp(&a.escalation_level))
                .then(a.timestamp.cmp(&b.timestamp))
                .then(a.id.cmp(&b.id))
        });
        pending
    }

    /// Claim a pending event for rule evaluation
    pub async fn begin_processing(&self, id: Uuid) -> CoreResult<SystemEvent> {
        self.apply(id, |event| event.transition(EventStatus::Processing, None))
            .await
    }

    /// Resolve an event, recording why
    pub async fn resolve(
        &self,
        id: Uuid,
        reason: ResolutionReason,
        resolved_by: Option<&str>,
    ) -> CoreResult<SystemEvent> {
        let note = format!("{:?}", reason);
        self.apply(id, |event| {
            let transition = event.transition(EventStatus::Resolved, Some(note))?;
            event.resolution = Some(reason);
            event.resolved_by = resolved_by.map(str::to_string);
            Ok(transition)
        })
        .await
    }

    /// Escalate a processing event, raising its level by one (capped)
    pub async fn escalate(&self, id: Uuid, note: impl Into<String>) -> CoreResult<SystemEvent> {
        let note = note.into();
        self.apply(id, |event| {
            if event.status != EventStatus::Processing {
                return Err(CoreError::InvalidTransition {
                    kind: "event",
                    id: event.id.to_string(),
                    from: event.status.to_string(),
                    to: EventStatus::Escalated.to_string(),
                });
            }
            event.bump_escalation();
            event.transition(EventStatus::Escalated, Some(note))
        })
        .await
    }

    pub async fn cancel(&self, id: Uuid) -> CoreResult<SystemEvent> {
        self.apply(id, |event| event.transition(EventStatus::Cancelled, None))
            .await
    }

    /// Add a responder to an open event
    pub async fn assign(&self, id: Uuid, responder: &str) -> CoreResult<SystemEvent> {
        let mut state = self.state.write().await;
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| CoreError::unknown("event", id))?;
        if !event.is_open() {
            return Err(CoreError::already_resolved("event", id));
        }
        event.assign(responder);
        Ok(event.clone())
    }

    pub async fn record_response(&self, response: EventResponse) {
        debug!(event_id = %response.event_id, rule = %response.rule_id, "Recording response");
        let mut state = self.state.write().await;
        self.record(AuditRecord::Response { response: response.clone() }).await;
        state.responses.push(response);
    }

    pub async fn responses_for(&self, event_id: Uuid) -> Vec<EventResponse> {
        self.state
            .read()
            .await
            .responses
            .iter()
            .filter(|r| r.event_id == event_id)
            .cloned()
            .collect()
    }

    /// Audit trail of one event, oldest first
    pub async fn history(&self, event_id: Uuid) -> Vec<EventTransition> {
        self.state
            .read()
            .await
            .transitions
            .iter()
            .filter(|t| t.event_id == event_id)
            .cloned()
            .collect()
    }

    pub async fn summary(&self) -> EventSummary {
        let state = self.state.read().await;
        let mut summary = EventSummary {
            total: state.events.len(),
            ..Default::default()
        };
        for event in state.events.values() {
            *summary.by_status.entry(event.status.to_string()).or_default() += 1;
            *summary
                .by_severity
                .entry(label(&event.severity))
                .or_default() += 1;
            *summary.by_type.entry(label(&event.event_type)).or_default() += 1;
            if event.is_open() {
                summary.max_open_escalation = summary.max_open_escalation.max(event.escalation_level);
            }
        }
        summary
    }

    pub async fn count_with_status(&self, status: EventStatus) -> usize {
        self.state
            .read()
            .await
            .events
            .values()
            .filter(|e| e.status == status)
            .count()
    }

    async fn apply<F>(&self, id: Uuid, change: F) -> CoreResult<SystemEvent>
    where
        F: FnOnce(&mut SystemEvent) -> CoreResult<EventTransition>,
    {
        let mut state = self.state.write().await;
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| CoreError::unknown("event", id))?;

        let transition = change(event)?;
        let snapshot = event.clone();

        debug!(event_id = %id, from = %transition.from, to = %transition.to, "Event transition");
        self.record(AuditRecord::Transition { transition: transition.clone() })
            .await;
        state.transitions.push(transition);
        Ok(snapshot)
    }

    async fn record(&self, record: AuditRecord) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.append(&record).await {
                error!(path = %audit.path().display(), error = %e, "Failed to append audit record");
            }
        }
    }
}

fn label<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Producer side of the bounded event ingest channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<EventDraft>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EventDraft>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a draft, waiting for room; false once the consumer is gone
    pub async fn emit(&self, draft: EventDraft) -> bool {
        if self.tx.send(draft).await.is_err() {
            warn!("Event ingest channel closed, dropping event");
            return false;
        }
        true
    }
}

/// Drain the ingest channel into the store until cancelled or closed
pub async fn run_ingest(
    store: std::sync::Arc<EventStore>,
    mut rx: mpsc::Receiver<EventDraft>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            draft = rx.recv() => match draft {
                Some(draft) => {
                    store.submit(draft).await;
                }
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("Event ingest stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn draft(severity: Severity, level: u8) -> EventDraft {
        EventDraft::new(EventType::System, severity, format!("{:?}/{}", severity, level))
            .with_escalation_level(level)
    }

    #[tokio::test]
    async fn test_pending_order() {
        let store = EventStore::new();
        store.submit(draft(Severity::Low, 9)).await;
        store.submit(draft(Severity::Critical, 1)).await;
        store.submit(draft(Severity::Critical, 7)).await;
        store.submit(draft(Severity::Emergency, 0)).await;

        let titles: Vec<String> = store
            .pending_ordered()
            .await
            .into_iter()
            .map(|e| e.title)
            .collect();
        assert_eq!(titles, ["Emergency/0", "Critical/7", "Critical/1", "Low/9"]);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = EventStore::new();
        store.submit(draft(Severity::Low, 0)).await;
        store.submit(draft(Severity::High, 0)).await;
        store
            .submit(EventDraft::new(EventType::Weather, Severity::High, "storm"))
            .await;

        let filter = EventFilter {
            severity: Some(Severity::High),
            ..Default::default()
        };
        assert_eq!(store.list(&filter).await.len(), 2);

        let filter = EventFilter {
            event_type: Some(EventType::Weather),
            ..Default::default()
        };
        assert_eq!(store.list(&filter).await[0].title, "storm");

        let filter = EventFilter {
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(store.list(&filter).await.len(), 1);
    }

    #[tokio::test]
    async fn test_transitions_are_recorded() {
        let store = EventStore::new();
        let id = store.submit(draft(Severity::High, 3)).await;

        store.begin_processing(id).await.unwrap();
        let escalated = store.escalate(id, "actions failed").await.unwrap();
        assert_eq!(escalated.escalation_level, 4);

        let resolved = store
            .resolve(id, ResolutionReason::Manual, Some("ops"))
            .await
            .unwrap();
        assert_eq!(resolved.resolution, Some(ResolutionReason::Manual));

        let history = store.history(id).await;
        let steps: Vec<_> = history.iter().map(|t| t.to).collect();
        assert_eq!(
            steps,
            [EventStatus::Processing, EventStatus::Escalated, EventStatus::Resolved]
        );

        let err = store.resolve(id, ResolutionReason::Manual, None).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn test_unknown_event() {
        let store = EventStore::new();
        let err = store.get(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_audit_log_replay_order() {
        let temp = TempDir::new().unwrap();
        let audit = AuditLog::open(temp.path().join("audit").join("events.jsonl"))
            .await
            .unwrap();
        let store = EventStore::with_audit_log(audit.clone());

        let id = store.submit(draft(Severity::Medium, 0)).await;
        store.begin_processing(id).await.unwrap();
        store
            .resolve(id, ResolutionReason::NoMatchingRule, None)
            .await
            .unwrap();

        let records = audit.replay().await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0], AuditRecord::Submitted { .. }));
        match &records[2] {
            AuditRecord::Transition { transition } => {
                assert_eq!(transition.to, EventStatus::Resolved)
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let store = EventStore::new();
        let a = store.submit(draft(Severity::High, 6)).await;
        store.submit(draft(Severity::High, 2)).await;
        store.submit(draft(Severity::Low, 0)).await;
        store.cancel(a).await.unwrap();

        let summary = store.summary().await;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_severity.get("high"), Some(&2));
        assert_eq!(summary.by_status.get("cancelled"), Some(&1));
        assert_eq!(summary.max_open_escalation, 2);
    }

    #[tokio::test]
    async fn test_ingest_channel() {
        let store = std::sync::Arc::new(EventStore::new());
        let (sink, rx) = EventSink::channel(4);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_ingest(store.clone(), rx, shutdown.clone()));

        assert!(sink.emit(draft(Severity::Low, 0)).await);
        drop(sink);
        task.await.unwrap();

        assert_eq!(store.count_with_status(EventStatus::Pending).await, 1);
    }
}
