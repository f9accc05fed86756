//! Health alerts, escalation chains and metric thresholds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{AlertRequest, HealthAlert, Severity};
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSettings {
    /// Seconds without acknowledgement before an alert escalates
    #[serde(default = "default_escalation_secs")]
    pub escalation_secs: u64,

    #[serde(default = "default_max_level")]
    pub max_level: u8,

    /// Contact chain for alerts that do not name their own
    #[serde(default)]
    pub default_contacts: Vec<String>,

    /// Interval between escalation checks, in milliseconds
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    #[serde(default)]
    pub thresholds: Vec<MetricThreshold>,
}

fn default_escalation_secs() -> u64 {
    300
}
fn default_max_level() -> u8 {
    3
}
fn default_check_interval() -> u64 {
    1000
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            escalation_secs: default_escalation_secs(),
            max_level: default_max_level(),
            default_contacts: Vec::new(),
            check_interval_ms: default_check_interval(),
            thresholds: Vec::new(),
        }
    }
}

/// Bounds on one component metric; leaving the bounds raises an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricThreshold {
    pub component: String,
    pub metric: String,

    #[serde(default)]
    pub above: Option<f64>,

    #[serde(default)]
    pub below: Option<f64>,

    #[serde(default = "default_threshold_severity")]
    pub severity: Severity,
}

fn default_threshold_severity() -> Severity {
    Severity::High
}

impl MetricThreshold {
    pub fn breached_by(&self, value: f64) -> bool {
        self.above.map_or(false, |limit| value > limit)
            || self.below.map_or(false, |limit| value < limit)
    }
}

#[derive(Default)]
struct AlertState {
    alerts: HashMap<Uuid, HealthAlert>,
    /// Open alert raised for each (component, metric)
    by_metric: HashMap<(String, String), Uuid>,
}

pub struct AlertManager {
    state: RwLock<AlertState>,
    settings: AlertSettings,
}

impl AlertManager {
    pub fn new(settings: AlertSettings) -> Self {
        Self {
            state: RwLock::new(AlertState::default()),
            settings,
        }
    }

    pub fn settings(&self) -> &AlertSettings {
        &self.settings
    }

    pub async fn raise(&self, mut request: AlertRequest) -> Uuid {
        if request.contacts.is_empty() {
            request.contacts = self.settings.default_contacts.clone();
        }
        let alert = HealthAlert::raise(request, self.settings.escalation_secs, self.settings.max_level);
        let id = alert.id;
        warn!(
            alert_id = %id,
            severity = ?alert.severity,
            source = %alert.source,
            title = %alert.title,
            "Alert raised"
        );
        self.state.write().await.alerts.insert(id, alert);
        id
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<HealthAlert> {
        self.state
            .read()
            .await
            .alerts
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::unknown("alert", id))
    }

    /// Stop escalation; acknowledging twice keeps the first acknowledgement
    pub async fn acknowledge(&self, id: Uuid, who: &str) -> CoreResult<HealthAlert> {
        let mut state = self.state.write().await;
        let alert = state
            .alerts
            .get_mut(&id)
            .ok_or_else(|| CoreError::unknown("alert", id))?;
        if alert.is_resolved() {
            return Err(CoreError::already_resolved("alert", id));
        }
        if !alert.is_acknowledged() {
            alert.acknowledged_at = Some(Utc::now());
            alert.acknowledged_by = Some(who.to_string());
            info!(alert_id = %id, by = %who, "Alert acknowledged");
        }
        Ok(alert.clone())
    }

    pub async fn resolve(&self, id: Uuid, who: &str) -> CoreResult<HealthAlert> {
        let mut state = self.state.write().await;
        let alert = state
            .alerts
            .get_mut(&id)
            .ok_or_else(|| CoreError::unknown("alert", id))?;
        if alert.is_resolved() {
            return Err(CoreError::already_resolved("alert", id));
        }
        alert.resolved_at = Some(Utc::now());
        alert.resolved_by = Some(who.to_string());
        info!(alert_id = %id, by = %who, "Alert resolved");
        let snapshot = alert.clone();

        state.by_metric.retain(|_, alert_id| *alert_id != id);
        Ok(snapshot)
    }

    /// Escalate every overdue, unacknowledged alert; returns the escalated ids
    pub async fn check_escalations_at(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut state = self.state.write().await;
        let mut escalated = Vec::new();
        for alert in state.alerts.values_mut() {
            if alert.escalation_due(now) && alert.escalate(now) {
                warn!(
                    alert_id = %alert.id,
                    level = alert.escalation_level,
                    contact = alert.current_contact().unwrap_or("-"),
                    "Alert escalated"
                );
                escalated.push(alert.id);
            }
        }
        escalated
    }

    /// Alerts newest first
    pub async fn list(&self, open_only: bool) -> Vec<HealthAlert> {
        let state = self.state.read().await;
        let mut alerts: Vec<HealthAlert> = state
            .alerts
            .values()
            .filter(|a| !open_only || !a.is_resolved())
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at).then(a.id.cmp(&b.id)));
        alerts
    }

    pub async fn open_count(&self) -> usize {
        self.state
            .read()
            .await
            .alerts
            .values()
            .filter(|a| !a.is_resolved())
            .count()
    }

    /// Check a metric sample against the configured thresholds.
    ///
    /// Returns the id of a newly raised alert. While an alert for the same
    /// component and metric is still open no second one is raised.
    pub async fn record_metric(&self, component: &str, metric: &str, value: f64) -> Option<Uuid> {
        let threshold = self
            .settings
            .thresholds
            .iter()
            .find(|t| t.component == component && t.metric == metric)?;
        if !threshold.breached_by(value) {
            return None;
        }

        let key = (component.to_string(), metric.to_string());
        let mut state = self.state.write().await;
        if let Some(existing) = state.by_metric.get(&key) {
            debug!(alert_id = %existing, component, metric, value, "Threshold alert already open");
            return None;
        }

        let request = AlertRequest::new(
            threshold.severity,
            component,
            format!("{} {} out of bounds", component, metric),
        )
        .with_message(format!("{} = {}", metric, value))
        .with_contacts(self.settings.default_contacts.clone());
        let alert = HealthAlert::raise(request, self.settings.escalation_secs, self.settings.max_level);
        let id = alert.id;
        warn!(alert_id = %id, component, metric, value, "Metric threshold breached");

        state.alerts.insert(id, alert);
        state.by_metric.insert(key, id);
        Some(id)
    }

    /// Raise alerts arriving on `rx` until cancelled or the senders are gone
    pub async fn run_listener(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<AlertRequest>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => {
                        self.raise(request).await;
                    }
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Alert listener stopped");
    }

    /// Check escalations on the configured interval until cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.settings.check_interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_escalations_at(Utc::now()).await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Alert escalation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AlertManager {
        AlertManager::new(AlertSettings {
            escalation_secs: 60,
            max_level: 2,
            default_contacts: vec!["oncall".into(), "lead".into()],
            thresholds: vec![MetricThreshold {
                component: "relay-7".into(),
                metric: "cpu".into(),
                above: Some(90.0),
                below: None,
                severity: Severity::Critical,
            }],
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_acknowledged_alert_does_not_escalate() {
        let alerts = manager();
        let id = alerts
            .raise(AlertRequest::new(Severity::High, "relay-7", "offline"))
            .await;
        alerts.acknowledge(id, "dana").await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(3600);
        assert!(alerts.check_escalations_at(later).await.is_empty());
    }

    #[tokio::test]
    async fn test_huge_escalation_interval_is_never_due() {
        let alerts = manager();
        alerts
            .raise(
                AlertRequest::new(Severity::Critical, "relay-7", "offline")
                    .escalating_after(9_000_000_000_000_000, 3),
            )
            .await;

        assert!(alerts.check_escalations_at(Utc::now()).await.is_empty());
        assert!(alerts
            .check_escalations_at(Utc::now() + chrono::Duration::days(365 * 1000))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_resolve_twice_conflicts() {
        let alerts = manager();
        let id = alerts
            .raise(AlertRequest::new(Severity::Low, "gateway", "slow"))
            .await;

        alerts.resolve(id, "dana").await.unwrap();
        let err = alerts.resolve(id, "dana").await.unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert_eq!(alerts.acknowledge(id, "dana").await.unwrap_err().status_code(), 409);
        assert_eq!(
            alerts.resolve(Uuid::new_v4(), "dana").await.unwrap_err().status_code(),
            404
        );
    }

    #[tokio::test]
    async fn test_escalation_appends_notifications() {
        let alerts = manager();
        let id = alerts
            .raise(AlertRequest::new(Severity::High, "relay-7", "offline"))
            .await;

        let mut now = Utc::now();
        for _ in 0..5 {
            now += chrono::Duration::seconds(61);
            alerts.check_escalations_at(now).await;
        }

        let alert = alerts.get(id).await.unwrap();
        assert_eq!(alert.escalation_level, 2);
        let contacts: Vec<_> = alert.notifications.iter().map(|n| n.contact.as_str()).collect();
        assert_eq!(contacts, ["oncall", "lead", "lead"]);
    }

    #[tokio::test]
    async fn test_one_open_alert_per_metric() {
        let alerts = manager();
        assert!(alerts.record_metric("relay-7", "cpu", 50.0).await.is_none());

        let first = alerts.record_metric("relay-7", "cpu", 95.0).await.unwrap();
        assert!(alerts.record_metric("relay-7", "cpu", 99.0).await.is_none());

        alerts.resolve(first, "dana").await.unwrap();
        assert!(alerts.record_metric("relay-7", "cpu", 97.0).await.is_some());
        assert!(alerts.record_metric("relay-8", "cpu", 97.0).await.is_none());
    }
}
