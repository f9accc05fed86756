//! Rule evaluation over pending events.
//!
//! A sweep pulls every pending event in severity order and applies the first
//! enabled rule that matches. Actions run one after another; a failing action
//! is recorded and the rest still run. The event then resolves, or escalates
//! when anything failed or asked for follow-up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{ActionHandler, ActionOutcome};
use crate::core::event_store::EventStore;
use crate::core::scheduler::ResourceScheduler;
use crate::domain::{
    ActionType, AlertRequest, EventResponse, EventRule, OperationPriority, OperationRequest,
    ResolutionReason, ResourceRequirement, ResponseAction, Severity, SystemEvent,
};
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEngineSettings {
    /// Interval between sweeps, in milliseconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Escalating an event to this level or above raises a health alert
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold_level: u8,

    /// Contact chain used for escalation alerts
    #[serde(default)]
    pub escalation_contacts: Vec<String>,

    /// Estimated duration for `deploy` actions that do not give one
    #[serde(default = "default_deploy_duration")]
    pub default_deploy_secs: u64,
}

fn default_sweep_interval() -> u64 {
    1000
}
fn default_alert_threshold() -> u8 {
    8
}
fn default_deploy_duration() -> u64 {
    3600
}

impl Default for RuleEngineSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval(),
            alert_threshold_level: default_alert_threshold(),
            escalation_contacts: Vec::new(),
            default_deploy_secs: default_deploy_duration(),
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleSweep {
    pub resolved: Vec<Uuid>,
    pub escalated: Vec<Uuid>,
    pub responses: usize,
}

pub struct RuleEngine {
    rules: RwLock<Vec<EventRule>>,
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
    store: Arc<EventStore>,
    scheduler: Arc<ResourceScheduler>,
    alerts: Option<mpsc::Sender<AlertRequest>>,
    settings: RuleEngineSettings,
    /// Sweeps never overlap
    sweep_lock: Mutex<()>,
}

impl RuleEngine {
    pub fn new(
        store: Arc<EventStore>,
        scheduler: Arc<ResourceScheduler>,
        rules: Vec<EventRule>,
        settings: RuleEngineSettings,
    ) -> Self {
        Self {
            rules: RwLock::new(sorted(rules)),
            handlers: RwLock::new(HashMap::new()),
            store,
            scheduler,
            alerts: None,
            settings,
            sweep_lock: Mutex::new(()),
        }
    }

    /// Route `alert` actions and escalation alerts into `tx`
    pub fn with_alerts(mut self, tx: mpsc::Sender<AlertRequest>) -> Self {
        self.alerts = Some(tx);
        self
    }

    pub fn settings(&self) -> &RuleEngineSettings {
        &self.settings
    }

    /// Bind a handler for `notify`/`custom` actions aimed at `target`
    pub async fn register_handler(&self, target: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.write().await.insert(target.into(), handler);
    }

    /// Rules in evaluation order
    pub async fn list_rules(&self) -> Vec<EventRule> {
        self.rules.read().await.clone()
    }

    pub async fn add_rule(&self, rule: EventRule) -> CoreResult<()> {
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(CoreError::InvalidDefinition(format!(
                "rule '{}' is already registered",
                rule.id
            )));
        }
        rules.push(rule);
        rules.sort_by(|a, b| a.priority.cmp(&b.priority));
        Ok(())
    }

    pub async fn set_enabled(&self, rule_id: &str, enabled: bool) -> CoreResult<EventRule> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| CoreError::unknown("rule", rule_id))?;
        rule.enabled = enabled;
        info!(rule = %rule_id, enabled, "Rule toggled");
        Ok(rule.clone())
    }

    /// Evaluate every pending event once
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> RuleSweep {
        let _guard = self.sweep_lock.lock().await;
        let rules = self.rules.read().await.clone();
        let mut outcome = RuleSweep::default();

        for pending in self.store.pending_ordered().await {
            let event = match self.store.begin_processing(pending.id).await {
                Ok(event) => event,
                Err(e) => {
                    debug!(event_id = %pending.id, error = %e, "Event no longer pending, skipping");
                    continue;
                }
            };

            let Some(rule) = rules.iter().find(|r| r.enabled && r.matches(&event)) else {
                debug!(event_id = %event.id, "No rule matched");
                if self
                    .store
                    .resolve(event.id, ResolutionReason::NoMatchingRule, None)
                    .await
                    .is_ok()
                {
                    outcome.resolved.push(event.id);
                }
                continue;
            };

            info!(event_id = %event.id, rule = %rule.id, "Rule matched");
            let response = self.apply_rule(rule, &event).await;
            let settle = response.success && !response.requires_follow_up;
            self.store.record_response(response).await;
            outcome.responses += 1;

            if settle {
                match self
                    .store
                    .resolve(event.id, ResolutionReason::ActionsSucceeded, None)
                    .await
                {
                    Ok(_) => outcome.resolved.push(event.id),
                    Err(e) => warn!(event_id = %event.id, error = %e, "Failed to resolve event"),
                }
            } else {
                match self
                    .store
                    .escalate(event.id, format!("rule '{}' requires follow-up", rule.id))
                    .await
                {
                    Ok(escalated) => {
                        outcome.escalated.push(event.id);
                        self.alert_on_escalation(&escalated).await;
                    }
                    Err(e) => warn!(event_id = %event.id, error = %e, "Failed to escalate event"),
                }
            }
        }

        outcome
    }

    /// Sweep on the configured interval until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.settings.sweep_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let sweep = self.sweep().await;
                    if sweep.responses > 0 || !sweep.resolved.is_empty() {
                        debug!(
                            resolved = sweep.resolved.len(),
                            escalated = sweep.escalated.len(),
                            "Rule sweep finished"
                        );
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Rule engine stopped");
    }

    async fn apply_rule(&self, rule: &EventRule, event: &SystemEvent) -> EventResponse {
        let mut executed = Vec::with_capacity(rule.actions.len());

        for action in &rule.actions {
            if !action.immediate && action.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(action.delay_ms)).await;
            }

            let record = match self.dispatch(action, event).await {
                Ok(outcome) => ResponseAction {
                    action_type: action.action_type,
                    target: action.target.clone(),
                    success: true,
                    message: outcome.message,
                    requires_follow_up: outcome.requires_follow_up,
                    executed_at: Utc::now(),
                },
                Err(e) => {
                    warn!(
                        event_id = %event.id,
                        rule = %rule.id,
                        action = %action.action_type,
                        error = %e,
                        "Action failed"
                    );
                    ResponseAction {
                        action_type: action.action_type,
                        target: action.target.clone(),
                        success: false,
                        message: format!("{:#}", e),
                        requires_follow_up: true,
                        executed_at: Utc::now(),
                    }
                }
            };
            executed.push(record);
        }

        EventResponse::from_actions(event.id, rule.id.clone(), executed)
    }

    async fn dispatch(
        &self,
        action: &crate::domain::RuleAction,
        event: &SystemEvent,
    ) -> anyhow::Result<ActionOutcome> {
        let handler = self.handlers.read().await.get(&action.target).cloned();

        match action.action_type {
            ActionType::Log => {
                info!(event_id = %event.id, title = %event.title, target = %action.target, "Event logged");
                Ok(ActionOutcome::done("logged"))
            }
            ActionType::Notify => match handler {
                Some(h) => h.handle(action, event).await,
                None => {
                    info!(event_id = %event.id, contact = %action.target, "Notification sent");
                    Ok(ActionOutcome::done(format!("notified {}", action.target)))
                }
            },
            ActionType::Custom => match handler {
                Some(h) => h.handle(action, event).await,
                None => Err(anyhow!("no handler registered for '{}'", action.target)),
            },
            ActionType::Alert => {
                let contacts = match action.parameters.get("contacts") {
                    Some(v) => serde_json::from_value::<Vec<String>>(v.clone())
                        .context("invalid 'contacts' parameter")?,
                    None if action.target.is_empty() => Vec::new(),
                    None => vec![action.target.clone()],
                };
                let mut request = AlertRequest::new(event.severity, event.source.clone(), event.title.clone())
                    .with_contacts(contacts)
                    .with_message(event.description.clone());
                request.event_id = Some(event.id);
                self.send_alert(request).await?;
                Ok(ActionOutcome::done("alert raised"))
            }
            ActionType::Deploy => {
                let request = self.operation_request(action, event)?;
                let id = self.scheduler.plan(request).await;
                Ok(ActionOutcome::done(format!("planned operation {}", id)))
            }
            ActionType::Assign => {
                let responders = match action.parameters.get("responders") {
                    Some(v) => serde_json::from_value::<Vec<String>>(v.clone())
                        .context("invalid 'responders' parameter")?,
                    None => vec![action.target.clone()],
                };
                for responder in responders.iter().filter(|r| !r.is_empty()) {
                    self.store.assign(event.id, responder).await?;
                }
                Ok(ActionOutcome::done(format!("assigned {}", responders.join(", "))))
            }
            ActionType::Escalate => Ok(ActionOutcome::follow_up(format!(
                "escalation requested for {}",
                action.target
            ))),
        }
    }

    fn operation_request(
        &self,
        action: &crate::domain::RuleAction,
        event: &SystemEvent,
    ) -> anyhow::Result<OperationRequest> {
        let operation_type = action
            .param_str("operation_type")
            .unwrap_or(action.target.as_str())
            .to_string();
        if operation_type.is_empty() {
            anyhow::bail!("deploy action needs a target or 'operation_type'");
        }

        let priority = match action.parameters.get("priority") {
            Some(v) => serde_json::from_value::<OperationPriority>(v.clone())
                .context("invalid 'priority' parameter")?,
            None => priority_for(event.severity),
        };
        let duration = action
            .param_u64("duration_secs")
            .unwrap_or(self.settings.default_deploy_secs);

        let mut request = OperationRequest::new(operation_type, priority, duration);
        if let Some(v) = action.parameters.get("resources") {
            request.requirements = serde_json::from_value::<Vec<ResourceRequirement>>(v.clone())
                .context("invalid 'resources' parameter")?;
        }
        request.responders = event.assigned_responders.clone();
        request.source_event = Some(event.id);
        Ok(request)
    }

    async fn alert_on_escalation(&self, event: &SystemEvent) {
        if event.escalation_level < self.settings.alert_threshold_level {
            return;
        }
        let mut request = AlertRequest::new(
            event.severity,
            event.source.clone(),
            format!("Event escalated to level {}: {}", event.escalation_level, event.title),
        )
        .with_contacts(self.settings.escalation_contacts.clone())
        .with_message(event.description.clone());
        request.event_id = Some(event.id);

        if let Err(e) = self.send_alert(request).await {
            warn!(event_id = %event.id, error = %e, "Escalation alert not delivered");
        }
    }

    async fn send_alert(&self, request: AlertRequest) -> anyhow::Result<()> {
        let tx = self
            .alerts
            .as_ref()
            .ok_or_else(|| anyhow!("alert channel not configured"))?;
        tx.send(request)
            .await
            .map_err(|_| anyhow!("alert channel closed"))
    }
}

fn sorted(mut rules: Vec<EventRule>) -> Vec<EventRule> {
    rules.sort_by(|a, b| a.priority.cmp(&b.priority));
    rules
}

fn priority_for(severity: Severity) -> OperationPriority {
    match severity {
        Severity::Low => OperationPriority::Low,
        Severity::Medium => OperationPriority::Medium,
        Severity::High => OperationPriority::High,
        Severity::Critical | Severity::Emergency => OperationPriority::Critical,
    }
}
