//! Process-wide context.
//!
//! `CoreContext` is built once at startup from a [`ResolvedConfig`] and owns
//! every component. It exposes the transport-agnostic operations an external
//! binding (CLI, HTTP, RPC) calls, and spawns the background sweeps on
//! [`CoreContext::start`]. Shutdown cancels one token shared by every loop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapters::{ActionHandler, StageProcessor};
use crate::config::{CoreConfig, ResolvedConfig};
use crate::core::alerts::AlertManager;
use crate::core::event_store::{run_ingest, AuditLog, EventFilter, EventSink, EventStore, EventSummary};
use crate::core::executor::StageExecutor;
use crate::core::registry::StageRegistry;
use crate::core::rule_engine::RuleEngine;
use crate::core::runner::{PipelineRunner, PipelineSummary};
use crate::core::scheduler::{OperationFilter, ResourceScheduler};
use crate::domain::{
    AlertRequest, EventDraft, EventResponse, EventRule, EventStatus, EventTransition,
    HealthAlert, LogisticsOperation, LogisticsResource, OperationPriority, OperationRequest,
    PipelineExecution, ResolutionReason, ResourceAvailability, ResourceHandle, SystemEvent,
};
use crate::error::CoreResult;

/// Point-in-time view of the whole core
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub running_executions: usize,
    pub total_executions: usize,
    pub pending_events: usize,
    pub escalated_events: usize,
    pub executing_operations: usize,
    pub open_alerts: usize,
}

/// Builds a [`CoreContext`], optionally with extra processors and handlers
pub struct CoreContextBuilder {
    config: CoreConfig,
    audit_log: Option<PathBuf>,
    processors: Vec<(String, Arc<dyn StageProcessor>)>,
    handlers: Vec<(String, Arc<dyn ActionHandler>)>,
}

impl CoreContextBuilder {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            audit_log: None,
            processors: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn audit_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_log = Some(path.into());
        self
    }

    /// Bind a processor by name; takes precedence over configured processors
    pub fn processor(mut self, name: impl Into<String>, processor: Arc<dyn StageProcessor>) -> Self {
        self.processors.push((name.into(), processor));
        self
    }

    /// Bind a handler for `notify`/`custom` actions aimed at `target`
    pub fn handler(mut self, target: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        self.handlers.push((target.into(), handler));
        self
    }

    pub async fn build(self) -> Result<CoreContext> {
        let config = self.config;
        config.validate()?;

        let mut registry = StageRegistry::new();
        for (name, spec) in &config.processors {
            registry.register_processor(name.clone(), spec.build(name));
        }
        for (name, processor) in self.processors {
            registry.register_processor(name, processor);
        }
        for definition in config.pipelines.iter().cloned() {
            let id = definition.id.clone();
            registry
                .register(definition)
                .with_context(|| format!("Failed to register pipeline '{}'", id))?;
        }
        let registry = Arc::new(registry);

        let events = match &self.audit_log {
            Some(path) => Arc::new(EventStore::with_audit_log(AuditLog::open(path).await?)),
            None => Arc::new(EventStore::new()),
        };

        let (sink, event_rx) = EventSink::channel(config.limits.event_channel_capacity);
        let (alert_tx, alert_rx) = mpsc::channel(config.limits.alert_channel_capacity.max(1));

        let runner = Arc::new(
            PipelineRunner::new(
                registry,
                StageExecutor::new(config.retry.clone()),
                config.limits.max_concurrent_pipelines,
            )
            .with_events(sink.clone())
            .with_retention(config.limits.execution_retention_secs),
        );

        let scheduler = Arc::new(ResourceScheduler::new(
            config.scheduler.clone(),
            config.resources.clone(),
        ));

        let rules = Arc::new(
            RuleEngine::new(
                events.clone(),
                scheduler.clone(),
                config.rules.clone(),
                config.rule_engine.clone(),
            )
            .with_alerts(alert_tx),
        );
        for (target, handler) in self.handlers {
            rules.register_handler(target, handler).await;
        }

        let alerts = Arc::new(AlertManager::new(config.alerts.clone()));

        info!(
            pipelines = config.pipelines.len(),
            rules = config.rules.len(),
            resources = config.resources.len(),
            "Core context ready"
        );

        Ok(CoreContext {
            runner,
            events,
            rules,
            scheduler,
            alerts,
            sink,
            event_rx: Mutex::new(Some(event_rx)),
            alert_rx: Mutex::new(Some(alert_rx)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Owns every component of the core for the lifetime of the process
pub struct CoreContext {
    runner: Arc<PipelineRunner>,
    events: Arc<EventStore>,
    rules: Arc<RuleEngine>,
    scheduler: Arc<ResourceScheduler>,
    alerts: Arc<AlertManager>,
    sink: EventSink,
    event_rx: Mutex<Option<mpsc::Receiver<EventDraft>>>,
    alert_rx: Mutex<Option<mpsc::Receiver<AlertRequest>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CoreContext {
    pub fn builder(config: CoreConfig) -> CoreContextBuilder {
        CoreContextBuilder::new(config)
    }

    /// Build from a resolved configuration
    pub async fn from_config(resolved: &ResolvedConfig) -> Result<Self> {
        let mut builder = CoreContextBuilder::new(resolved.config.clone());
        if let Some(path) = &resolved.audit_log {
            builder = builder.audit_log(path.clone());
        }
        builder.build().await
    }

    /// Spawn the ingest drain, rule sweeps, scheduler sweeps, alert loops and
    /// execution pruning.
    ///
    /// Calling `start` twice does not spawn a second set of loops.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        let (Some(event_rx), Some(alert_rx)) = (
            self.event_rx.lock().await.take(),
            self.alert_rx.lock().await.take(),
        ) else {
            debug!("Background sweeps already started");
            return;
        };

        tasks.push(tokio::spawn(run_ingest(
            self.events.clone(),
            event_rx,
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(
            self.alerts.clone().run_listener(alert_rx, self.shutdown.clone()),
        ));
        tasks.push(tokio::spawn(self.rules.clone().run(self.shutdown.clone())));
        tasks.push(tokio::spawn(self.scheduler.clone().run(self.shutdown.clone())));
        tasks.push(tokio::spawn(self.alerts.clone().run(self.shutdown.clone())));
        tasks.push(tokio::spawn(self.runner.clone().run_retention(self.shutdown.clone())));
        info!(tasks = tasks.len(), "Background sweeps started");
    }

    /// Cancel running executions, stop every loop and wait for them
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.runner.cancel_all().await;
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                debug!(error = %e, "Background task ended abnormally");
            }
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn runner(&self) -> &Arc<PipelineRunner> {
        &self.runner
    }

    pub fn event_store(&self) -> &Arc<EventStore> {
        &self.events
    }

    pub fn rule_engine(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    pub fn scheduler(&self) -> &Arc<ResourceScheduler> {
        &self.scheduler
    }

    pub fn alert_manager(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    /// Producer handle for the bounded ingest channel
    pub fn event_sink(&self) -> EventSink {
        self.sink.clone()
    }

    // ------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------

    pub async fn execute_pipeline(&self, pipeline_id: &str, input: serde_json::Value) -> CoreResult<Uuid> {
        self.runner.execute(pipeline_id, input).await
    }

    pub async fn pipeline_status(&self, execution_id: Uuid) -> CoreResult<PipelineExecution> {
        self.runner.status(execution_id).await
    }

    pub async fn wait_pipeline(&self, execution_id: Uuid) -> CoreResult<PipelineExecution> {
        self.runner.wait(execution_id).await
    }

    pub async fn cancel_pipeline(&self, execution_id: Uuid) -> CoreResult<()> {
        self.runner.cancel(execution_id).await
    }

    pub fn list_pipelines(&self) -> Vec<PipelineSummary> {
        self.runner.pipelines()
    }

    pub async fn list_executions(&self) -> Vec<PipelineExecution> {
        self.runner.list().await
    }

    // ------------------------------------------------------------------
    // Events and rules
    // ------------------------------------------------------------------

    /// Always accepted; the event is stored as `pending`
    pub async fn submit_event(&self, draft: EventDraft) -> Uuid {
        self.events.submit(draft).await
    }

    pub async fn get_event(&self, event_id: Uuid) -> CoreResult<SystemEvent> {
        self.events.get(event_id).await
    }

    pub async fn list_events(&self, filter: &EventFilter) -> Vec<SystemEvent> {
        self.events.list(filter).await
    }

    /// Resolve by hand; 409 when already resolved
    pub async fn resolve_event(&self, event_id: Uuid, who: &str) -> CoreResult<SystemEvent> {
        self.events
            .resolve(event_id, ResolutionReason::Manual, Some(who))
            .await
    }

    pub async fn cancel_event(&self, event_id: Uuid) -> CoreResult<SystemEvent> {
        self.events.cancel(event_id).await
    }

    pub async fn event_history(&self, event_id: Uuid) -> CoreResult<Vec<EventTransition>> {
        self.events.get(event_id).await?;
        Ok(self.events.history(event_id).await)
    }

    pub async fn event_responses(&self, event_id: Uuid) -> CoreResult<Vec<EventResponse>> {
        self.events.get(event_id).await?;
        Ok(self.events.responses_for(event_id).await)
    }

    pub async fn event_summary(&self) -> EventSummary {
        self.events.summary().await
    }

    pub async fn list_rules(&self) -> Vec<EventRule> {
        self.rules.list_rules().await
    }

    pub async fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> CoreResult<EventRule> {
        self.rules.set_enabled(rule_id, enabled).await
    }

    // ------------------------------------------------------------------
    // Logistics
    // ------------------------------------------------------------------

    pub async fn plan_operation(&self, request: OperationRequest) -> Uuid {
        self.scheduler.plan(request).await
    }

    pub async fn list_operations(&self, filter: &OperationFilter) -> Vec<LogisticsOperation> {
        self.scheduler.operations(filter).await
    }

    pub async fn get_operation(&self, operation_id: Uuid) -> CoreResult<LogisticsOperation> {
        self.scheduler.operation(operation_id).await
    }

    pub async fn cancel_operation(&self, operation_id: Uuid) -> CoreResult<LogisticsOperation> {
        self.scheduler.cancel(operation_id).await
    }

    pub async fn fail_operation(&self, operation_id: Uuid, reason: &str) -> CoreResult<LogisticsOperation> {
        self.scheduler.fail(operation_id, reason).await
    }

    pub async fn archived_operations(&self) -> Vec<LogisticsOperation> {
        self.scheduler.archived().await
    }

    pub async fn list_resources(&self) -> Vec<LogisticsResource> {
        self.scheduler.resources().await
    }

    pub async fn set_resource_availability(
        &self,
        resource_id: &str,
        availability: ResourceAvailability,
    ) -> CoreResult<LogisticsResource> {
        self.scheduler.set_availability(resource_id, availability).await
    }

    pub async fn reserve(
        &self,
        kind: &str,
        units: u32,
        priority: OperationPriority,
    ) -> CoreResult<Vec<ResourceHandle>> {
        self.scheduler.reserve(kind, units, priority).await
    }

    pub async fn release(&self, handle: &ResourceHandle) -> CoreResult<bool> {
        self.scheduler.release(handle).await
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    pub async fn raise_alert(&self, request: AlertRequest) -> Uuid {
        self.alerts.raise(request).await
    }

    pub async fn acknowledge_alert(&self, alert_id: Uuid, who: &str) -> CoreResult<HealthAlert> {
        self.alerts.acknowledge(alert_id, who).await
    }

    pub async fn resolve_alert(&self, alert_id: Uuid, who: &str) -> CoreResult<HealthAlert> {
        self.alerts.resolve(alert_id, who).await
    }

    pub async fn list_alerts(&self, open_only: bool) -> Vec<HealthAlert> {
        self.alerts.list(open_only).await
    }

    pub async fn record_metric(&self, component: &str, metric: &str, value: f64) -> Option<Uuid> {
        self.alerts.record_metric(component, metric, value).await
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub async fn status(&self) -> SystemStatus {
        SystemStatus {
            running_executions: self.runner.running_count(),
            total_executions: self.runner.list().await.len(),
            pending_events: self.events.count_with_status(EventStatus::Pending).await,
            escalated_events: self.events.count_with_status(EventStatus::Escalated).await,
            executing_operations: self.scheduler.executing_count().await,
            open_alerts: self.alerts.open_count().await,
        }
    }
}
