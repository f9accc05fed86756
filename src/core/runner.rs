//! Pipeline runner.
//!
//! Coordinates pipeline executions:
//! - admission against the concurrency cap (reject, never queue)
//! - stage ordering and input threading
//! - fail-fast on the first failed stage
//! - cooperative cancellation
//! - lifecycle events fed to the event ingest channel
//!
//! Each execution is driven by its own task. That task is the only writer of
//! the execution's state; everyone else reads snapshots from a watch channel.
//! Terminal executions are kept for the retention window, then dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::StageContext;
use crate::core::event_store::EventSink;
use crate::core::executor::StageExecutor;
use crate::core::registry::{RegisteredPipeline, StageRegistry};
use crate::core::scheduler::after_secs;
use crate::domain::{
    EventDraft, EventType, PipelineExecution, PipelineStage, Severity, StageKind, StageResult,
};
use crate::error::{CoreError, CoreResult};

/// Default time a terminal execution stays queryable
pub const DEFAULT_EXECUTION_RETENTION_SECS: u64 = 3600;

const PRUNE_INTERVAL: Duration = Duration::from_secs(10);

/// Short fingerprint of an execution input
pub fn fingerprint_input(input: &Value) -> String {
    let bytes = serde_json::to_vec(input).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    hex::encode(&digest[..8])
}

/// Registered pipeline as reported by `pipeline.list`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSummary {
    pub id: String,
    pub description: String,
    pub stages: Vec<String>,
}

struct ExecutionEntry {
    updates: Arc<watch::Sender<PipelineExecution>>,
    cancel: CancellationToken,
}

/// How a drive loop ended
enum Outcome {
    Completed,
    Failed {
        stage: Option<String>,
        kind: Option<StageKind>,
        error: String,
    },
    Cancelled,
}

pub struct PipelineRunner {
    registry: Arc<StageRegistry>,
    executor: StageExecutor,
    executions: RwLock<HashMap<Uuid, ExecutionEntry>>,
    permits: Arc<Semaphore>,
    limit: usize,
    retention_secs: u64,
    events: Option<EventSink>,
}

impl PipelineRunner {
    pub fn new(registry: Arc<StageRegistry>, executor: StageExecutor, limit: usize) -> Self {
        Self {
            registry,
            executor,
            executions: RwLock::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            retention_secs: DEFAULT_EXECUTION_RETENTION_SECS,
            events: None,
        }
    }

    /// Keep terminal executions for `secs` after they finish
    pub fn with_retention(mut self, secs: u64) -> Self {
        self.retention_secs = secs;
        self
    }

    /// Send lifecycle and stage-produced events to `sink`
    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Registered pipelines with their stage order
    pub fn pipelines(&self) -> Vec<PipelineSummary> {
        self.registry
            .pipeline_ids()
            .into_iter()
            .filter_map(|id| self.registry.get(&id).ok())
            .map(|p| PipelineSummary {
                id: p.id().to_string(),
                description: p.definition.description.clone(),
                stages: p.stage_order(),
            })
            .collect()
    }

    /// Start a pipeline; returns as soon as the execution is admitted.
    ///
    /// Unknown pipelines are rejected before the concurrency cap is checked.
    /// A rejected request creates no execution.
    #[instrument(skip(self, input))]
    pub async fn execute(&self, pipeline_id: &str, input: Value) -> CoreResult<Uuid> {
        let pipeline = self.registry.get(pipeline_id)?;

        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| CoreError::Saturated { limit: self.limit })?;

        let id = Uuid::new_v4();
        let execution = PipelineExecution::new(id, pipeline_id, fingerprint_input(&input));
        let (updates, _) = watch::channel(execution);
        let updates = Arc::new(updates);
        let cancel = CancellationToken::new();

        self.executions.write().await.insert(
            id,
            ExecutionEntry {
                updates: updates.clone(),
                cancel: cancel.clone(),
            },
        );
        info!(execution_id = %id, pipeline = %pipeline_id, "Execution admitted");

        let driver = Driver {
            registry: self.registry.clone(),
            executor: self.executor.clone(),
            events: self.events.clone(),
            pipeline,
            updates,
            cancel,
        };
        tokio::spawn(driver.run(input, permit));

        Ok(id)
    }

    pub async fn status(&self, execution_id: Uuid) -> CoreResult<PipelineExecution> {
        self.executions
            .read()
            .await
            .get(&execution_id)
            .map(|e| e.updates.borrow().clone())
            .ok_or_else(|| CoreError::unknown("execution", execution_id))
    }

    /// Snapshot stream for one execution
    pub async fn subscribe(&self, execution_id: Uuid) -> CoreResult<watch::Receiver<PipelineExecution>> {
        self.executions
            .read()
            .await
            .get(&execution_id)
            .map(|e| e.updates.subscribe())
            .ok_or_else(|| CoreError::unknown("execution", execution_id))
    }

    /// Wait until the execution reaches a terminal status
    pub async fn wait(&self, execution_id: Uuid) -> CoreResult<PipelineExecution> {
        let mut rx = self.subscribe(execution_id).await?;
        let terminal = rx
            .wait_for(|e| e.is_terminal())
            .await
            .map(|e| (*e).clone())
            .map_err(|_| CoreError::unknown("execution", execution_id))?;
        Ok(terminal)
    }

    /// Request cooperative cancellation
    pub async fn cancel(&self, execution_id: Uuid) -> CoreResult<()> {
        let executions = self.executions.read().await;
        let entry = executions
            .get(&execution_id)
            .ok_or_else(|| CoreError::unknown("execution", execution_id))?;

        let current = entry.updates.borrow().status;
        if current.is_terminal() {
            return Err(CoreError::InvalidTransition {
                kind: "execution",
                id: execution_id.to_string(),
                from: current.to_string(),
                to: "cancelled".to_string(),
            });
        }

        info!(execution_id = %execution_id, "Cancellation requested");
        entry.cancel.cancel();
        Ok(())
    }

    /// Every retained execution, newest first
    pub async fn list(&self) -> Vec<PipelineExecution> {
        let mut all: Vec<PipelineExecution> = self
            .executions
            .read()
            .await
            .values()
            .map(|e| e.updates.borrow().clone())
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Executions admitted and not yet terminal
    pub fn running_count(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    /// Cancel everything still running
    pub async fn cancel_all(&self) {
        for entry in self.executions.read().await.values() {
            entry.cancel.cancel();
        }
    }

    /// Drop terminal executions whose retention window has passed
    pub async fn prune_at(&self, now: DateTime<Utc>) -> usize {
        let retention_secs = self.retention_secs;
        let mut executions = self.executions.write().await;
        let before = executions.len();
        executions.retain(|_, entry| {
            let execution = entry.updates.borrow();
            let expired = execution.is_terminal()
                && execution
                    .completed_at
                    .and_then(|done| after_secs(done, retention_secs))
                    .map_or(false, |drop_at| now >= drop_at);
            !expired
        });
        let pruned = before - executions.len();
        if pruned > 0 {
            debug!(pruned, "Pruned finished executions");
        }
        pruned
    }

    /// Prune periodically until `shutdown` fires
    pub async fn run_retention(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.prune_at(Utc::now()).await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Execution retention stopped");
    }
}

/// Everything one execution task needs
struct Driver {
    registry: Arc<StageRegistry>,
    executor: StageExecutor,
    events: Option<EventSink>,
    pipeline: Arc<RegisteredPipeline>,
    updates: Arc<watch::Sender<PipelineExecution>>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(self, input: Value, permit: OwnedSemaphorePermit) {
        let execution_id = self.updates.borrow().id;
        self.updates.send_modify(|e| {
            if let Err(err) = e.start() {
                error!(execution_id = %e.id, error = %err, "Execution could not start");
            }
        });

        let outcome = self.drive(execution_id, &input).await;

        // Free the slot before publishing the terminal status
        drop(permit);
        self.finish(execution_id, outcome).await;
    }

    async fn drive(&self, execution_id: Uuid, input: &Value) -> Outcome {
        let mut outputs: HashMap<String, Value> = HashMap::new();

        for stage in self.pipeline.ordered_stages() {
            if self.cancel.is_cancelled() {
                return Outcome::Cancelled;
            }

            if let Some(dep) = stage.depends_on.iter().find(|d| !outputs.contains_key(*d)) {
                let err = CoreError::DependencyFailed {
                    stage: stage.id.clone(),
                    dependency: dep.clone(),
                };
                return Outcome::Failed {
                    stage: Some(stage.id.clone()),
                    kind: Some(stage.kind),
                    error: err.to_string(),
                };
            }

            let stage_input = thread_input(stage, input, &outputs);

            if !stage.enabled {
                debug!(execution_id = %execution_id, stage = %stage.id, "Stage disabled, skipping");
                outputs.insert(stage.id.clone(), stage_input.clone());
                self.updates
                    .send_modify(|e| e.record_stage(StageResult::skipped(stage.id.clone(), stage_input)));
                continue;
            }

            let processor = match self.registry.processor(&stage.processor) {
                Ok(p) => p,
                Err(e) => {
                    return Outcome::Failed {
                        stage: Some(stage.id.clone()),
                        kind: Some(stage.kind),
                        error: e.to_string(),
                    }
                }
            };

            self.updates.send_modify(|e| e.stage_started(&stage.id));
            info!(execution_id = %execution_id, stage = %stage.id, processor = %processor.name(), "Stage started");

            let ctx = StageContext {
                execution_id,
                pipeline_id: self.pipeline.id().to_string(),
                stage_id: stage.id.clone(),
                stage_kind: stage.kind,
                attempt: 0,
                pipeline_input: input.clone(),
                upstream: stage
                    .depends_on
                    .iter()
                    .filter_map(|d| outputs.get(d).map(|v| (d.clone(), v.clone())))
                    .collect(),
            };

            let result = self
                .executor
                .run(stage, processor.as_ref(), stage_input, ctx, &self.cancel)
                .await;

            if self.cancel.is_cancelled() {
                debug!(execution_id = %execution_id, stage = %stage.id, "Discarding result of cancelled execution");
                return Outcome::Cancelled;
            }

            if result.success {
                let output = result.output.clone().unwrap_or(Value::Null);
                self.updates.send_modify(|e| e.record_stage(result));
                self.emit_stage_events(stage, &output).await;
                outputs.insert(stage.id.clone(), output);
            } else {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "stage failed".to_string());
                self.updates.send_modify(|e| e.record_stage(result));
                return Outcome::Failed {
                    stage: Some(stage.id.clone()),
                    kind: Some(stage.kind),
                    error,
                };
            }
        }

        Outcome::Completed
    }

    async fn finish(&self, execution_id: Uuid, outcome: Outcome) {
        let pipeline_id = self.pipeline.id().to_string();

        let draft = match &outcome {
            Outcome::Completed => {
                self.updates.send_modify(|e| {
                    if let Err(err) = e.complete() {
                        warn!(execution_id = %e.id, error = %err, "Ignoring completion");
                    }
                });
                info!(execution_id = %execution_id, pipeline = %pipeline_id, "Execution completed");
                Some(
                    EventDraft::new(
                        EventType::System,
                        Severity::Low,
                        format!("Pipeline '{}' completed", pipeline_id),
                    )
                    .with_data(serde_json::json!({ "execution_id": execution_id })),
                )
            }
            Outcome::Failed { stage, kind, error } => {
                self.updates.send_modify(|e| {
                    if let Err(err) = e.fail(stage.as_deref(), error.clone()) {
                        warn!(execution_id = %e.id, error = %err, "Ignoring failure");
                    }
                });
                error!(
                    execution_id = %execution_id,
                    pipeline = %pipeline_id,
                    stage = stage.as_deref().unwrap_or("-"),
                    error = %error,
                    "Execution failed"
                );
                let severity = if *kind == Some(StageKind::Security) {
                    Severity::Critical
                } else {
                    Severity::High
                };
                let mut draft = EventDraft::new(
                    EventType::System,
                    severity,
                    format!("Pipeline '{}' failed", pipeline_id),
                )
                .with_description(error.clone())
                .with_data(serde_json::json!({
                    "execution_id": execution_id,
                    "failed_stage": stage,
                }));
                if let Some(stage) = stage {
                    draft = draft.affecting(stage.clone());
                }
                Some(draft)
            }
            Outcome::Cancelled => {
                self.updates.send_modify(|e| {
                    if let Err(err) = e.cancel() {
                        warn!(execution_id = %e.id, error = %err, "Ignoring cancellation");
                    }
                });
                info!(execution_id = %execution_id, pipeline = %pipeline_id, "Execution cancelled");
                None
            }
        };

        if let Some(draft) = draft {
            self.emit(draft.with_source(format!("pipeline:{}", pipeline_id)))
                .await;
        }
    }

    /// Submit drafts listed under an `events` array in a stage output
    async fn emit_stage_events(&self, stage: &PipelineStage, output: &Value) {
        let Some(drafts) = output.get("events").and_then(Value::as_array) else {
            return;
        };
        for raw in drafts {
            match serde_json::from_value::<EventDraft>(raw.clone()) {
                Ok(mut draft) => {
                    if draft.source.is_empty() {
                        draft.source = format!("pipeline:{}/{}", self.pipeline.id(), stage.id);
                    }
                    self.emit(draft).await;
                }
                Err(e) => {
                    warn!(stage = %stage.id, error = %e, "Ignoring malformed event in stage output");
                }
            }
        }
    }

    async fn emit(&self, draft: EventDraft) {
        if let Some(sink) = &self.events {
            sink.emit(draft).await;
        }
    }
}

/// Input for a stage: the pipeline input, its single dependency's output, or
/// an object keyed by dependency id
fn thread_input(stage: &PipelineStage, pipeline_input: &Value, outputs: &HashMap<String, Value>) -> Value {
    match stage.depends_on.len() {
        0 => pipeline_input.clone(),
        1 => stage
            .depends_on
            .iter()
            .next()
            .and_then(|d| outputs.get(d))
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Object(
            stage
                .depends_on
                .iter()
                .map(|d| (d.clone(), outputs.get(d).cloned().unwrap_or(Value::Null)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = fingerprint_input(&json!({"zone": "north", "level": 3}));
        let b = fingerprint_input(&json!({"zone": "north", "level": 3}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, fingerprint_input(&json!({"zone": "south", "level": 3})));
    }

    #[test]
    fn test_thread_input() {
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), json!(1));
        outputs.insert("b".to_string(), json!(2));
        let input = json!("raw");

        let root = PipelineStage::new("root", StageKind::Input);
        assert_eq!(thread_input(&root, &input, &outputs), json!("raw"));

        let single = PipelineStage::new("s", StageKind::Transform).depends_on("a");
        assert_eq!(thread_input(&single, &input, &outputs), json!(1));

        let join = PipelineStage::new("j", StageKind::Output)
            .depends_on("a")
            .depends_on("b");
        assert_eq!(thread_input(&join, &input, &outputs), json!({"a": 1, "b": 2}));
    }
}
