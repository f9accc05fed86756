//! Pipeline execution state.
//!
//! A PipelineExecution represents a single run of a registered pipeline.
//! It is owned by the runner task that drives it; everyone else only ever
//! sees cloned snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::StageResult;
use crate::error::{CoreError, CoreResult};

/// A single run of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    /// Unique identifier for this execution
    pub id: Uuid,

    /// Pipeline being executed
    pub pipeline_id: String,

    /// Fingerprint of the input payload
    pub input_hash: String,

    pub status: ExecutionStatus,

    /// When the execution was requested
    pub created_at: DateTime<Utc>,

    /// When the first stage was started
    pub started_at: Option<DateTime<Utc>>,

    /// When a terminal status was reached
    pub completed_at: Option<DateTime<Utc>>,

    /// Results keyed by stage id
    pub stage_results: BTreeMap<String, StageResult>,

    /// Stages in the order they were started
    pub started_stages: Vec<String>,

    /// First stage that failed, if any
    pub failed_stage: Option<String>,

    /// Terminal error text, if any
    pub error: Option<String>,
}

impl PipelineExecution {
    /// Create a pending execution
    pub fn new(id: Uuid, pipeline_id: impl Into<String>, input_hash: String) -> Self {
        Self {
            id,
            pipeline_id: pipeline_id.into(),
            input_hash,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            stage_results: BTreeMap::new(),
            started_stages: Vec::new(),
            failed_stage: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move `pending -> running`
    pub fn start(&mut self) -> CoreResult<()> {
        self.transition(ExecutionStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record that a stage has been started
    pub fn stage_started(&mut self, stage_id: &str) {
        if !self.is_terminal() {
            self.started_stages.push(stage_id.to_string());
        }
    }

    /// Record a stage result; ignored once the execution is terminal
    pub fn record_stage(&mut self, result: StageResult) {
        if !self.is_terminal() {
            self.stage_results.insert(result.stage_id.clone(), result);
        }
    }

    pub fn complete(&mut self) -> CoreResult<()> {
        self.transition(ExecutionStatus::Completed)
    }

    pub fn fail(&mut self, stage_id: Option<&str>, error: impl Into<String>) -> CoreResult<()> {
        self.transition(ExecutionStatus::Failed)?;
        self.failed_stage = stage_id.map(str::to_string);
        self.error = Some(error.into());
        Ok(())
    }

    pub fn cancel(&mut self) -> CoreResult<()> {
        self.transition(ExecutionStatus::Cancelled)
    }

    /// Whether a stage produced a successful result in this execution
    pub fn stage_succeeded(&self, stage_id: &str) -> bool {
        self.stage_results
            .get(stage_id)
            .map(|r| r.success)
            .unwrap_or(false)
    }

    fn transition(&mut self, to: ExecutionStatus) -> CoreResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                kind: "execution",
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// Lifecycle of a pipeline execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn can_transition_to(self, to: Self) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_lifecycle() {
        let mut exec = PipelineExecution::new(Uuid::new_v4(), "ingest", "abc".into());
        assert_eq!(exec.status, ExecutionStatus::Pending);

        exec.start().unwrap();
        exec.complete().unwrap();

        assert!(exec.is_terminal());
        assert!(exec.completed_at.is_some());
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut exec = PipelineExecution::new(Uuid::new_v4(), "ingest", "abc".into());
        exec.start().unwrap();
        exec.fail(Some("security"), "boom").unwrap();

        assert!(exec.complete().is_err());
        assert!(exec.cancel().is_err());
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.failed_stage.as_deref(), Some("security"));
    }

    #[test]
    fn test_results_ignored_after_terminal() {
        let mut exec = PipelineExecution::new(Uuid::new_v4(), "ingest", "abc".into());
        exec.start().unwrap();
        exec.cancel().unwrap();

        exec.record_stage(super::super::StageResult::succeeded(
            "late",
            serde_json::json!(null),
            5,
            0,
        ));
        assert!(exec.stage_results.is_empty());
    }
}
