//! Pipeline stages and their per-attempt results.
//!
//! A stage is one unit of pipeline work. Stages are declared once at
//! startup and never change afterwards; every run produces a fresh
//! [`StageResult`] per stage.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A single stage in a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    /// Stage identity (unique within its pipeline)
    pub id: String,

    /// What kind of work the stage performs
    #[serde(default)]
    pub kind: StageKind,

    /// Declared execution order, used to break ties between independent stages
    #[serde(default)]
    pub order: u32,

    /// Disabled stages are skipped and count as satisfied dependencies
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Per-attempt timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Retries allowed after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Stages that must succeed before this one runs
    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    /// Name of the processor bound to this stage
    #[serde(default = "default_processor")]
    pub processor: String,
}

fn default_enabled() -> bool {
    true
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    2
}
fn default_processor() -> String {
    "passthrough".to_string()
}

impl PipelineStage {
    /// Create an enabled stage with default timeout and retries
    pub fn new(id: impl Into<String>, kind: StageKind) -> Self {
        Self {
            id: id.into(),
            kind,
            order: 0,
            enabled: true,
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            depends_on: BTreeSet::new(),
            processor: default_processor(),
        }
    }

    pub fn with_processor(mut self, processor: impl Into<String>) -> Self {
        self.processor = processor.into();
        self
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    pub fn depends_on(mut self, stage_id: impl Into<String>) -> Self {
        self.depends_on.insert(stage_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Per-attempt timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Kinds of pipeline stages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Input,
    #[default]
    Transform,
    Validate,
    Process,
    Output,
    Security,
}

/// Why a stage attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageFailureKind {
    Timeout,
    Processor,
    Cancelled,
}

/// Outcome of running one stage (across all of its attempts)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_id: String,

    pub success: bool,

    /// Output payload of the successful attempt
    pub output: Option<serde_json::Value>,

    /// Error text of the last failed attempt
    pub error: Option<String>,

    pub failure: Option<StageFailureKind>,

    /// Wall-clock duration across all attempts, in milliseconds
    pub duration_ms: u64,

    /// Retries performed after the first attempt
    pub retries_used: u32,

    /// Stage was disabled and not executed
    #[serde(default)]
    pub skipped: bool,
}

impl StageResult {
    pub fn succeeded(
        stage_id: impl Into<String>,
        output: serde_json::Value,
        duration_ms: u64,
        retries_used: u32,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            success: true,
            output: Some(output),
            error: None,
            failure: None,
            duration_ms,
            retries_used,
            skipped: false,
        }
    }

    pub fn failed(
        stage_id: impl Into<String>,
        failure: StageFailureKind,
        error: impl Into<String>,
        duration_ms: u64,
        retries_used: u32,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            success: false,
            output: None,
            error: Some(error.into()),
            failure: Some(failure),
            duration_ms,
            retries_used,
            skipped: false,
        }
    }

    /// A disabled stage forwards its input untouched
    pub fn skipped(stage_id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            stage_id: stage_id.into(),
            success: true,
            output: Some(input),
            error: None,
            failure: None,
            duration_ms: 0,
            retries_used: 0,
            skipped: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_yaml_defaults() {
        let stage: PipelineStage = serde_yaml::from_str("id: scan\nkind: security\n").unwrap();

        assert_eq!(stage.kind, StageKind::Security);
        assert!(stage.enabled);
        assert_eq!(stage.max_retries, 2);
        assert_eq!(stage.timeout(), Duration::from_secs(30));
        assert_eq!(stage.processor, "passthrough");
        assert!(stage.depends_on.is_empty());
    }

    #[test]
    fn test_skipped_result_forwards_input() {
        let result = StageResult::skipped("enrich", serde_json::json!({"a": 1}));
        assert!(result.success);
        assert!(result.skipped);
        assert_eq!(result.output, Some(serde_json::json!({"a": 1})));
    }
}
