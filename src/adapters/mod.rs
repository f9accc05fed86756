//! Pluggable integrations for stages and rule actions.
//!
//! The orchestration core never performs real work itself: every stage is
//! bound to a [`StageProcessor`] and rule actions may be routed to an
//! [`ActionHandler`]. Production deployments plug real integrations in here;
//! tests plug in deterministic fakes.

pub mod builtin;
pub mod command;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{RuleAction, StageKind, SystemEvent};

pub use builtin::{PassthroughProcessor, RequireFieldsProcessor};
pub use command::CommandProcessor;

/// Context handed to a processor for one attempt
#[derive(Debug, Clone)]
pub struct StageContext {
    pub execution_id: Uuid,
    pub pipeline_id: String,
    pub stage_id: String,
    pub stage_kind: StageKind,
    /// 1-indexed attempt number
    pub attempt: u32,
    /// The input the whole pipeline was started with
    pub pipeline_input: serde_json::Value,
    /// Outputs of completed upstream stages
    pub upstream: HashMap<String, serde_json::Value>,
}

/// Unit of work bound to a pipeline stage
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// Human-readable processor name
    fn name(&self) -> &str;

    /// Run one attempt. Attempts must not rely on state from earlier attempts.
    async fn process(
        &self,
        ctx: &StageContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value>;
}

/// What an action handler reports back
#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    pub message: String,
    /// The event needs further attention even though the action succeeded
    pub requires_follow_up: bool,
}

impl ActionOutcome {
    pub fn done(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            requires_follow_up: false,
        }
    }

    pub fn follow_up(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            requires_follow_up: true,
        }
    }
}

/// Handler for `notify` and `custom` rule actions, looked up by target
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, action: &RuleAction, event: &SystemEvent) -> Result<ActionOutcome>;
}

/// Declarative processor binding, as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorSpec {
    Passthrough,
    RequireFields { fields: Vec<String> },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl ProcessorSpec {
    /// Instantiate the processor this binding describes
    pub fn build(&self, name: &str) -> Arc<dyn StageProcessor> {
        match self {
            Self::Passthrough => Arc::new(PassthroughProcessor),
            Self::RequireFields { fields } => {
                Arc::new(RequireFieldsProcessor::new(name, fields.clone()))
            }
            Self::Command { program, args } => {
                Arc::new(CommandProcessor::new(name, program.clone(), args.clone()))
            }
        }
    }
}
