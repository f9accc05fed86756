//! Core orchestration logic.
//!
//! This module contains:
//! - Registry: pipeline definitions and processor bindings
//! - Executor: single-stage timeout and retry
//! - Runner: pipeline executions under a concurrency cap
//! - EventStore: event lifecycle and the JSONL audit log
//! - RuleEngine: first-match rule evaluation over pending events
//! - Scheduler: resource reservation and logistics operations
//! - Alerts: health alerts and escalation chains
//! - Context: the process-wide owner of all of the above

pub mod alerts;
pub mod context;
pub mod event_store;
pub mod executor;
pub mod registry;
pub mod rule_engine;
pub mod runner;
pub mod scheduler;

// Re-export commonly used types
pub use alerts::{AlertManager, AlertSettings, MetricThreshold};
pub use context::{CoreContext, CoreContextBuilder, SystemStatus};
pub use event_store::{AuditLog, AuditRecord, EventFilter, EventSink, EventStore, EventSummary};
pub use executor::{BackoffPolicy, StageExecutor};
pub use registry::{PipelineDefinition, RegisteredPipeline, StageRegistry};
pub use rule_engine::{RuleEngine, RuleEngineSettings, RuleSweep};
pub use runner::{fingerprint_input, PipelineRunner, PipelineSummary};
pub use scheduler::{
    OperationFilter, ReservationMode, ResourceScheduler, SchedulerSettings, SweepReport,
};
