//! Domain types for the orchestration core.
//!
//! This module contains the core data structures:
//! - Stage / Execution: pipeline definitions and run state
//! - Events / Rules: system events and the rules that respond to them
//! - Logistics: operations and the shared resources they reserve
//! - Alert: health alerts and escalation chains

pub mod alert;
pub mod events;
pub mod execution;
pub mod logistics;
pub mod rules;
pub mod stage;

// Re-export commonly used types
pub use alert::{AlertNotification, AlertRequest, HealthAlert};
pub use events::{
    EventDraft, EventStatus, EventTransition, EventType, ResolutionReason, Severity, SystemEvent,
    MAX_ESCALATION_LEVEL,
};
pub use execution::{ExecutionStatus, PipelineExecution};
pub use logistics::{
    LeaseState, LogisticsOperation, LogisticsResource, OperationPriority, OperationRequest,
    OperationStatus, ProgressStage, ProgressStatus, ResourceAvailability, ResourceHandle,
    ResourceLease, ResourceRequirement,
};
pub use rules::{ActionType, EventResponse, EventRule, ResponseAction, RuleAction, RuleCondition};
pub use stage::{PipelineStage, StageFailureKind, StageKind, StageResult};
