//! stormcore - staged pipeline executor with a rule-driven event engine
//!
//! A single-process orchestration core. Pipelines of stages run under
//! dependency, timeout and retry constraints; their output becomes events
//! that rules react to with prioritized actions, escalation, health alerts
//! and shared-resource reservation.
//!
//! # Modules
//!
//! - `adapters`: Stage processors and action handlers (the pluggable edges)
//! - `core`: Orchestration logic (runner, event store, rules, scheduler, alerts)
//! - `domain`: Data structures (stages, executions, events, rules, logistics)
//! - `config`: YAML configuration and discovery
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline once
//! echo '{"zone": "north"}' | stormcore run threat-scan
//!
//! # Check a config file
//! stormcore --config .stormcore/config.yaml validate
//!
//! # Serve, feeding events as JSON lines
//! stormcore serve < events.jsonl
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use crate::config::{CoreConfig, ResolvedConfig};
pub use crate::core::{CoreContext, PipelineRunner};
pub use domain::{EventDraft, PipelineExecution, SystemEvent};
pub use error::{CoreError, CoreResult};
