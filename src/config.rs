//! Configuration for the stormcore process.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STORMCORE_HOME, STORMCORE_MAX_PIPELINES)
//! 2. Config file: $STORMCORE_CONFIG, else .stormcore/config.yaml found in
//!    the current directory or one of its parents
//! 3. Defaults (~/.stormcore, three concurrent pipelines, no audit log)
//!
//! Paths in the config file are relative to the directory holding it.
//! Configuration is loaded once by the binary and handed to
//! [`CoreContext`](crate::core::CoreContext); nothing here is global.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::ProcessorSpec;
use crate::core::alerts::AlertSettings;
use crate::core::executor::BackoffPolicy;
use crate::core::registry::PipelineDefinition;
use crate::core::rule_engine::RuleEngineSettings;
use crate::core::runner::DEFAULT_EXECUTION_RETENTION_SECS;
use crate::core::scheduler::SchedulerSettings;
use crate::domain::{EventRule, LogisticsResource};

pub const CONFIG_ENV: &str = "STORMCORE_CONFIG";
pub const HOME_ENV: &str = "STORMCORE_HOME";
pub const MAX_PIPELINES_ENV: &str = "STORMCORE_MAX_PIPELINES";

/// Config file schema (matches YAML structure)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    /// Backoff between stage retries
    #[serde(default)]
    pub retry: BackoffPolicy,

    #[serde(default)]
    pub rule_engine: RuleEngineSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub alerts: AlertSettings,

    /// Named processors stages can bind to
    #[serde(default)]
    pub processors: BTreeMap<String, ProcessorSpec>,

    #[serde(default)]
    pub pipelines: Vec<PipelineDefinition>,

    #[serde(default)]
    pub rules: Vec<EventRule>,

    /// Shared resources. Usage is derived from leases at runtime, so
    /// `current_usage` and `leases` must be left out.
    #[serde(default)]
    pub resources: Vec<LogisticsResource>,
}

fn default_version() -> String {
    "1".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            paths: PathsConfig::default(),
            limits: LimitsConfig::default(),
            retry: BackoffPolicy::default(),
            rule_engine: RuleEngineSettings::default(),
            scheduler: SchedulerSettings::default(),
            alerts: AlertSettings::default(),
            processors: BTreeMap::new(),
            pipelines: Vec::new(),
            rules: Vec::new(),
            resources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to the config file)
    pub home: Option<String>,

    /// JSONL audit log; relative paths resolve against the config file
    pub audit_log: Option<String>,

    /// Write the audit log to `<home>/events.jsonl` when no path is given
    #[serde(default)]
    pub audit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Pipeline executions allowed to run at once
    #[serde(default = "default_max_pipelines")]
    pub max_concurrent_pipelines: usize,

    /// Capacity of the bounded event ingest channel
    #[serde(default = "default_event_channel")]
    pub event_channel_capacity: usize,

    /// Capacity of the bounded rule engine -> alert manager channel
    #[serde(default = "default_alert_channel")]
    pub alert_channel_capacity: usize,

    /// Seconds a finished execution stays queryable before it is dropped
    #[serde(default = "default_execution_retention")]
    pub execution_retention_secs: u64,
}

fn default_max_pipelines() -> usize {
    3
}
fn default_event_channel() -> usize {
    256
}
fn default_alert_channel() -> usize {
    64
}
fn default_execution_retention() -> u64 {
    DEFAULT_EXECUTION_RETENTION_SECS
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_pipelines: default_max_pipelines(),
            event_channel_capacity: default_event_channel(),
            alert_channel_capacity: default_alert_channel(),
            execution_retention_secs: default_execution_retention(),
        }
    }
}

impl CoreConfig {
    /// Parse a config from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse config YAML")
    }

    /// Reject settings no component can run with
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_concurrent_pipelines == 0 {
            anyhow::bail!("limits.max_concurrent_pipelines must be at least 1");
        }
        if self.scheduler.max_concurrent_operations == 0 {
            anyhow::bail!("scheduler.max_concurrent_operations must be at least 1");
        }
        for name in self.processors.keys() {
            if name.is_empty() {
                anyhow::bail!("processor names cannot be empty");
            }
        }
        let mut resource_ids = HashSet::new();
        for resource in &self.resources {
            if !resource_ids.insert(resource.id.as_str()) {
                anyhow::bail!("resource '{}' is defined more than once", resource.id);
            }
            if resource.current_usage != 0 || !resource.leases.is_empty() {
                anyhow::bail!(
                    "resource '{}': current_usage and leases are runtime state and cannot be configured",
                    resource.id
                );
            }
        }
        Ok(())
    }
}

/// Configuration with env overrides applied and paths made absolute
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: CoreConfig,
    /// State directory
    pub home: PathBuf,
    /// Audit log file, when auditing is enabled
    pub audit_log: Option<PathBuf>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

/// Find `.stormcore/config.yaml` in `start` or any of its parents
pub fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".stormcore").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse a config file
pub fn load_config_file(path: &Path) -> Result<CoreConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Load configuration from the environment and the discovered config file
pub fn load() -> Result<ResolvedConfig> {
    let config_file = match std::env::var(CONFIG_ENV) {
        Ok(path) => Some(PathBuf::from(path)),
        Err(_) => std::env::current_dir()
            .ok()
            .and_then(|cwd| find_config_file(&cwd)),
    };

    let config = match &config_file {
        Some(path) => load_config_file(path)?,
        None => CoreConfig::default(),
    };

    resolve(config, config_file, |key| std::env::var(key).ok())
}

/// Load an explicit config file, still honouring env overrides
pub fn load_from(path: &Path) -> Result<ResolvedConfig> {
    let config = load_config_file(path)?;
    resolve(config, Some(path.to_path_buf()), |key| std::env::var(key).ok())
}

/// Apply env overrides (looked up through `env`) and resolve paths
pub fn resolve(
    mut config: CoreConfig,
    config_file: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let home = if let Some(env_home) = env(HOME_ENV) {
        PathBuf::from(env_home)
    } else if let Some(home_path) = &config.paths.home {
        resolve_path(&base_dir, home_path)
    } else {
        dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".stormcore")
    };

    if let Some(raw) = env(MAX_PIPELINES_ENV) {
        config.limits.max_concurrent_pipelines = raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a positive integer, got '{}'", MAX_PIPELINES_ENV, raw))?;
    }

    let audit_log = match &config.paths.audit_log {
        Some(path) => Some(resolve_path(&base_dir, path)),
        None if config.paths.audit => Some(home.join("events.jsonl")),
        None => None,
    };

    config.validate()?;

    Ok(ResolvedConfig {
        config,
        home,
        audit_log,
        config_file,
    })
}
