//! Pipeline definitions and the registry that holds them.
//!
//! Pipelines are defined in YAML and consist of stages with declared
//! dependencies. Registration validates the dependency graph and computes a
//! topological order once; cycles are rejected here, never at run time.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapters::{PassthroughProcessor, StageProcessor};
use crate::domain::PipelineStage;
use crate::error::{CoreError, CoreResult};

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline identity (used by `pipeline.execute`)
    pub id: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    pub stages: Vec<PipelineStage>,
}

impl PipelineDefinition {
    pub fn new(id: impl Into<String>, stages: Vec<PipelineStage>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            stages,
        }
    }

    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    pub fn get_stage(&self, id: &str) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Validate structure and return stage indices in dependency order.
    ///
    /// Ties between ready stages are broken by `order`, then declaration index.
    pub fn topological_order(&self) -> CoreResult<Vec<usize>> {
        if self.id.is_empty() {
            return Err(CoreError::InvalidDefinition("pipeline id cannot be empty".into()));
        }
        if self.stages.is_empty() {
            return Err(CoreError::InvalidDefinition(format!(
                "pipeline '{}' must have at least one stage",
                self.id
            )));
        }

        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.id.is_empty() {
                return Err(CoreError::InvalidDefinition(format!(
                    "stage {} of pipeline '{}' has an empty id",
                    i, self.id
                )));
            }
            if index.insert(stage.id.as_str(), i).is_some() {
                return Err(CoreError::InvalidDefinition(format!(
                    "duplicate stage '{}' in pipeline '{}'",
                    stage.id, self.id
                )));
            }
        }

        let mut in_degree = vec![0usize; self.stages.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.stages.len()];
        for (i, stage) in self.stages.iter().enumerate() {
            for dep in &stage.depends_on {
                let Some(&d) = index.get(dep.as_str()) else {
                    return Err(CoreError::InvalidDefinition(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.id, dep
                    )));
                };
                if d == i {
                    return Err(CoreError::InvalidDefinition(format!(
                        "stage '{}' depends on itself",
                        stage.id
                    )));
                }
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        // Kahn's algorithm with a deterministic ready set
        let key = |i: usize| (self.stages[i].order, i);
        let mut ready: BTreeSet<(u32, usize)> = (0..self.stages.len())
            .filter(|&i| in_degree[i] == 0)
            .map(key)
            .collect();
        let mut order = Vec::with_capacity(self.stages.len());

        while let Some(next) = ready.pop_first() {
            let i = next.1;
            order.push(i);
            for &j in &dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.insert(key(j));
                }
            }
        }

        if order.len() != self.stages.len() {
            let cyclic: Vec<&str> = (0..self.stages.len())
                .filter(|i| in_degree[*i] > 0)
                .map(|i| self.stages[i].id.as_str())
                .collect();
            return Err(CoreError::InvalidDefinition(format!(
                "pipeline '{}' has a dependency cycle through: {}",
                self.id,
                cyclic.join(", ")
            )));
        }

        Ok(order)
    }
}

/// A validated pipeline with its precomputed stage order
#[derive(Debug, Clone)]
pub struct RegisteredPipeline {
    pub definition: PipelineDefinition,
    order: Vec<usize>,
}

impl RegisteredPipeline {
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Stages in the order they will be started
    pub fn ordered_stages(&self) -> impl Iterator<Item = &PipelineStage> {
        self.order.iter().map(|&i| &self.definition.stages[i])
    }

    pub fn stage_order(&self) -> Vec<String> {
        self.ordered_stages().map(|s| s.id.clone()).collect()
    }
}

/// Named pipelines and the processors their stages are bound to.
///
/// Built once at startup and shared immutably afterwards.
pub struct StageRegistry {
    pipelines: HashMap<String, Arc<RegisteredPipeline>>,
    processors: HashMap<String, Arc<dyn StageProcessor>>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    /// Create a registry with the built-in `passthrough` processor
    pub fn new() -> Self {
        let mut processors: HashMap<String, Arc<dyn StageProcessor>> = HashMap::new();
        processors.insert("passthrough".to_string(), Arc::new(PassthroughProcessor));
        Self {
            pipelines: HashMap::new(),
            processors,
        }
    }

    /// Bind a processor name; later bindings replace earlier ones
    pub fn register_processor(&mut self, name: impl Into<String>, processor: Arc<dyn StageProcessor>) {
        self.processors.insert(name.into(), processor);
    }

    /// Validate and register a pipeline
    pub fn register(&mut self, definition: PipelineDefinition) -> CoreResult<()> {
        if self.pipelines.contains_key(&definition.id) {
            return Err(CoreError::InvalidDefinition(format!(
                "pipeline '{}' is already registered",
                definition.id
            )));
        }

        let order = definition.topological_order()?;

        let unbound: HashSet<&str> = definition
            .stages
            .iter()
            .map(|s| s.processor.as_str())
            .filter(|p| !self.processors.contains_key(*p))
            .collect();
        if !unbound.is_empty() {
            let mut names: Vec<&str> = unbound.into_iter().collect();
            names.sort_unstable();
            return Err(CoreError::InvalidDefinition(format!(
                "pipeline '{}' references unknown processor(s): {}",
                definition.id,
                names.join(", ")
            )));
        }

        debug!(pipeline = %definition.id, stages = definition.stages.len(), "Registered pipeline");
        self.pipelines.insert(
            definition.id.clone(),
            Arc::new(RegisteredPipeline { definition, order }),
        );
        Ok(())
    }

    pub fn get(&self, pipeline_id: &str) -> CoreResult<Arc<RegisteredPipeline>> {
        self.pipelines
            .get(pipeline_id)
            .cloned()
            .ok_or_else(|| CoreError::unknown("pipeline", pipeline_id))
    }

    pub fn processor(&self, name: &str) -> CoreResult<Arc<dyn StageProcessor>> {
        self.processors
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::unknown("processor", name))
    }

    /// Registered pipeline ids, sorted
    pub fn pipeline_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pipelines.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StageKind;

    const TEST_PIPELINE_YAML: &str = r#"
id: threat-scan
description: Scan inbound telemetry

stages:
  - id: output
    kind: output
    depends_on: [security]

  - id: input
    kind: input

  - id: security
    kind: security
    max_retries: 2
    timeout_ms: 500
    depends_on: [input]
"#;

    #[test]
    fn test_pipeline_parsing() {
        let pipeline = PipelineDefinition::from_yaml(TEST_PIPELINE_YAML).unwrap();

        assert_eq!(pipeline.id, "threat-scan");
        assert_eq!(pipeline.stages.len(), 3);
        assert_eq!(pipeline.get_stage("security").unwrap().kind, StageKind::Security);
    }

    #[test]
    fn test_topological_order_follows_dependencies() {
        let pipeline = PipelineDefinition::from_yaml(TEST_PIPELINE_YAML).unwrap();
        let mut registry = StageRegistry::new();
        registry.register(pipeline).unwrap();

        let registered = registry.get("threat-scan").unwrap();
        assert_eq!(registered.stage_order(), ["input", "security", "output"]);
    }

    #[test]
    fn test_order_breaks_ties() {
        let pipeline = PipelineDefinition::new(
            "fan-out",
            vec![
                PipelineStage::new("root", StageKind::Input),
                PipelineStage::new("b", StageKind::Process).depends_on("root").with_order(2),
                PipelineStage::new("a", StageKind::Process).depends_on("root").with_order(1),
            ],
        );
        let order: Vec<&str> = pipeline
            .topological_order()
            .unwrap()
            .into_iter()
            .map(|i| pipeline.stages[i].id.as_str())
            .collect();
        assert_eq!(order, ["root", "a", "b"]);
    }

    #[test]
    fn test_cycle_rejected_at_registration() {
        let pipeline = PipelineDefinition::new(
            "loop",
            vec![
                PipelineStage::new("a", StageKind::Process).depends_on("b"),
                PipelineStage::new("b", StageKind::Process).depends_on("a"),
            ],
        );
        let mut registry = StageRegistry::new();
        let err = registry.register(pipeline).unwrap_err();

        assert!(matches!(err, CoreError::InvalidDefinition(ref m) if m.contains("cycle")));
        assert!(registry.get("loop").is_err());
    }

    #[test]
    fn test_unknown_dependency_and_processor() {
        let dangling = PipelineDefinition::new(
            "dangling",
            vec![PipelineStage::new("a", StageKind::Process).depends_on("ghost")],
        );
        assert!(dangling.topological_order().is_err());

        let unbound = PipelineDefinition::new(
            "unbound",
            vec![PipelineStage::new("a", StageKind::Process).with_processor("nope")],
        );
        let mut registry = StageRegistry::new();
        assert!(registry.register(unbound).is_err());
    }

    #[test]
    fn test_unknown_pipeline() {
        let registry = StageRegistry::new();
        let err = registry.get("missing").unwrap_err();
        assert_eq!(err.status_code(), 404);
    }
}
