//! Processors that ship with the core.

use anyhow::Result;
use async_trait::async_trait;

use super::{StageContext, StageProcessor};

/// Returns its input unchanged
pub struct PassthroughProcessor;

#[async_trait]
impl StageProcessor for PassthroughProcessor {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn process(&self, _ctx: &StageContext, input: serde_json::Value) -> Result<serde_json::Value> {
        Ok(input)
    }
}

/// Validate-class processor: fails unless the input object has every field
pub struct RequireFieldsProcessor {
    name: String,
    fields: Vec<String>,
}

impl RequireFieldsProcessor {
    pub fn new(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }
}

#[async_trait]
impl StageProcessor for RequireFieldsProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, ctx: &StageContext, input: serde_json::Value) -> Result<serde_json::Value> {
        let Some(object) = input.as_object() else {
            anyhow::bail!("Stage '{}' expects an object input", ctx.stage_id);
        };

        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| !object.contains_key(f.as_str()))
            .map(String::as_str)
            .collect();

        if !missing.is_empty() {
            anyhow::bail!("Missing required fields: {}", missing.join(", "));
        }

        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StageKind;
    use serde_json::json;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn ctx() -> StageContext {
        StageContext {
            execution_id: Uuid::new_v4(),
            pipeline_id: "p".into(),
            stage_id: "validate".into(),
            stage_kind: StageKind::Validate,
            attempt: 1,
            pipeline_input: json!({}),
            upstream: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_require_fields() {
        let p = RequireFieldsProcessor::new("check", vec!["lat".into(), "lon".into()]);

        assert!(p.process(&ctx(), json!({"lat": 1, "lon": 2})).await.is_ok());

        let err = p.process(&ctx(), json!({"lat": 1})).await.unwrap_err();
        assert!(err.to_string().contains("lon"));

        assert!(p.process(&ctx(), json!("text")).await.is_err());
    }

    #[tokio::test]
    async fn test_passthrough() {
        let out = PassthroughProcessor.process(&ctx(), json!([1, 2])).await.unwrap();
        assert_eq!(out, json!([1, 2]));
    }
}
