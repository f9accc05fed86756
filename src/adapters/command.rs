//! Processor that runs an external program.
//!
//! The stage input is written to the child's stdin as JSON; stdout is parsed
//! as JSON when possible and otherwise returned as a string. The stage
//! timeout is enforced by the executor, which drops (and so kills) the child.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{StageContext, StageProcessor};

pub struct CommandProcessor {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandProcessor {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl StageProcessor for CommandProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, ctx: &StageContext, input: serde_json::Value) -> Result<serde_json::Value> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("STORMCORE_STAGE", &ctx.stage_id)
            .env("STORMCORE_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}' for stage '{}'", self.program, ctx.stage_id))?;

        // stdin is fed while stdout and stderr are being drained
        let payload = serde_json::to_vec(&input).context("Failed to serialize stage input")?;
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
                // Dropping stdin signals EOF
            }
            Ok::<_, std::io::Error>(())
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.with_context(|| format!("Failed to wait for '{}'", self.program))?;

        match fed {
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!(stage = %ctx.stage_id, "Command exited before reading all of its input");
            }
            other => other.context("Failed to write stage input")?,
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "'{}' exited with code {}: {}",
                self.program,
                exit_code,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8(output.stdout).context("Command output is not valid UTF-8")?;
        let trimmed = stdout.trim();

        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string())))
    }
}

#[cfg(all(test, unix))]
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
            stage_id: "shell".into(),
            stage_kind: StageKind::Process,
            attempt: 1,
            pipeline_input: json!(null),
            upstream: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_cat_round_trips_json() {
        let p = CommandProcessor::new("cat", "cat", vec![]);
        let out = p.process(&ctx(), json!({"k": "v"})).await.unwrap();
        assert_eq!(out, json!({"k": "v"}));
    }

    #[tokio::test]
    async fn test_large_input_does_not_stall_on_full_pipes() {
        let p = CommandProcessor::new("cat", "cat", vec![]);
        let input = json!({"readings": "x".repeat(1 << 20)});
        let c = ctx();
        let run = p.process(&c, input.clone());
        let out = tokio::time::timeout(std::time::Duration::from_secs(10), run)
            .await
            .expect("command stalled")
            .unwrap();
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn test_child_ignoring_input_still_succeeds() {
        let p = CommandProcessor::new("echo", "sh", vec!["-c".into(), "echo done".into()]);
        let out = p.process(&ctx(), json!({"readings": "x".repeat(1 << 20)})).await.unwrap();
        assert_eq!(out, json!("done"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error() {
        let p = CommandProcessor::new("false", "sh", vec!["-c".into(), "echo nope >&2; exit 3".into()]);
        let err = p.process(&ctx(), json!(null)).await.unwrap_err();
        assert!(err.to_string().contains("code 3"));
    }

    #[tokio::test]
    async fn test_plain_text_output() {
        let p = CommandProcessor::new("echo", "sh", vec!["-c".into(), "echo hello".into()]);
        let out = p.process(&ctx(), json!(null)).await.unwrap();
        assert_eq!(out, json!("hello"));
    }
}
