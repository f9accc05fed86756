//! Single-stage execution with timeout and retry.
//!
//! The executor is pure orchestration: it invokes the bound processor, bounds
//! each attempt by the stage timeout and retries transient failures with
//! exponential backoff. Nothing carries over between attempts.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::adapters::{StageContext, StageProcessor};
use crate::domain::{PipelineStage, StageFailureKind, StageResult};
use crate::error::CoreError;

/// Backoff between stage attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt, in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay, in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_initial_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl BackoffPolicy {
    /// Fixed delay with no growth, handy for tests
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay after failed attempt `attempt` (0-indexed): base × multiplier^attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }
}

/// Runs one stage against its processor
#[derive(Debug, Clone, Default)]
pub struct StageExecutor {
    backoff: BackoffPolicy,
}

impl StageExecutor {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Run a stage to a final result.
    ///
    /// Makes at most `1 + stage.max_retries` attempts. Cancellation is checked
    /// before every attempt and interrupts backoff sleeps, but an attempt that
    /// is already in flight is allowed to finish.
    pub async fn run(
        &self,
        stage: &PipelineStage,
        processor: &dyn StageProcessor,
        input: serde_json::Value,
        mut ctx: StageContext,
        cancel: &CancellationToken,
    ) -> StageResult {
        let started = Instant::now();
        let timeout = stage.timeout();
        let mut last: Option<(StageFailureKind, CoreError)> = None;
        let mut retries_used = 0u32;

        for attempt in 0..=stage.max_retries {
            if cancel.is_cancelled() {
                return cancelled(stage, started, retries_used);
            }

            retries_used = attempt;
            ctx.attempt = attempt + 1;
            debug!(stage = %stage.id, attempt = ctx.attempt, "Running stage attempt");

            let failure = match tokio::time::timeout(timeout, processor.process(&ctx, input.clone())).await {
                Ok(Ok(output)) => {
                    return StageResult::succeeded(
                        stage.id.clone(),
                        output,
                        started.elapsed().as_millis() as u64,
                        retries_used,
                    );
                }
                Ok(Err(e)) => (
                    StageFailureKind::Processor,
                    CoreError::StageProcessorError {
                        stage: stage.id.clone(),
                        message: format!("{:#}", e),
                    },
                ),
                Err(_) => (
                    StageFailureKind::Timeout,
                    CoreError::StageTimeout {
                        stage: stage.id.clone(),
                        timeout,
                    },
                ),
            };

            if attempt < stage.max_retries {
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(
                    stage = %stage.id,
                    attempt = ctx.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure.1,
                    "Stage attempt failed, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return cancelled(stage, started, retries_used);
                    }
                }
            }

            last = Some(failure);
        }

        let (kind, err) = last.unwrap_or((
            StageFailureKind::Processor,
            CoreError::StageProcessorError {
                stage: stage.id.clone(),
                message: "no attempt was made".to_string(),
            },
        ));

        error!(
            stage = %stage.id,
            attempts = retries_used + 1,
            error = %err,
            "Stage failed permanently"
        );

        StageResult::failed(
            stage.id.clone(),
            kind,
            err.to_string(),
            started.elapsed().as_millis() as u64,
            retries_used,
        )
    }
}

fn cancelled(stage: &PipelineStage, started: Instant, retries_used: u32) -> StageResult {
    StageResult::failed(
        stage.id.clone(),
        StageFailureKind::Cancelled,
        "cancelled",
        started.elapsed().as_millis() as u64,
        retries_used,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StageKind;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Fails the first `failures` attempts, then echoes its input
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StageProcessor for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn process(&self, _ctx: &StageContext, input: serde_json::Value) -> anyhow::Result<serde_json::Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                anyhow::bail!("transient failure {}", n);
            }
            Ok(input)
        }
    }

    struct Slow;

    #[async_trait]
    impl StageProcessor for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn process(&self, _ctx: &StageContext, input: serde_json::Value) -> anyhow::Result<serde_json::Value> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(input)
        }
    }

    fn ctx(stage: &PipelineStage) -> StageContext {
        StageContext {
            execution_id: Uuid::new_v4(),
            pipeline_id: "test".into(),
            stage_id: stage.id.clone(),
            stage_kind: stage.kind,
            attempt: 0,
            pipeline_input: json!(null),
            upstream: HashMap::new(),
        }
    }

    #[test]
    fn test_backoff_delays() {
        let policy = BackoffPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(10000)); // Capped
    }

    #[tokio::test]
    async fn test_recovers_within_retry_budget() {
        let stage = PipelineStage::new("enrich", StageKind::Transform).with_max_retries(2);
        let processor = Flaky { failures: 2, calls: AtomicU32::new(0) };
        let executor = StageExecutor::new(BackoffPolicy::fixed(1));

        let result = executor
            .run(&stage, &processor, json!({"x": 1}), ctx(&stage), &CancellationToken::new())
            .await;

        assert!(result.success);
        assert_eq!(result.retries_used, 2);
        assert_eq!(result.output, Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_last_error() {
        let stage = PipelineStage::new("enrich", StageKind::Transform).with_max_retries(1);
        let processor = Flaky { failures: 10, calls: AtomicU32::new(0) };
        let executor = StageExecutor::new(BackoffPolicy::fixed(1));

        let result = executor
            .run(&stage, &processor, json!(null), ctx(&stage), &CancellationToken::new())
            .await;

        assert!(!result.success);
        assert_eq!(result.retries_used, 1);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.failure, Some(StageFailureKind::Processor));
        assert!(result.error.unwrap().contains("transient failure 1"));
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let stage = PipelineStage::new("slow", StageKind::Process)
            .with_timeout(Duration::from_millis(20))
            .with_max_retries(0);
        let executor = StageExecutor::new(BackoffPolicy::fixed(1));

        let result = executor
            .run(&stage, &Slow, json!(null), ctx(&stage), &CancellationToken::new())
            .await;

        assert!(!result.success);
        assert_eq!(result.retries_used, 0);
        assert_eq!(result.failure, Some(StageFailureKind::Timeout));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let stage = PipelineStage::new("any", StageKind::Process);
        let token = CancellationToken::new();
        token.cancel();

        let result = StageExecutor::default()
            .run(&stage, &Slow, json!(null), ctx(&stage), &token)
            .await;

        assert_eq!(result.failure, Some(StageFailureKind::Cancelled));
    }
}
