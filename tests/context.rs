//! Core Context Integration Tests
//!
//! Runs the whole core with its background sweeps on short intervals.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use stormcore::adapters::{StageContext, StageProcessor};
use stormcore::core::{EventFilter, OperationFilter};
use stormcore::domain::{
    EventStatus, EventType, ExecutionStatus, OperationPriority, OperationStatus,
    ResolutionReason, Severity,
};
use stormcore::{CoreConfig, CoreContext};

const CONFIG: &str = r#"
limits:
  max_concurrent_pipelines: 2
retry:
  initial_delay_ms: 1
  max_delay_ms: 1
rule_engine:
  sweep_interval_ms: 10
scheduler:
  tick_interval_ms: 10
alerts:
  check_interval_ms: 10
  default_contacts: [duty-officer]
  thresholds:
    - component: pump-3
      metric: pressure
      above: 8.5
      severity: critical
processors:
  check:
    type: require_fields
    fields: [zone]
pipelines:
  - id: intake
    stages:
      - id: validate
        kind: validate
        processor: check
        max_retries: 0
      - id: publish
        kind: output
        depends_on: [validate]
  - id: threat-scan
    stages:
      - id: ingest
        kind: input
      - id: scan
        kind: security
        processor: scanner
        max_retries: 1
        depends_on: [ingest]
rules:
  - id: security-failure
    priority: 1
    conditions:
      - field: type
        equals: system
      - field: severity
        any_of: [critical]
    actions:
      - type: deploy
        target: incident-response
        parameters:
          duration_secs: 3600
          resources:
            - kind: responder
              units: 2
      - type: alert
        target: soc
resources:
  - id: team-red
    kind: responder
    capacity: 2
"#;

struct BrokenScanner;

#[async_trait]
impl StageProcessor for BrokenScanner {
    fn name(&self) -> &str {
        "scanner"
    }

    async fn process(&self, _ctx: &StageContext, _input: Value) -> Result<Value> {
        Err(anyhow!("signature database corrupt"))
    }
}

async fn context() -> CoreContext {
    let config = CoreConfig::from_yaml(CONFIG).unwrap();
    let context = CoreContext::builder(config)
        .processor("scanner", Arc::new(BrokenScanner))
        .build()
        .await
        .unwrap();
    context.start().await;
    context
}

/// Poll `check` until it yields a value or two seconds pass
async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

#[tokio::test]
async fn test_pipeline_completes_and_reports_low_severity_event() {
    let context = context().await;

    let id = context
        .execute_pipeline("intake", json!({"zone": "harbor", "reading": 4}))
        .await
        .unwrap();
    let execution = context.wait_pipeline(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        execution.stage_results["publish"].output,
        Some(json!({"zone": "harbor", "reading": 4}))
    );

    // The completion event is ingested and resolved by default handling
    let ctx = &context;
    let event = eventually(|| async move {
        ctx
            .list_events(&EventFilter::default())
            .await
            .into_iter()
            .find(|e| e.status == EventStatus::Resolved)
    })
    .await;
    assert_eq!(event.severity, Severity::Low);
    assert_eq!(event.resolution, Some(ResolutionReason::NoMatchingRule));

    context.shutdown().await;
}

#[tokio::test]
async fn test_validation_failure_stops_before_publish() {
    let context = context().await;

    let id = context
        .execute_pipeline("intake", json!({"reading": 4}))
        .await
        .unwrap();
    let execution = context.wait_pipeline(id).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.failed_stage.as_deref(), Some("validate"));
    assert!(!execution.stage_results.contains_key("publish"));

    context.shutdown().await;
}

#[tokio::test]
async fn test_security_failure_deploys_responders_and_raises_alert() {
    let context = context().await;

    let id = context.execute_pipeline("threat-scan", json!({})).await.unwrap();
    let execution = context.wait_pipeline(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.failed_stage.as_deref(), Some("scan"));

    let ctx = &context;
    let operation = eventually(|| async move {
        ctx
            .list_operations(&OperationFilter {
                status: Some(OperationStatus::Executing),
                ..Default::default()
            })
            .await
            .into_iter()
            .next()
    })
    .await;
    assert_eq!(operation.operation_type, "incident-response");
    assert_eq!(operation.priority, OperationPriority::Critical);

    let resources = context.list_resources().await;
    assert_eq!(resources[0].current_usage, 2);

    let alert = eventually(|| async move { ctx.list_alerts(true).await.into_iter().next() }).await;
    assert_eq!(alert.severity, Severity::Critical);
    assert_eq!(alert.contacts, ["soc"]);
    assert_eq!(alert.source, "pipeline:threat-scan");

    let event_id = operation.source_event.unwrap();
    let event = eventually(|| async move {
        ctx
            .get_event(event_id)
            .await
            .ok()
            .filter(|e| e.status == EventStatus::Resolved)
    })
    .await;
    assert_eq!(event.event_type, EventType::System);
    assert_eq!(event.resolution, Some(ResolutionReason::ActionsSucceeded));
    assert_eq!(context.event_responses(event_id).await.unwrap().len(), 1);

    // Cancelling the operation returns the responders
    context.cancel_operation(operation.id).await.unwrap();
    assert_eq!(context.list_resources().await[0].current_usage, 0);

    context.acknowledge_alert(alert.id, "dana").await.unwrap();
    context.resolve_alert(alert.id, "dana").await.unwrap();
    assert_eq!(context.status().await.open_alerts, 0);

    context.shutdown().await;
}

#[tokio::test]
async fn test_metric_threshold_and_status_snapshot() {
    let context = context().await;

    assert!(context.record_metric("pump-3", "pressure", 7.0).await.is_none());
    let alert_id = context.record_metric("pump-3", "pressure", 9.1).await.unwrap();
    assert!(context.record_metric("pump-3", "pressure", 9.4).await.is_none());

    let alert = context.alert_manager().get(alert_id).await.unwrap();
    assert_eq!(alert.contacts, ["duty-officer"]);

    let status = context.status().await;
    assert_eq!(status.open_alerts, 1);
    assert_eq!(status.running_executions, 0);
    assert_eq!(status.executing_operations, 0);

    let summaries = context.list_pipelines();
    let ids: Vec<&str> = summaries.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, ["intake", "threat-scan"]);

    context.shutdown().await;
}

#[tokio::test]
async fn test_manual_resolution_and_unknown_ids() {
    let context = context().await;
    context.set_rule_enabled("security-failure", false).await.unwrap();
    assert_eq!(
        context.set_rule_enabled("missing", true).await.unwrap_err().status_code(),
        404
    );

    let missing = uuid::Uuid::new_v4();
    assert_eq!(context.get_event(missing).await.unwrap_err().status_code(), 404);
    assert_eq!(context.pipeline_status(missing).await.unwrap_err().status_code(), 404);
    assert_eq!(context.get_operation(missing).await.unwrap_err().status_code(), 404);
    assert_eq!(
        context.acknowledge_alert(missing, "dana").await.unwrap_err().status_code(),
        404
    );

    context.shutdown().await;

    // With the sweeps stopped the event stays pending until an operator acts
    let id = context
        .submit_event(stormcore::EventDraft::new(
            EventType::User,
            Severity::Medium,
            "Shelter capacity reached",
        ))
        .await;
    let resolved = context.resolve_event(id, "dana").await.unwrap();
    assert_eq!(resolved.resolution, Some(ResolutionReason::Manual));
    assert_eq!(resolved.resolved_by.as_deref(), Some("dana"));
    assert_eq!(context.resolve_event(id, "dana").await.unwrap_err().status_code(), 409);

    let history = context.event_history(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].to, EventStatus::Resolved);
}
