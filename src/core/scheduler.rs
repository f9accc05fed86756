//! Resource reservation and logistics operation scheduling.
//!
//! All resource and operation state lives behind one mutex so that starting
//! an operation (reserving every requirement) is atomic to observers. Leased
//! units never exceed a resource's capacity, and an operation's leases are
//! returned exactly once, whether it completes, fails or is cancelled.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    LeaseState, LogisticsOperation, LogisticsResource, OperationPriority, OperationRequest,
    OperationStatus, ResourceAvailability, ResourceHandle, ResourceLease, ResourceRequirement,
};
use crate::error::{CoreError, CoreResult};

/// What `reserve` does when capacity is short
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationMode {
    /// Return `ResourceUnavailable` immediately
    #[default]
    FailFast,
    /// Wait for releases until the reservation timeout
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Operations allowed in `executing` at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_operations: usize,

    #[serde(default)]
    pub reservation_mode: ReservationMode,

    /// Upper bound on a blocking reservation, in milliseconds
    #[serde(default = "default_reservation_timeout")]
    pub reservation_timeout_ms: u64,

    /// Finished operations are archived after this many seconds
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Interval between scheduler sweeps, in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

fn default_max_concurrent() -> usize {
    3
}
fn default_reservation_timeout() -> u64 {
    30_000
}
fn default_retention() -> u64 {
    3600
}
fn default_tick_interval() -> u64 {
    1000
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_operations: default_max_concurrent(),
            reservation_mode: ReservationMode::default(),
            reservation_timeout_ms: default_reservation_timeout(),
            retention_secs: default_retention(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

/// Filters for `logistics.list`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationFilter {
    pub status: Option<OperationStatus>,
    pub priority: Option<OperationPriority>,
    pub operation_type: Option<String>,
}

impl OperationFilter {
    fn matches(&self, op: &LogisticsOperation) -> bool {
        self.status.map_or(true, |s| op.status == s)
            && self.priority.map_or(true, |p| op.priority == p)
            && self
                .operation_type
                .as_deref()
                .map_or(true, |t| op.operation_type == t)
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub started: Vec<Uuid>,
    pub completed: Vec<Uuid>,
    pub force_released: Vec<Uuid>,
    pub archived: usize,
}

#[derive(Default)]
struct SchedulerState {
    resources: BTreeMap<String, LogisticsResource>,
    operations: HashMap<Uuid, LogisticsOperation>,
    archived: Vec<LogisticsOperation>,
}

impl SchedulerState {
    /// Lease `units` of `kind`, spreading across resources with the most room first
    fn try_reserve(
        &mut self,
        kind: &str,
        units: u32,
        operation_id: Option<Uuid>,
        priority: OperationPriority,
    ) -> CoreResult<Vec<ResourceHandle>> {
        let mut candidates: Vec<(&String, u32)> = self
            .resources
            .iter()
            .filter(|(_, r)| r.kind == kind)
            .map(|(id, r)| (id, r.free_units()))
            .filter(|(_, free)| *free > 0)
            .collect();
        let available: u32 = candidates.iter().map(|(_, free)| *free).sum();

        if available < units {
            return Err(CoreError::ResourceUnavailable {
                kind: kind.to_string(),
                requested: units,
                available,
            });
        }

        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        let plan: Vec<(String, u32)> = {
            let mut remaining = units;
            let mut plan = Vec::new();
            for (id, free) in candidates {
                if remaining == 0 {
                    break;
                }
                let take = free.min(remaining);
                plan.push((id.clone(), take));
                remaining -= take;
            }
            plan
        };

        let now = Utc::now();
        let mut handles = Vec::with_capacity(plan.len());
        for (resource_id, take) in plan {
            if let Some(resource) = self.resources.get_mut(&resource_id) {
                let lease = ResourceLease {
                    id: Uuid::new_v4(),
                    operation_id,
                    units: take,
                    priority,
                    state: LeaseState::Reserved,
                    acquired_at: now,
                };
                handles.push(ResourceHandle {
                    lease_id: lease.id,
                    resource_id: resource_id.clone(),
                    units: take,
                });
                resource.lease(lease);
            }
        }
        Ok(handles)
    }

    /// Reserve every requirement or nothing
    fn try_reserve_all(
        &mut self,
        requirements: &[ResourceRequirement],
        operation_id: Uuid,
        priority: OperationPriority,
    ) -> CoreResult<Vec<ResourceHandle>> {
        let mut taken = Vec::new();
        for req in requirements {
            match self.try_reserve(&req.kind, req.units, Some(operation_id), priority) {
                Ok(handles) => taken.extend(handles),
                Err(e) => {
                    for handle in &taken {
                        self.return_handle(handle);
                    }
                    return Err(e);
                }
            }
        }
        Ok(taken)
    }

    fn return_handle(&mut self, handle: &ResourceHandle) -> bool {
        self.resources
            .get_mut(&handle.resource_id)
            .and_then(|r| r.return_lease(handle.lease_id))
            .is_some()
    }

    /// Hand back an operation's leases; a second call is a no-op
    fn release_operation(&mut self, operation_id: Uuid) -> bool {
        let Some(op) = self.operations.get_mut(&operation_id) else {
            return false;
        };
        if op.resources_released {
            return false;
        }
        op.resources_released = true;
        let handles = op.reserved.clone();
        for handle in &handles {
            self.return_handle(handle);
        }
        true
    }
}

/// `start + secs`, or `None` when that lies past the representable range
pub(crate) fn after_secs(start: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(secs).ok()?;
    start.checked_add_signed(chrono::Duration::try_seconds(secs)?)
}

/// Reserves shared resources and drives logistics operations
pub struct ResourceScheduler {
    state: Mutex<SchedulerState>,
    released: Notify,
    settings: SchedulerSettings,
}

impl ResourceScheduler {
    pub fn new(settings: SchedulerSettings, resources: Vec<LogisticsResource>) -> Self {
        let mut state = SchedulerState::default();
        for mut resource in resources {
            resource.reset_usage();
            state.resources.insert(resource.id.clone(), resource);
        }
        Self {
            state: Mutex::new(state),
            released: Notify::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Register a new resource. Usage is derived from leases, so any
    /// `current_usage` or `leases` carried by `resource` are cleared.
    pub async fn add_resource(
        &self,
        mut resource: LogisticsResource,
    ) -> CoreResult<LogisticsResource> {
        let mut state = self.state.lock().await;
        if state.resources.contains_key(&resource.id) {
            return Err(CoreError::InvalidDefinition(format!(
                "resource '{}' is already registered",
                resource.id
            )));
        }
        resource.reset_usage();
        let snapshot = resource.clone();
        state.resources.insert(resource.id.clone(), resource);
        drop(state);
        info!(resource = %snapshot.id, capacity = snapshot.capacity, "Resource added");
        self.released.notify_waiters();
        Ok(snapshot)
    }

    /// Snapshot of every resource (`resources.list`)
    pub async fn resources(&self) -> Vec<LogisticsResource> {
        self.state.lock().await.resources.values().cloned().collect()
    }

    pub async fn resource(&self, id: &str) -> CoreResult<LogisticsResource> {
        self.state
            .lock()
            .await
            .resources
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::unknown("resource", id))
    }

    /// Take a resource in or out of service.
    ///
    /// Only `available`, `maintenance` and `offline` may be set directly;
    /// existing leases are kept.
    pub async fn set_availability(
        &self,
        id: &str,
        availability: ResourceAvailability,
    ) -> CoreResult<LogisticsResource> {
        let mut state = self.state.lock().await;
        let resource = state
            .resources
            .get_mut(id)
            .ok_or_else(|| CoreError::unknown("resource", id))?;

        match availability {
            ResourceAvailability::Maintenance | ResourceAvailability::Offline => {
                resource.availability = availability;
            }
            ResourceAvailability::Available => {
                resource.availability = ResourceAvailability::Available;
                resource.refresh_availability();
            }
            other => {
                return Err(CoreError::InvalidTransition {
                    kind: "resource",
                    id: id.to_string(),
                    from: format!("{:?}", resource.availability),
                    to: format!("{:?}", other),
                });
            }
        }

        info!(resource = %id, availability = ?resource.availability, "Resource availability changed");
        let snapshot = resource.clone();
        drop(state);
        self.released.notify_waiters();
        Ok(snapshot)
    }

    /// Reserve `units` of a resource kind outside of any operation.
    ///
    /// In `Block` mode waits for releases up to the reservation timeout.
    pub async fn reserve(
        &self,
        kind: &str,
        units: u32,
        priority: OperationPriority,
    ) -> CoreResult<Vec<ResourceHandle>> {
        self.reserve_with(kind, units, priority, self.settings.reservation_mode)
            .await
    }

    pub async fn reserve_with(
        &self,
        kind: &str,
        units: u32,
        priority: OperationPriority,
        mode: ReservationMode,
    ) -> CoreResult<Vec<ResourceHandle>> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.settings.reservation_timeout_ms);

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let attempt = self.state.lock().await.try_reserve(kind, units, None, priority);
            match attempt {
                Ok(handles) => {
                    debug!(kind, units, ?priority, "Reserved resources");
                    return Ok(handles);
                }
                Err(e) if mode == ReservationMode::FailFast => return Err(e),
                Err(e) => {
                    debug!(kind, units, "Waiting for capacity");
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Return a reservation. Releasing the same handle twice is a no-op.
    pub async fn release(&self, handle: &ResourceHandle) -> CoreResult<bool> {
        let mut state = self.state.lock().await;
        if !state.resources.contains_key(&handle.resource_id) {
            return Err(CoreError::unknown("resource", &handle.resource_id));
        }
        let released = state.return_handle(handle);
        drop(state);
        if released {
            self.released.notify_waiters();
        }
        Ok(released)
    }

    /// Queue an operation as `planned`
    pub async fn plan(&self, request: OperationRequest) -> Uuid {
        let op = LogisticsOperation::planned(request);
        let id = op.id;
        info!(operation_id = %id, operation_type = %op.operation_type, priority = ?op.priority, "Operation planned");
        self.state.lock().await.operations.insert(id, op);
        id
    }

    pub async fn operation(&self, id: Uuid) -> CoreResult<LogisticsOperation> {
        let state = self.state.lock().await;
        state
            .operations
            .get(&id)
            .or_else(|| state.archived.iter().find(|op| op.id == id))
            .cloned()
            .ok_or_else(|| CoreError::unknown("operation", id))
    }

    /// Live operations matching `filter`, highest priority first
    pub async fn operations(&self, filter: &OperationFilter) -> Vec<LogisticsOperation> {
        let state = self.state.lock().await;
        let mut ops: Vec<LogisticsOperation> = state
            .operations
            .values()
            .filter(|op| filter.matches(op))
            .cloned()
            .collect();
        ops.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        ops
    }

    pub async fn archived(&self) -> Vec<LogisticsOperation> {
        self.state.lock().await.archived.clone()
    }

    pub async fn executing_count(&self) -> usize {
        self.state
            .lock()
            .await
            .operations
            .values()
            .filter(|op| op.status == OperationStatus::Executing)
            .count()
    }

    /// Start planned operations while executing slots are free.
    ///
    /// Candidates are taken by priority, then creation time. An operation
    /// whose requirements cannot all be reserved stays planned and the next
    /// candidate is tried.
    pub async fn start_ready(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut state = self.state.lock().await;
        let executing = state
            .operations
            .values()
            .filter(|op| op.status == OperationStatus::Executing)
            .count();
        let mut slots = self.settings.max_concurrent_operations.saturating_sub(executing);
        if slots == 0 {
            return Vec::new();
        }

        let mut planned: Vec<(OperationPriority, DateTime<Utc>, Uuid)> = state
            .operations
            .values()
            .filter(|op| op.status == OperationStatus::Planned)
            .map(|op| (op.priority, op.created_at, op.id))
            .collect();
        planned.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut started = Vec::new();
        for (priority, _, id) in planned {
            if slots == 0 {
                break;
            }
            let requirements = match state.operations.get(&id) {
                Some(op) => op.requirements.clone(),
                None => continue,
            };
            match state.try_reserve_all(&requirements, id, priority) {
                Ok(handles) => {
                    if let Some(op) = state.operations.get_mut(&id) {
                        op.reserved = handles;
                        op.status = OperationStatus::Executing;
                        op.started_at = Some(now);
                        info!(operation_id = %id, ?priority, "Operation started");
                    }
                    started.push(id);
                    slots -= 1;
                }
                Err(e) => {
                    debug!(operation_id = %id, error = %e, "Operation waiting for resources");
                }
            }
        }
        started
    }

    /// Advance progress of executing operations; returns those that completed
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut state = self.state.lock().await;
        let executing: Vec<Uuid> = state
            .operations
            .values()
            .filter(|op| op.status == OperationStatus::Executing)
            .map(|op| op.id)
            .collect();

        let mut completed = Vec::new();
        for id in executing {
            let reserved: Vec<String> = match state.operations.get(&id) {
                Some(op) => op.reserved.iter().map(|h| h.resource_id.clone()).collect(),
                None => continue,
            };
            for resource_id in reserved {
                if let Some(resource) = state.resources.get_mut(&resource_id) {
                    resource.mark_busy(id);
                }
            }

            let Some(op) = state.operations.get_mut(&id) else {
                continue;
            };
            let pct = op.progress_at(now);
            op.apply_progress(pct);

            if op.progress >= 100.0 {
                op.status = OperationStatus::Completed;
                op.completed_at = Some(now);
                op.actual_duration_secs = op
                    .started_at
                    .map(|s| (now - s).num_seconds().max(0) as u64);
                info!(operation_id = %id, "Operation completed");
                state.release_operation(id);
                completed.push(id);
            }
        }

        drop(state);
        if !completed.is_empty() {
            self.released.notify_waiters();
        }
        completed
    }

    pub async fn cancel(&self, id: Uuid) -> CoreResult<LogisticsOperation> {
        self.terminate(id, OperationStatus::Cancelled, None).await
    }

    pub async fn fail(&self, id: Uuid, reason: impl Into<String>) -> CoreResult<LogisticsOperation> {
        self.terminate(id, OperationStatus::Failed, Some(reason.into()))
            .await
    }

    async fn terminate(
        &self,
        id: Uuid,
        status: OperationStatus,
        reason: Option<String>,
    ) -> CoreResult<LogisticsOperation> {
        let mut state = self.state.lock().await;
        let op = state
            .operations
            .get_mut(&id)
            .ok_or_else(|| CoreError::unknown("operation", id))?;

        if op.status.is_terminal() {
            return Err(CoreError::InvalidTransition {
                kind: "operation",
                id: id.to_string(),
                from: format!("{:?}", op.status),
                to: format!("{:?}", status),
            });
        }

        op.status = status;
        op.completed_at = Some(Utc::now());
        op.failure_reason = reason;
        warn!(operation_id = %id, ?status, "Operation terminated");

        state.release_operation(id);
        let snapshot = state.operations.get(&id).cloned();
        drop(state);
        self.released.notify_waiters();
        snapshot.ok_or_else(|| CoreError::unknown("operation", id))
    }

    /// Force-release leaked leases and archive finished operations
    pub async fn supervise(&self, now: DateTime<Utc>) -> (Vec<Uuid>, usize) {
        let mut state = self.state.lock().await;

        let leaked: Vec<Uuid> = state
            .operations
            .values()
            .filter(|op| op.status.is_terminal() && !op.resources_released)
            .map(|op| op.id)
            .collect();
        for id in &leaked {
            warn!(operation_id = %id, "Force-releasing resources of finished operation");
            state.release_operation(*id);
        }

        let retention_secs = self.settings.retention_secs;
        let expired: Vec<Uuid> = state
            .operations
            .values()
            .filter(|op| {
                op.status.is_terminal()
                    && op
                        .completed_at
                        .and_then(|done| after_secs(done, retention_secs))
                        .map_or(false, |archive_at| now >= archive_at)
            })
            .map(|op| op.id)
            .collect();
        for id in &expired {
            if let Some(op) = state.operations.remove(id) {
                state.archived.push(op);
            }
        }

        drop(state);
        if !leaked.is_empty() {
            self.released.notify_waiters();
        }
        (leaked, expired.len())
    }

    /// One scheduler pass: supervise, advance progress, start what fits
    #[instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let (force_released, archived) = self.supervise(now).await;
        let completed = self.tick_at(now).await;
        let started = self.start_ready(now).await;
        SweepReport {
            started,
            completed,
            force_released,
            archived,
        }
    }

    /// Sweep on the configured interval until `shutdown` fires
    pub async fn run(self: std::sync::Arc<Self>, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.settings.tick_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sweep_at(Utc::now()).await;
                    if report != SweepReport::default() {
                        debug!(
                            started = report.started.len(),
                            completed = report.completed.len(),
                            archived = report.archived,
                            "Scheduler sweep finished"
                        );
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(resources: Vec<LogisticsResource>) -> ResourceScheduler {
        ResourceScheduler::new(SchedulerSettings::default(), resources)
    }

    #[tokio::test]
    async fn test_reserve_spreads_across_resources() {
        let s = scheduler(vec![
            LogisticsResource::new("team-a", "personnel", 2),
            LogisticsResource::new("team-b", "personnel", 3),
        ]);

        let handles = s.reserve("personnel", 4, OperationPriority::High).await.unwrap();
        let total: u32 = handles.iter().map(|h| h.units).sum();
        assert_eq!(total, 4);
        assert_eq!(handles[0].resource_id, "team-b");

        let err = s.reserve("personnel", 2, OperationPriority::High).await.unwrap_err();
        assert!(matches!(err, CoreError::ResourceUnavailable { available: 1, .. }));
    }

    #[tokio::test]
    async fn test_double_release_is_noop() {
        let s = scheduler(vec![LogisticsResource::new("drone-1", "drone", 1)]);
        let handles = s.reserve("drone", 1, OperationPriority::Low).await.unwrap();

        assert!(s.release(&handles[0]).await.unwrap());
        assert!(!s.release(&handles[0]).await.unwrap());
        assert_eq!(s.resource("drone-1").await.unwrap().current_usage, 0);
    }

    #[tokio::test]
    async fn test_out_of_service_is_ineligible() {
        let s = scheduler(vec![LogisticsResource::new("truck-1", "vehicle", 2)]);
        s.set_availability("truck-1", ResourceAvailability::Maintenance)
            .await
            .unwrap();

        assert!(s.reserve("vehicle", 1, OperationPriority::Critical).await.is_err());

        s.set_availability("truck-1", ResourceAvailability::Available)
            .await
            .unwrap();
        assert!(s.reserve("vehicle", 1, OperationPriority::Critical).await.is_ok());
    }

    #[tokio::test]
    async fn test_busy_cannot_be_set_directly() {
        let s = scheduler(vec![LogisticsResource::new("truck-1", "vehicle", 2)]);
        let err = s
            .set_availability("truck-1", ResourceAvailability::Busy)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn test_all_or_nothing_start() {
        let s = scheduler(vec![
            LogisticsResource::new("team-a", "personnel", 2),
            LogisticsResource::new("van-1", "vehicle", 1),
        ]);
        let id = s
            .plan(
                OperationRequest::new("supply-run", OperationPriority::Medium, 60)
                    .requiring("personnel", 2)
                    .requiring("vehicle", 2),
            )
            .await;

        assert!(s.start_ready(Utc::now()).await.is_empty());
        assert_eq!(s.operation(id).await.unwrap().status, OperationStatus::Planned);
        assert_eq!(s.resource("team-a").await.unwrap().current_usage, 0);
    }
}
