//! Logistics operations and the shared resources they reserve.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A shared, capacity-bounded resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticsResource {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Resource kind, e.g. "personnel", "vehicle", "drone"
    pub kind: String,

    pub capacity: u32,

    /// Units currently leased (reserved + busy)
    #[serde(default)]
    pub current_usage: u32,

    #[serde(default)]
    pub availability: ResourceAvailability,

    #[serde(default)]
    pub leases: Vec<ResourceLease>,
}

impl LogisticsResource {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, capacity: u32) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind: kind.into(),
            capacity,
            current_usage: 0,
            availability: ResourceAvailability::Available,
            leases: Vec::new(),
        }
    }

    /// Drop any usage not backed by a lease held by the scheduler
    pub fn reset_usage(&mut self) {
        self.current_usage = 0;
        self.leases.clear();
        self.refresh_availability();
    }

    /// Out of service resources accept no new leases
    pub fn is_out_of_service(&self) -> bool {
        matches!(
            self.availability,
            ResourceAvailability::Maintenance | ResourceAvailability::Offline
        )
    }

    /// Units that can still be leased
    pub fn free_units(&self) -> u32 {
        if self.is_out_of_service() {
            return 0;
        }
        self.capacity.saturating_sub(self.current_usage)
    }

    /// Add a lease; caller must have checked `free_units`
    pub fn lease(&mut self, lease: ResourceLease) {
        self.current_usage += lease.units;
        self.leases.push(lease);
        self.refresh_availability();
    }

    /// Remove a lease, returning the units freed
    pub fn return_lease(&mut self, lease_id: Uuid) -> Option<u32> {
        let idx = self.leases.iter().position(|l| l.id == lease_id)?;
        let lease = self.leases.remove(idx);
        self.current_usage = self.current_usage.saturating_sub(lease.units);
        self.refresh_availability();
        Some(lease.units)
    }

    /// Mark every lease held by an operation as busy
    pub fn mark_busy(&mut self, operation_id: Uuid) {
        for lease in self.leases.iter_mut().filter(|l| l.operation_id == Some(operation_id)) {
            lease.state = LeaseState::Busy;
        }
        self.refresh_availability();
    }

    pub fn refresh_availability(&mut self) {
        if self.is_out_of_service() {
            return;
        }
        self.availability = if self.leases.iter().any(|l| l.state == LeaseState::Busy) {
            ResourceAvailability::Busy
        } else if !self.leases.is_empty() {
            ResourceAvailability::Reserved
        } else {
            ResourceAvailability::Available
        };
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAvailability {
    #[default]
    Available,
    Reserved,
    Busy,
    Maintenance,
    Offline,
}

/// A claim on some units of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLease {
    pub id: Uuid,
    pub operation_id: Option<Uuid>,
    pub units: u32,
    pub priority: OperationPriority,
    pub state: LeaseState,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Reserved,
    Busy,
}

/// Handle returned by a reservation; pass it back to release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub lease_id: Uuid,
    pub resource_id: String,
    pub units: u32,
}

/// Units of a resource kind an operation needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub kind: String,
    pub units: u32,
}

impl ResourceRequirement {
    pub fn new(kind: impl Into<String>, units: u32) -> Self {
        Self {
            kind: kind.into(),
            units,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Planned,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    #[default]
    Pending,
    Executing,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressStage {
    pub name: String,
    pub status: ProgressStatus,
}

/// What a caller asks the scheduler to plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub operation_type: String,

    #[serde(default)]
    pub priority: OperationPriority,

    pub estimated_duration_secs: u64,

    #[serde(default)]
    pub requirements: Vec<ResourceRequirement>,

    #[serde(default = "default_stage_names")]
    pub stages: Vec<String>,

    #[serde(default)]
    pub responders: Vec<String>,

    #[serde(default)]
    pub source_event: Option<Uuid>,
}

fn default_stage_names() -> Vec<String> {
    ["preparation", "deployment", "execution", "completion"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl OperationRequest {
    pub fn new(operation_type: impl Into<String>, priority: OperationPriority, estimated_duration_secs: u64) -> Self {
        Self {
            operation_type: operation_type.into(),
            priority,
            estimated_duration_secs,
            requirements: Vec::new(),
            stages: default_stage_names(),
            responders: Vec::new(),
            source_event: None,
        }
    }

    pub fn requiring(mut self, kind: impl Into<String>, units: u32) -> Self {
        self.requirements.push(ResourceRequirement::new(kind, units));
        self
    }
}

/// A durable piece of work backed by reserved resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticsOperation {
    pub id: Uuid,
    pub operation_type: String,
    pub priority: OperationPriority,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_duration_secs: u64,
    pub actual_duration_secs: Option<u64>,
    pub requirements: Vec<ResourceRequirement>,
    pub reserved: Vec<ResourceHandle>,
    pub assigned_responders: Vec<String>,
    pub stages: Vec<ProgressStage>,
    /// Overall completion, 0..=100
    pub progress: f64,
    pub source_event: Option<Uuid>,
    pub failure_reason: Option<String>,
    /// Set once reserved resources have been handed back
    pub resources_released: bool,
}

impl LogisticsOperation {
    pub fn planned(request: OperationRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_type: request.operation_type,
            priority: request.priority,
            status: OperationStatus::Planned,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            estimated_duration_secs: request.estimated_duration_secs,
            actual_duration_secs: None,
            requirements: request.requirements,
            reserved: Vec::new(),
            assigned_responders: request.responders,
            stages: request
                .stages
                .into_iter()
                .map(|name| ProgressStage {
                    name,
                    status: ProgressStatus::Pending,
                })
                .collect(),
            progress: 0.0,
            source_event: request.source_event,
            failure_reason: None,
            resources_released: false,
        }
    }

    /// Completion percentage at `now`, clipped to [0, 100]
    pub fn progress_at(&self, now: DateTime<Utc>) -> f64 {
        let Some(started) = self.started_at else {
            return 0.0;
        };
        if self.estimated_duration_secs == 0 {
            return 100.0;
        }
        let elapsed = (now - started).num_milliseconds().max(0) as f64 / 1000.0;
        (elapsed / self.estimated_duration_secs as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Set overall progress and advance stage statuses.
    ///
    /// Stage `i` of `n` spans `[i*100/n, (i+1)*100/n]`: it is executing once
    /// progress passes its lower boundary and completed once progress reaches
    /// the upper one.
    pub fn apply_progress(&mut self, pct: f64) {
        let pct = pct.clamp(0.0, 100.0);
        self.progress = self.progress.max(pct);
        let n = self.stages.len();
        if n == 0 {
            return;
        }
        let span = 100.0 / n as f64;
        for (i, stage) in self.stages.iter_mut().enumerate() {
            let lower = i as f64 * span;
            let upper = (i + 1) as f64 * span;
            if self.progress >= upper {
                stage.status = ProgressStatus::Completed;
            } else if self.progress > lower && stage.status == ProgressStatus::Pending {
                stage.status = ProgressStatus::Executing;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_priority_ordering() {
        assert!(OperationPriority::Critical > OperationPriority::High);
        assert!(OperationPriority::High > OperationPriority::Medium);
        assert!(OperationPriority::Medium > OperationPriority::Low);
    }

    #[test]
    fn test_lease_accounting() {
        let mut res = LogisticsResource::new("team-a", "personnel", 3);
        let op = Uuid::new_v4();
        let lease = ResourceLease {
            id: Uuid::new_v4(),
            operation_id: Some(op),
            units: 2,
            priority: OperationPriority::High,
            state: LeaseState::Reserved,
            acquired_at: Utc::now(),
        };
        let lease_id = lease.id;

        res.lease(lease);
        assert_eq!(res.free_units(), 1);
        assert_eq!(res.availability, ResourceAvailability::Reserved);

        res.mark_busy(op);
        assert_eq!(res.availability, ResourceAvailability::Busy);

        assert_eq!(res.return_lease(lease_id), Some(2));
        assert_eq!(res.return_lease(lease_id), None);
        assert_eq!(res.current_usage, 0);
        assert_eq!(res.availability, ResourceAvailability::Available);
    }

    #[test]
    fn test_maintenance_has_no_free_units() {
        let mut res = LogisticsResource::new("truck-1", "vehicle", 4);
        res.availability = ResourceAvailability::Maintenance;
        assert_eq!(res.free_units(), 0);
    }

    #[test]
    fn test_progress_clipped_and_stages_advance() {
        let mut op = LogisticsOperation::planned(OperationRequest::new(
            "evacuation",
            OperationPriority::High,
            100,
        ));
        let start = Utc::now();
        op.started_at = Some(start);

        assert_eq!(op.progress_at(start + Duration::seconds(500)), 100.0);

        let pct = op.progress_at(start + Duration::seconds(30));
        assert!((pct - 30.0).abs() < 0.01);
        op.apply_progress(pct);
        assert_eq!(op.stages[0].status, ProgressStatus::Completed);
        assert_eq!(op.stages[1].status, ProgressStatus::Executing);
        assert_eq!(op.stages[2].status, ProgressStatus::Pending);

        op.apply_progress(100.0);
        assert!(op.stages.iter().all(|s| s.status == ProgressStatus::Completed));
    }
}
