use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{IncidentId, InstanceId, JobKey, TimerId, TokenId, WorkerId};

/// Incident source categories (§3.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentType {
    JobFailure,
    BpmnError,
    ExpressionError,
    ProcessError,
    TimerError,
    MessageError,
    SystemError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentStatus {
    Open,
    Resolved,
    Dismissed,
}

/// Action taken to resolve an incident (§3.8, §4.E incident resolution).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResolutionAction {
    /// Jobs only: set a new retry count and return the job to `Pending`.
    Retry { new_retries: u32 },
    /// Mark the incident dismissed; the parked token is canceled.
    Dismiss,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolved_at: DateTime<Utc>,
    pub resolved_by: String,
    pub action: ResolutionAction,
}

/// A record of an unrecoverable runtime condition requiring operator
/// action (§3.8).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: IncidentId,
    pub incident_type: IncidentType,
    pub status: IncidentStatus,
    pub message: String,
    pub instance_id: Option<InstanceId>,
    pub element_id: Option<String>,
    pub token_id: Option<TokenId>,
    pub job_key: Option<JobKey>,
    pub timer_id: Option<TimerId>,
    pub message_name: Option<String>,
    pub worker_id: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
    pub resolution: Option<Resolution>,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        matches!(self.status, IncidentStatus::Open)
    }
}

/// Filters for listing incidents (§4.incidents "listing with filters").
#[derive(Clone, Debug, Default)]
pub struct IncidentFilter {
    pub status: Option<IncidentStatus>,
    pub incident_type: Option<IncidentType>,
    pub instance_id: Option<InstanceId>,
    pub element_id: Option<String>,
    pub job_key: Option<JobKey>,
    pub worker_id: Option<WorkerId>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl IncidentFilter {
    pub fn matches(&self, incident: &Incident) -> bool {
        if let Some(status) = self.status {
            if incident.status != status {
                return false;
            }
        }
        if let Some(incident_type) = self.incident_type {
            if incident.incident_type != incident_type {
                return false;
            }
        }
        if let Some(ref instance_id) = self.instance_id {
            if incident.instance_id.as_ref() != Some(instance_id) {
                return false;
            }
        }
        if let Some(ref element_id) = self.element_id {
            if incident.element_id.as_deref() != Some(element_id.as_str()) {
                return false;
            }
        }
        if let Some(ref job_key) = self.job_key {
            if incident.job_key.as_ref() != Some(job_key) {
                return false;
            }
        }
        if let Some(ref worker_id) = self.worker_id {
            if incident.worker_id.as_ref() != Some(worker_id) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if incident.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if incident.created_at > before {
                return false;
            }
        }
        true
    }
}

/// Aggregate counts for the incident list view (§4.incidents "stats").
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentStats {
    pub open_count: usize,
    pub resolved_count: usize,
    pub dismissed_count: usize,
    pub last_24h_count: usize,
}
