use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{InstanceId, JobKey, TokenId, WorkerId};
use crate::value::VariableMap;

/// Job state machine states (§3.5, §4.D).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    ErrorThrown,
    Deferred,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::ErrorThrown | JobStatus::Canceled
        )
    }
}

/// A unit of work offered to external workers for a serviceTask (§3.5).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_key: JobKey,
    pub job_type: String,
    pub process_instance_id: InstanceId,
    pub element_id: String,
    pub token_id: TokenId,
    pub status: JobStatus,
    pub worker_id: Option<WorkerId>,
    pub retries: u32,
    pub max_retries: u32,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub variables: VariableMap,
    pub custom_headers: VariableMap,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When a `Deferred` job should return to `Pending` (§4.D `Fail`:
    /// `scheduled_at = now + backoff`).
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new_pending(
        job_type: impl Into<String>,
        process_instance_id: InstanceId,
        element_id: impl Into<String>,
        token_id: TokenId,
        variables: VariableMap,
        custom_headers: VariableMap,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_key: JobKey::generate(),
            job_type: job_type.into(),
            process_instance_id,
            element_id: element_id.into(),
            token_id,
            status: JobStatus::Pending,
            worker_id: None,
            retries: max_retries,
            max_retries,
            lease_expires_at: None,
            variables,
            custom_headers,
            error_code: None,
            error_message: None,
            created_at: now,
            scheduled_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pending_job_starts_with_full_retry_budget() {
        let now = Utc::now();
        let job = Job::new_pending(
            "email",
            InstanceId::generate(),
            "task-1",
            crate::ids::TokenId::generate(),
            VariableMap::new(),
            VariableMap::new(),
            3,
            now,
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retries, 3);
        assert_eq!(job.max_retries, 3);
        assert!(job.worker_id.is_none());
        assert!(job.lease_expires_at.is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::ErrorThrown.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Deferred.is_terminal());
    }
}
