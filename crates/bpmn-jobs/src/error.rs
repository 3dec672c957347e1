use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {job_key} is {actual:?}, expected {expected:?}")]
    WrongState {
        job_key: String,
        actual: bpmn_types::JobStatus,
        expected: &'static str,
    },
    #[error("storage error: {0}")]
    Storage(#[from] bpmn_storage::StorageError),
    #[error("incident sink error: {0}")]
    Incident(#[from] bpmn_incidents::IncidentError),
}
