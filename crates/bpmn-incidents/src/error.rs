use thiserror::Error;

#[derive(Debug, Error)]
pub enum IncidentError {
    #[error("storage error: {0}")]
    Storage(#[from] bpmn_storage::StorageError),
    #[error("incident {0} not found")]
    NotFound(String),
    #[error("incident {0} is not open (state machine is OPEN -> {{RESOLVED, DISMISSED}})")]
    NotOpen(String),
}
