use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("process {0} not found")]
    ProcessNotFound(String),
    #[error("instance {0} not found")]
    InstanceNotFound(String),
    #[error("token {0} not found")]
    TokenNotFound(String),
    #[error("element {0} not found in process definition")]
    ElementNotFound(String),
    #[error("no open incident found for {0}")]
    IncidentNotFound(String),
    #[error("storage error: {0}")]
    Storage(#[from] bpmn_storage::StorageError),
    #[error("incident sink error: {0}")]
    Incident(#[from] bpmn_incidents::IncidentError),
    #[error("timer error: {0}")]
    Timer(#[from] bpmn_timewheel::TimerError),
    #[error("job error: {0}")]
    Job(#[from] bpmn_jobs::JobError),
    #[error("message error: {0}")]
    Message(#[from] bpmn_messaging::MessageError),
    #[error("failed to encode process content for hashing: {0}")]
    Encoding(String),
}
