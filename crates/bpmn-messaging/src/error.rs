use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("subscription {0} not found")]
    SubscriptionNotFound(String),
    #[error("storage error: {0}")]
    Storage(#[from] bpmn_storage::StorageError),
    #[error("incident sink error: {0}")]
    Incident(#[from] bpmn_incidents::IncidentError),
}
