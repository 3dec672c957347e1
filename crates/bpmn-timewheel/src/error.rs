use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("unparseable {kind} expression {expression:?}: {reason}")]
    InvalidExpression {
        kind: &'static str,
        expression: String,
        reason: &'static str,
    },
    #[error("timer {0} not found")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(#[from] bpmn_storage::StorageError),
    #[error("incident sink error: {0}")]
    Incident(#[from] bpmn_incidents::IncidentError),
}
