use thiserror::Error;

/// Errors shared across the data-model layer — id parsing, hashing inputs.
#[derive(Clone, Debug, Error)]
pub enum DomainError {
    #[error("invalid id '{value}': {reason}")]
    InvalidId { value: String, reason: &'static str },
}
