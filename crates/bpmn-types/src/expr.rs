use thiserror::Error;

use crate::value::Value;

/// The out-of-scope expression evaluator boundary (§1, §6.2): a pure
/// function `(expression, variables) -> value or error`. Lives here
/// rather than in `bpmn-engine` so that `bpmn-messaging` (correlation key
/// evaluation, §4.C) and `bpmn-engine` (gateway conditions, input/output
/// mappings) can both depend on the trait without `bpmn-messaging`
/// depending on `bpmn-engine`.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate `expression` against `variables`. A leading `=` signals a
    /// FEEL expression (§6.2); anything else is a variable path or
    /// literal, and dispatch on that leading character is the caller's
    /// responsibility, not this trait's.
    fn evaluate(&self, expression: &str, variables: &Value) -> Result<Value, ExpressionError>;
}

#[derive(Clone, Debug, Error)]
pub enum ExpressionError {
    #[error("expression {expression:?} failed to evaluate: {reason}")]
    EvaluationFailed { expression: String, reason: String },
}
