use bpmn_types::{ExpressionError, ExpressionEvaluator, Value};

/// Comparison operators, longest first so `>=`/`<=`/`==`/`!=` are found
/// before their single-character prefixes.
const OPERATORS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];

/// Reference `ExpressionEvaluator` used by the end-to-end scenario tests
/// and suitable as an embedder's starting point. Not the production FEEL
/// engine (§1 declares expression evaluation out of scope): it supports
/// only variable-path lookups (`foo.bar`), `true`/`false`/numeric/quoted
/// string literals, and a single comparison per expression (`x>10`).
#[derive(Clone, Copy, Debug, Default)]
pub struct SimpleFeelEvaluator;

impl ExpressionEvaluator for SimpleFeelEvaluator {
    fn evaluate(&self, expression: &str, variables: &Value) -> Result<Value, ExpressionError> {
        let expr = expression.trim();

        for op in OPERATORS {
            if let Some(idx) = expr.find(op) {
                let (lhs, rest) = expr.split_at(idx);
                let rhs = &rest[op.len()..];
                let left = resolve_operand(lhs.trim(), variables, expression)?;
                let right = resolve_operand(rhs.trim(), variables, expression)?;
                return compare(op, &left, &right, expression).map(Value::Bool);
            }
        }

        resolve_operand(expr, variables, expression)
    }
}

fn resolve_operand(token: &str, variables: &Value, expression: &str) -> Result<Value, ExpressionError> {
    match token {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }
    if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
        return Ok(Value::String(token[1..token.len() - 1].to_string()));
    }
    if let Ok(i) = token.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    if let Ok(f) = token.parse::<f64>() {
        return Ok(Value::Float(f));
    }
    if let Some(value) = variables.get_path(token) {
        return Ok(value.clone());
    }
    Err(ExpressionError::EvaluationFailed {
        expression: expression.to_string(),
        reason: format!("unresolved variable path {token:?}"),
    })
}

fn compare(op: &str, left: &Value, right: &Value, expression: &str) -> Result<bool, ExpressionError> {
    if op == "==" {
        return Ok(left == right);
    }
    if op == "!=" {
        return Ok(left != right);
    }
    let (l, r) = match (numeric(left), numeric(right)) {
        (Some(l), Some(r)) => (l, r),
        _ => {
            return Err(ExpressionError::EvaluationFailed {
                expression: expression.to_string(),
                reason: "ordering comparison requires numeric operands".to_string(),
            });
        }
    };
    Ok(match op {
        ">" => l > r,
        "<" => l < r,
        ">=" => l >= r,
        "<=" => l <= r,
        _ => unreachable!("operator set is exhaustive"),
    })
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}
