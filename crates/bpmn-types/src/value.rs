use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Dynamic variable value, per Design Notes §9: a sum type over
/// `{null, bool, int, float, string, list, map}` with JSON as the
/// canonical interchange form.
///
/// `Map` uses a `BTreeMap` rather than a `HashMap` so that two variable
/// maps with identical contents always serialize to identical bytes —
/// `content_hash` derivation (process definitions) and any replay-style
/// comparison elsewhere in the workspace depend on that stability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Look up a dotted variable path (`"order.id"`) inside a `Map` value.
    /// Returns `None` on a missing key or a path that walks through a
    /// non-map value.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.') {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }
}

impl From<JsonValue> for Value {
    fn from(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for JsonValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(b),
            Value::Int(i) => JsonValue::Number(i.into()),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s),
            Value::List(items) => JsonValue::Array(items.into_iter().map(JsonValue::from).collect()),
            Value::Map(map) => {
                JsonValue::Object(map.into_iter().map(|(k, v)| (k, JsonValue::from(v))).collect())
            }
        }
    }
}

/// A string-keyed variable map, the shape instances, tokens, and jobs all
/// carry (§3.2–§3.5).
pub type VariableMap = BTreeMap<String, Value>;

/// Merge `overlay` into `base`, with `overlay` winning on key conflicts.
///
/// This is the single merge rule the spec names repeatedly: message
/// variables over token variables (§4.C Delivery), job output variables
/// over instance variables (§4.E serviceTask), etc. Centralizing it here
/// keeps that "last writer wins, one level deep" policy consistent.
pub fn merge_variables(base: &mut VariableMap, overlay: &VariableMap) {
    for (key, value) in overlay {
        base.insert(key.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_path_walks_nested_maps() {
        let mut inner = BTreeMap::new();
        inner.insert("id".to_string(), Value::String("ORD-1".to_string()));
        let mut outer = BTreeMap::new();
        outer.insert("order".to_string(), Value::Map(inner));
        let root = Value::Map(outer);

        assert_eq!(
            root.get_path("order.id"),
            Some(&Value::String("ORD-1".to_string()))
        );
        assert_eq!(root.get_path("order.missing"), None);
        assert_eq!(root.get_path("nope"), None);
    }

    #[test]
    fn json_roundtrip_preserves_shape() {
        let json: JsonValue = serde_json::json!({
            "a": 1,
            "b": [true, null, "x"],
            "c": {"d": 2.5}
        });
        let value = Value::from(json.clone());
        let back: JsonValue = value.into();
        assert_eq!(json, back);
    }

    #[test]
    fn merge_variables_overlay_wins_on_conflict() {
        let mut base = VariableMap::new();
        base.insert("x".to_string(), Value::Int(1));
        base.insert("y".to_string(), Value::Int(2));
        let mut overlay = VariableMap::new();
        overlay.insert("x".to_string(), Value::Int(99));

        merge_variables(&mut base, &overlay);

        assert_eq!(base.get("x"), Some(&Value::Int(99)));
        assert_eq!(base.get("y"), Some(&Value::Int(2)));
    }
}
