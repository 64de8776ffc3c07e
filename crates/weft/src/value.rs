//! Runtime values flowing through the graph.
//!
//! Values are immutable and cheap to clone: aggregates sit behind `Arc`.
//! Numbers use `OrderedFloat` so every value is `Eq + Ord + Hash`, which the
//! result cache and const types rely on.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Largest magnitude below which every integer is an exact `f64` (2^53).
pub const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    /// Number (f64 with total ordering)
    Number(OrderedFloat<f64>),
    String(Arc<str>),
    List(Arc<Vec<Value>>),
    /// String-keyed record; backs typed dicts, dicts and objects alike.
    Dict(Arc<BTreeMap<Arc<str>, Value>>),
    /// External reference (artifact URI); never dereferenced structurally.
    Ref(Arc<str>),
}

impl Value {
    pub fn number(n: f64) -> Self {
        Value::Number(OrderedFloat(n))
    }

    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Value::String(s.into())
    }

    pub fn bool(b: bool) -> Self {
        Value::Bool(b)
    }

    pub fn reference(uri: impl Into<Arc<str>>) -> Self {
        Value::Ref(uri.into())
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(Arc::new(items.into_iter().collect()))
    }

    pub fn dict(fields: impl IntoIterator<Item = (impl Into<Arc<str>>, Value)>) -> Self {
        Value::Dict(Arc::new(
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(n.0),
            _ => None,
        }
    }

    /// The number as an integer, if it has no fractional part and every
    /// integer up to it is exactly representable as an `f64`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Number(n) if n.0.fract() == 0.0 && n.0.abs() <= MAX_EXACT_INT => {
                Some(n.0 as i64)
            }
            _ => None,
        }
    }

    /// True for finite numbers without a fractional part, of any magnitude.
    pub fn is_integral(&self) -> bool {
        matches!(self, Value::Number(n) if n.0.is_finite() && n.0.fract() == 0.0)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Arc<str>, Value>> {
        match self {
            Value::Dict(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_ref_uri(&self) -> Option<&str> {
        match self {
            Value::Ref(uri) => Some(uri),
            _ => None,
        }
    }

    pub fn get_field(&self, name: &str) -> Option<&Value> {
        self.as_dict()?.get(name)
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.as_list()?.get(index)
    }

    /// Build a value from plain JSON. Refs cannot be expressed in plain JSON
    /// and come back as strings.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::string(s.as_str()),
            serde_json::Value::Array(items) => Value::list(items.iter().map(Value::from_json)),
            serde_json::Value::Object(fields) => Value::dict(
                fields
                    .iter()
                    .map(|(k, v)| (k.as_str(), Value::from_json(v))),
            ),
        }
    }

    /// Plain JSON view for display and CLI output.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Value::None => json!(null),
            Value::Bool(b) => json!(b),
            Value::Number(_) => match self.as_int() {
                Some(i) => json!(i),
                None => json!(self.as_number()),
            },
            Value::String(s) => json!(s.as_ref()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Dict(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect(),
            ),
            Value::Ref(uri) => json!({ "_ref": uri.as_ref() }),
        }
    }

    /// Convert to user-visible display string.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => match self.as_int() {
                Some(i) => i.to_string(),
                None => n.0.to_string(),
            },
            Value::String(s) => s.to_string(),
            Value::List(items) => {
                let entries: Vec<_> = items.iter().map(Value::to_display_string).collect();
                format!("[{}]", entries.join(", "))
            }
            Value::Dict(fields) => {
                let entries: Vec<_> = fields
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v.to_display_string()))
                    .collect();
                format!("{{{}}}", entries.join(", "))
            }
            Value::Ref(uri) => format!("ref({uri})"),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::string(s)
    }
}
