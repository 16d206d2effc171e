//! Values exchanged as task inputs and outputs
//!
//! Inline values are plain JSON. A shared-memory array travels as a
//! reference object tagged with `"appose_type": "ndarray"`.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::shm::NdArrayRef;

/// Reserved key that marks special objects on the wire
pub const TYPE_KEY: &str = "appose_type";

/// Tag value for shared-memory array references
pub const NDARRAY_TYPE: &str = "ndarray";

/// A task input or output.
///
/// JSON has no NaN or infinity, so a `Float` holding one cannot be
/// serialized. [`Value::non_finite`] finds such values before sending.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    NdArray(NdArrayRef),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value, widening integers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ndarray(&self) -> Option<&NdArrayRef> {
        match self {
            Value::NdArray(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Every array reference contained in this value, including nested ones
    pub fn ndarray_refs(&self) -> Vec<&NdArrayRef> {
        let mut refs = Vec::new();
        self.collect_refs(&mut refs);
        refs
    }

    fn collect_refs<'a>(&'a self, refs: &mut Vec<&'a NdArrayRef>) {
        match self {
            Value::NdArray(r) => refs.push(r),
            Value::List(items) => items.iter().for_each(|v| v.collect_refs(refs)),
            Value::Map(map) => map.values().for_each(|v| v.collect_refs(refs)),
            _ => {}
        }
    }

    /// The first NaN or infinite float in this value, including nested ones
    pub fn non_finite(&self) -> Option<f64> {
        match self {
            Value::Float(f) if !f.is_finite() => Some(*f),
            Value::List(items) => items.iter().find_map(Value::non_finite),
            Value::Map(map) => map.values().find_map(Value::non_finite),
            _ => None,
        }
    }

    /// Convert to plain JSON. Non-finite floats become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::NdArray(r) => serde_json::json!({
                TYPE_KEY: NDARRAY_TYPE,
                "name": r.name,
                "dtype": r.dtype,
                "shape": r.shape,
            }),
        }
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = String;

    fn try_from(json: serde_json::Value) -> Result<Self, Self::Error> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().ok_or_else(|| format!("unrepresentable number {n}"))?),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(mut map) => match map.remove(TYPE_KEY) {
                Some(serde_json::Value::String(tag)) if tag == NDARRAY_TYPE => {
                    let reference: NdArrayRef = serde_json::from_value(serde_json::Value::Object(map))
                        .map_err(|e| format!("invalid ndarray reference: {e}"))?;
                    Value::NdArray(reference)
                }
                Some(other) => return Err(format!("unknown {TYPE_KEY}: {other}")),
                None => Value::Map(
                    map.into_iter()
                        .map(|(k, v)| Value::try_from(v).map(|v| (k, v)))
                        .collect::<Result<_, _>>()?,
                ),
            },
        })
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if let Some(f) = self.non_finite() {
            return Err(S::Error::custom(format!("{f} has no JSON representation")));
        }
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::try_from(json).map_err(D::Error::custom)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::NdArray(r) => write!(f, "ndarray({}, {}, {:?})", r.name, r.dtype, r.shape),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        i64::try_from(i).map(Value::Int).unwrap_or(Value::Float(i as f64))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<NdArrayRef> for Value {
    fn from(r: NdArrayRef) -> Self {
        Value::NdArray(r)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}
