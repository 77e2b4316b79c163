use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A tagged scalar mirroring the dynamic `map[string]any` values the
/// upstream resource managers emit for allocation extras and tags.
///
/// Redesign note (see DESIGN.md / spec §9): the original `Generic =
/// map[string]any` type is replaced by this explicit variant so that JSON
/// round-tripping and numeric coercion never depend on runtime type
/// assertions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    /// Best-effort coercion to a finite `f64`, used by allocation-derived
    /// metrics (e.g. `alloc_cputime = cpus * walltime`). Non-numeric values
    /// and non-finite floats coerce to `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) if f.is_finite() => Some(*f),
            Value::Float(_) => None,
            Value::String(s) => s.parse::<f64>().ok().filter(|f| f.is_finite()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

/// `allocation`: cpus, mem-bytes, gpus, billing, flavor extras. Mixed
/// int/float/string values, keyed by string.
pub type Allocation = BTreeMap<String, Value>;

/// `tags`: free-form string-or-int values (partition, qos, workdir, ...).
pub type Tags = BTreeMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_coercion() {
        assert_eq!(Value::Int(160).as_f64(), Some(160.0));
        assert_eq!(Value::Float(42.5).as_f64(), Some(42.5));
        assert_eq!(Value::Float(f64::NAN).as_f64(), None);
        assert_eq!(Value::Float(f64::INFINITY).as_f64(), None);
        assert_eq!(Value::String("8".into()).as_f64(), Some(8.0));
        assert_eq!(Value::String("gpu_a100".into()).as_f64(), None);
    }

    #[test]
    fn json_roundtrip_untagged() {
        let v: Value = serde_json::from_str("160").unwrap();
        assert_eq!(v, Value::Int(160));
        let v: Value = serde_json::from_str("42.5").unwrap();
        assert_eq!(v, Value::Float(42.5));
        let v: Value = serde_json::from_str("\"standard\"").unwrap();
        assert_eq!(v, Value::String("standard".into()));
    }
}
