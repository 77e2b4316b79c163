use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

/// Coerce a raw sample into the only shape ever persisted: finite and
/// non-negative. NaN, +-Inf, and negative values all become zero. This is
/// the single sanitization point named in spec §4.2 — nothing else in the
/// pipeline is allowed to filter metric values.
pub fn sanitize(x: f64) -> f64 {
    if x.is_finite() && x >= 0.0 {
        x
    } else {
        0.0
    }
}

/// `mapping<string, f64>`, sanitized on every write. Used for
/// `avg_cpu_usage`, `avg_gpu_mem_usage`, `total_io_write_stats`, etc.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricMap(BTreeMap<String, f64>);

impl MetricMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a raw (possibly unsanitized) sample under `key`.
    pub fn insert_raw(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), sanitize(value));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.0).unwrap_or(serde_json::Value::Object(Default::default()))
    }

    pub fn from_json(v: &serde_json::Value) -> Self {
        let map: BTreeMap<String, f64> = serde_json::from_value(v.clone()).unwrap_or_default();
        let mut out = BTreeMap::new();
        for (k, val) in map {
            out.insert(k, sanitize(val));
        }
        Self(out)
    }
}

impl Deref for MetricMap {
    type Target = BTreeMap<String, f64>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for MetricMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<(String, f64)> for MetricMap {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        let mut out = BTreeMap::new();
        for (k, v) in iter {
            out.insert(k, sanitize(v));
        }
        Self(out)
    }
}

/// Always-present walltime breakdown. A typed struct rather than a generic
/// map (spec §3, §9 redesign flag): the five keys are fixed, so invariants
/// like "walltime_new >= walltime_old" are checked on real fields instead of
/// map lookups that could silently miss a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TotalTimeSeconds {
    pub walltime: f64,
    pub alloc_cputime: f64,
    pub alloc_cpumemtime: f64,
    pub alloc_gputime: f64,
    pub alloc_gpumemtime: f64,
}

impl TotalTimeSeconds {
    /// Derive the four `alloc_*` keys from an allocation and the window
    /// overlap (`walltime`), per spec §4.1: "the other four alloc_* keys are
    /// populated from allocation x walltime."
    pub fn from_allocation(walltime: f64, cpus: f64, cpu_mem_bytes: f64, gpus: f64, gpu_mem_bytes: f64) -> Self {
        let walltime = sanitize(walltime);
        Self {
            walltime,
            alloc_cputime: sanitize(cpus * walltime),
            alloc_cpumemtime: sanitize(cpu_mem_bytes * walltime),
            alloc_gputime: sanitize(gpus * walltime),
            alloc_gpumemtime: sanitize(gpu_mem_bytes * walltime),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap()
    }

    pub fn from_json(v: &serde_json::Value) -> Self {
        serde_json::from_value(v.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_coerces_non_finite_and_negative() {
        assert_eq!(sanitize(f64::NAN), 0.0);
        assert_eq!(sanitize(f64::INFINITY), 0.0);
        assert_eq!(sanitize(f64::NEG_INFINITY), 0.0);
        assert_eq!(sanitize(-3.0), 0.0);
        assert_eq!(sanitize(42.0), 42.0);
    }

    #[test]
    fn metric_map_sanitizes_on_insert() {
        let mut m = MetricMap::new();
        m.insert_raw("usage", f64::NAN);
        m.insert_raw("energy", -3.0);
        assert_eq!(m.get("usage"), Some(&0.0));
        assert_eq!(m.get("energy"), Some(&0.0));
    }

    #[test]
    fn alloc_cputime_derivation() {
        // S8: cpus=160, window-overlap=900s -> alloc_cputime = 144000
        let t = TotalTimeSeconds::from_allocation(900.0, 160.0, 0.0, 8.0, 0.0);
        assert_eq!(t.walltime, 900.0);
        assert_eq!(t.alloc_cputime, 144000.0);
        assert_eq!(t.alloc_gputime, 7200.0);
    }
}
