use std::collections::BTreeMap;

use rusqlite::functions::{Aggregate, Context, FunctionFlags};
use rusqlite::{Connection, Result as SqlResult};
use serde_json::{Map, Value};

/// Registers the four custom SQL functions spec §4.3 names: two scalars
/// (`add_metric_map`, `avg_metric_map`) used in the per-row upsert, and two
/// aggregates (`sum_metric_map_agg`, `avg_metric_map_agg`) used to recompute
/// a `usage` row from its member `units` rows in one grouped query. These
/// are the reason the pipeline is storage-coupled — expressing "insert or
/// running-weighted-average every metric in a JSON blob" purely in SQL is
/// only tractable with them.
pub fn register(conn: &Connection) -> SqlResult<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("add_metric_map", 2, flags, move |ctx| {
        let existing: Option<String> = ctx.get(0)?;
        let new: Option<String> = ctx.get(1)?;
        Ok(add_metric_map(existing.as_deref(), new.as_deref()))
    })?;

    conn.create_scalar_function("avg_metric_map", 4, flags, move |ctx| {
        let existing: Option<String> = ctx.get(0)?;
        let new: Option<String> = ctx.get(1)?;
        let existing_weight: Option<f64> = ctx.get(2)?;
        let new_weight: Option<f64> = ctx.get(3)?;
        Ok(avg_metric_map(
            existing.as_deref(),
            new.as_deref(),
            existing_weight.unwrap_or(0.0),
            new_weight.unwrap_or(0.0),
        ))
    })?;

    conn.create_aggregate_function("sum_metric_map_agg", 1, flags, SumMetricMapAgg)?;
    conn.create_aggregate_function("avg_metric_map_agg", 2, flags, AvgMetricMapAgg)?;

    Ok(())
}

fn parse_object(raw: Option<&str>) -> Map<String, Value> {
    raw.and_then(|s| serde_json::from_str::<Value>(s).ok())
        .and_then(|v| match v {
            Value::Object(m) => Some(m),
            _ => None,
        })
        .unwrap_or_default()
}

/// A key's value contributes only when it is present and coerces to a
/// finite number (spec §4.3: "non-finite values on either side contribute
/// zero", §4.2 sanitization already guarantees this in practice, but the
/// functions re-check since they're also reachable from raw SQL).
fn numeric_or_none(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn to_json_string(map: &BTreeMap<String, f64>) -> String {
    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string())
}

/// Pointwise sum across the union of keys. A key missing or non-finite on
/// one side contributes zero on that side, which also covers "missing keys
/// on one side are taken from the other" (sum with a zero contribution).
pub fn add_metric_map(existing: Option<&str>, new: Option<&str>) -> String {
    let e = parse_object(existing);
    let n = parse_object(new);

    let mut out = BTreeMap::new();
    for key in e.keys().chain(n.keys()) {
        if out.contains_key(key) {
            continue;
        }
        let ev = e.get(key).and_then(numeric_or_none).unwrap_or(0.0);
        let nv = n.get(key).and_then(numeric_or_none).unwrap_or(0.0);
        out.insert(key.clone(), ev + nv);
    }
    to_json_string(&out)
}

/// Weighted average per key: `(w_e*v_e + w_n*v_n) / (w_e+w_n)` restricted to
/// finite contributions. A key present on only one (finite) side uses that
/// side's raw value (equivalent to a weighted average where the missing
/// side contributes neither value nor weight). If the surviving weight sum
/// for a key is zero, the output is the surviving side's raw value, or zero
/// if neither side is finite.
pub fn avg_metric_map(existing: Option<&str>, new: Option<&str>, existing_weight: f64, new_weight: f64) -> String {
    let e = parse_object(existing);
    let n = parse_object(new);

    let mut out = BTreeMap::new();
    for key in e.keys().chain(n.keys()) {
        if out.contains_key(key) {
            continue;
        }
        let ev = e.get(key).and_then(numeric_or_none);
        let nv = n.get(key).and_then(numeric_or_none);

        let value = match (ev, nv) {
            (Some(ev), Some(nv)) => {
                let total_weight = existing_weight + new_weight;
                if total_weight != 0.0 {
                    (existing_weight * ev + new_weight * nv) / total_weight
                } else {
                    ev
                }
            }
            (Some(ev), None) => ev,
            (None, Some(nv)) => nv,
            (None, None) => 0.0,
        };
        out.insert(key.clone(), value);
    }
    to_json_string(&out)
}

/// Per-key accumulator for `avg_metric_map_agg`: `(weighted_sum, weight_sum,
/// last_finite_raw_value)`.
#[derive(Default)]
pub struct AvgMetricMapState(BTreeMap<String, (f64, f64, Option<f64>)>);

struct AvgMetricMapAgg;

impl Aggregate<AvgMetricMapState, Option<String>> for AvgMetricMapAgg {
    fn init(&self, _ctx: &mut Context<'_>) -> SqlResult<AvgMetricMapState> {
        Ok(AvgMetricMapState::default())
    }

    fn step(&self, ctx: &mut Context<'_>, state: &mut AvgMetricMapState) -> SqlResult<()> {
        let raw: Option<String> = ctx.get(0)?;
        let weight: f64 = ctx.get::<Option<f64>>(1)?.unwrap_or(0.0);
        let row = parse_object(raw.as_deref());

        for (key, value) in row.iter() {
            let entry = state.0.entry(key.clone()).or_insert((0.0, 0.0, None));
            if let Some(v) = numeric_or_none(value) {
                entry.0 += weight * v;
                entry.1 += weight;
                entry.2 = Some(v);
            }
        }
        Ok(())
    }

    fn finalize(&self, _ctx: &mut Context<'_>, state: Option<AvgMetricMapState>) -> SqlResult<Option<String>> {
        let Some(state) = state else {
            return Ok(Some("{}".to_string()));
        };

        let mut out = BTreeMap::new();
        for (key, (weighted_sum, weight_sum, last_valid)) in state.0 {
            let value = if weight_sum != 0.0 {
                weighted_sum / weight_sum
            } else {
                last_valid.unwrap_or(0.0)
            };
            out.insert(key, value);
        }
        Ok(Some(to_json_string(&out)))
    }
}

#[derive(Default)]
pub struct SumMetricMapState(BTreeMap<String, f64>);

struct SumMetricMapAgg;

impl Aggregate<SumMetricMapState, Option<String>> for SumMetricMapAgg {
    fn init(&self, _ctx: &mut Context<'_>) -> SqlResult<SumMetricMapState> {
        Ok(SumMetricMapState::default())
    }

    fn step(&self, ctx: &mut Context<'_>, state: &mut SumMetricMapState) -> SqlResult<()> {
        let raw: Option<String> = ctx.get(0)?;
        let row = parse_object(raw.as_deref());
        for (key, value) in row.iter() {
            let contribution = numeric_or_none(value).unwrap_or(0.0);
            *state.0.entry(key.clone()).or_insert(0.0) += contribution;
        }
        Ok(())
    }

    fn finalize(&self, _ctx: &mut Context<'_>, state: Option<SumMetricMapState>) -> SqlResult<Option<String>> {
        Ok(Some(to_json_string(&state.unwrap_or_default().0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn add_metric_map_sums_union_of_keys() {
        let existing = r#"{"a": 1.0, "b": 2.0}"#;
        let new = r#"{"b": 3.0, "c": 4.0}"#;
        let result = add_metric_map(Some(existing), Some(new));
        let v: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(v["a"], 1.0);
        assert_eq!(v["b"], 5.0);
        assert_eq!(v["c"], 4.0);
    }

    #[test]
    fn add_metric_map_treats_non_finite_as_zero() {
        let existing = r#"{"a": "NaN"}"#;
        let new = r#"{"a": 5.0}"#;
        let result = add_metric_map(Some(existing), Some(new));
        let v: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(v["a"], 5.0);
    }

    #[test]
    fn add_metric_map_handles_none_inputs() {
        let result = add_metric_map(None, None);
        assert_eq!(result, "{}");
    }

    #[test]
    fn avg_metric_map_weighted_average_matches_spec_property() {
        // Testable property 3: (w1*v1 + w2*v2)/(w1+w2).
        let existing = r#"{"usage": 42.0}"#;
        let new = r#"{"usage": 50.0}"#;
        let result = avg_metric_map(Some(existing), Some(new), 144000.0, 144000.0);
        let v: Value = serde_json::from_str(&result).unwrap();
        assert!((v["usage"].as_f64().unwrap() - 46.0).abs() < 1e-9);
    }

    #[test]
    fn avg_metric_map_identity_for_equal_maps_and_weights() {
        // Testable property 2: avg_metric_map(m, m, w, w) == m.
        let m = r#"{"usage": 17.5}"#;
        let result = avg_metric_map(Some(m), Some(m), 10.0, 10.0);
        let v: Value = serde_json::from_str(&result).unwrap();
        assert!((v["usage"].as_f64().unwrap() - 17.5).abs() < 1e-9);
    }

    #[test]
    fn avg_metric_map_zero_weight_on_one_side_uses_other_value() {
        let existing = r#"{"usage": 10.0}"#;
        let new = r#"{"usage": 20.0}"#;
        // existing weight == 0: testable property 3 "equals v2 when w1 = 0".
        let result = avg_metric_map(Some(existing), Some(new), 0.0, 5.0);
        let v: Value = serde_json::from_str(&result).unwrap();
        assert!((v["usage"].as_f64().unwrap() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn avg_metric_map_key_present_on_one_side_only() {
        let existing = r#"{"usage": 10.0}"#;
        let new = r#"{}"#;
        let result = avg_metric_map(Some(existing), Some(new), 5.0, 5.0);
        let v: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(v["usage"], 10.0);
    }

    #[test]
    fn functions_register_on_a_connection() {
        let conn = Connection::open_in_memory().unwrap();
        register(&conn).unwrap();

        let result: String = conn
            .query_row("SELECT add_metric_map('{\"a\":1.0}', '{\"a\":2.0}')", [], |row| row.get(0))
            .unwrap();
        let v: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(v["a"], 3.0);
    }

    #[test]
    fn sum_metric_map_agg_reduces_across_grouped_rows() {
        let conn = Connection::open_in_memory().unwrap();
        register(&conn).unwrap();
        conn.execute_batch(
            "CREATE TABLE t (grp TEXT, m TEXT);
             INSERT INTO t VALUES ('g', '{\"walltime\": 900.0}');
             INSERT INTO t VALUES ('g', '{\"walltime\": 900.0}');",
        )
        .unwrap();

        let result: String = conn
            .query_row("SELECT sum_metric_map_agg(m) FROM t GROUP BY grp", [], |row| row.get(0))
            .unwrap();
        let v: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(v["walltime"], 1800.0);
    }

    #[test]
    fn avg_metric_map_agg_reduces_with_weights() {
        let conn = Connection::open_in_memory().unwrap();
        register(&conn).unwrap();
        conn.execute_batch(
            "CREATE TABLE t (grp TEXT, m TEXT, w REAL);
             INSERT INTO t VALUES ('g', '{\"usage\": 42.0}', 144000.0);
             INSERT INTO t VALUES ('g', '{\"usage\": 50.0}', 144000.0);",
        )
        .unwrap();

        let result: String = conn
            .query_row("SELECT avg_metric_map_agg(m, w) FROM t GROUP BY grp", [], |row| row.get(0))
            .unwrap();
        let v: Value = serde_json::from_str(&result).unwrap();
        assert!((v["usage"].as_f64().unwrap() - 46.0).abs() < 1e-9);
    }
}
