use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{named_params, Transaction};

use crate::model::Unit;

/// Upsert one unit row (spec §4.3 "Upsert procedure"). On conflict by
/// `(cluster_id, uuid, started_at_ts)`, metric maps accumulate through the
/// custom `add_metric_map` / `avg_metric_map` functions instead of being
/// overwritten; everything else about the unit (lifecycle state, tags,
/// allocation, ignore flag) reflects the latest fetch.
pub fn upsert_unit(tx: &Transaction, unit: &Unit, now: DateTime<Utc>) -> rusqlite::Result<()> {
    tx.execute(
        r#"
        INSERT INTO units (
            cluster_id, uuid, resource_manager, name, project, "group", "user", state,
            created_at, created_at_ts, started_at, started_at_ts, ended_at, ended_at_ts, elapsed,
            allocation, tags,
            avg_cpu_usage, avg_cpu_mem_usage, total_cpu_energy_usage_kwh, total_cpu_emissions_gms,
            avg_gpu_usage, avg_gpu_mem_usage, total_gpu_energy_usage_kwh, total_gpu_emissions_gms,
            total_io_write_stats, total_io_read_stats, total_ingress_stats, total_outgress_stats,
            total_time_seconds, ignore, num_updates, last_updated_at
        ) VALUES (
            :cluster_id, :uuid, :resource_manager, :name, :project, :group, :user, :state,
            :created_at, :created_at_ts, :started_at, :started_at_ts, :ended_at, :ended_at_ts, :elapsed,
            :allocation, :tags,
            :avg_cpu_usage, :avg_cpu_mem_usage, :total_cpu_energy_usage_kwh, :total_cpu_emissions_gms,
            :avg_gpu_usage, :avg_gpu_mem_usage, :total_gpu_energy_usage_kwh, :total_gpu_emissions_gms,
            :total_io_write_stats, :total_io_read_stats, :total_ingress_stats, :total_outgress_stats,
            :total_time_seconds, :ignore, 1, :last_updated_at
        )
        ON CONFLICT(cluster_id, uuid, started_at_ts) DO UPDATE SET
            resource_manager = excluded.resource_manager,
            name             = excluded.name,
            project          = excluded.project,
            "group"          = excluded."group",
            "user"           = excluded."user",
            state            = excluded.state,
            ended_at         = excluded.ended_at,
            ended_at_ts      = excluded.ended_at_ts,
            elapsed          = excluded.elapsed,
            allocation       = excluded.allocation,
            tags             = excluded.tags,
            ignore           = excluded.ignore,
            total_time_seconds = add_metric_map(total_time_seconds, excluded.total_time_seconds),
            total_cpu_energy_usage_kwh = add_metric_map(total_cpu_energy_usage_kwh, excluded.total_cpu_energy_usage_kwh),
            total_cpu_emissions_gms    = add_metric_map(total_cpu_emissions_gms, excluded.total_cpu_emissions_gms),
            total_gpu_energy_usage_kwh = add_metric_map(total_gpu_energy_usage_kwh, excluded.total_gpu_energy_usage_kwh),
            total_gpu_emissions_gms    = add_metric_map(total_gpu_emissions_gms, excluded.total_gpu_emissions_gms),
            total_io_write_stats       = add_metric_map(total_io_write_stats, excluded.total_io_write_stats),
            total_io_read_stats        = add_metric_map(total_io_read_stats, excluded.total_io_read_stats),
            total_ingress_stats        = add_metric_map(total_ingress_stats, excluded.total_ingress_stats),
            total_outgress_stats       = add_metric_map(total_outgress_stats, excluded.total_outgress_stats),
            avg_cpu_usage = avg_metric_map(
                avg_cpu_usage, excluded.avg_cpu_usage,
                CAST(json_extract(total_time_seconds, '$.alloc_cputime') AS REAL),
                CAST(json_extract(excluded.total_time_seconds, '$.alloc_cputime') AS REAL)
            ),
            avg_cpu_mem_usage = avg_metric_map(
                avg_cpu_mem_usage, excluded.avg_cpu_mem_usage,
                CAST(json_extract(total_time_seconds, '$.alloc_cpumemtime') AS REAL),
                CAST(json_extract(excluded.total_time_seconds, '$.alloc_cpumemtime') AS REAL)
            ),
            avg_gpu_usage = avg_metric_map(
                avg_gpu_usage, excluded.avg_gpu_usage,
                CAST(json_extract(total_time_seconds, '$.alloc_gputime') AS REAL),
                CAST(json_extract(excluded.total_time_seconds, '$.alloc_gputime') AS REAL)
            ),
            avg_gpu_mem_usage = avg_metric_map(
                avg_gpu_mem_usage, excluded.avg_gpu_mem_usage,
                CAST(json_extract(total_time_seconds, '$.alloc_gpumemtime') AS REAL),
                CAST(json_extract(excluded.total_time_seconds, '$.alloc_gpumemtime') AS REAL)
            ),
            num_updates      = num_updates + 1,
            last_updated_at  = excluded.last_updated_at
        "#,
        named_params! {
            ":cluster_id": unit.cluster_id,
            ":uuid": unit.uuid,
            ":resource_manager": unit.resource_manager,
            ":name": unit.name,
            ":project": unit.project,
            ":group": unit.group,
            ":user": unit.user,
            ":state": unit.state,
            ":created_at": unit.created_at,
            ":created_at_ts": unit.created_at_ts,
            ":started_at": unit.started_at,
            ":started_at_ts": unit.started_at_ts,
            ":ended_at": unit.ended_at,
            ":ended_at_ts": unit.ended_at_ts,
            ":elapsed": unit.elapsed,
            ":allocation": serde_json::to_string(&unit.allocation).unwrap_or_else(|_| "{}".to_string()),
            ":tags": serde_json::to_string(&unit.tags).unwrap_or_else(|_| "{}".to_string()),
            ":avg_cpu_usage": unit.avg_cpu_usage.to_json().to_string(),
            ":avg_cpu_mem_usage": unit.avg_cpu_mem_usage.to_json().to_string(),
            ":total_cpu_energy_usage_kwh": unit.total_cpu_energy_usage_kwh.to_json().to_string(),
            ":total_cpu_emissions_gms": unit.total_cpu_emissions_gms.to_json().to_string(),
            ":avg_gpu_usage": unit.avg_gpu_usage.to_json().to_string(),
            ":avg_gpu_mem_usage": unit.avg_gpu_mem_usage.to_json().to_string(),
            ":total_gpu_energy_usage_kwh": unit.total_gpu_energy_usage_kwh.to_json().to_string(),
            ":total_gpu_emissions_gms": unit.total_gpu_emissions_gms.to_json().to_string(),
            ":total_io_write_stats": unit.total_io_write_stats.to_json().to_string(),
            ":total_io_read_stats": unit.total_io_read_stats.to_json().to_string(),
            ":total_ingress_stats": unit.total_ingress_stats.to_json().to_string(),
            ":total_outgress_stats": unit.total_outgress_stats.to_json().to_string(),
            ":total_time_seconds": unit.total_time_seconds.to_json().to_string(),
            ":ignore": unit.ignore,
            ":last_updated_at": now.to_rfc3339(),
        },
    )?;
    Ok(())
}

/// Recomputes one `(cluster_id, project, user)` usage row from a full
/// grouped aggregation over its member `units` rows, using the `_agg`
/// variants (spec §4.3: "this decouples correctness of Usage from the order
/// in which Units arrive" — testable property 4).
pub fn recompute_usage(tx: &Transaction, cluster_id: &str, project: &str, user: &str, now: DateTime<Utc>) -> rusqlite::Result<()> {
    tx.execute(
        r#"
        INSERT INTO usage (
            cluster_id, project, "user",
            avg_cpu_usage, avg_cpu_mem_usage, total_cpu_energy_usage_kwh, total_cpu_emissions_gms,
            avg_gpu_usage, avg_gpu_mem_usage, total_gpu_energy_usage_kwh, total_gpu_emissions_gms,
            total_io_write_stats, total_io_read_stats, total_ingress_stats, total_outgress_stats,
            total_time_seconds, num_units, last_updated_at
        )
        SELECT
            cluster_id, project, "user",
            avg_metric_map_agg(avg_cpu_usage, CAST(json_extract(total_time_seconds, '$.alloc_cputime') AS REAL)),
            avg_metric_map_agg(avg_cpu_mem_usage, CAST(json_extract(total_time_seconds, '$.alloc_cpumemtime') AS REAL)),
            sum_metric_map_agg(total_cpu_energy_usage_kwh),
            sum_metric_map_agg(total_cpu_emissions_gms),
            avg_metric_map_agg(avg_gpu_usage, CAST(json_extract(total_time_seconds, '$.alloc_gputime') AS REAL)),
            avg_metric_map_agg(avg_gpu_mem_usage, CAST(json_extract(total_time_seconds, '$.alloc_gpumemtime') AS REAL)),
            sum_metric_map_agg(total_gpu_energy_usage_kwh),
            sum_metric_map_agg(total_gpu_emissions_gms),
            sum_metric_map_agg(total_io_write_stats),
            sum_metric_map_agg(total_io_read_stats),
            sum_metric_map_agg(total_ingress_stats),
            sum_metric_map_agg(total_outgress_stats),
            sum_metric_map_agg(total_time_seconds),
            COUNT(DISTINCT uuid),
            :now
        FROM units
        WHERE cluster_id = :cluster_id AND project = :project AND "user" = :user
        GROUP BY cluster_id, project, "user"
        ON CONFLICT(cluster_id, project, "user") DO UPDATE SET
            avg_cpu_usage              = excluded.avg_cpu_usage,
            avg_cpu_mem_usage          = excluded.avg_cpu_mem_usage,
            total_cpu_energy_usage_kwh = excluded.total_cpu_energy_usage_kwh,
            total_cpu_emissions_gms    = excluded.total_cpu_emissions_gms,
            avg_gpu_usage              = excluded.avg_gpu_usage,
            avg_gpu_mem_usage          = excluded.avg_gpu_mem_usage,
            total_gpu_energy_usage_kwh = excluded.total_gpu_energy_usage_kwh,
            total_gpu_emissions_gms    = excluded.total_gpu_emissions_gms,
            total_io_write_stats       = excluded.total_io_write_stats,
            total_io_read_stats        = excluded.total_io_read_stats,
            total_ingress_stats        = excluded.total_ingress_stats,
            total_outgress_stats       = excluded.total_outgress_stats,
            total_time_seconds         = excluded.total_time_seconds,
            num_units                  = excluded.num_units,
            last_updated_at            = excluded.last_updated_at
        "#,
        named_params! {
            ":cluster_id": cluster_id,
            ":project": project,
            ":user": user,
            ":now": now.to_rfc3339(),
        },
    )?;
    Ok(())
}

/// Distinct `(cluster_id, project, user)` keys touched by a batch of units,
/// in the order a caller should recompute their usage rows.
pub fn touched_usage_keys(units: &[Unit]) -> Vec<(String, String, String)> {
    let mut seen = BTreeSet::new();
    let mut keys = Vec::new();
    for unit in units {
        let key = (unit.cluster_id.clone(), unit.project.clone(), unit.user.clone());
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    }
    keys
}
