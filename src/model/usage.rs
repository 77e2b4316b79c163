use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::metric_map::{MetricMap, TotalTimeSeconds};

/// A rolling aggregate keyed `(cluster_id, project, user)` over the unit
/// lifetime. Carries the same metric-map fields as [`crate::model::Unit`]
/// plus `num_units`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub cluster_id: String,
    pub project: String,
    pub user: String,

    pub avg_cpu_usage: MetricMap,
    pub avg_cpu_mem_usage: MetricMap,
    pub total_cpu_energy_usage_kwh: MetricMap,
    pub total_cpu_emissions_gms: MetricMap,
    pub avg_gpu_usage: MetricMap,
    pub avg_gpu_mem_usage: MetricMap,
    pub total_gpu_energy_usage_kwh: MetricMap,
    pub total_gpu_emissions_gms: MetricMap,
    pub total_io_write_stats: MetricMap,
    pub total_io_read_stats: MetricMap,
    pub total_ingress_stats: MetricMap,
    pub total_outgress_stats: MetricMap,
    pub total_time_seconds: TotalTimeSeconds,

    pub num_units: i64,
    pub last_updated_at: DateTime<Utc>,
}

/// Membership record: a cluster's projects or users, each carrying the
/// sorted, de-duplicated list of the other side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    pub cluster_id: String,
    pub name: String,
    pub users: Vec<String>,
    pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub cluster_id: String,
    pub name: String,
    pub projects: Vec<String>,
    pub last_updated_at: DateTime<Utc>,
}

/// Per-source list of privileged users; peripheral to the core but
/// referenced for write-authorization of certain rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminUsers {
    pub source: String,
    pub users: Vec<String>,
}

/// A fetcher's membership snapshot for one cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterProjects {
    pub cluster_id: String,
    pub projects: Vec<Project>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterUsers {
    pub cluster_id: String,
    pub users: Vec<User>,
}

/// De-duplicate and sort a membership list (spec S6: "sorted, compacted").
pub fn dedup_sorted(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items.dedup();
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_sorted_removes_duplicates_and_orders() {
        let v = dedup_sorted(vec!["usr2".into(), "usr3".into(), "usr2".into()]);
        assert_eq!(v, vec!["usr2".to_string(), "usr3".to_string()]);
    }
}
