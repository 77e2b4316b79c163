use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::metric_map::{MetricMap, TotalTimeSeconds};
use super::value::{Allocation, Tags};

/// The abstract compute allocation (batch job, VM, pod). Identity is
/// `(cluster_id, uuid)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub cluster_id: String,
    pub uuid: String,

    // Provenance
    pub resource_manager: String,
    pub name: String,
    pub project: String,
    pub group: String,
    pub user: String,
    /// Opaque, fetcher-defined taxonomy (e.g. "RUNNING", "COMPLETED").
    pub state: String,

    // Lifecycle timestamps: human strings plus millisecond epoch forms.
    pub created_at: String,
    pub created_at_ts: i64,
    pub started_at: String,
    pub started_at_ts: i64,
    pub ended_at: String,
    pub ended_at_ts: i64,
    /// Formatted duration, e.g. "01:02:03".
    pub elapsed: String,

    pub allocation: Allocation,
    pub tags: Tags,

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

    pub ignore: i32,
    pub num_updates: i64,
    pub last_updated_at: DateTime<Utc>,
}

impl Unit {
    /// Invariant 1 (spec §3): created_at_ts <= started_at_ts <= ended_at_ts,
    /// each check skipped when the right-hand timestamp is zero (unset /
    /// still running).
    pub fn timestamps_are_ordered(&self) -> bool {
        let created_started_ok = self.created_at_ts == 0
            || self.started_at_ts == 0
            || self.created_at_ts <= self.started_at_ts;
        let started_ended_ok =
            self.started_at_ts == 0 || self.ended_at_ts == 0 || self.started_at_ts <= self.ended_at_ts;
        created_started_ok && started_ended_ok
    }

    /// Invariant 3 (spec §3): an ignored unit must have run less than the
    /// cutoff duration.
    pub fn mark_ignored_if_below_cutoff(&mut self, cutoff_seconds: i64) {
        if self.ended_at_ts > 0 {
            let duration_ms = self.ended_at_ts - self.started_at_ts;
            if duration_ms < cutoff_seconds * 1000 {
                self.ignore = 1;
            }
        }
    }

    pub fn is_ignored(&self) -> bool {
        self.ignore != 0
    }

    /// Resolve a config-driven `queries[<metric_name>]` key to the metric
    /// map field it enriches. Returns `None` for an unrecognized name so the
    /// updater can warn instead of silently dropping a misconfigured query.
    pub fn metric_map_mut(&mut self, metric_name: &str) -> Option<&mut MetricMap> {
        match metric_name {
            "avg_cpu_usage" => Some(&mut self.avg_cpu_usage),
            "avg_cpu_mem_usage" => Some(&mut self.avg_cpu_mem_usage),
            "total_cpu_energy_usage_kwh" => Some(&mut self.total_cpu_energy_usage_kwh),
            "total_cpu_emissions_gms" => Some(&mut self.total_cpu_emissions_gms),
            "avg_gpu_usage" => Some(&mut self.avg_gpu_usage),
            "avg_gpu_mem_usage" => Some(&mut self.avg_gpu_mem_usage),
            "total_gpu_energy_usage_kwh" => Some(&mut self.total_gpu_energy_usage_kwh),
            "total_gpu_emissions_gms" => Some(&mut self.total_gpu_emissions_gms),
            "total_io_write_stats" => Some(&mut self.total_io_write_stats),
            "total_io_read_stats" => Some(&mut self.total_io_read_stats),
            "total_ingress_stats" => Some(&mut self.total_ingress_stats),
            "total_outgress_stats" => Some(&mut self.total_outgress_stats),
            _ => None,
        }
    }
}

/// A fetcher's result for a single cluster: every unit observed active in
/// the requested window, including still-running ones (`ended_at_ts == 0`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterUnits {
    pub cluster_id: String,
    pub units: Vec<Unit>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_unit() -> Unit {
        Unit {
            cluster_id: "c1".into(),
            uuid: "1479763".into(),
            resource_manager: "slurm".into(),
            name: "job".into(),
            project: "proj".into(),
            group: "grp".into(),
            user: "usr".into(),
            state: "RUNNING".into(),
            created_at: String::new(),
            created_at_ts: 0,
            started_at: String::new(),
            started_at_ts: 1_676_986_627_000,
            ended_at: String::new(),
            ended_at_ts: 0,
            elapsed: String::new(),
            allocation: Default::default(),
            tags: Default::default(),
            avg_cpu_usage: Default::default(),
            avg_cpu_mem_usage: Default::default(),
            total_cpu_energy_usage_kwh: Default::default(),
            total_cpu_emissions_gms: Default::default(),
            avg_gpu_usage: Default::default(),
            avg_gpu_mem_usage: Default::default(),
            total_gpu_energy_usage_kwh: Default::default(),
            total_gpu_emissions_gms: Default::default(),
            total_io_write_stats: Default::default(),
            total_io_read_stats: Default::default(),
            total_ingress_stats: Default::default(),
            total_outgress_stats: Default::default(),
            total_time_seconds: Default::default(),
            ignore: 0,
            num_updates: 0,
            last_updated_at: Utc::now(),
        }
    }

    #[test]
    fn ordered_timestamps_allow_zero_ended() {
        assert!(base_unit().timestamps_are_ordered());
    }

    #[test]
    fn cutoff_marks_short_unit_ignored() {
        // S3: started 1676988486000, ended 1676988503000 (17s), cutoff 120s
        let mut u = base_unit();
        u.started_at_ts = 1_676_988_486_000;
        u.ended_at_ts = 1_676_988_503_000;
        u.mark_ignored_if_below_cutoff(120);
        assert!(u.is_ignored());
    }

    #[test]
    fn cutoff_leaves_long_unit_unignored() {
        let mut u = base_unit();
        u.started_at_ts = 0;
        u.ended_at_ts = 3_600_000;
        u.mark_ignored_if_below_cutoff(120);
        assert!(!u.is_ignored());
    }
}
