pub mod k8s;
pub mod manager;
pub mod registry;
pub mod slurm;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::model::{ClusterProjects, ClusterUnits, ClusterUsers};

pub use manager::FetcherManager;
pub use registry::{FetcherFactory, FetcherRegistry};

/// A `Fetcher` is a pluggable adapter producing Units and membership
/// snapshots from one cluster (spec §4.1). Every method is bounded by a
/// caller-supplied cancellation token — cooperative, not forced: a fetcher
/// may finish an in-flight remote call before observing cancellation.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Stable identifier of the cluster this fetcher was built for.
    fn cluster_id(&self) -> &str;

    /// Every unit whose `[started_at, ended_at]` overlaps `[start, end]`,
    /// including still-running units (`ended_at_ts == 0`) and units that
    /// terminated inside the window.
    async fn fetch_units(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ClusterUnits>;

    /// The current user/project membership snapshot. Implementations may
    /// cache this internally with a TTL (reference: twelve hours) and
    /// return stale data until it expires.
    async fn fetch_users_projects(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(ClusterUsers, ClusterProjects)>;
}

/// Compute the portion of a unit's runtime overlapping `[start, end]`,
/// clamped to zero, in seconds (spec §4.1). `ended_or_now` should be `end`
/// when the unit is still running.
pub fn window_overlap_seconds(
    started_at_ts_ms: i64,
    ended_or_now_ts_ms: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> f64 {
    let window_start_ms = start.timestamp_millis();
    let window_end_ms = end.timestamp_millis();

    let overlap_start = started_at_ts_ms.max(window_start_ms);
    let overlap_end = ended_or_now_ts_ms.min(window_end_ms);

    let overlap_ms = (overlap_end - overlap_start).max(0);
    overlap_ms as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn overlap_matches_s1_scenario() {
        // S1: window [15:00, 15:15], job started at 1676986627000 (before
        // window start since it's still running from an earlier tick),
        // still running -> overlap should be clipped to the 900s window.
        let start = Utc.with_ymd_and_hms(2023, 2, 21, 15, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2023, 2, 21, 15, 15, 0).unwrap();
        let started = start.timestamp_millis() - 60_000; // started before window
        let overlap = window_overlap_seconds(started, end.timestamp_millis(), start, end);
        assert_eq!(overlap, 900.0);
    }

    #[test]
    fn overlap_clamps_to_zero_when_outside_window() {
        let start = Utc.with_ymd_and_hms(2023, 2, 21, 15, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2023, 2, 21, 15, 15, 0).unwrap();
        let started = end.timestamp_millis() + 1_000;
        let overlap = window_overlap_seconds(started, started + 10_000, start, end);
        assert_eq!(overlap, 0.0);
    }
}
