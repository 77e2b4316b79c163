use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::model::{ClusterProjects, ClusterUnits, ClusterUsers};

use super::Fetcher;

/// Fans out one task per registered `Fetcher` in parallel and concatenates
/// results, joining errors instead of aborting (spec §4.1). Parallelism is
/// unbounded across fetchers: each is itself a heavy remote caller and is
/// expected to bound its own internal concurrency.
#[derive(Clone)]
pub struct FetcherManager {
    fetchers: Vec<Arc<dyn Fetcher>>,
}

impl FetcherManager {
    pub fn new(fetchers: Vec<Arc<dyn Fetcher>>) -> Self {
        Self { fetchers }
    }

    pub fn len(&self) -> usize {
        self.fetchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }

    /// Fetch units from every fetcher in parallel. Returns the concatenated
    /// per-cluster unit lists plus a joined error string describing any
    /// fetchers that failed — a fetcher failure never aborts the others
    /// (spec §4.1, testable property 7).
    pub async fn fetch_units(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> (Vec<ClusterUnits>, Option<String>) {
        let tasks = self.fetchers.iter().map(|fetcher| {
            let fetcher = fetcher.clone();
            let cancel = cancel.clone();
            async move { (fetcher.cluster_id().to_string(), fetcher.fetch_units(start, end, &cancel).await) }
        });

        let results = futures::future::join_all(tasks).await;
        join_results(results)
    }

    /// Fetch user/project membership snapshots from every fetcher in
    /// parallel, same error-joining semantics as `fetch_units`.
    pub async fn fetch_users_projects(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> (Vec<ClusterUsers>, Vec<ClusterProjects>, Option<String>) {
        let tasks = self.fetchers.iter().map(|fetcher| {
            let fetcher = fetcher.clone();
            let cancel = cancel.clone();
            async move {
                (
                    fetcher.cluster_id().to_string(),
                    fetcher.fetch_users_projects(now, &cancel).await,
                )
            }
        });

        let results = futures::future::join_all(tasks).await;

        let mut users = Vec::new();
        let mut projects = Vec::new();
        let mut errors = Vec::new();

        for (cluster_id, result) in results {
            match result {
                Ok((u, p)) => {
                    users.push(u);
                    projects.push(p);
                }
                Err(e) => {
                    warn!(cluster_id, error = %e, "fetcher failed to fetch users/projects");
                    errors.push(format!("{cluster_id}: {e}"));
                }
            }
        }

        let joined = if errors.is_empty() { None } else { Some(errors.join("; ")) };
        (users, projects, joined)
    }
}

fn join_results(results: Vec<(String, anyhow::Result<ClusterUnits>)>) -> (Vec<ClusterUnits>, Option<String>) {
    let mut units = Vec::new();
    let mut errors = Vec::new();

    for (cluster_id, result) in results {
        match result {
            Ok(cu) => units.push(cu),
            Err(e) => {
                warn!(cluster_id, error = %e, "fetcher failed to fetch units");
                errors.push(format!("{cluster_id}: {e}"));
            }
        }
    }

    let joined = if errors.is_empty() { None } else { Some(errors.join("; ")) };
    (units, joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Unit;
    use async_trait::async_trait;
    use chrono::Utc;

    struct OkFetcher {
        id: String,
        n_units: usize,
    }

    struct FailingFetcher {
        id: String,
    }

    #[async_trait]
    impl Fetcher for OkFetcher {
        fn cluster_id(&self) -> &str {
            &self.id
        }

        async fn fetch_units(
            &self,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<ClusterUnits> {
            let units = (0..self.n_units)
                .map(|i| test_unit(&self.id, &format!("u{i}")))
                .collect();
            Ok(ClusterUnits {
                cluster_id: self.id.clone(),
                units,
            })
        }

        async fn fetch_users_projects(
            &self,
            _now: DateTime<Utc>,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<(ClusterUsers, ClusterProjects)> {
            Ok((ClusterUsers::default(), ClusterProjects::default()))
        }
    }

    #[async_trait]
    impl Fetcher for FailingFetcher {
        fn cluster_id(&self) -> &str {
            &self.id
        }

        async fn fetch_units(
            &self,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<ClusterUnits> {
            anyhow::bail!("cluster-b unreachable")
        }

        async fn fetch_users_projects(
            &self,
            _now: DateTime<Utc>,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<(ClusterUsers, ClusterProjects)> {
            anyhow::bail!("cluster-b unreachable")
        }
    }

    fn test_unit(cluster_id: &str, uuid: &str) -> Unit {
        Unit {
            cluster_id: cluster_id.to_string(),
            uuid: uuid.to_string(),
            resource_manager: "slurm".into(),
            name: "job".into(),
            project: "p".into(),
            group: "g".into(),
            user: "u".into(),
            state: "RUNNING".into(),
            created_at: String::new(),
            created_at_ts: 0,
            started_at: String::new(),
            started_at_ts: 0,
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

    #[tokio::test]
    async fn partial_failure_keeps_other_clusters_units() {
        // S5: fetcher A returns 3 units, fetcher B fails -> 3 units total
        // plus a joined error mentioning B's failure.
        let manager = FetcherManager::new(vec![
            Arc::new(OkFetcher {
                id: "cluster-a".into(),
                n_units: 3,
            }),
            Arc::new(FailingFetcher { id: "cluster-b".into() }),
        ]);

        let now = Utc::now();
        let cancel = CancellationToken::new();
        let (results, err) = manager.fetch_units(now, now, &cancel).await;

        let total_units: usize = results.iter().map(|r| r.units.len()).sum();
        assert_eq!(total_units, 3);
        let err = err.expect("expected joined error");
        assert!(err.contains("cluster-b unreachable"));
    }
}
