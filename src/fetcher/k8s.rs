use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::{api::ListParams, Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::{ClusterProjects, ClusterUnits, ClusterUsers, Project, Unit, User};

use super::{window_overlap_seconds, Fetcher};

/// Lists Pods via the Kubernetes API and derives one [`Unit`] per pod,
/// grounded in the teacher's `core::client::kube_client` / `nodes.rs`
/// (`kube` + `k8s-openapi`, `Api::all`, `ListParams::default()`). The
/// pod-to-unit mapping covers the common Fetcher contract only — it does
/// not attempt the full informer/reflector machinery the teacher uses for
/// its own live-state cache (out of scope per spec §1).
pub struct K8sFetcher {
    cluster_id: String,
}

impl K8sFetcher {
    pub fn new(cluster_id: String) -> Self {
        Self { cluster_id }
    }

    async fn build_client(&self) -> anyhow::Result<Client> {
        debug!(cluster_id = %self.cluster_id, "building kube client");
        Client::try_default().await.map_err(Into::into)
    }
}

#[async_trait]
impl Fetcher for K8sFetcher {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    async fn fetch_units(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ClusterUnits> {
        let client = self.build_client().await?;
        let pods: Api<Pod> = Api::all(client);

        let list = tokio::select! {
            res = pods.list(&ListParams::default()) => res?,
            _ = cancel.cancelled() => {
                warn!(cluster_id = %self.cluster_id, "fetch_units cancelled before pod list completed");
                return Ok(ClusterUnits { cluster_id: self.cluster_id.clone(), units: vec![] });
            }
        };

        let mut units = Vec::with_capacity(list.items.len());
        for pod in list.items {
            if let Some(unit) = pod_to_unit(&self.cluster_id, &pod, start, end) {
                units.push(unit);
            }
        }

        Ok(ClusterUnits {
            cluster_id: self.cluster_id.clone(),
            units,
        })
    }

    async fn fetch_users_projects(
        &self,
        now: DateTime<Utc>,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<(ClusterUsers, ClusterProjects)> {
        let client = self.build_client().await?;
        let ns_api: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(client);
        let namespaces = ns_api.list(&ListParams::default()).await?;

        // Kubernetes has no native project/user membership model; the
        // namespace stands in for "project" the way the teacher's
        // `info_k8s_namespace_service` treats namespaces as the billing
        // boundary.
        let projects = namespaces
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .map(|name| Project {
                cluster_id: self.cluster_id.clone(),
                name,
                users: Vec::new(),
                last_updated_at: now,
            })
            .collect();

        Ok((
            ClusterUsers {
                cluster_id: self.cluster_id.clone(),
                users: Vec::<User>::new(),
            },
            ClusterProjects {
                cluster_id: self.cluster_id.clone(),
                projects,
            },
        ))
    }
}

fn pod_to_unit(cluster_id: &str, pod: &Pod, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Unit> {
    let meta = &pod.metadata;
    let uuid = meta.uid.clone()?;
    let name = meta.name.clone().unwrap_or_default();
    let namespace = meta.namespace.clone().unwrap_or_default();

    let started_at_ts = pod
        .status
        .as_ref()
        .and_then(|s| s.start_time.as_ref())
        .map(|t| t.0.timestamp_millis())
        .unwrap_or(0);

    let (ended_at_ts, state) = match pod.status.as_ref().and_then(|s| s.phase.clone()) {
        Some(phase) if phase == "Succeeded" || phase == "Failed" => {
            // k8s-openapi does not expose a pod-level end timestamp; the
            // container's last termination time is the closest proxy.
            let ended = pod
                .status
                .as_ref()
                .and_then(|s| s.container_statuses.as_ref())
                .and_then(|cs| cs.iter().find_map(|c| c.state.as_ref()?.terminated.as_ref()))
                .map(|t| t.finished_at.as_ref().map(|f| f.0.timestamp_millis()).unwrap_or(0))
                .unwrap_or(0);
            (ended, phase)
        }
        Some(phase) => (0, phase),
        None => (0, "Unknown".to_string()),
    };

    let ended_or_now = if ended_at_ts > 0 { ended_at_ts } else { end.timestamp_millis() };
    let walltime = window_overlap_seconds(started_at_ts, ended_or_now, start, end);

    let cpus = sum_container_cpu_millis(pod) / 1000.0;
    let mem_bytes = sum_container_mem_bytes(pod);

    let total_time_seconds =
        crate::model::TotalTimeSeconds::from_allocation(walltime, cpus, mem_bytes, 0.0, 0.0);

    let mut allocation = crate::model::Allocation::new();
    allocation.insert("cpus".into(), crate::model::Value::Float(cpus));
    allocation.insert("mem_bytes".into(), crate::model::Value::Float(mem_bytes));

    Some(Unit {
        cluster_id: cluster_id.to_string(),
        uuid,
        resource_manager: "k8s".into(),
        name,
        project: namespace.clone(),
        group: namespace,
        user: meta
            .labels
            .as_ref()
            .and_then(|l| l.get("ceems.io/user"))
            .cloned()
            .unwrap_or_default(),
        state,
        created_at: String::new(),
        created_at_ts: meta.creation_timestamp.as_ref().map(|t| t.0.timestamp_millis()).unwrap_or(0),
        started_at: format_ts(started_at_ts),
        started_at_ts,
        ended_at: format_ts(ended_at_ts),
        ended_at_ts,
        elapsed: humantime::format_duration(std::time::Duration::from_secs_f64(walltime.max(0.0))).to_string(),
        allocation,
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
        total_time_seconds,
        ignore: 0,
        num_updates: 0,
        last_updated_at: Utc::now(),
    })
}

fn sum_container_cpu_millis(pod: &Pod) -> f64 {
    pod.spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .filter_map(|c| c.resources.as_ref()?.requests.as_ref()?.get("cpu"))
                .filter_map(|q| parse_cpu_quantity(&q.0))
                .sum()
        })
        .unwrap_or(0.0)
}

fn sum_container_mem_bytes(pod: &Pod) -> f64 {
    pod.spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .filter_map(|c| c.resources.as_ref()?.requests.as_ref()?.get("memory"))
                .filter_map(|q| parse_mem_quantity(&q.0))
                .sum()
        })
        .unwrap_or(0.0)
}

fn parse_cpu_quantity(s: &str) -> Option<f64> {
    if let Some(milli) = s.strip_suffix('m') {
        milli.parse::<f64>().ok().map(|v| v / 1000.0)
    } else {
        s.parse::<f64>().ok()
    }
}

fn parse_mem_quantity(s: &str) -> Option<f64> {
    const UNITS: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1024f64.powi(2)),
        ("Gi", 1024f64.powi(3)),
        ("Ti", 1024f64.powi(4)),
        ("K", 1000.0),
        ("M", 1000f64.powi(2)),
        ("G", 1000f64.powi(3)),
    ];
    for (suffix, mult) in UNITS {
        if let Some(num) = s.strip_suffix(suffix) {
            return num.parse::<f64>().ok().map(|v| v * mult);
        }
    }
    s.parse::<f64>().ok()
}

fn format_ts(ts_ms: i64) -> String {
    if ts_ms == 0 {
        return String::new();
    }
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}
