pub mod batch;
pub mod query;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::TsdbUpdaterExtraConfig;
use crate::model::Unit;
use crate::tsdb::TsdbClient;

use batch::{chunk_uuids, plan_batches};
use query::TemplateBindings;

/// `aggMetrics[metric_name][sub_metric_name][uuid] = sanitized value`,
/// built fresh for one `Update` invocation and merged under a single mutex
/// (spec §4.2 "Concurrency").
type AggMetrics = HashMap<String, HashMap<String, HashMap<String, f64>>>;

/// Outcome of one `Update` invocation, surfaced to the scheduler for its
/// per-tick INFO log line (spec §7 "user-visible failure behavior").
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    pub units_enriched: usize,
    pub ignored: usize,
    pub deleted_series: bool,
    pub warnings: Vec<String>,
}

/// Enriches units emitted by the fetcher manager with the metric-map fields
/// named in spec §3, by issuing templated queries against a TSDB and
/// distributing results back by the `uuid` label (spec §4.2).
pub struct TsdbUpdater {
    client: TsdbClient,
    config: TsdbUpdaterExtraConfig,
    query_max_samples: u64,
}

impl TsdbUpdater {
    pub fn new(client: TsdbClient, config: TsdbUpdaterExtraConfig, query_max_samples: u64) -> Self {
        Self {
            client,
            config,
            query_max_samples,
        }
    }

    /// Queries `query_max_samples` once via the settings endpoint, per spec
    /// §4.2 "queried once at startup via a settings endpoint".
    pub async fn bootstrap(client: TsdbClient, config: TsdbUpdaterExtraConfig) -> anyhow::Result<Self> {
        let query_max_samples = client.query_max_samples().await?;
        Ok(Self::new(client, config, query_max_samples))
    }

    /// Runs the state machine described in spec §4.2:
    /// `mark-cutoff-ignored -> compute-batches -> fan-out-queries -> merge
    /// -> apply-metrics-to-units -> delete-ignored-series`.
    pub async fn update(
        &self,
        units: &mut [Unit],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> UpdateReport {
        let cutoff_secs = self.config.cutoff_duration.as_secs() as i64;
        for unit in units.iter_mut() {
            unit.mark_ignored_if_below_cutoff(cutoff_secs);
        }

        let uuids: Vec<String> = units.iter().map(|u| u.uuid.clone()).collect();
        let range = (end - start).num_seconds().max(0) as u64;
        let range_dur = Duration::from_secs(range);

        let plan = plan_batches(
            self.query_max_samples,
            self.config.query_max_series,
            self.config.query_min_samples,
            range_dur,
            self.config.scrape_interval,
            uuids.len() as u64,
        );
        let batches = chunk_uuids(&uuids, plan.batch_size);

        let agg: Arc<Mutex<AggMetrics>> = Arc::new(Mutex::new(HashMap::new()));
        let mut warnings = Vec::new();

        for batch in &batches {
            if cancel.is_cancelled() {
                warnings.push("tick cancelled: remaining TSDB batches skipped".to_string());
                break;
            }

            let mut tasks = Vec::new();
            for (metric_name, subs) in &self.config.queries {
                for (sub_name, template) in subs {
                    let bindings = TemplateBindings {
                        uuids: batch.clone(),
                        scrape_interval: self.config.scrape_interval,
                        evaluation_interval: self.config.evaluation_interval,
                        rate_interval: self.config.rate_interval,
                        range: range_dur,
                    };
                    let rendered = bindings.render(template);
                    let client = self.client.clone();
                    let agg = agg.clone();
                    let metric_name = metric_name.clone();
                    let sub_name = sub_name.clone();
                    let at = end.timestamp();

                    tasks.push(tokio::spawn(async move {
                        match client.query(&rendered, at).await {
                            Ok(data) => {
                                let mut guard = agg.lock().await;
                                let inner = guard.entry(metric_name).or_default().entry(sub_name).or_default();
                                for sample in data.result {
                                    if let Some(uuid) = sample.uuid() {
                                        inner.insert(uuid.to_string(), crate::model::sanitize(sample.value_f64()));
                                    }
                                }
                                None
                            }
                            Err(e) => Some(format!("{metric_name}.{sub_name}: {e}")),
                        }
                    }));
                }
            }

            for task in tasks {
                match task.await {
                    Ok(Some(err)) => {
                        warn!(error = %err, "TSDB batch query failed");
                        warnings.push(err);
                    }
                    Ok(None) => {}
                    Err(join_err) => warnings.push(format!("batch task panicked: {join_err}")),
                }
            }
        }

        let agg = Arc::try_unwrap(agg).map(Mutex::into_inner).unwrap_or_default();
        apply_metrics_to_units(units, &agg);

        let ignored_uuids: Vec<String> = units
            .iter()
            .filter(|u| u.is_ignored())
            .map(|u| u.uuid.clone())
            .collect();

        let mut deleted_series = false;
        if self.config.delete_ignored && (!ignored_uuids.is_empty() || !self.config.labels_to_drop.is_empty()) {
            let mut matchers = Vec::new();
            if !ignored_uuids.is_empty() {
                matchers.push(format!("{{uuid=~\"{}\"}}", ignored_uuids.join("|")));
            }
            matchers.extend(self.config.labels_to_drop.iter().cloned());

            let cutoff_start = start - chrono::Duration::seconds(cutoff_secs);
            match self
                .client
                .delete_series(&matchers, cutoff_start.timestamp(), end.timestamp())
                .await
            {
                Ok(()) => deleted_series = true,
                Err(e) => warnings.push(format!("delete_series failed: {e}")),
            }
        }

        info!(
            units_enriched = units.len(),
            ignored = ignored_uuids.len(),
            deleted_series,
            warnings = warnings.len(),
            "tick enrichment complete"
        );

        UpdateReport {
            units_enriched: units.len(),
            ignored: ignored_uuids.len(),
            deleted_series,
            warnings,
        }
    }
}

/// apply-metrics-to-units: for every unit, copy in the sanitized values
/// this invocation fetched for it. Absence of an entry (a uuid the TSDB
/// never returned a sample for) leaves the unit's pre-tick value untouched
/// — "absence = preserve" (spec §5).
fn apply_metrics_to_units(units: &mut [Unit], agg: &AggMetrics) {
    for unit in units.iter_mut() {
        for (metric_name, subs) in agg {
            let Some(target) = unit.metric_map_mut(metric_name) else {
                continue;
            };
            for (sub_name, values) in subs {
                if let Some(value) = values.get(&unit.uuid) {
                    target.insert_raw(sub_name.clone(), *value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TotalTimeSeconds;

    fn unit_with_uuid(uuid: &str) -> Unit {
        Unit {
            cluster_id: "c1".into(),
            uuid: uuid.into(),
            resource_manager: "slurm".into(),
            name: String::new(),
            project: "p".into(),
            group: String::new(),
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
            total_time_seconds: TotalTimeSeconds::default(),
            ignore: 0,
            num_updates: 0,
            last_updated_at: Utc::now(),
        }
    }

    #[test]
    fn apply_metrics_sanitizes_nan_and_negative() {
        // S4: avg_cpu_usage = NaN, total_cpu_energy_usage_kwh = -3.0 -> both 0.
        let mut units = vec![unit_with_uuid("u1")];
        let mut agg: AggMetrics = HashMap::new();
        agg.entry("avg_cpu_usage".to_string())
            .or_default()
            .entry("usage".to_string())
            .or_default()
            .insert("u1".to_string(), crate::model::sanitize(f64::NAN));
        agg.entry("total_cpu_energy_usage_kwh".to_string())
            .or_default()
            .entry("usage".to_string())
            .or_default()
            .insert("u1".to_string(), crate::model::sanitize(-3.0));

        apply_metrics_to_units(&mut units, &agg);

        assert_eq!(units[0].avg_cpu_usage.get("usage"), Some(&0.0));
        assert_eq!(units[0].total_cpu_energy_usage_kwh.get("usage"), Some(&0.0));
    }

    #[test]
    fn apply_metrics_preserves_absent_uuid() {
        let mut units = vec![unit_with_uuid("u1")];
        units[0].avg_cpu_usage.insert_raw("usage", 10.0);
        let agg: AggMetrics = HashMap::new();
        apply_metrics_to_units(&mut units, &agg);
        assert_eq!(units[0].avg_cpu_usage.get("usage"), Some(&10.0));
    }

    #[test]
    fn unrecognized_metric_name_is_ignored_not_panicking() {
        let mut units = vec![unit_with_uuid("u1")];
        let mut agg: AggMetrics = HashMap::new();
        agg.entry("not_a_real_metric".to_string())
            .or_default()
            .entry("x".to_string())
            .or_default()
            .insert("u1".to_string(), 5.0);
        apply_metrics_to_units(&mut units, &agg);
    }
}
