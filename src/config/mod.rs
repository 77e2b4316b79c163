use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top level YAML document (spec §6). Mirrors the upstream
/// `ceems_api_server` / `clusters` / `updaters` document shape.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ceems_api_server: ApiServerConfig,
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub updaters: Vec<UpdaterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiServerConfig {
    pub data: DataConfig,
    #[serde(default)]
    pub web: Option<WebConfig>,
    /// Listen address for the internal `/health` + `/status` surface. Not
    /// part of the upstream YAML shape (spec §6) — an ambient addition so
    /// the binary has something to bind liveness checks to.
    #[serde(default = "default_health_addr")]
    pub health_addr: String,
}

fn default_health_addr() -> String {
    "127.0.0.1:9100".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    #[serde(with = "humantime_serde")]
    pub update_interval: std::time::Duration,
    #[serde(with = "humantime_serde", default = "default_users_interval")]
    pub users_interval: std::time::Duration,
    #[serde(with = "humantime_serde")]
    pub retention_period: std::time::Duration,
}

fn default_users_interval() -> std::time::Duration {
    std::time::Duration::from_secs(3600)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CliConfig {
    pub path: String,
    #[serde(default)]
    pub environment_variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub id: String,
    pub manager: String,
    #[serde(default)]
    pub cli: Option<CliConfig>,
    #[serde(default)]
    pub web: Option<WebConfig>,
    #[serde(default)]
    pub updaters: Vec<String>,
    #[serde(default)]
    pub extra_config: serde_yaml::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdaterConfig {
    pub id: String,
    pub updater: String,
    #[serde(default)]
    pub web: Option<WebConfig>,
    #[serde(default)]
    pub extra_config: TsdbUpdaterExtraConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TsdbUpdaterExtraConfig {
    #[serde(default = "default_query_max_series")]
    pub query_max_series: u64,
    #[serde(default = "default_query_min_samples")]
    pub query_min_samples: f64,
    #[serde(with = "humantime_serde", default = "default_cutoff_duration")]
    pub cutoff_duration: std::time::Duration,
    #[serde(default)]
    pub delete_ignored: bool,
    /// `queries[<metric_name>][<sub_metric_name>] = query_template`
    #[serde(default)]
    pub queries: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub labels_to_drop: Vec<String>,
    /// TSDB scrape interval, used to derive `samples_per_series` for the
    /// batching formula (spec §4.2) and as the `ScrapeInterval` template
    /// binding. Not named explicitly in spec §6's example block but implied
    /// by the `ScrapeInterval` binding it documents.
    #[serde(with = "humantime_serde", default = "default_scrape_interval")]
    pub scrape_interval: std::time::Duration,
    #[serde(with = "humantime_serde", default = "default_scrape_interval")]
    pub evaluation_interval: std::time::Duration,
    #[serde(with = "humantime_serde", default = "default_rate_interval")]
    pub rate_interval: std::time::Duration,
}

fn default_query_max_series() -> u64 {
    50
}
fn default_query_min_samples() -> f64 {
    0.5
}
fn default_cutoff_duration() -> std::time::Duration {
    std::time::Duration::from_secs(10 * 60)
}
fn default_scrape_interval() -> std::time::Duration {
    std::time::Duration::from_secs(15)
}
fn default_rate_interval() -> std::time::Duration {
    std::time::Duration::from_secs(60)
}

impl Default for TsdbUpdaterExtraConfig {
    fn default() -> Self {
        Self {
            query_max_series: default_query_max_series(),
            query_min_samples: default_query_min_samples(),
            cutoff_duration: default_cutoff_duration(),
            delete_ignored: false,
            queries: HashMap::new(),
            labels_to_drop: Vec::new(),
            scrape_interval: default_scrape_interval(),
            evaluation_interval: default_scrape_interval(),
            rate_interval: default_rate_interval(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
        let cfg: Config = serde_yaml::from_str(&raw).context("parsing config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Fatal-at-startup validation (spec §7 "Config" error kind): unknown
    /// manager, unknown updater kind, duplicate cluster ID, invalid ID
    /// regex, invalid query_min_samples range.
    pub fn validate(&self) -> Result<()> {
        let known_managers: HashSet<&str> = ["slurm", "openstack", "k8s"].into_iter().collect();
        let known_updater_kinds: HashSet<&str> = ["tsdb"].into_iter().collect();
        let mut seen_ids = HashSet::new();

        if self.clusters.is_empty() {
            bail!("config error: at least one cluster must be configured");
        }

        for cluster in &self.clusters {
            if !is_valid_cluster_id(&cluster.id) {
                bail!(
                    "config error: cluster id '{}' must match [A-Za-z0-9_-]+",
                    cluster.id
                );
            }
            if !seen_ids.insert(cluster.id.clone()) {
                bail!("config error: duplicate cluster id '{}'", cluster.id);
            }
            if !known_managers.contains(cluster.manager.as_str()) {
                bail!(
                    "config error: unknown manager '{}' for cluster '{}'",
                    cluster.manager,
                    cluster.id
                );
            }
        }

        for updater in &self.updaters {
            if !known_updater_kinds.contains(updater.updater.as_str()) {
                bail!(
                    "config error: unknown updater kind '{}' for updater '{}'",
                    updater.updater,
                    updater.id
                );
            }

            let qms = updater.extra_config.query_min_samples;
            if !(0.0..=1.0).contains(&qms) {
                bail!(
                    "config error: updater '{}' query_min_samples must be in 0..=1, got {}",
                    updater.id,
                    qms
                );
            }
        }

        Ok(())
    }
}

fn is_valid_cluster_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Minimal `humantime`-backed serde adapter ("5m", "15m", "1h", ...),
/// grounded in `azat-chdig`'s use of `humantime::Duration` for config
/// durations.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        s.parse::<humantime::Duration>()
            .map(Into::into)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
ceems_api_server:
  data:
    update_interval: 15m
    retention_period: 30d
clusters:
  - id: cluster-1
    manager: slurm
updaters:
  - id: tsdb-1
    updater: tsdb
    extra_config:
      query_max_series: 50
      query_min_samples: 0.5
"#
    }

    #[test]
    fn parses_minimal_config() {
        let cfg: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        assert_eq!(cfg.clusters.len(), 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_cluster_id() {
        let mut cfg: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        let dup = cfg.clusters[0].clone();
        cfg.clusters.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_manager() {
        let mut cfg: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        cfg.clusters[0].manager = "mesos".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_invalid_cluster_id() {
        let mut cfg: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        cfg.clusters[0].id = "bad id!".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_updater_kind() {
        let mut cfg: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        cfg.updaters[0].updater = "influx".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_query_min_samples() {
        let mut cfg: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        cfg.updaters[0].extra_config.query_min_samples = 1.5;
        assert!(cfg.validate().is_err());
    }
}
