use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::Db;
use crate::fetcher::FetcherManager;
use crate::health::HealthState;
use crate::updater::{TsdbUpdater, UpdateReport};

/// Never wait on a TSDB or fetcher past this regardless of how large
/// `update_interval` is configured (spec §5: "default per-tick deadline is
/// `min(update_interval - guard, 1 min)`").
const TICK_DEADLINE_GUARD: Duration = Duration::from_secs(5);
const TICK_DEADLINE_CAP: Duration = Duration::from_secs(60);

/// The control loop tying the fetcher manager, TSDB updaters, and database
/// together into the three-period schedule (spec §4.4): `update_interval`
/// (full fetch→enrich→write), `users_interval` (membership replace).
/// `retention_interval` is out of core and not driven here (spec §4.4: "out
/// of core — noted only as a collaborator").
pub struct Scheduler {
    db: Db,
    fetcher_manager: FetcherManager,
    updaters: HashMap<String, TsdbUpdater>,
    /// `cluster_id -> [updater_id, ...]`, taken from each cluster's
    /// `updaters` config list (spec §6).
    cluster_updaters: HashMap<String, Vec<String>>,
    update_interval: Duration,
    users_interval: Duration,
    health: HealthState,
}

impl Scheduler {
    pub fn new(
        db: Db,
        fetcher_manager: FetcherManager,
        updaters: HashMap<String, TsdbUpdater>,
        cluster_updaters: HashMap<String, Vec<String>>,
        update_interval: Duration,
        users_interval: Duration,
        health: HealthState,
    ) -> Self {
        Self {
            db,
            fetcher_manager,
            updaters,
            cluster_updaters,
            update_interval,
            users_interval,
            health,
        }
    }

    fn tick_deadline(&self) -> Duration {
        self.update_interval.saturating_sub(TICK_DEADLINE_GUARD).min(TICK_DEADLINE_CAP)
    }

    /// Runs the control loop until `shutdown` is cancelled (spec §4.4, §6:
    /// "SIGTERM triggers a graceful shutdown after the current tick's DB
    /// write completes"). A fatal DB write error bubbles up so `main` can
    /// exit with the dedicated fatal-write exit code (spec §6).
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.catch_up(&shutdown).await?;

        let mut update_ticker = tokio::time::interval(self.update_interval);
        update_ticker.tick().await; // consumed by catch_up already
        let mut users_ticker = tokio::time::interval(self.users_interval);
        users_ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, stopping scheduler");
                    return Ok(());
                }
                _ = update_ticker.tick() => {
                    let end = floor_to_interval(Utc::now(), self.update_interval);
                    let start = end - to_chrono_duration(self.update_interval);
                    self.run_update_tick(start, end, &shutdown).await?;
                }
                _ = users_ticker.tick() => {
                    if let Err(e) = self.run_users_tick(Utc::now(), &shutdown).await {
                        error!(error = %e, "membership replace tick failed");
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Reads `last_updated_at` and replays every aligned window between it
    /// and `floor(now, update_interval)` before the steady-state loop
    /// starts (spec §4.4 "catch-up ticks"). Safe to replay because the
    /// units upsert key is `(cluster_id, uuid, started_at_ts)` (spec §8).
    async fn catch_up(&self, shutdown: &CancellationToken) -> Result<()> {
        let last_updated_at = self.db.last_updated_at().await?;
        let windows = catch_up_windows(last_updated_at, Utc::now(), self.update_interval);
        if !windows.is_empty() {
            info!(count = windows.len(), "replaying catch-up ticks");
        }
        for (start, end) in windows {
            if shutdown.is_cancelled() {
                break;
            }
            self.run_update_tick(start, end, shutdown).await?;
        }
        Ok(())
    }

    async fn run_update_tick(&self, start: DateTime<Utc>, end: DateTime<Utc>, shutdown: &CancellationToken) -> Result<()> {
        let tick_cancel = shutdown.child_token();
        let deadline = self.tick_deadline();
        let timer_cancel = tick_cancel.clone();
        let deadline_guard = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            timer_cancel.cancel();
        });

        let (cluster_units, fetch_err) = self.fetcher_manager.fetch_units(start, end, &tick_cancel).await;
        if let Some(err) = &fetch_err {
            warn!(error = %err, "one or more fetchers failed this tick");
        }

        let mut all_units = Vec::new();
        let mut report = UpdateReport::default();
        let mut warnings: Vec<String> = fetch_err.into_iter().collect();

        for cluster in cluster_units {
            let mut units = cluster.units;
            if let Some(updater_ids) = self.cluster_updaters.get(&cluster.cluster_id) {
                for updater_id in updater_ids {
                    let Some(updater) = self.updaters.get(updater_id) else {
                        warn!(updater_id, cluster_id = %cluster.cluster_id, "cluster references unknown updater id");
                        continue;
                    };
                    let r = updater.update(&mut units, start, end, &tick_cancel).await;
                    report.units_enriched += r.units_enriched;
                    report.ignored += r.ignored;
                    report.deleted_series |= r.deleted_series;
                    warnings.extend(r.warnings);
                }
            }
            all_units.extend(units);
        }

        deadline_guard.abort();

        let write_result = self.db.write_tick(&all_units, Utc::now()).await;
        match &write_result {
            Ok(stats) => info!(
                start = %start,
                end = %end,
                units_fetched = all_units.len(),
                units_enriched = report.units_enriched,
                ignored = report.ignored,
                deleted_series = report.deleted_series,
                warnings = warnings.len(),
                usage_rows = stats.usage_rows_recomputed,
                "update tick complete"
            ),
            Err(e) => error!(error = %e, "fatal: database write failed"),
        }
        match &write_result {
            Ok(_) => self.health.record_success(Utc::now()).await,
            Err(e) => self.health.record_error(e.to_string()).await,
        }
        write_result?;
        Ok(())
    }

    async fn run_users_tick(&self, now: DateTime<Utc>, shutdown: &CancellationToken) -> Result<()> {
        let cancel = shutdown.child_token();
        let (users, projects, err) = self.fetcher_manager.fetch_users_projects(now, &cancel).await;
        if let Some(err) = err {
            warn!(error = %err, "one or more fetchers failed users/projects tick");
        }

        for (cluster_users, cluster_projects) in users.into_iter().zip(projects.into_iter()) {
            let cluster_id = cluster_users.cluster_id.clone();
            self.db
                .replace_users_projects(&cluster_id, &cluster_users, &cluster_projects, now)
                .await?;
        }
        info!("users/projects replace tick complete");
        Ok(())
    }
}

/// Align `t` down to the nearest multiple of `interval` since the Unix
/// epoch (spec §4.4: `end = floor(now, update_interval)`).
pub fn floor_to_interval(t: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let secs = interval.as_secs().max(1) as i64;
    let ts = t.timestamp();
    let floored = ts - ts.rem_euclid(secs);
    Utc.timestamp_opt(floored, 0).single().unwrap_or(t)
}

fn to_chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::seconds(1))
}

/// Every `[start, end)` window between `last_updated_at` and
/// `floor(now, update_interval)`, in chronological order. Returns nothing if
/// there's no persisted `last_updated_at` yet — the first-ever tick is
/// handled by the regular steady-state loop instead, since there is no prior
/// window to replay (spec §4.4).
pub fn catch_up_windows(
    last_updated_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    update_interval: Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let Some(last_updated_at) = last_updated_at else {
        return Vec::new();
    };
    let interval = to_chrono_duration(update_interval);
    let last_aligned_end = floor_to_interval(now, update_interval);

    let mut windows = Vec::new();
    let mut end = floor_to_interval(last_updated_at, update_interval) + interval;
    while end <= last_aligned_end {
        windows.push((end - interval, end));
        end += interval;
    }
    windows
}
