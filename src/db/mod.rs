pub mod functions;
pub mod membership;
pub mod metadata;
pub mod schema;
pub mod units;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use tokio::sync::Mutex;

use crate::model::{ClusterProjects, ClusterUsers, Unit};

/// Outcome of one transactional tick write, surfaced to the scheduler's
/// per-tick INFO log line (spec §7).
#[derive(Debug, Clone, Default)]
pub struct TickWriteStats {
    pub units_written: usize,
    pub usage_rows_recomputed: usize,
}

/// Single process-wide writer handle wrapped in a cloneable `Db`, mirroring
/// the teacher's `Arc<...>`-composed service style in `app_state.rs`.
/// Additional reader connections may be opened independently and coexist
/// (spec §5: "single writer, multiple readers").
#[derive(Clone)]
pub struct Db {
    writer: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Db {
    /// Opens (creating if absent) the database at `path`, registers the
    /// custom SQL functions (spec §4.3), and runs schema migration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).with_context(|| format!("opening database {}", path.display()))?;
        functions::register(&conn).context("registering custom SQL functions")?;
        schema::migrate(&conn).context("migrating database schema")?;

        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        functions::register(&conn)?;
        schema::migrate(&conn)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Opens an independent read-only connection against the same file.
    /// Readers never block the writer and vice versa (spec §5).
    pub fn open_reader(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("opening reader connection to {}", self.path.display()))?;
        functions::register(&conn)?;
        Ok(conn)
    }

    /// Writes one tick's enriched units: upserts every unit row, then
    /// recomputes every touched `(cluster_id, project, user)` usage row, all
    /// inside one transaction (spec §4.3, §5: "atomic" unit-then-usage
    /// write). The transaction is rolled back on any error — a metric blob
    /// parse failure or a post-conflict unique-index violation is fatal
    /// (spec §4.3, §7 "DB write" error kind).
    pub async fn write_tick(&self, units: &[Unit], now: DateTime<Utc>) -> Result<TickWriteStats> {
        let mut conn = self.writer.lock().await;
        let tx = conn.transaction().context("beginning tick write transaction")?;

        for unit in units {
            units::upsert_unit(&tx, unit, now).context("upserting unit row")?;
        }

        let usage_keys = units::touched_usage_keys(units);
        for (cluster_id, project, user) in &usage_keys {
            units::recompute_usage(&tx, cluster_id, project, user, now).context("recomputing usage row")?;
        }

        metadata::set_timestamp(&tx, metadata::LAST_UPDATED_AT, now).context("updating last_updated_at")?;

        tx.commit().context("committing tick write transaction")?;

        Ok(TickWriteStats {
            units_written: units.len(),
            usage_rows_recomputed: usage_keys.len(),
        })
    }

    /// Replaces one cluster's project/user membership snapshot wholesale
    /// (spec §3, §4.4 "users_interval" sub-tick) in a single transaction.
    pub async fn replace_users_projects(
        &self,
        cluster_id: &str,
        users: &ClusterUsers,
        projects: &ClusterProjects,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.writer.lock().await;
        let tx = conn.transaction().context("beginning membership replace transaction")?;

        membership::replace_projects(&tx, cluster_id, &projects.projects, now).context("replacing projects")?;
        membership::replace_users(&tx, cluster_id, &users.users, now).context("replacing users")?;
        metadata::set_timestamp(&tx, metadata::LAST_USERS_PROJECTS_UPDATED_AT, now)
            .context("updating last_users_projects_updated_at")?;

        tx.commit().context("committing membership replace transaction")?;
        Ok(())
    }

    pub async fn last_updated_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.writer.lock().await;
        Ok(metadata::get_timestamp(&conn, metadata::LAST_UPDATED_AT)?)
    }

    pub async fn last_users_projects_updated_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.writer.lock().await;
        Ok(metadata::get_timestamp(&conn, metadata::LAST_USERS_PROJECTS_UPDATED_AT)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricMap, TotalTimeSeconds};

    fn unit(uuid: &str, ended_at_ts: i64, started_at_ts: i64) -> Unit {
        Unit {
            cluster_id: "c1".into(),
            uuid: uuid.into(),
            resource_manager: "slurm".into(),
            name: "job".into(),
            project: "proj".into(),
            group: "grp".into(),
            user: "usr".into(),
            state: "RUNNING".into(),
            created_at: String::new(),
            created_at_ts: 0,
            started_at: String::new(),
            started_at_ts,
            ended_at: String::new(),
            ended_at_ts,
            elapsed: String::new(),
            allocation: Default::default(),
            tags: Default::default(),
            avg_cpu_usage: MetricMap::new(),
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

    #[tokio::test]
    async fn write_tick_updates_metadata_and_counts() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc::now();
        let stats = db.write_tick(&[unit("u1", 0, 1_000)], now).await.unwrap();
        assert_eq!(stats.units_written, 1);
        assert_eq!(stats.usage_rows_recomputed, 1);

        let last_updated = db.last_updated_at().await.unwrap().unwrap();
        assert_eq!(last_updated.timestamp(), now.timestamp());
    }

    #[tokio::test]
    async fn s3_short_job_persists_as_ignored() {
        // started_at_ts=1676988486000, ended_at_ts=1676988503000 (17s) < cutoff.
        // Ignore flag is set by the updater before write_tick is called; here
        // we verify the ignore column round-trips through the upsert.
        let db = Db::open_in_memory().unwrap();
        let mut u = unit("short", 1_676_988_503_000, 1_676_988_486_000);
        u.mark_ignored_if_below_cutoff(120);
        assert!(u.is_ignored());

        db.write_tick(&[u], Utc::now()).await.unwrap();
        let conn = db.open_reader().unwrap();
        let ignore: i64 = conn
            .query_row("SELECT ignore FROM units WHERE uuid='short'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(ignore, 1);
    }

    #[tokio::test]
    async fn retick_same_window_holds_averages_sums_totals() {
        // Testable property 2: avg_metric_map(m, m, w, w) == m, so an
        // average metric (weighted on the same total_time_seconds both
        // times) reports the same value on re-tick. total_time_seconds
        // itself is a *sum* metric (add_metric_map, spec §4.3) and doubles
        // on an identical-window re-tick (900 -> 1800) — that's the
        // prescribed accumulation, not a bug, so this asserts it rather
        // than claiming the row is untouched.
        let db = Db::open_in_memory().unwrap();
        let mut u = unit("u1", 0, 1_000);
        u.avg_cpu_usage.insert_raw("usage", 42.0);
        u.total_time_seconds = TotalTimeSeconds::from_allocation(900.0, 160.0, 0.0, 8.0, 0.0);

        db.write_tick(&[u.clone()], Utc::now()).await.unwrap();
        db.write_tick(&[u], Utc::now()).await.unwrap();

        let conn = db.open_reader().unwrap();
        let (cpu_usage, walltime, num_updates): (f64, f64, i64) = conn
            .query_row(
                "SELECT json_extract(avg_cpu_usage,'$.usage'), json_extract(total_time_seconds,'$.walltime'), num_updates FROM units WHERE uuid='u1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert!((cpu_usage - 42.0).abs() < 1e-9);
        assert_eq!(walltime, 1800.0);
        assert_eq!(num_updates, 2);
    }
}
