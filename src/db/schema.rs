use rusqlite::Connection;

/// Schema version bumped whenever `SCHEMA_DDL` changes shape. Stored in
/// `PRAGMA user_version` and cross-checked against the `metadata` table's
/// own `schema_version` key (spec §6 "Persisted state").
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS units (
    cluster_id                  TEXT NOT NULL,
    uuid                        TEXT NOT NULL,
    resource_manager            TEXT NOT NULL DEFAULT '',
    name                        TEXT NOT NULL DEFAULT '',
    project                     TEXT NOT NULL DEFAULT '',
    "group"                     TEXT NOT NULL DEFAULT '',
    "user"                      TEXT NOT NULL DEFAULT '',
    state                       TEXT NOT NULL DEFAULT '',
    created_at                  TEXT NOT NULL DEFAULT '',
    created_at_ts               INTEGER NOT NULL DEFAULT 0,
    started_at                  TEXT NOT NULL DEFAULT '',
    started_at_ts               INTEGER NOT NULL DEFAULT 0,
    ended_at                    TEXT NOT NULL DEFAULT '',
    ended_at_ts                 INTEGER NOT NULL DEFAULT 0,
    elapsed                     TEXT NOT NULL DEFAULT '',
    allocation                  TEXT NOT NULL DEFAULT '{}',
    tags                        TEXT NOT NULL DEFAULT '{}',
    avg_cpu_usage               TEXT NOT NULL DEFAULT '{}',
    avg_cpu_mem_usage           TEXT NOT NULL DEFAULT '{}',
    total_cpu_energy_usage_kwh  TEXT NOT NULL DEFAULT '{}',
    total_cpu_emissions_gms     TEXT NOT NULL DEFAULT '{}',
    avg_gpu_usage               TEXT NOT NULL DEFAULT '{}',
    avg_gpu_mem_usage           TEXT NOT NULL DEFAULT '{}',
    total_gpu_energy_usage_kwh  TEXT NOT NULL DEFAULT '{}',
    total_gpu_emissions_gms     TEXT NOT NULL DEFAULT '{}',
    total_io_write_stats        TEXT NOT NULL DEFAULT '{}',
    total_io_read_stats         TEXT NOT NULL DEFAULT '{}',
    total_ingress_stats         TEXT NOT NULL DEFAULT '{}',
    total_outgress_stats        TEXT NOT NULL DEFAULT '{}',
    total_time_seconds          TEXT NOT NULL DEFAULT '{}',
    ignore                      INTEGER NOT NULL DEFAULT 0,
    num_updates                 INTEGER NOT NULL DEFAULT 0,
    last_updated_at             TEXT NOT NULL DEFAULT ''
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_units_cluster_uuid_started
    ON units(cluster_id, uuid, started_at_ts);
CREATE INDEX IF NOT EXISTS idx_units_cluster_project_user ON units(cluster_id, project, "user");

CREATE TABLE IF NOT EXISTS usage (
    cluster_id                  TEXT NOT NULL,
    project                     TEXT NOT NULL,
    "user"                      TEXT NOT NULL,
    avg_cpu_usage               TEXT NOT NULL DEFAULT '{}',
    avg_cpu_mem_usage           TEXT NOT NULL DEFAULT '{}',
    total_cpu_energy_usage_kwh  TEXT NOT NULL DEFAULT '{}',
    total_cpu_emissions_gms     TEXT NOT NULL DEFAULT '{}',
    avg_gpu_usage               TEXT NOT NULL DEFAULT '{}',
    avg_gpu_mem_usage           TEXT NOT NULL DEFAULT '{}',
    total_gpu_energy_usage_kwh  TEXT NOT NULL DEFAULT '{}',
    total_gpu_emissions_gms     TEXT NOT NULL DEFAULT '{}',
    total_io_write_stats        TEXT NOT NULL DEFAULT '{}',
    total_io_read_stats         TEXT NOT NULL DEFAULT '{}',
    total_ingress_stats         TEXT NOT NULL DEFAULT '{}',
    total_outgress_stats        TEXT NOT NULL DEFAULT '{}',
    total_time_seconds          TEXT NOT NULL DEFAULT '{}',
    num_units                   INTEGER NOT NULL DEFAULT 0,
    last_updated_at             TEXT NOT NULL DEFAULT ''
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_usage_cluster_project_user
    ON usage(cluster_id, project, "user");

CREATE TABLE IF NOT EXISTS projects (
    cluster_id       TEXT NOT NULL,
    name             TEXT NOT NULL,
    users            TEXT NOT NULL DEFAULT '[]',
    last_updated_at  TEXT NOT NULL DEFAULT ''
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_cluster_name ON projects(cluster_id, name);

CREATE TABLE IF NOT EXISTS users (
    cluster_id       TEXT NOT NULL,
    name             TEXT NOT NULL,
    projects         TEXT NOT NULL DEFAULT '[]',
    last_updated_at  TEXT NOT NULL DEFAULT ''
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_users_cluster_name ON users(cluster_id, name);

CREATE TABLE IF NOT EXISTS admin_users (
    source  TEXT NOT NULL,
    name    TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_admin_users_source_name ON admin_users(source, name);

CREATE TABLE IF NOT EXISTS metadata (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);
"#;

/// `PRAGMA user_version` check + `CREATE TABLE IF NOT EXISTS` migration
/// bootstrapping (spec §6 "Persisted state"), grounded in the teacher's
/// filesystem-adapter initialization pattern translated to SQL DDL.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current_version > SCHEMA_VERSION {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_SCHEMA),
            Some(format!(
                "database schema version {current_version} is newer than supported version {SCHEMA_VERSION}"
            )),
        ));
    }

    conn.execute_batch(SCHEMA_DDL)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

    conn.execute(
        "INSERT INTO metadata (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0)).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn migrate_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        for table in ["units", "usage", "projects", "users", "admin_users", "metadata"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
