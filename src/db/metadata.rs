use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

/// Well-known `metadata` keys (spec §6 "Persisted state").
pub const LAST_UPDATED_AT: &str = "last_updated_at";
pub const LAST_USERS_PROJECTS_UPDATED_AT: &str = "last_users_projects_updated_at";

pub fn get_timestamp(conn: &Connection, key: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| row.get(0))
        .optional()?;
    Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&Utc)))
}

pub fn set_timestamp(conn: &Connection, key: &str, value: DateTime<Utc>) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![key, value.to_rfc3339()],
    )?;
    Ok(())
}
