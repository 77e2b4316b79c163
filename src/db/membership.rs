use chrono::{DateTime, Utc};
use rusqlite::{named_params, Transaction};

use crate::model::{dedup_sorted, Project, User};

/// Replaces every `projects` row for `cluster_id` wholesale (spec §3:
/// "Projects/Users are replaced wholesale per snapshot"). Deleting first
/// means a project absent from the new snapshot doesn't linger — this is
/// what testable property S6 checks ("no residual usr1 remains").
pub fn replace_projects(tx: &Transaction, cluster_id: &str, projects: &[Project], now: DateTime<Utc>) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM projects WHERE cluster_id = ?1", [cluster_id])?;
    for project in projects {
        let users = dedup_sorted(project.users.clone());
        tx.execute(
            r#"INSERT INTO projects (cluster_id, name, users, last_updated_at)
               VALUES (:cluster_id, :name, :users, :now)
               ON CONFLICT(cluster_id, name) DO UPDATE SET
                   users = excluded.users, last_updated_at = excluded.last_updated_at"#,
            named_params! {
                ":cluster_id": cluster_id,
                ":name": project.name,
                ":users": serde_json::to_string(&users).unwrap_or_else(|_| "[]".to_string()),
                ":now": now.to_rfc3339(),
            },
        )?;
    }
    Ok(())
}

pub fn replace_users(tx: &Transaction, cluster_id: &str, users: &[User], now: DateTime<Utc>) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM users WHERE cluster_id = ?1", [cluster_id])?;
    for user in users {
        let projects = dedup_sorted(user.projects.clone());
        tx.execute(
            r#"INSERT INTO users (cluster_id, name, projects, last_updated_at)
               VALUES (:cluster_id, :name, :projects, :now)
               ON CONFLICT(cluster_id, name) DO UPDATE SET
                   projects = excluded.projects, last_updated_at = excluded.last_updated_at"#,
            named_params! {
                ":cluster_id": cluster_id,
                ":name": user.name,
                ":projects": serde_json::to_string(&projects).unwrap_or_else(|_| "[]".to_string()),
                ":now": now.to_rfc3339(),
            },
        )?;
    }
    Ok(())
}

/// `admin_users`: a per-source list of privileged users, peripheral to the
/// core but referenced for write-authorization of certain rows (spec §3).
pub fn replace_admin_users(tx: &Transaction, source: &str, users: &[String]) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM admin_users WHERE source = ?1", [source])?;
    for user in dedup_sorted(users.to_vec()) {
        tx.execute(
            "INSERT INTO admin_users (source, name) VALUES (?1, ?2)
             ON CONFLICT(source, name) DO NOTHING",
            rusqlite::params![source, user],
        )?;
    }
    Ok(())
}
