//! SQLite host/group catalog with the derived dynamic membership cache.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;

use crate::access::GroupMembership;
use crate::types::{GroupId, GroupKind, Host, HostGroup, HostId, ProjectId};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("catalog: group {0} not found")]
    GroupNotFound(GroupId),
}

/// Async SQLite-backed catalog of hosts and groups.
pub struct Catalog {
    conn: Connection,
}

fn kind_to_sql(kind: GroupKind) -> &'static str {
    match kind {
        GroupKind::Static => "static",
        GroupKind::Dynamic => "dynamic",
    }
}

fn kind_from_sql(raw: &str) -> GroupKind {
    match raw {
        "dynamic" => GroupKind::Dynamic,
        _ => GroupKind::Static,
    }
}

const HOST_COLUMNS: &str =
    "id, project_id, name, hostname, port, username, os_type, environment, tags, credential_id";

impl Catalog {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory catalog (useful for tests).
    pub async fn new_in_memory() -> Result<Self, CatalogError> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), CatalogError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS hosts (
                        id            INTEGER PRIMARY KEY,
                        project_id    INTEGER NOT NULL,
                        name          TEXT NOT NULL,
                        hostname      TEXT NOT NULL,
                        port          INTEGER NOT NULL DEFAULT 22,
                        username      TEXT NOT NULL DEFAULT 'root',
                        os_type       TEXT,
                        environment   TEXT,
                        tags          TEXT NOT NULL DEFAULT '{}',
                        credential_id INTEGER
                    );

                    CREATE INDEX IF NOT EXISTS idx_hosts_project ON hosts(project_id);

                    CREATE TABLE IF NOT EXISTS host_groups (
                        id         INTEGER PRIMARY KEY,
                        project_id INTEGER NOT NULL,
                        name       TEXT NOT NULL,
                        kind       TEXT NOT NULL,
                        rule       TEXT
                    );

                    CREATE TABLE IF NOT EXISTS group_hosts (
                        group_id INTEGER NOT NULL REFERENCES host_groups(id) ON DELETE CASCADE,
                        host_id  INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                        PRIMARY KEY (group_id, host_id)
                    );

                    CREATE TABLE IF NOT EXISTS dynamic_group_host_cache (
                        group_id    INTEGER NOT NULL REFERENCES host_groups(id) ON DELETE CASCADE,
                        host_id     INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                        computed_at TEXT NOT NULL,
                        PRIMARY KEY (group_id, host_id)
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Hosts
    // -----------------------------------------------------------------------

    pub async fn upsert_host(&self, host: &Host) -> Result<(), CatalogError> {
        let host = host.clone();
        let tags = serde_json::to_string(&host.tags).unwrap_or_else(|_| "{}".into());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO hosts (id, project_id, name, hostname, port, username,
                        os_type, environment, tags, credential_id)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
                     ON CONFLICT(id) DO UPDATE SET
                        project_id=excluded.project_id, name=excluded.name,
                        hostname=excluded.hostname, port=excluded.port,
                        username=excluded.username, os_type=excluded.os_type,
                        environment=excluded.environment, tags=excluded.tags,
                        credential_id=excluded.credential_id",
                    rusqlite::params![
                        host.id,
                        host.project_id,
                        host.name,
                        host.hostname,
                        host.port,
                        host.username,
                        host.os_type,
                        host.environment,
                        tags,
                        host.credential_id,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn delete_host(&self, id: HostId) -> Result<(), CatalogError> {
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM hosts WHERE id = ?1", rusqlite::params![id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_hosts(&self, project_id: ProjectId) -> Result<Vec<Host>, CatalogError> {
        let sql = format!("SELECT {HOST_COLUMNS} FROM hosts WHERE project_id = ?1 ORDER BY id");
        let hosts = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_host(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(hosts)
    }

    pub async fn hosts_by_ids(&self, ids: &[HostId]) -> Result<Vec<Host>, CatalogError> {
        let ids = ids.to_vec();
        let sql = format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = ?1");
        let hosts = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut out = Vec::new();
                for id in ids {
                    let mut rows = stmt.query(rusqlite::params![id])?;
                    if let Some(row) = rows.next()? {
                        out.push(row_to_host(row)?);
                    }
                }
                Ok(out)
            })
            .await?;
        Ok(hosts)
    }

    // -----------------------------------------------------------------------
    // Groups
    // -----------------------------------------------------------------------

    pub async fn upsert_group(&self, group: &HostGroup) -> Result<(), CatalogError> {
        let group = group.clone();
        let kind = kind_to_sql(group.kind);
        let rule = group.rule.as_ref().map(|r| r.to_string());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO host_groups (id, project_id, name, kind, rule)
                     VALUES (?1,?2,?3,?4,?5)
                     ON CONFLICT(id) DO UPDATE SET
                        project_id=excluded.project_id, name=excluded.name,
                        kind=excluded.kind, rule=excluded.rule",
                    rusqlite::params![group.id, group.project_id, group.name, kind, rule],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_group(&self, id: GroupId) -> Result<Option<HostGroup>, CatalogError> {
        let group = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, name, kind, rule FROM host_groups WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_group(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(group)
    }

    pub async fn list_groups(&self, project_id: ProjectId) -> Result<Vec<HostGroup>, CatalogError> {
        let groups = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, name, kind, rule FROM host_groups
                     WHERE project_id = ?1 ORDER BY id",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_group(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(groups)
    }

    pub async fn add_static_member(&self, group_id: GroupId, host_id: HostId) -> Result<(), CatalogError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO group_hosts (group_id, host_id) VALUES (?1, ?2)",
                    rusqlite::params![group_id, host_id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn static_members(&self, group_id: GroupId) -> Result<Vec<HostId>, CatalogError> {
        self.host_ids(
            "SELECT host_id FROM group_hosts WHERE group_id = ?1 ORDER BY host_id",
            group_id,
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Dynamic membership cache
    // -----------------------------------------------------------------------

    pub async fn cached_members(&self, group_id: GroupId) -> Result<Vec<HostId>, CatalogError> {
        self.host_ids(
            "SELECT host_id FROM dynamic_group_host_cache WHERE group_id = ?1 ORDER BY host_id",
            group_id,
        )
        .await
    }

    /// Replace the cached membership of a group wholesale. The delete and
    /// the inserts commit together or not at all.
    pub async fn replace_dynamic_cache(
        &self,
        group_id: GroupId,
        host_ids: &[HostId],
        computed_at: DateTime<Utc>,
    ) -> Result<(), CatalogError> {
        let host_ids = host_ids.to_vec();
        let stamp = computed_at.to_rfc3339();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM dynamic_group_host_cache WHERE group_id = ?1",
                    rusqlite::params![group_id],
                )?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO dynamic_group_host_cache (group_id, host_id, computed_at)
                         VALUES (?1, ?2, ?3)",
                    )?;
                    for host_id in &host_ids {
                        stmt.execute(rusqlite::params![group_id, host_id, stamp])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn cache_computed_at(&self, group_id: GroupId) -> Result<Option<DateTime<Utc>>, CatalogError> {
        let raw = self
            .conn
            .call(move |conn| {
                let raw: Option<String> = conn.query_row(
                    "SELECT MAX(computed_at) FROM dynamic_group_host_cache WHERE group_id = ?1",
                    rusqlite::params![group_id],
                    |r| r.get(0),
                )?;
                Ok(raw)
            })
            .await?;
        Ok(raw.and_then(|s| crate::types::flex_time::parse(&s)))
    }

    /// Static and dynamic-cache membership of every group in a project.
    pub async fn membership(&self, project_id: ProjectId) -> Result<GroupMembership, CatalogError> {
        let (static_rows, dynamic_rows) = self
            .conn
            .call(move |conn| {
                let collect = |sql: &str| -> rusqlite::Result<Vec<(GroupId, HostId)>> {
                    let mut stmt = conn.prepare(sql)?;
                    let rows = stmt.query_map(rusqlite::params![project_id], |r| {
                        Ok((r.get(0)?, r.get(1)?))
                    })?;
                    rows.collect()
                };
                let s = collect(
                    "SELECT gh.group_id, gh.host_id FROM group_hosts gh
                     JOIN host_groups g ON g.id = gh.group_id WHERE g.project_id = ?1",
                )?;
                let d = collect(
                    "SELECT c.group_id, c.host_id FROM dynamic_group_host_cache c
                     JOIN host_groups g ON g.id = c.group_id WHERE g.project_id = ?1",
                )?;
                Ok((s, d))
            })
            .await?;
        let mut membership = GroupMembership::new();
        for (g, h) in static_rows {
            membership.add_static(g, h);
        }
        for (g, h) in dynamic_rows {
            membership.add_dynamic(g, h);
        }
        Ok(membership)
    }

    async fn host_ids(&self, sql: &'static str, group_id: GroupId) -> Result<Vec<HostId>, CatalogError> {
        let ids = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt.query_map(rusqlite::params![group_id], |r| r.get::<_, HostId>(0))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_host(row: &rusqlite::Row<'_>) -> rusqlite::Result<Host> {
    let tags_str: String = row.get(8)?;
    // Corrupt tag JSON reads as no tags; rules over tags then fail closed.
    let tags: BTreeMap<String, serde_json::Value> = serde_json::from_str(&tags_str).unwrap_or_default();
    Ok(Host {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        hostname: row.get(3)?,
        port: row.get(4)?,
        username: row.get(5)?,
        os_type: row.get(6)?,
        environment: row.get(7)?,
        tags,
        credential_id: row.get(9)?,
    })
}

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<HostGroup> {
    let kind: String = row.get(3)?;
    let rule: Option<String> = row.get(4)?;
    Ok(HostGroup {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        kind: kind_from_sql(&kind),
        // Unparsable rule text is kept as a JSON string, which compiles to match-nothing.
        rule: rule.map(|r| serde_json::from_str(&r).unwrap_or(serde_json::Value::String(r))),
    })
}
