//! SQLite layout of snapshot files.
//!
//! A snapshot is a self-contained database: a `meta` key/value table
//! describing it plus one row per node and per edge holding the JSON payload.

use rusqlite::{params, Connection, OptionalExtension};

use crate::store::StoreError;

/// Bumped whenever the table layout or payload encoding changes.
pub const SNAPSHOT_FORMAT_VERSION: i32 = 1;

pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS nodes (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS edges (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        source TEXT NOT NULL,
        target TEXT NOT NULL,
        payload TEXT NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_nodes_kind ON nodes(kind);",
    "CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source);",
    "CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target);",
];

// ─── meta keys ──────────────────────────────────────────────────────────────

pub const META_FORMAT_VERSION: &str = "format_version";
pub const META_ID: &str = "id";
pub const META_LABEL: &str = "label";
pub const META_CREATED_AT: &str = "created_at";
pub const META_WAL_SEQUENCE: &str = "wal_sequence";
pub const META_NODE_COUNT: &str = "node_count";
pub const META_EDGE_COUNT: &str = "edge_count";
pub const META_COVERAGE_PCT: &str = "coverage_pct";
pub const META_CHECKSUM: &str = "checksum";

/// Create every table and stamp the format version.
pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    for stmt in SCHEMA_STATEMENTS {
        conn.execute_batch(stmt)?;
    }
    set_meta(conn, META_FORMAT_VERSION, &SNAPSHOT_FORMAT_VERSION.to_string())?;
    Ok(())
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO meta(key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        params![key, value],
    )?;
    Ok(())
}

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row("SELECT value FROM meta WHERE key = ?1;", params![key], |row| {
            row.get(0)
        })
        .optional()?)
}

/// Format version of an existing snapshot, 0 when unstamped.
pub fn format_version(conn: &Connection) -> Result<i32, StoreError> {
    Ok(get_meta(conn, META_FORMAT_VERSION)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(format_version(&conn).unwrap(), SNAPSHOT_FORMAT_VERSION);
    }

    #[test]
    fn test_meta_upsert_and_missing_key() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        set_meta(&conn, META_LABEL, "first").unwrap();
        set_meta(&conn, META_LABEL, "second").unwrap();
        assert_eq!(get_meta(&conn, META_LABEL).unwrap().as_deref(), Some("second"));
        assert_eq!(get_meta(&conn, META_CHECKSUM).unwrap(), None);
    }
}
