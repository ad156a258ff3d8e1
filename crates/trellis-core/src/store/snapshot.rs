//! Point-in-time snapshot files.
//!
//! Each snapshot is written to a temporary file and renamed into place, so a
//! crash mid-write never leaves a half-written `.db` behind. The stored
//! checksum is the graph fingerprint and is re-verified on load.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use tracing::{debug, warn};

use crate::models::{Edge, IndexSnapshot, Node};
use crate::store::graph::GraphState;
use crate::store::schema::{self, SNAPSHOT_FORMAT_VERSION};
use crate::store::StoreError;

const SNAPSHOT_EXTENSION: &str = "db";

fn slug(label: &str) -> String {
    let mut out = String::new();
    for ch in label.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let trimmed: String = out.trim_end_matches('-').chars().take(40).collect();
    if trimmed.is_empty() {
        "snapshot".to_string()
    } else {
        trimmed
    }
}

/// Ids sort in sequence order: `<seq:020>-<label slug>`.
pub fn snapshot_id(wal_sequence: u64, label: &str) -> String {
    format!("{wal_sequence:020}-{}", slug(label))
}

pub fn snapshot_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.{SNAPSHOT_EXTENSION}"))
}

/// Persist `state` as of `wal_sequence`.
pub fn write_snapshot(
    dir: &Path,
    state: &GraphState,
    label: &str,
    wal_sequence: u64,
) -> Result<IndexSnapshot, StoreError> {
    fs::create_dir_all(dir)?;
    let id = snapshot_id(wal_sequence, label);
    let path = snapshot_path(dir, &id);
    let tmp = dir.join(format!("{id}.{SNAPSHOT_EXTENSION}.tmp"));
    if tmp.exists() {
        fs::remove_file(&tmp)?;
    }

    let created_at = Utc::now();
    let checksum = state.fingerprint();
    let coverage_pct = state.coverage_pct();
    {
        let mut conn = Connection::open(&tmp)?;
        schema::init_schema(&conn)?;
        let tx = conn.transaction()?;
        {
            let mut insert_node =
                tx.prepare("INSERT INTO nodes(id, kind, payload) VALUES (?1, ?2, ?3);")?;
            for node in state.nodes() {
                insert_node.execute(params![
                    node.id().as_str(),
                    node.kind().as_str(),
                    serde_json::to_string(node)?
                ])?;
            }
            let mut insert_edge = tx.prepare(
                "INSERT INTO edges(id, kind, source, target, payload) VALUES (?1, ?2, ?3, ?4, ?5);",
            )?;
            for edge in state.edges() {
                insert_edge.execute(params![
                    edge.id.as_str(),
                    edge.kind.as_str(),
                    edge.source.as_str(),
                    edge.target.as_str(),
                    serde_json::to_string(edge)?
                ])?;
            }
            for (key, value) in [
                (schema::META_ID, id.clone()),
                (schema::META_LABEL, label.to_string()),
                (schema::META_CREATED_AT, created_at.to_rfc3339()),
                (schema::META_WAL_SEQUENCE, wal_sequence.to_string()),
                (schema::META_NODE_COUNT, state.node_count().to_string()),
                (schema::META_EDGE_COUNT, state.edge_count().to_string()),
                (schema::META_COVERAGE_PCT, coverage_pct.to_string()),
                (schema::META_CHECKSUM, checksum.clone()),
            ] {
                schema::set_meta(&tx, key, &value)?;
            }
        }
        tx.commit()?;
    }
    fs::rename(&tmp, &path)?;
    let size_bytes = fs::metadata(&path)?.len();
    debug!(id = %id, nodes = state.node_count(), edges = state.edge_count(), "wrote snapshot");

    Ok(IndexSnapshot {
        id,
        label: label.to_string(),
        created_at,
        wal_sequence,
        node_count: state.node_count(),
        edge_count: state.edge_count(),
        coverage_pct,
        checksum,
        path,
        size_bytes,
    })
}

fn open_read_only(path: &Path) -> Result<Connection, StoreError> {
    Ok(Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?)
}

fn corrupt(path: &Path, reason: impl Into<String>) -> StoreError {
    StoreError::StorageCorruption {
        location: path.display().to_string(),
        reason: reason.into(),
    }
}

fn required_meta(conn: &Connection, path: &Path, key: &str) -> Result<String, StoreError> {
    schema::get_meta(conn, key)?.ok_or_else(|| corrupt(path, format!("missing meta `{key}`")))
}

fn parse_meta<T: std::str::FromStr>(
    conn: &Connection,
    path: &Path,
    key: &str,
) -> Result<T, StoreError> {
    required_meta(conn, path, key)?
        .parse()
        .map_err(|_| corrupt(path, format!("unparseable meta `{key}`")))
}

fn read_header(conn: &Connection, path: &Path) -> Result<IndexSnapshot, StoreError> {
    let version = schema::format_version(conn)?;
    if version != SNAPSHOT_FORMAT_VERSION {
        return Err(corrupt(path, format!("unsupported format version {version}")));
    }
    let created_at = DateTime::parse_from_rfc3339(&required_meta(conn, path, schema::META_CREATED_AT)?)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| corrupt(path, "unparseable created_at"))?;
    Ok(IndexSnapshot {
        id: required_meta(conn, path, schema::META_ID)?,
        label: required_meta(conn, path, schema::META_LABEL)?,
        created_at,
        wal_sequence: parse_meta(conn, path, schema::META_WAL_SEQUENCE)?,
        node_count: parse_meta(conn, path, schema::META_NODE_COUNT)?,
        edge_count: parse_meta(conn, path, schema::META_EDGE_COUNT)?,
        coverage_pct: parse_meta(conn, path, schema::META_COVERAGE_PCT)?,
        checksum: required_meta(conn, path, schema::META_CHECKSUM)?,
        path: path.to_path_buf(),
        size_bytes: fs::metadata(path)?.len(),
    })
}

/// Snapshot metadata without loading the graph.
pub fn read_snapshot_meta(path: &Path) -> Result<IndexSnapshot, StoreError> {
    let conn = open_read_only(path)?;
    read_header(&conn, path)
}

/// Load a snapshot and verify its checksum.
pub fn load_snapshot(path: &Path) -> Result<(IndexSnapshot, GraphState), StoreError> {
    let conn = open_read_only(path)?;
    let header = read_header(&conn, path)?;

    let mut nodes = Vec::with_capacity(header.node_count);
    let mut stmt = conn.prepare("SELECT payload FROM nodes ORDER BY id;")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for payload in rows {
        nodes.push(serde_json::from_str::<Node>(&payload?)?);
    }

    let mut edges = Vec::with_capacity(header.edge_count);
    let mut stmt = conn.prepare("SELECT payload FROM edges ORDER BY id;")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for payload in rows {
        edges.push(serde_json::from_str::<Edge>(&payload?)?);
    }

    let state = GraphState::from_parts(nodes, edges);
    if state.fingerprint() != header.checksum {
        return Err(corrupt(path, "checksum mismatch"));
    }
    Ok((header, state))
}

/// Readable snapshots in `dir`, oldest first. Unreadable files are skipped.
pub fn list_snapshots(dir: &Path) -> Result<Vec<IndexSnapshot>, StoreError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut snapshots = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
            continue;
        }
        match read_snapshot_meta(&path) {
            Ok(meta) => snapshots.push(meta),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable snapshot"),
        }
    }
    snapshots.sort_by(|a, b| {
        a.wal_sequence
            .cmp(&b.wal_sequence)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
    Ok(snapshots)
}

pub fn find_snapshot(dir: &Path, id: &str) -> Result<PathBuf, StoreError> {
    let path = snapshot_path(dir, id);
    if path.is_file() {
        Ok(path)
    } else {
        Err(StoreError::SnapshotNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ParseStatus;
    use crate::store::test_support::{file_node, function_node};

    fn sample_state() -> GraphState {
        let file = file_node("a.py", ParseStatus::Partial);
        let f = function_node("a.py", "a", "f", 1);
        GraphState::from_parts(
            vec![file.clone(), f.clone()],
            vec![Edge::contains(file.id().clone(), f.id().clone())],
        )
    }

    #[test]
    fn test_slug_and_id_shape() {
        assert_eq!(slug("  Before Refactor!! "), "before-refactor");
        assert_eq!(slug("***"), "snapshot");
        assert_eq!(snapshot_id(42, "nightly"), "00000000000000000042-nightly");
    }

    #[test]
    fn test_write_then_load_restores_identical_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = sample_state();
        let meta = write_snapshot(dir.path(), &state, "baseline", 9).unwrap();
        assert_eq!(meta.node_count, 2);
        assert_eq!(meta.edge_count, 1);
        assert!(meta.size_bytes > 0);

        let (header, loaded) = load_snapshot(&meta.path).unwrap();
        assert_eq!(header.wal_sequence, 9);
        assert_eq!(header.label, "baseline");
        assert_eq!(loaded, state);

        let listed = list_snapshots(dir.path()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, meta.id);
        assert_eq!(find_snapshot(dir.path(), &meta.id).unwrap(), meta.path);
        assert!(matches!(
            find_snapshot(dir.path(), "nope"),
            Err(StoreError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_tampered_snapshot_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let meta = write_snapshot(dir.path(), &sample_state(), "x", 1).unwrap();
        {
            let conn = Connection::open(&meta.path).unwrap();
            conn.execute("DELETE FROM edges;", []).unwrap();
        }
        assert!(matches!(
            load_snapshot(&meta.path),
            Err(StoreError::StorageCorruption { .. })
        ));
    }
}
