//! Canonical graph store.
//!
//! Reads see the last-committed [`GraphState`] through a `RwLock`. All writes
//! funnel through [`GraphStore::apply`], which holds the single writer lock,
//! validates the transaction against the committed state, appends its entries
//! to the WAL and only then folds them into memory.

pub mod graph;
pub mod schema;
pub mod snapshot;
pub mod transaction;
pub mod wal;

#[cfg(test)]
pub(crate) mod test_support;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::models::{Edge, EdgeId, EdgeKind, IndexSnapshot, Node, NodeId, NodeKind};

pub use graph::GraphState;
pub use transaction::{diff_transaction, Mutation, Transaction};
pub use wal::{Record, WalEntry, WalOp};

use transaction::Staging;
use wal::Wal;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Invariant a rejected transaction would have broken.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Violation {
    #[error("node {0} already exists")]
    DuplicateNode(NodeId),

    #[error("node {0} does not exist")]
    MissingNode(NodeId),

    #[error("node id {id} does not match kind {kind}")]
    KindMismatch { id: NodeId, kind: NodeKind },

    #[error("qualified name `{name}` is already used by {existing}")]
    DuplicateQualifiedName { name: String, existing: NodeId },

    #[error("edge {edge} references missing node {endpoint}")]
    MissingEndpoint { edge: EdgeId, endpoint: NodeId },

    #[error("edge {0} already exists")]
    DuplicateEdge(EdgeId),

    #[error("edge {0} does not exist")]
    MissingEdge(EdgeId),

    #[error("edge id {0} does not match its kind and endpoints")]
    EdgeIdMismatch(EdgeId),

    #[error("edge {edge} has confidence {value} outside [0, 1]")]
    ConfidenceOutOfRange { edge: EdgeId, value: f64 },

    #[error("unresolved edge {edge} has confidence {value} above 0.7")]
    UnresolvedConfidenceTooHigh { edge: EdgeId, value: f64 },

    #[error("edge {0} would create a containment cycle")]
    ContainsCycle(EdgeId),

    #[error("edge {edge} gives {child} a second parent (already contained by {parent})")]
    SecondParent {
        edge: EdgeId,
        child: NodeId,
        parent: NodeId,
    },

    #[error("edge {0} would create an inheritance cycle")]
    InheritsCycle(EdgeId),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transaction rejected: {0}")]
    InvariantViolation(Violation),

    #[error("storage corruption at {location}: {reason}")]
    StorageCorruption { location: String, reason: String },

    #[error("WAL sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("store has no state directory")]
    NotPersistent,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// On-disk layout under a state directory.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.root.join("wal")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }
}

// ---------------------------------------------------------------------------
// Receipts and patterns
// ---------------------------------------------------------------------------

/// What a committed transaction changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Receipt {
    pub first_seq: u64,
    pub last_seq: u64,
    pub entries: usize,
    pub nodes_created: Vec<NodeId>,
    pub nodes_updated: Vec<NodeId>,
    pub nodes_deleted: Vec<NodeId>,
    pub edges_created: Vec<EdgeId>,
    pub edges_deleted: Vec<EdgeId>,
    /// Snapshot taken automatically after this commit, if any.
    pub snapshot: Option<IndexSnapshot>,
}

impl Receipt {
    fn from_entries(entries: &[WalEntry]) -> Self {
        let mut receipt = Receipt {
            first_seq: entries.first().map(|e| e.seq).unwrap_or(0),
            last_seq: entries.last().map(|e| e.seq).unwrap_or(0),
            entries: entries.len(),
            ..Receipt::default()
        };
        for entry in entries {
            let node = || NodeId::from(entry.entity.as_str());
            let edge = || match (&entry.before, &entry.after) {
                (_, Some(Record::Edge(e))) | (Some(Record::Edge(e)), _) => Some(e.id.clone()),
                _ => None,
            };
            match entry.op {
                WalOp::CreateNode => receipt.nodes_created.push(node()),
                WalOp::UpdateNode => receipt.nodes_updated.push(node()),
                WalOp::DeleteNode => receipt.nodes_deleted.push(node()),
                WalOp::CreateEdge => receipt.edges_created.extend(edge()),
                WalOp::DeleteEdge => receipt.edges_deleted.extend(edge()),
            }
        }
        receipt
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgePattern {
    pub kinds: Vec<EdgeKind>,
    pub direction: Direction,
    pub min_confidence: f64,
}

impl EdgePattern {
    pub fn new(direction: Direction) -> Self {
        Self {
            kinds: Vec::new(),
            direction,
            min_confidence: 0.0,
        }
    }

    pub fn kinds(mut self, kinds: &[EdgeKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn min_confidence(mut self, value: f64) -> Self {
        self.min_confidence = value;
        self
    }

    fn matches(&self, edge: &Edge) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&edge.kind))
            && edge.confidence.value() >= self.min_confidence
    }
}

/// Declarative node filter. Empty fields match everything.
///
/// With an edge pattern set, only nodes with at least one matching edge are
/// returned, together with those edges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pattern {
    pub kind: Option<NodeKind>,
    pub name: Option<String>,
    pub qualified_prefix: Option<String>,
    pub file_path: Option<String>,
    pub edges: Option<EdgePattern>,
    pub limit: Option<usize>,
}

impl Pattern {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: NodeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn qualified_prefix(mut self, prefix: &str) -> Self {
        self.qualified_prefix = Some(prefix.to_string());
        self
    }

    pub fn in_file(mut self, path: &str) -> Self {
        self.file_path = Some(path.to_string());
        self
    }

    pub fn with_edges(mut self, edges: EdgePattern) -> Self {
        self.edges = Some(edges);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches_node(&self, node: &Node) -> bool {
        self.kind.map_or(true, |k| node.kind() == k)
            && self.name.as_deref().map_or(true, |n| node.name() == n)
            && self
                .qualified_prefix
                .as_deref()
                .map_or(true, |p| node.qualified_name().starts_with(p))
            && self
                .file_path
                .as_deref()
                .map_or(true, |p| node.file_path() == Some(p))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub node: Node,
    pub edges: Vec<Edge>,
}

fn match_pattern(state: &GraphState, pattern: &Pattern) -> Vec<Match> {
    let limit = pattern.limit.unwrap_or(usize::MAX);
    let candidates: Box<dyn Iterator<Item = &Node>> = match &pattern.file_path {
        Some(path) => Box::new(state.nodes_in_file(path)),
        None => Box::new(state.nodes()),
    };
    let mut out = Vec::new();
    for node in candidates {
        if out.len() >= limit {
            break;
        }
        if !pattern.matches_node(node) {
            continue;
        }
        let edges = match &pattern.edges {
            None => Vec::new(),
            Some(edge_pattern) => {
                let mut edges: Vec<Edge> = Vec::new();
                if edge_pattern.direction != Direction::Incoming {
                    edges.extend(state.outgoing(node.id()).filter(|e| edge_pattern.matches(e)).cloned());
                }
                if edge_pattern.direction != Direction::Outgoing {
                    edges.extend(state.incoming(node.id()).filter(|e| edge_pattern.matches(e)).cloned());
                }
                if edges.is_empty() {
                    continue;
                }
                edges
            }
        };
        out.push(Match {
            node: node.clone(),
            edges,
        });
    }
    out
}

// ---------------------------------------------------------------------------
// GraphStore
// ---------------------------------------------------------------------------

struct Writer {
    wal: Option<Wal>,
    next_seq: u64,
    entries_since_snapshot: u64,
    last_snapshot_at: Instant,
}

pub struct GraphStore {
    state: RwLock<GraphState>,
    writer: Mutex<Writer>,
    /// Last committed sequence, readable without the writer lock.
    committed: AtomicU64,
    layout: Option<StoreLayout>,
    config: StoreConfig,
}

impl GraphStore {
    /// A store with no durability, for tests and throwaway sessions.
    pub fn in_memory(config: StoreConfig) -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            writer: Mutex::new(Writer {
                wal: None,
                next_seq: 1,
                entries_since_snapshot: 0,
                last_snapshot_at: Instant::now(),
            }),
            committed: AtomicU64::new(0),
            layout: None,
            config,
        }
    }

    /// Open (or create) a persistent store: load the newest readable
    /// snapshot, then replay the WAL past it.
    pub fn open(root: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(root);
        std::fs::create_dir_all(layout.wal_dir())?;
        std::fs::create_dir_all(layout.snapshot_dir())?;

        let mut base = GraphState::default();
        let mut snapshot_seq = 0u64;
        for meta in snapshot::list_snapshots(&layout.snapshot_dir())?.iter().rev() {
            match snapshot::load_snapshot(&meta.path) {
                Ok((header, state)) => {
                    snapshot_seq = header.wal_sequence;
                    base = state;
                    debug!(id = %header.id, seq = snapshot_seq, "loaded snapshot");
                    break;
                }
                Err(err) => {
                    warn!(id = %meta.id, error = %err, "snapshot unusable, trying an older one");
                }
            }
        }

        let recovery = wal::recover(&layout.wal_dir(), snapshot_seq)?;
        let mut replayed = 0usize;
        for tx in &recovery.transactions {
            for entry in tx {
                base.apply_entry(entry);
                replayed += 1;
            }
        }
        let last_seq = recovery.last_sequence;
        info!(
            root = %root.display(),
            snapshot_seq,
            replayed,
            discarded = recovery.discarded_entries,
            nodes = base.node_count(),
            edges = base.edge_count(),
            "graph store opened"
        );

        let wal = Wal::open(&layout.wal_dir(), config.wal_segment_bytes, config.sync_writes)?;
        Ok(Self {
            state: RwLock::new(base),
            writer: Mutex::new(Writer {
                wal: Some(wal),
                next_seq: last_seq + 1,
                entries_since_snapshot: last_seq - snapshot_seq,
                last_snapshot_at: Instant::now(),
            }),
            committed: AtomicU64::new(last_seq),
            layout: Some(layout),
            config,
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.layout.is_some()
    }

    pub fn layout(&self) -> Option<&StoreLayout> {
        self.layout.as_ref()
    }

    /// Last-committed state. Hold the guard briefly: commits wait on it.
    pub fn read(&self) -> RwLockReadGuard<'_, GraphState> {
        self.state.read()
    }

    /// Sequence number of the last committed WAL entry (0 when empty).
    pub fn last_sequence(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub fn query(&self, pattern: &Pattern) -> impl Iterator<Item = Match> {
        let state = self.state.read();
        match_pattern(&state, pattern).into_iter()
    }

    /// Validate, log and commit `tx` atomically.
    pub fn apply(&self, tx: Transaction) -> Result<Receipt, StoreError> {
        let mut writer = self.writer.lock();
        let staged = {
            let state = self.state.read();
            Staging::new(&state).stage_all(&tx)
        };
        let changes = match staged {
            Ok(changes) => changes,
            Err(violation) => {
                warn!(error = %violation, ops = tx.len(), "transaction rejected");
                return Err(StoreError::InvariantViolation(violation));
            }
        };
        if changes.is_empty() {
            return Ok(Receipt {
                first_seq: writer.next_seq,
                last_seq: writer.next_seq - 1,
                ..Receipt::default()
            });
        }

        let entries = wal::sequence(changes, writer.next_seq);
        if let Some(wal) = writer.wal.as_mut() {
            wal.append(&entries)?;
        }
        {
            let mut state = self.state.write();
            for entry in &entries {
                state.apply_entry(entry);
            }
            writer.next_seq += entries.len() as u64;
            self.committed.store(writer.next_seq - 1, Ordering::Release);
        }
        writer.entries_since_snapshot += entries.len() as u64;

        let mut receipt = Receipt::from_entries(&entries);
        if self.snapshot_due(&writer) {
            match self.snapshot_locked(&mut writer, "auto") {
                Ok(meta) => receipt.snapshot = Some(meta),
                Err(err) => warn!(error = %err, "automatic snapshot failed"),
            }
        }
        Ok(receipt)
    }

    fn snapshot_due(&self, writer: &Writer) -> bool {
        if self.layout.is_none() || writer.entries_since_snapshot == 0 {
            return false;
        }
        let by_count = self
            .config
            .snapshot_every_entries
            .is_some_and(|every| writer.entries_since_snapshot >= every.max(1));
        let by_time = self
            .config
            .snapshot_interval_secs
            .is_some_and(|secs| writer.last_snapshot_at.elapsed() >= Duration::from_secs(secs));
        by_count || by_time
    }

    fn snapshot_locked(&self, writer: &mut Writer, label: &str) -> Result<IndexSnapshot, StoreError> {
        let layout = self.layout.as_ref().ok_or(StoreError::NotPersistent)?;
        let seq = writer.next_seq - 1;
        let meta = {
            let state = self.state.read();
            snapshot::write_snapshot(&layout.snapshot_dir(), &state, label, seq)?
        };
        if let Some(wal) = writer.wal.as_mut() {
            wal.seal();
            wal.truncate_through(seq)?;
        }
        writer.entries_since_snapshot = 0;
        writer.last_snapshot_at = Instant::now();
        info!(id = %meta.id, seq, nodes = meta.node_count, edges = meta.edge_count, "snapshot created");
        Ok(meta)
    }

    pub fn create_snapshot(&self, label: &str) -> Result<IndexSnapshot, StoreError> {
        let mut writer = self.writer.lock();
        self.snapshot_locked(&mut writer, label)
    }

    pub fn list_snapshots(&self) -> Result<Vec<IndexSnapshot>, StoreError> {
        let layout = self.layout.as_ref().ok_or(StoreError::NotPersistent)?;
        snapshot::list_snapshots(&layout.snapshot_dir())
    }

    pub fn latest_snapshot(&self) -> Result<Option<IndexSnapshot>, StoreError> {
        Ok(self.list_snapshots()?.pop())
    }

    /// Bring the live graph back to snapshot `id`.
    ///
    /// The difference is applied as an ordinary transaction, so the restore is
    /// itself logged and survives a crash.
    pub fn restore_snapshot(&self, id: &str) -> Result<Receipt, StoreError> {
        let layout = self.layout.as_ref().ok_or(StoreError::NotPersistent)?;
        let path = snapshot::find_snapshot(&layout.snapshot_dir(), id)?;
        let (header, target) = snapshot::load_snapshot(&path)?;
        let tx = {
            let state = self.state.read();
            let (nodes, edges) = target.into_parts();
            diff_transaction(state.nodes(), state.edges(), &nodes, &edges)
        };
        let receipt = self.apply(tx)?;
        info!(id = %header.id, entries = receipt.entries, "snapshot restored");
        Ok(receipt)
    }
}
