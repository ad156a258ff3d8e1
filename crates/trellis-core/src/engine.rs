//! The programmatic surface of the core.
//!
//! An [`Engine`] owns one repository's graph store, parse-tree cache and
//! embedding cache. Writers (full index, incremental update, removal,
//! restore) serialize on a single lock; queries read the last committed
//! state and never wait on a writer beyond the store's own read lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rayon::ThreadPool;
use tracing::{debug, info, info_span, warn};

use crate::config::EngineConfig;
use crate::errors::{TrellisError, TrellisResult};
use crate::indexer::pipeline::build_pool;
use crate::indexer::{index_repository, TreeCache};
use crate::models::{
    ContextPack, EdgeKind, ImpactReport, IndexResult, IndexSnapshot, NodeId, NodeKind, NodeSet,
    Patch, StatusReport, TestSet,
};
use crate::query::{self, EmbeddingEngine, Encoder, QueryRequest};
use crate::store::GraphStore;
use crate::updater::{self, FileChange, ReadyUpdate, UpdateQueue};

pub struct Engine {
    config: EngineConfig,
    root: PathBuf,
    store: GraphStore,
    trees: TreeCache,
    embeddings: EmbeddingEngine,
    pool: Option<ThreadPool>,
    queue: Mutex<UpdateQueue>,
    writer: Mutex<()>,
    last_indexed: RwLock<Option<DateTime<Utc>>>,
    cancel: AtomicBool,
}

impl Engine {
    /// Open an engine for the repository at `root`.
    ///
    /// With a `state_dir` configured the WAL is replayed from the latest
    /// snapshot; otherwise the graph lives in memory only.
    pub fn open(root: &Path, mut config: EngineConfig) -> TrellisResult<Self> {
        if !root.is_dir() {
            return Err(TrellisError::InvalidRoot(root.to_path_buf()));
        }
        config.validate()?;
        let store = match &config.state_dir {
            Some(dir) => GraphStore::open(dir, config.store.clone())?,
            None => GraphStore::in_memory(config.store.clone()),
        };
        let embeddings = EmbeddingEngine::new(&config.embedding);
        Ok(Self::assemble(root, config, store, embeddings))
    }

    /// Like [`Engine::open`] but with a caller-supplied encoder, e.g. a real
    /// embedding model in place of the built-in hashing encoder.
    pub fn with_encoder(
        root: &Path,
        config: EngineConfig,
        encoder: Arc<dyn Encoder>,
    ) -> TrellisResult<Self> {
        let mut engine = Self::open(root, config)?;
        engine.embeddings =
            EmbeddingEngine::with_encoder(encoder, engine.config.embedding.cache_capacity);
        Ok(engine)
    }

    fn assemble(root: &Path, config: EngineConfig, store: GraphStore, embeddings: EmbeddingEngine) -> Self {
        let last_indexed = (store.read().node_count() > 0).then(Utc::now);
        let debounce = Duration::from_millis(config.updates.debounce_ms);
        Self {
            pool: build_pool(config.workers),
            root: root.to_path_buf(),
            store,
            trees: TreeCache::new(),
            embeddings,
            queue: Mutex::new(UpdateQueue::new(debounce)),
            writer: Mutex::new(()),
            last_indexed: RwLock::new(last_indexed),
            cancel: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn embeddings(&self) -> &EmbeddingEngine {
        &self.embeddings
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Index the whole repository. `repo_path` defaults to the engine root
    /// when `None`.
    pub fn index_full(&self, repo_path: Option<&Path>) -> TrellisResult<IndexResult> {
        let root = repo_path.unwrap_or(&self.root);
        let _writer = self.writer.lock();
        self.cancel.store(false, Ordering::Relaxed);
        let result = index_repository(&self.store, &self.trees, root, &self.config, &self.cancel)?;
        if !result.cancelled {
            *self.last_indexed.write() = Some(Utc::now());
        }
        if self.config.embedding.warm_on_index && !result.cancelled {
            self.warm_embeddings();
        }
        Ok(result)
    }

    /// Apply new content for one file. Paths are relative to the root.
    pub fn index_incremental(&self, file_path: &str, content: &[u8]) -> TrellisResult<Patch> {
        let _writer = self.writer.lock();
        let patch = updater::update_file(
            &self.store,
            &self.trees,
            self.pool.as_ref(),
            self.config.exclude_sensitive,
            file_path,
            content,
        )?;
        if !patch.unchanged {
            *self.last_indexed.write() = Some(Utc::now());
        }
        Ok(patch)
    }

    /// Drop a deleted file's nodes and recompute the files depending on it.
    pub fn index_remove(&self, file_path: &str) -> TrellisResult<Patch> {
        let _writer = self.writer.lock();
        let patch = updater::remove_file(&self.store, &self.trees, self.pool.as_ref(), file_path)?;
        *self.last_indexed.write() = Some(Utc::now());
        Ok(patch)
    }

    /// Ask a running full index to stop after the current file unit.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // Debounced file events
    // -----------------------------------------------------------------------

    /// Record a change reported by a file watcher. Nothing is applied until
    /// [`Engine::process_ready_updates`] or [`Engine::flush_updates`].
    pub fn enqueue_change(&self, file_path: &str, change: FileChange) {
        self.queue.lock().push(file_path, change);
    }

    pub fn pending_updates(&self) -> usize {
        self.queue.lock().len()
    }

    /// When the next queued path comes out of its quiet period.
    pub fn next_update_due(&self) -> Option<Instant> {
        self.queue.lock().next_ready_at()
    }

    /// Apply every queued change whose quiet period has elapsed, one file at
    /// a time in arrival order.
    pub fn process_ready_updates(&self) -> Vec<(String, TrellisResult<Patch>)> {
        let ready = self.queue.lock().drain_ready();
        self.apply_updates(ready)
    }

    /// Apply everything queued, ignoring the debounce period.
    pub fn flush_updates(&self) -> Vec<(String, TrellisResult<Patch>)> {
        let ready = self.queue.lock().flush();
        self.apply_updates(ready)
    }

    fn apply_updates(&self, ready: Vec<ReadyUpdate>) -> Vec<(String, TrellisResult<Patch>)> {
        ready
            .into_iter()
            .map(|update| {
                debug!(path = %update.path, coalesced = update.coalesced, "applying queued update");
                let result = match &update.change {
                    FileChange::Write(content) => self.index_incremental(&update.path, content),
                    FileChange::Remove => self.index_remove(&update.path),
                };
                if let Err(err) = &result {
                    warn!(path = %update.path, error = %err, "queued update failed");
                }
                (update.path, result)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Retrieve a context pack. Never fails; problems become notes.
    pub fn query(&self, request: &QueryRequest) -> ContextPack {
        query::run_query(
            &self.store,
            &self.embeddings,
            &self.config.query,
            self.config.confidence_warning_threshold,
            request,
        )
    }

    pub fn neighbors(&self, node_id: &NodeId, hops: u32, edge_types: &[EdgeKind]) -> TrellisResult<NodeSet> {
        query::neighbors(&self.store.read(), node_id, hops, edge_types)
    }

    pub fn impact(&self, node_id: &NodeId, depth: u32) -> TrellisResult<ImpactReport> {
        query::impact(&self.store.read(), node_id, depth)
    }

    pub fn related_tests(&self, node_ids: &[NodeId]) -> TestSet {
        query::related_tests(&self.store.read(), node_ids)
    }

    pub fn status(&self) -> StatusReport {
        let wal_sequence = self.store.last_sequence();
        let embedding_cache = self.embeddings.stats();
        let last_indexed = *self.last_indexed.read();
        let state = self.store.read();
        let nodes_by_kind = [
            NodeKind::File,
            NodeKind::Module,
            NodeKind::Class,
            NodeKind::Function,
            NodeKind::Test,
        ]
        .into_iter()
        .map(|kind| (kind.as_str().to_string(), state.count_nodes(kind)))
        .collect();
        let edges_by_kind = EdgeKind::ALL
            .into_iter()
            .map(|kind| (kind.as_str().to_string(), state.count_edges(kind)))
            .collect();
        StatusReport {
            node_count: state.node_count(),
            edge_count: state.edge_count(),
            nodes_by_kind,
            edges_by_kind,
            coverage_pct: state.coverage_pct(),
            last_indexed,
            wal_sequence,
            embedding_cache,
        }
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub fn snapshot_create(&self, label: &str) -> TrellisResult<IndexSnapshot> {
        let _writer = self.writer.lock();
        Ok(self.store.create_snapshot(label)?)
    }

    pub fn snapshot_list(&self) -> TrellisResult<Vec<IndexSnapshot>> {
        Ok(self.store.list_snapshots()?)
    }

    /// Roll the graph back to snapshot `id`. Parse trees and embeddings from
    /// the abandoned state are dropped.
    pub fn snapshot_restore(&self, id: &str) -> TrellisResult<()> {
        let _writer = self.writer.lock();
        let span = info_span!("snapshot_restore", id = %id);
        let _enter = span.enter();
        let receipt = self.store.restore_snapshot(id)?;
        self.trees.clear();
        self.embeddings.clear();
        *self.last_indexed.write() = Some(Utc::now());
        info!(
            nodes = self.store.read().node_count(),
            wal_sequence = receipt.last_seq,
            "snapshot restored"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------

    /// Embed every declaration so the first query does not pay for it.
    fn warm_embeddings(&self) {
        let nodes: Vec<_> = self
            .store
            .read()
            .nodes()
            .filter(|n| n.kind() != NodeKind::Module)
            .cloned()
            .collect();
        let started = Instant::now();
        let warmed = nodes
            .iter()
            .filter(|node| self.embeddings.embed_node(node).is_some())
            .count();
        debug!(
            warmed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "embedding cache warmed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ExecutionLog;
    use std::fs;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "billing/invoice.py",
            "from billing.tax import compute_tax\n\n\ndef create_invoice(amount):\n    return amount + compute_tax(amount)\n",
        );
        write(
            dir.path(),
            "billing/tax.py",
            "def compute_tax(amount):\n    return amount * 0.2\n",
        );
        write(
            dir.path(),
            "tests/test_invoice.py",
            "from billing.invoice import create_invoice\n\n\ndef test_create_invoice():\n    assert create_invoice(10) == 12\n",
        );
        dir
    }

    #[test]
    fn test_open_rejects_missing_root() {
        let err = Engine::open(Path::new("/definitely/not/here"), EngineConfig::default());
        assert!(matches!(err, Err(TrellisError::InvalidRoot(_))));
    }

    #[test]
    fn test_index_then_status() {
        let dir = repo();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        assert!(engine.status().last_indexed.is_none());
        let result = engine.index_full(None).unwrap();
        assert_eq!(result.files_indexed, 3);
        let status = engine.status();
        assert!(status.last_indexed.is_some());
        assert_eq!(status.nodes_by_kind["file"], 3);
        assert!(status.edges_by_kind["calls"] >= 1);
        assert_eq!(status.coverage_pct, 100.0);
    }

    #[test]
    fn test_related_tests_through_engine() {
        let dir = repo();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.index_full(None).unwrap();
        let tests = engine.related_tests(&[NodeId::from("function:billing.tax.compute_tax")]);
        assert!(tests.contains(&NodeId::from("test:tests.test_invoice.test_create_invoice")));
    }

    #[test]
    fn test_queue_applies_latest_write_once() {
        let dir = repo();
        let mut config = EngineConfig::default();
        config.updates.debounce_ms = 0;
        let engine = Engine::open(dir.path(), config).unwrap();
        engine.index_full(None).unwrap();

        engine.enqueue_change("billing/tax.py", FileChange::Write(b"def compute_tax(a):\n    return 0\n".to_vec()));
        engine.enqueue_change(
            "billing/tax.py",
            FileChange::Write(b"def compute_tax(a):\n    return 1\n\n\ndef round_tax(a):\n    return a\n".to_vec()),
        );
        assert_eq!(engine.pending_updates(), 1);
        let applied = engine.flush_updates();
        assert_eq!(applied.len(), 1);
        let patch = applied[0].1.as_ref().unwrap();
        assert!(patch.added.contains(&NodeId::from("function:billing.tax.round_tax")));
        assert_eq!(engine.pending_updates(), 0);
    }

    #[test]
    fn test_query_with_log_and_warm_cache() {
        let dir = repo();
        let mut config = EngineConfig::default();
        config.embedding.warm_on_index = true;
        let engine = Engine::open(dir.path(), config).unwrap();
        engine.index_full(None).unwrap();
        assert!(engine.status().embedding_cache.entries > 0);

        let log = ExecutionLog::v1("  File \"/srv/billing/tax.py\", line 2, in compute_tax\n");
        let pack = engine.query(&QueryRequest::new("invoice tax computation").execution_log(log));
        assert!(pack.paths().contains(&"billing/tax.py"));
    }

    #[test]
    fn test_reads_proceed_alongside_updates() {
        use std::sync::mpsc;
        use std::thread;

        let dir = repo();
        let engine = Arc::new(Engine::open(dir.path(), EngineConfig::default()).unwrap());
        engine.index_full(None).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<&'static str>();

        let writer = {
            let (engine, done, tx) = (Arc::clone(&engine), Arc::clone(&done), tx.clone());
            thread::spawn(move || {
                for i in 0..200 {
                    let body = format!("def compute_tax(amount):\n    return amount * 0.{}\n", i % 9 + 1);
                    engine.index_incremental("billing/tax.py", body.as_bytes()).unwrap();
                }
                done.store(true, Ordering::Relaxed);
                tx.send("writer").unwrap();
            })
        };
        let reader = {
            let (engine, done) = (Arc::clone(&engine), Arc::clone(&done));
            thread::spawn(move || {
                let target = NodeId::from("function:billing.invoice.create_invoice");
                let mut rounds = 0u32;
                while !done.load(Ordering::Relaxed) || rounds == 0 {
                    let status = engine.status();
                    assert!(status.node_count > 0);
                    let pack = engine.query(&QueryRequest::new("invoice tax"));
                    assert!(!pack.files.is_empty());
                    engine.neighbors(&target, 2, &[]).unwrap();
                    rounds += 1;
                }
                tx.send("reader").unwrap();
            })
        };

        let timeout = Duration::from_secs(60);
        let mut finished = vec![rx.recv_timeout(timeout).unwrap(), rx.recv_timeout(timeout).unwrap()];
        finished.sort_unstable();
        assert_eq!(finished, vec!["reader", "writer"]);
        writer.join().unwrap();
        reader.join().unwrap();
        assert!(engine.status().wal_sequence > 0);
    }

    #[test]
    fn test_snapshots_need_persistence() {
        let dir = repo();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        assert!(engine.snapshot_create("x").is_err());
    }
}
