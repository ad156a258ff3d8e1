//! Indexing pipeline orchestration with Rayon-based parallelism.
//!
//! Parsing and building are per-file and run on a bounded pool. Everything
//! that touches the graph goes through [`GraphStore::apply`] one file at a
//! time: node transactions first, then module nodes, then each file's
//! resolved edges against a symbol index of the committed declarations.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, info, info_span, warn};

use crate::config::EngineConfig;
use crate::errors::TrellisResult;
use crate::indexer::builder::{build, BuildOutput};
use crate::indexer::filesystem::{content_hash, scan_repository, ScanOptions, SourceFile};
use crate::indexer::parser::{parse, Grammar, ParseOutput, TreeCache};
use crate::indexer::relations::{self, SymbolIndex};
use crate::models::{
    Edge, EdgeId, IndexIssue, IndexResult, IssueStage, Language, ModuleNode, Node, NodeId,
    NodeKind, ParseStatus,
};
use crate::store::{diff_transaction, GraphStore, Receipt, StoreError, Transaction, Violation};

/// One file parsed and built, not yet committed.
#[derive(Debug)]
pub struct ParsedFile {
    pub path: String,
    pub language: Language,
    pub source: Vec<u8>,
    pub parsed: ParseOutput,
    pub output: BuildOutput,
}

impl ParsedFile {
    /// Non-fatal parse problems worth surfacing to the caller.
    pub fn issue(&self) -> Option<IndexIssue> {
        if self.parsed.status == ParseStatus::Success {
            return None;
        }
        let first = self
            .parsed
            .errors
            .first()
            .map(|e| format!("; first at {e}"))
            .unwrap_or_default();
        Some(IndexIssue {
            path: self.path.clone(),
            stage: IssueStage::Parse,
            message: format!(
                "{} parse, {} syntax error(s){first}",
                self.parsed.status.as_str(),
                self.parsed.errors.len()
            ),
        })
    }
}

pub fn parse_and_build(path: &str, language: Language, source: Vec<u8>) -> ParsedFile {
    let parsed = parse(Grammar::for_path(path, language), &source);
    let output = build(path, &source, &parsed, language);
    ParsedFile {
        path: path.to_string(),
        language,
        source,
        parsed,
        output,
    }
}

// ---------------------------------------------------------------------------
// Commit helpers shared with the incremental updater
// ---------------------------------------------------------------------------

/// What a sequence of per-file transactions changed, in commit order.
#[derive(Debug, Default)]
pub(crate) struct CommitLog {
    pub wal_entries: usize,
    pub edges_created: Vec<EdgeId>,
    pub edges_deleted: Vec<EdgeId>,
    pub unresolved: usize,
    pub issues: Vec<IndexIssue>,
}

impl CommitLog {
    pub fn record(&mut self, receipt: &Receipt) {
        self.wal_entries += receipt.entries;
        self.edges_created.extend(receipt.edges_created.iter().cloned());
        self.edges_deleted.extend(receipt.edges_deleted.iter().cloned());
    }

    pub fn issue(&mut self, path: &str, message: impl Into<String>) {
        self.issues.push(IndexIssue {
            path: path.to_string(),
            stage: IssueStage::Store,
            message: message.into(),
        });
    }
}

/// Bring the nodes of one file (and their containment) to `output`.
pub(crate) fn commit_nodes(store: &GraphStore, output: &BuildOutput) -> Result<Receipt, StoreError> {
    let path = output.file().map(|f| f.path.as_str()).unwrap_or_default();
    let tx = {
        let state = store.read();
        diff_transaction(
            state.nodes_in_file(path),
            relations::structural_edges(&state, path),
            &output.nodes.nodes,
            &output.contains,
        )
    };
    store.apply(tx)
}

/// Delete every node of a file. Incident edges are pruned with them.
pub(crate) fn remove_nodes(store: &GraphStore, path: &str) -> Result<Receipt, StoreError> {
    let tx = {
        let state = store.read();
        diff_transaction(
            state.nodes_in_file(path),
            relations::structural_edges(&state, path),
            &[],
            &[],
        )
    };
    store.apply(tx)
}

/// Edge a rejected transaction tripped over, if the violation names one.
pub(crate) fn violating_edge(violation: &Violation) -> Option<&EdgeId> {
    match violation {
        Violation::MissingEndpoint { edge, .. }
        | Violation::SecondParent { edge, .. }
        | Violation::ConfidenceOutOfRange { edge, .. }
        | Violation::UnresolvedConfidenceTooHigh { edge, .. } => Some(edge),
        Violation::DuplicateEdge(edge)
        | Violation::EdgeIdMismatch(edge)
        | Violation::ContainsCycle(edge)
        | Violation::InheritsCycle(edge) => Some(edge),
        _ => None,
    }
}

/// Replace the edges owned by `path` with `desired`.
///
/// An edge the store rejects (a cycle through a guessed base class, say) is
/// dropped with an issue and the rest are retried.
pub(crate) fn commit_edges(store: &GraphStore, path: &str, mut desired: Vec<Edge>, log: &mut CommitLog) {
    loop {
        let tx = {
            let state = store.read();
            diff_transaction(
                std::iter::empty(),
                relations::owned_edges(&state, path),
                &[],
                &desired,
            )
        };
        match store.apply(tx) {
            Ok(receipt) => {
                log.record(&receipt);
                return;
            }
            Err(StoreError::InvariantViolation(violation)) => {
                let Some(position) = violating_edge(&violation)
                    .and_then(|id| desired.iter().position(|e| &e.id == id))
                else {
                    log.issue(path, violation.to_string());
                    return;
                };
                let dropped = desired.remove(position);
                debug!(path, edge = %dropped.id, error = %violation, "edge dropped");
                log.issue(path, format!("dropped edge {}: {violation}", dropped.id));
            }
            Err(err) => {
                log.issue(path, err.to_string());
                return;
            }
        }
    }
}

pub(crate) fn module_node(qualified_name: &str, external: bool) -> Node {
    let name = qualified_name
        .rsplit(['/', '.'])
        .find(|part| !part.is_empty())
        .unwrap_or(qualified_name);
    Node::Module(ModuleNode {
        id: NodeId::module(qualified_name),
        name: name.to_string(),
        qualified_name: qualified_name.to_string(),
        external,
    })
}

fn declared_modules(store: &GraphStore) -> BTreeSet<String> {
    store
        .read()
        .files()
        .filter_map(|f| f.module.clone())
        .filter(|m| !m.is_empty())
        .collect()
}

/// Create the module nodes that declared files and `required` imports need,
/// and fix the external flag of existing ones.
pub(crate) fn ensure_modules<I>(store: &GraphStore, required: I) -> Result<Receipt, StoreError>
where
    I: IntoIterator<Item = String>,
{
    let declared = declared_modules(store);
    let mut wanted = declared.clone();
    wanted.extend(required.into_iter().filter(|m| !m.is_empty()));
    let tx = {
        let state = store.read();
        let mut tx = Transaction::new();
        for module in &wanted {
            let node = module_node(module, !declared.contains(module));
            match state.node(node.id()) {
                None => {
                    tx.create_node(node);
                }
                Some(existing) if existing != &node => {
                    tx.update_node(node);
                }
                Some(_) => {}
            }
        }
        tx
    };
    store.apply(tx)
}

/// Drop module nodes nothing declares or points at.
pub(crate) fn prune_modules(store: &GraphStore) -> Result<Receipt, StoreError> {
    let declared = declared_modules(store);
    let tx = {
        let state = store.read();
        let mut tx = Transaction::new();
        for node in state.nodes().filter(|n| n.kind() == NodeKind::Module) {
            let id = node.id();
            let is_declared = declared.contains(node.qualified_name());
            let connected =
                state.outgoing(id).next().is_some() || state.incoming(id).next().is_some();
            if !is_declared && !connected {
                tx.delete_node(id.clone());
            } else if node.as_module().is_some_and(|m| m.external == is_declared) {
                tx.update_node(module_node(node.qualified_name(), !is_declared));
            }
        }
        tx
    };
    store.apply(tx)
}

/// Module nodes `paths` need, resolved against the committed declarations.
pub(crate) fn required_modules(store: &GraphStore, index: &SymbolIndex, paths: &[String]) -> Vec<String> {
    let state = store.read();
    let mut out = BTreeSet::new();
    for path in paths {
        if let Some(file) = state.file(path) {
            for target in relations::required_modules(file, index.catalog()) {
                out.insert(target.qualified_name().to_string());
            }
        }
    }
    out.into_iter().collect()
}

/// Resolve and commit the edges of `paths`, in order.
pub(crate) fn recompute_edges(
    store: &GraphStore,
    pool: Option<&ThreadPool>,
    paths: &[String],
    log: &mut CommitLog,
) -> SymbolIndex {
    let index = SymbolIndex::build(&store.read());
    if let Err(err) = ensure_modules(store, required_modules(store, &index, paths)) {
        warn!(error = %err, "module sync failed");
        log.issue("", err.to_string());
    }
    let files: Vec<_> = {
        let state = store.read();
        paths.iter().filter_map(|p| state.file(p).cloned()).collect()
    };
    let resolved = run_parallel(pool, &files, |file| {
        (file.path.clone(), relations::extract(file, &index))
    });
    for (path, edges) in resolved {
        log.unresolved += edges.unresolved.len();
        for miss in &edges.unresolved {
            debug!(path = %miss.path, line = miss.line, name = %miss.name, reason = miss.reason, "unresolved reference");
        }
        commit_edges(store, &path, edges.edges, log);
    }
    match prune_modules(store) {
        Ok(receipt) => log.record(&receipt),
        Err(err) => log.issue("", err.to_string()),
    }
    index
}

// ---------------------------------------------------------------------------
// Full index
// ---------------------------------------------------------------------------

pub(crate) fn build_pool(workers: usize) -> Option<ThreadPool> {
    match rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("trellis-index-{i}"))
        .build()
    {
        Ok(pool) => Some(pool),
        Err(err) => {
            warn!(error = %err, "thread pool unavailable, indexing sequentially");
            None
        }
    }
}

pub(crate) fn run_parallel<T, R, F>(pool: Option<&ThreadPool>, items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    match pool {
        Some(pool) => pool.install(|| items.par_iter().map(&f).collect()),
        None => items.iter().map(f).collect(),
    }
}

enum FileOutcome {
    Unchanged,
    Built(Box<ParsedFile>),
    Unreadable(IndexIssue),
    Cancelled,
}

fn process_file(file: &SourceFile, known: &HashMap<String, String>, cancel: &AtomicBool) -> FileOutcome {
    if cancel.load(Ordering::Relaxed) {
        return FileOutcome::Cancelled;
    }
    let source = match std::fs::read(&file.abs_path) {
        Ok(bytes) => bytes,
        Err(err) => {
            return FileOutcome::Unreadable(IndexIssue {
                path: file.rel_path.clone(),
                stage: IssueStage::Read,
                message: err.to_string(),
            })
        }
    };
    if known.get(&file.rel_path) == Some(&content_hash(&source)) {
        return FileOutcome::Unchanged;
    }
    let parsed = parse_and_build(&file.rel_path, file.language, source);
    debug!(
        path = %parsed.path,
        status = parsed.parsed.status.as_str(),
        nodes = parsed.output.nodes.len(),
        "file built"
    );
    FileOutcome::Built(Box::new(parsed))
}

fn finish(store: &GraphStore, result: &mut IndexResult, started: Instant) {
    let state = store.read();
    result.node_count = state.node_count();
    result.edge_count = state.edge_count();
    result.coverage_pct = state.coverage_pct();
    result.elapsed_ms = started.elapsed().as_millis() as u64;
}

/// Index (or re-index) the repository at `root` into `store`.
///
/// Files whose content hash matches the stored one are not re-parsed; files
/// that disappeared are removed. Per-file problems end up in
/// [`IndexResult::errors`]; only an unusable root or configuration is an
/// `Err`. Setting `cancel` stops the run between file units, leaving every
/// committed file consistent.
pub fn index_repository(
    store: &GraphStore,
    trees: &TreeCache,
    root: &Path,
    config: &EngineConfig,
    cancel: &AtomicBool,
) -> TrellisResult<IndexResult> {
    let span = info_span!("index_full", root = %root.display());
    let _enter = span.enter();
    let started = Instant::now();

    let scan = scan_repository(root, &ScanOptions::from(config))?;
    let mut result = IndexResult {
        files_seen: scan.files.len() + scan.skipped.len(),
        errors: scan.skipped,
        ..IndexResult::default()
    };
    let mut log = CommitLog::default();

    let known: HashMap<String, String> = store
        .read()
        .files()
        .map(|f| (f.path.clone(), f.content_hash.clone()))
        .collect();
    let pool = build_pool(config.workers);
    let outcomes = run_parallel(pool.as_ref(), &scan.files, |file| {
        process_file(file, &known, cancel)
    });

    let mut built = Vec::new();
    for outcome in outcomes {
        match outcome {
            FileOutcome::Unchanged => result.files_unchanged += 1,
            FileOutcome::Built(file) => built.push(*file),
            FileOutcome::Unreadable(issue) => result.errors.push(issue),
            FileOutcome::Cancelled => result.cancelled = true,
        }
    }
    if result.cancelled {
        info!("indexing cancelled before commit");
        finish(store, &mut result, started);
        return Ok(result);
    }

    // Removed files go first so their declarations can reappear elsewhere.
    let present: BTreeSet<&str> = scan.files.iter().map(|f| f.rel_path.as_str()).collect();
    let removed: Vec<String> = known
        .keys()
        .filter(|p| !present.contains(p.as_str()))
        .cloned()
        .collect();
    for path in &removed {
        match remove_nodes(store, path) {
            Ok(receipt) => {
                log.record(&receipt);
                trees.forget(path);
                result.files_removed += 1;
            }
            Err(err) => log.issue(path, err.to_string()),
        }
    }

    // A declaration moving between two files of one package collides until
    // the file it left is committed, so collisions are retried.
    let mut pending = built;
    loop {
        let mut deferred = Vec::new();
        let mut progressed = false;
        for file in pending {
            if cancel.load(Ordering::Relaxed) {
                result.cancelled = true;
                break;
            }
            match commit_nodes(store, &file.output) {
                Ok(receipt) => {
                    log.record(&receipt);
                    trees.remember(&file.path, &file.parsed, &file.source);
                    if let Some(issue) = file.issue() {
                        result.errors.push(issue);
                    }
                    result.files_indexed += 1;
                    progressed = true;
                }
                Err(StoreError::InvariantViolation(violation @ Violation::DuplicateQualifiedName { .. })) => {
                    deferred.push((file, violation));
                }
                Err(err) => log.issue(&file.path, err.to_string()),
            }
        }
        if result.cancelled || deferred.is_empty() {
            break;
        }
        if !progressed {
            for (file, violation) in deferred {
                log.issue(&file.path, violation.to_string());
            }
            break;
        }
        pending = deferred.into_iter().map(|(file, _)| file).collect();
    }
    if result.cancelled {
        info!(indexed = result.files_indexed, "indexing cancelled");
        result.errors.append(&mut log.issues);
        result.wal_entries = log.wal_entries;
        finish(store, &mut result, started);
        return Ok(result);
    }

    let paths: Vec<String> = store.read().files().map(|f| f.path.clone()).collect();
    recompute_edges(store, pool.as_ref(), &paths, &mut log);

    result.unresolved_references = log.unresolved;
    result.wal_entries = log.wal_entries;
    result.errors.append(&mut log.issues);
    finish(store, &mut result, started);
    info!(
        files_seen = result.files_seen,
        indexed = result.files_indexed,
        unchanged = result.files_unchanged,
        removed = result.files_removed,
        nodes = result.node_count,
        edges = result.edge_count,
        unresolved = result.unresolved_references,
        errors = result.errors.len(),
        coverage_pct = result.coverage_pct,
        wal_entries = result.wal_entries,
        elapsed_ms = result.elapsed_ms,
        "full index complete"
    );
    Ok(result)
}
