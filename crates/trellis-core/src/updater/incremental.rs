//! Single-file updates.
//!
//! The changed file is re-parsed (incrementally when its previous tree is
//! cached), its declarations are diffed against the committed ones by id and
//! structural content, and only the files whose references could now resolve
//! differently get their edges recomputed. No other file is re-parsed: edge
//! recomputation works from the references stored on each file node.

use std::collections::{BTreeMap, BTreeSet};

use rayon::ThreadPool;
use tracing::{debug, info, info_span};

use crate::errors::{TrellisError, TrellisResult};
use crate::indexer::builder::build;
use crate::indexer::filesystem::{content_hash, detect_language, is_sensitive, normalize_path};
use crate::indexer::parser::{Grammar, TreeCache};
use crate::indexer::pipeline::{commit_nodes, recompute_edges, remove_nodes, CommitLog};
use crate::models::{IndexIssue, IssueStage, Node, NodeId, Patch};
use crate::store::{GraphState, GraphStore, StoreError};

/// Declaration-level difference between two versions of a file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclarationDiff {
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    /// Same id, different content.
    pub modified: Vec<NodeId>,
    /// Same id and content, different lines.
    pub moved: Vec<NodeId>,
    /// Simple names of added, removed and modified declarations.
    pub names: BTreeSet<String>,
}

impl DeclarationDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.modified.is_empty()
            && self.moved.is_empty()
    }
}

pub fn diff_declarations<'a, I>(old: I, new: &[Node]) -> DeclarationDiff
where
    I: IntoIterator<Item = &'a Node>,
{
    let old: BTreeMap<&NodeId, &Node> = old
        .into_iter()
        .filter(|n| n.kind().is_declaration())
        .map(|n| (n.id(), n))
        .collect();
    let new: BTreeMap<&NodeId, &Node> = new
        .iter()
        .filter(|n| n.kind().is_declaration())
        .map(|n| (n.id(), n))
        .collect();

    let mut diff = DeclarationDiff::default();
    for (id, node) in &old {
        if !new.contains_key(id) {
            diff.removed.push((*id).clone());
            diff.names.insert(node.name().to_string());
        }
    }
    for (id, node) in &new {
        match old.get(id) {
            None => {
                diff.added.push((*id).clone());
                diff.names.insert(node.name().to_string());
            }
            Some(previous) if previous == node => {}
            Some(previous) if previous.without_position() == node.without_position() => {
                diff.moved.push((*id).clone());
            }
            Some(_) => {
                diff.modified.push((*id).clone());
                diff.names.insert(node.name().to_string());
            }
        }
    }
    diff
}

fn last_segment(name: &str) -> &str {
    name.rsplit(['/', '.'])
        .find(|s| !s.is_empty())
        .unwrap_or(name)
}

/// `names` plus the simple names of every class that inherits, directly or
/// through other classes, from a class named in it. Method lookup walks
/// bases, so a change to a base class can re-target calls made through any
/// of its subclasses.
pub fn with_subclasses(state: &GraphState, names: &BTreeSet<String>) -> BTreeSet<String> {
    let mut subclasses: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for node in state.nodes() {
        if let Node::Class(class) = node {
            for base in &class.bases {
                subclasses
                    .entry(last_segment(base))
                    .or_default()
                    .push(node.name());
            }
        }
    }
    let mut out = names.clone();
    let mut pending: Vec<&str> = names.iter().map(String::as_str).collect();
    while let Some(name) = pending.pop() {
        for sub in subclasses.get(name).into_iter().flatten() {
            if out.insert((*sub).to_string()) {
                pending.push(*sub);
            }
        }
    }
    out
}

/// Files whose edges may change when `names` (declarations) or `modules`
/// change: the file itself plus every file with a reference mentioning one
/// of them or one of their subclasses. Sorted by path.
pub fn affected_files(
    state: &GraphState,
    path: &str,
    names: &BTreeSet<String>,
    modules: &BTreeSet<String>,
) -> Vec<String> {
    let names = &with_subclasses(state, names);
    let module_tails: BTreeSet<&str> = modules.iter().map(|m| last_segment(m)).collect();
    let mut out = BTreeSet::new();
    if state.file(path).is_some() {
        out.insert(path.to_string());
    }
    for file in state.files() {
        if file.path == path {
            continue;
        }
        let hit = file.references.iter().any(|reference| {
            reference.mentions().into_iter().any(|mention| {
                mention.split('.').any(|part| names.contains(part))
                    || modules.contains(mention)
                    || module_tails.contains(last_segment(mention))
            })
        });
        if hit {
            out.insert(file.path.clone());
        }
    }
    out.into_iter().collect()
}

fn finish_patch(patch: &mut Patch, log: CommitLog) {
    let created: BTreeSet<_> = log.edges_created.into_iter().collect();
    let deleted: BTreeSet<_> = log.edges_deleted.into_iter().collect();
    patch.edges_removed = deleted.difference(&created).cloned().collect();
    patch.edges_added = created.into_iter().collect();
    patch.wal_entries = log.wal_entries;
    patch.errors.extend(log.issues);
}

/// Apply new content for one file and return what changed.
///
/// Identical content (same hash) is a no-op with zero WAL entries. A store
/// rejection of the file's node transaction leaves the graph untouched and
/// is reported in [`Patch::errors`].
pub fn update_file(
    store: &GraphStore,
    trees: &TreeCache,
    pool: Option<&ThreadPool>,
    exclude_sensitive: bool,
    path: &str,
    content: &[u8],
) -> TrellisResult<Patch> {
    let path = normalize_path(path);
    let span = info_span!("index_incremental", path = %path);
    let _enter = span.enter();

    let language =
        detect_language(&path).ok_or_else(|| TrellisError::UnsupportedFile(path.clone()))?;
    if exclude_sensitive && is_sensitive(&path) {
        let mut patch = Patch::unchanged(&path);
        patch.errors.push(IndexIssue {
            path: path.clone(),
            stage: IssueStage::Read,
            message: "excluded as sensitive".to_string(),
        });
        return Ok(patch);
    }

    let (old_nodes, old_module) = {
        let state = store.read();
        if state
            .file(&path)
            .is_some_and(|f| f.content_hash == content_hash(content))
        {
            debug!("content unchanged");
            return Ok(Patch::unchanged(&path));
        }
        let nodes: Vec<Node> = state.nodes_in_file(&path).cloned().collect();
        let module = state.file(&path).and_then(|f| f.module.clone());
        (nodes, module)
    };

    let parsed = trees.parse(&path, Grammar::for_path(&path, language), content);
    let output = build(&path, content, &parsed, language);
    let diff = diff_declarations(&old_nodes, &output.nodes.nodes);

    let mut patch = Patch {
        file_path: path.clone(),
        parse_status: Some(parsed.status),
        ..Patch::default()
    };
    if !parsed.errors.is_empty() {
        patch.errors.push(IndexIssue {
            path: path.clone(),
            stage: IssueStage::Parse,
            message: format!("{} syntax error(s)", parsed.errors.len()),
        });
    }

    let mut log = CommitLog::default();
    match commit_nodes(store, &output) {
        Ok(receipt) => log.record(&receipt),
        Err(StoreError::InvariantViolation(violation)) => {
            patch.errors.push(IndexIssue {
                path: path.clone(),
                stage: IssueStage::Store,
                message: violation.to_string(),
            });
            return Ok(patch);
        }
        Err(err) => return Err(err.into()),
    }

    let new_module = output.file().and_then(|f| f.module.clone());
    let mut modules = BTreeSet::new();
    if old_module != new_module || old_nodes.is_empty() {
        modules.extend(old_module);
        modules.extend(new_module);
    }
    let affected = affected_files(&store.read(), &path, &diff.names, &modules);
    recompute_edges(store, pool, &affected, &mut log);

    patch.added = diff.added;
    patch.removed = diff.removed;
    patch.modified = diff.modified;
    patch.moved = diff.moved;
    finish_patch(&mut patch, log);
    info!(
        added = patch.added.len(),
        removed = patch.removed.len(),
        modified = patch.modified.len(),
        moved = patch.moved.len(),
        edges_added = patch.edges_added.len(),
        edges_removed = patch.edges_removed.len(),
        affected_files = affected.len(),
        wal_entries = patch.wal_entries,
        "file updated"
    );
    Ok(patch)
}

/// Remove a file from the graph. Its declarations (and the file node itself)
/// are reported as removed; edges into them are pruned and the files that
/// referenced them are re-resolved.
pub fn remove_file(
    store: &GraphStore,
    trees: &TreeCache,
    pool: Option<&ThreadPool>,
    path: &str,
) -> TrellisResult<Patch> {
    let path = normalize_path(path);
    let span = info_span!("index_remove", path = %path);
    let _enter = span.enter();

    let (old_nodes, old_module) = {
        let state = store.read();
        let Some(file) = state.file(&path) else {
            return Ok(Patch::unchanged(&path));
        };
        let module = file.module.clone();
        (state.nodes_in_file(&path).cloned().collect::<Vec<Node>>(), module)
    };
    trees.forget(&path);

    let diff = diff_declarations(&old_nodes, &[]);
    let mut log = CommitLog::default();
    let receipt = remove_nodes(store, &path)?;
    log.record(&receipt);

    let modules: BTreeSet<String> = old_module.into_iter().collect();
    let affected = affected_files(&store.read(), &path, &diff.names, &modules);
    recompute_edges(store, pool, &affected, &mut log);

    let mut patch = Patch {
        file_path: path.clone(),
        removed: diff.removed,
        ..Patch::default()
    };
    patch.removed.push(NodeId::file(&path));
    finish_patch(&mut patch, log);
    info!(
        removed = patch.removed.len(),
        edges_removed = patch.edges_removed.len(),
        affected_files = affected.len(),
        "file removed"
    );
    Ok(patch)
}
