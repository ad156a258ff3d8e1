//! Last-committed in-memory graph with the lookup indexes queries need.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use sha2::{Digest, Sha256};

use crate::models::{Edge, EdgeId, EdgeKind, FileNode, Node, NodeId, NodeKind, ParseStatus};
use crate::store::wal::{Record, WalEntry, WalOp};

#[derive(Debug, Clone, Default)]
pub struct GraphState {
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeId, Edge>,
    outgoing: HashMap<NodeId, BTreeSet<EdgeId>>,
    incoming: HashMap<NodeId, BTreeSet<EdgeId>>,
    qualified: HashMap<String, NodeId>,
    by_file: HashMap<String, BTreeSet<NodeId>>,
}

impl PartialEq for GraphState {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes && self.edges == other.edges
    }
}

static EMPTY_IDS: BTreeSet<EdgeId> = BTreeSet::new();

impl GraphState {
    pub fn from_parts(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        let mut state = GraphState::default();
        for node in nodes {
            state.insert_node(node);
        }
        for edge in edges {
            state.insert_edge(edge);
        }
        state
    }

    // -- reads ---------------------------------------------------------------

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn edge(&self, id: &EdgeId) -> Option<&Edge> {
        self.edges.get(id)
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn outgoing(&self, id: &NodeId) -> impl Iterator<Item = &Edge> {
        self.outgoing_ids(id).iter().filter_map(|e| self.edges.get(e))
    }

    pub fn incoming(&self, id: &NodeId) -> impl Iterator<Item = &Edge> {
        self.incoming_ids(id).iter().filter_map(|e| self.edges.get(e))
    }

    pub(crate) fn outgoing_ids(&self, id: &NodeId) -> &BTreeSet<EdgeId> {
        self.outgoing.get(id).unwrap_or(&EMPTY_IDS)
    }

    pub(crate) fn incoming_ids(&self, id: &NodeId) -> &BTreeSet<EdgeId> {
        self.incoming.get(id).unwrap_or(&EMPTY_IDS)
    }

    /// Every node whose source lives in `path`, the file node included.
    pub fn nodes_in_file<'a>(&'a self, path: &str) -> impl Iterator<Item = &'a Node> + 'a {
        self.by_file
            .get(path)
            .into_iter()
            .flatten()
            .filter_map(|id| self.nodes.get(id))
    }

    pub fn file(&self, path: &str) -> Option<&FileNode> {
        self.nodes.get(&NodeId::file(path)).and_then(Node::as_file)
    }

    pub fn files(&self) -> impl Iterator<Item = &FileNode> {
        self.nodes.values().filter_map(Node::as_file)
    }

    pub fn by_qualified_name(&self, qualified_name: &str) -> Option<&Node> {
        self.qualified
            .get(qualified_name)
            .and_then(|id| self.nodes.get(id))
    }

    pub(crate) fn qualified_id(&self, qualified_name: &str) -> Option<&NodeId> {
        self.qualified.get(qualified_name)
    }

    pub fn count_nodes(&self, kind: NodeKind) -> usize {
        self.nodes.values().filter(|n| n.kind() == kind).count()
    }

    pub fn count_edges(&self, kind: EdgeKind) -> usize {
        self.edges.values().filter(|e| e.kind == kind).count()
    }

    /// Share of tracked files whose parse produced a usable tree.
    pub fn coverage_pct(&self) -> f64 {
        let mut total = 0usize;
        let mut usable = 0usize;
        for file in self.files() {
            total += 1;
            if file.parse_status != ParseStatus::Failed {
                usable += 1;
            }
        }
        if total == 0 {
            return 0.0;
        }
        ((usable as f64 / total as f64) * 10_000.0).round() / 100.0
    }

    /// SHA-256 over every node and edge in id order.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for node in self.nodes.values() {
            if let Ok(bytes) = serde_json::to_vec(node) {
                hasher.update(&bytes);
            }
            hasher.update(b"\n");
        }
        for edge in self.edges.values() {
            if let Ok(bytes) = serde_json::to_vec(edge) {
                hasher.update(&bytes);
            }
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    // -- writes (store-internal) ---------------------------------------------

    pub(crate) fn insert_node(&mut self, node: Node) {
        let id = node.id().clone();
        if let Some(previous) = self.nodes.remove(&id) {
            self.unindex_node(&previous);
        }
        if node.kind().is_declaration() {
            self.qualified
                .insert(node.qualified_name().to_string(), id.clone());
        }
        if let Some(path) = node.file_path() {
            self.by_file
                .entry(path.to_string())
                .or_default()
                .insert(id.clone());
        }
        self.nodes.insert(id, node);
    }

    pub(crate) fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        let node = self.nodes.remove(id)?;
        self.unindex_node(&node);
        let incident: Vec<EdgeId> = self
            .outgoing_ids(id)
            .iter()
            .chain(self.incoming_ids(id).iter())
            .cloned()
            .collect();
        for edge in incident {
            self.remove_edge(&edge);
        }
        self.outgoing.remove(id);
        self.incoming.remove(id);
        Some(node)
    }

    fn unindex_node(&mut self, node: &Node) {
        if node.kind().is_declaration()
            && self.qualified.get(node.qualified_name()) == Some(node.id())
        {
            self.qualified.remove(node.qualified_name());
        }
        if let Some(path) = node.file_path() {
            if let Some(ids) = self.by_file.get_mut(path) {
                ids.remove(node.id());
                if ids.is_empty() {
                    self.by_file.remove(path);
                }
            }
        }
    }

    pub(crate) fn insert_edge(&mut self, edge: Edge) {
        let id = edge.id.clone();
        if let Some(previous) = self.edges.remove(&id) {
            self.unindex_edge(&previous);
        }
        self.outgoing
            .entry(edge.source.clone())
            .or_default()
            .insert(id.clone());
        self.incoming
            .entry(edge.target.clone())
            .or_default()
            .insert(id.clone());
        self.edges.insert(id, edge);
    }

    pub(crate) fn remove_edge(&mut self, id: &EdgeId) -> Option<Edge> {
        let edge = self.edges.remove(id)?;
        self.unindex_edge(&edge);
        Some(edge)
    }

    fn unindex_edge(&mut self, edge: &Edge) {
        if let Some(ids) = self.outgoing.get_mut(&edge.source) {
            ids.remove(&edge.id);
        }
        if let Some(ids) = self.incoming.get_mut(&edge.target) {
            ids.remove(&edge.id);
        }
    }

    /// Fold one logged change into the state. Used by commit and replay.
    pub(crate) fn apply_entry(&mut self, entry: &WalEntry) {
        match (entry.op, &entry.after) {
            (WalOp::CreateNode | WalOp::UpdateNode, Some(Record::Node(node))) => {
                self.insert_node(node.clone());
            }
            (WalOp::CreateEdge, Some(Record::Edge(edge))) => {
                self.insert_edge(edge.clone());
            }
            (WalOp::DeleteNode, _) => {
                self.remove_node(&NodeId::from(entry.entity.as_str()));
            }
            (WalOp::DeleteEdge, _) => {
                if let Some(Record::Edge(edge)) = &entry.before {
                    self.remove_edge(&edge.id);
                }
            }
            _ => {
                tracing::warn!(seq = entry.seq, op = ?entry.op, "WAL entry without payload ignored");
            }
        }
    }

    pub(crate) fn into_parts(self) -> (Vec<Node>, Vec<Edge>) {
        (
            self.nodes.into_values().collect(),
            self.edges.into_values().collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModuleNode, ParseStatus};
    use crate::store::test_support::{file_node, function_node};

    #[test]
    fn test_remove_node_prunes_incident_edges() {
        let file = file_node("a.py", ParseStatus::Success);
        let f = function_node("a.py", "a", "f", 1);
        let g = function_node("a.py", "a", "g", 5);
        let mut state = GraphState::from_parts(
            vec![file.clone(), f.clone(), g.clone()],
            vec![
                Edge::contains(file.id().clone(), f.id().clone()),
                Edge::contains(file.id().clone(), g.id().clone()),
            ],
        );
        assert_eq!(state.edge_count(), 2);
        state.remove_node(g.id());
        assert_eq!(state.edge_count(), 1);
        assert_eq!(state.outgoing(file.id()).count(), 1);
        assert!(state.by_qualified_name("a.g").is_none());
        assert_eq!(state.nodes_in_file("a.py").count(), 2);
    }

    #[test]
    fn test_coverage_counts_failed_files() {
        let state = GraphState::from_parts(
            vec![
                file_node("a.py", ParseStatus::Success),
                file_node("b.py", ParseStatus::Partial),
                file_node("c.py", ParseStatus::Failed),
                Node::Module(ModuleNode {
                    id: NodeId::module("os"),
                    name: "os".into(),
                    qualified_name: "os".into(),
                    external: true,
                }),
            ],
            vec![],
        );
        assert!((state.coverage_pct() - 66.67).abs() < 1e-9);
    }

    #[test]
    fn test_fingerprint_ignores_insertion_order() {
        let a = file_node("a.py", ParseStatus::Success);
        let b = file_node("b.py", ParseStatus::Success);
        let one = GraphState::from_parts(vec![a.clone(), b.clone()], vec![]);
        let two = GraphState::from_parts(vec![b, a], vec![]);
        assert_eq!(one.fingerprint(), two.fingerprint());
        assert_eq!(one, two);
    }
}
