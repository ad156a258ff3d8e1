//! Transactions and their validation.
//!
//! A transaction is staged against an overlay on top of the last-committed
//! state. Staging either yields the full list of elementary changes to log, or
//! the first invariant it would break; the committed state is never touched
//! while staging.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::models::{Edge, EdgeId, EdgeKind, Node, NodeId, UNRESOLVED_CONFIDENCE_MAX};
use crate::store::graph::GraphState;
use crate::store::wal::{Change, Record, WalOp};
use crate::store::Violation;

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    CreateNode(Node),
    UpdateNode(Node),
    /// Also removes every edge touching the node.
    DeleteNode(NodeId),
    CreateEdge(Edge),
    DeleteEdge(EdgeId),
}

/// Ordered batch of mutations applied atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    ops: Vec<Mutation>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_node(&mut self, node: Node) -> &mut Self {
        self.ops.push(Mutation::CreateNode(node));
        self
    }

    pub fn update_node(&mut self, node: Node) -> &mut Self {
        self.ops.push(Mutation::UpdateNode(node));
        self
    }

    pub fn delete_node(&mut self, id: NodeId) -> &mut Self {
        self.ops.push(Mutation::DeleteNode(id));
        self
    }

    pub fn create_edge(&mut self, edge: Edge) -> &mut Self {
        self.ops.push(Mutation::CreateEdge(edge));
        self
    }

    pub fn delete_edge(&mut self, id: EdgeId) -> &mut Self {
        self.ops.push(Mutation::DeleteEdge(id));
        self
    }

    pub fn push(&mut self, op: Mutation) {
        self.ops.push(op);
    }

    pub fn extend(&mut self, other: Transaction) {
        self.ops.extend(other.ops);
    }

    pub fn ops(&self) -> &[Mutation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Plan the mutations that turn the `current` nodes/edges into `desired`.
///
/// Deletions come before creations so that a declaration replaced by another
/// one with the same qualified name, or a re-parented child, validates.
/// Changed edges are deleted and recreated.
pub fn diff_transaction<'a>(
    current_nodes: impl IntoIterator<Item = &'a Node>,
    current_edges: impl IntoIterator<Item = &'a Edge>,
    desired_nodes: &[Node],
    desired_edges: &[Edge],
) -> Transaction {
    let current_nodes: BTreeMap<&NodeId, &Node> =
        current_nodes.into_iter().map(|n| (n.id(), n)).collect();
    let current_edges: BTreeMap<&EdgeId, &Edge> =
        current_edges.into_iter().map(|e| (&e.id, e)).collect();
    let desired_nodes: BTreeMap<&NodeId, &Node> =
        desired_nodes.iter().map(|n| (n.id(), n)).collect();
    let desired_edges: BTreeMap<&EdgeId, &Edge> =
        desired_edges.iter().map(|e| (&e.id, e)).collect();

    let mut tx = Transaction::new();
    for (id, edge) in &current_edges {
        if desired_edges.get(id) != Some(edge) {
            tx.delete_edge((*id).clone());
        }
    }
    for id in current_nodes.keys() {
        if !desired_nodes.contains_key(id) {
            tx.delete_node((*id).clone());
        }
    }
    for (id, node) in &desired_nodes {
        if matches!(current_nodes.get(id), Some(existing) if existing != node) {
            tx.update_node((*node).clone());
        }
    }
    for (id, node) in &desired_nodes {
        if !current_nodes.contains_key(id) {
            tx.create_node((*node).clone());
        }
    }
    for (id, edge) in &desired_edges {
        if current_edges.get(id) != Some(edge) {
            tx.create_edge((*edge).clone());
        }
    }
    tx
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

pub(crate) struct Staging<'a> {
    base: &'a GraphState,
    nodes: HashMap<NodeId, Option<Node>>,
    edges: HashMap<EdgeId, Option<Edge>>,
    added_out: HashMap<NodeId, Vec<EdgeId>>,
    added_in: HashMap<NodeId, Vec<EdgeId>>,
    qualified: HashMap<String, Option<NodeId>>,
    changes: Vec<Change>,
}

impl<'a> Staging<'a> {
    pub(crate) fn new(base: &'a GraphState) -> Self {
        Self {
            base,
            nodes: HashMap::new(),
            edges: HashMap::new(),
            added_out: HashMap::new(),
            added_in: HashMap::new(),
            qualified: HashMap::new(),
            changes: Vec::new(),
        }
    }

    /// Stage every mutation, stopping at the first violation.
    pub(crate) fn stage_all(mut self, tx: &Transaction) -> Result<Vec<Change>, Violation> {
        for op in tx.ops() {
            self.stage(op)?;
        }
        Ok(self.changes)
    }

    fn node(&self, id: &NodeId) -> Option<&Node> {
        match self.nodes.get(id) {
            Some(staged) => staged.as_ref(),
            None => self.base.node(id),
        }
    }

    fn edge(&self, id: &EdgeId) -> Option<&Edge> {
        match self.edges.get(id) {
            Some(staged) => staged.as_ref(),
            None => self.base.edge(id),
        }
    }

    fn qualified_owner(&self, name: &str) -> Option<&NodeId> {
        match self.qualified.get(name) {
            Some(staged) => staged.as_ref(),
            None => self.base.qualified_id(name),
        }
    }

    fn live_edges(&self, id: &NodeId, outgoing: bool) -> Vec<&Edge> {
        let (base_ids, added) = if outgoing {
            (self.base.outgoing_ids(id), self.added_out.get(id))
        } else {
            (self.base.incoming_ids(id), self.added_in.get(id))
        };
        let ids: BTreeSet<&EdgeId> = base_ids.iter().chain(added.into_iter().flatten()).collect();
        ids.into_iter().filter_map(|e| self.edge(e)).collect()
    }

    fn reaches(&self, from: &NodeId, to: &NodeId, kind: EdgeKind) -> bool {
        let mut seen: BTreeSet<&NodeId> = BTreeSet::new();
        let mut queue: VecDeque<NodeId> = VecDeque::from([from.clone()]);
        while let Some(current) = queue.pop_front() {
            if &current == to {
                return true;
            }
            for edge in self.live_edges(&current, true) {
                if edge.kind == kind && seen.insert(&edge.target) {
                    queue.push_back(edge.target.clone());
                }
            }
        }
        false
    }

    fn stage(&mut self, op: &Mutation) -> Result<(), Violation> {
        match op {
            Mutation::CreateNode(node) => self.create_node(node),
            Mutation::UpdateNode(node) => self.update_node(node),
            Mutation::DeleteNode(id) => self.delete_node(id),
            Mutation::CreateEdge(edge) => self.create_edge(edge),
            Mutation::DeleteEdge(id) => self.delete_edge(id),
        }
    }

    fn check_qualified_name(&self, node: &Node) -> Result<(), Violation> {
        if !node.kind().is_declaration() {
            return Ok(());
        }
        match self.qualified_owner(node.qualified_name()) {
            Some(existing) if existing != node.id() => Err(Violation::DuplicateQualifiedName {
                name: node.qualified_name().to_string(),
                existing: existing.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn create_node(&mut self, node: &Node) -> Result<(), Violation> {
        let id = node.id();
        if id.kind() != Some(node.kind()) {
            return Err(Violation::KindMismatch {
                id: id.clone(),
                kind: node.kind(),
            });
        }
        if self.node(id).is_some() {
            return Err(Violation::DuplicateNode(id.clone()));
        }
        self.check_qualified_name(node)?;
        if node.kind().is_declaration() {
            self.qualified
                .insert(node.qualified_name().to_string(), Some(id.clone()));
        }
        self.nodes.insert(id.clone(), Some(node.clone()));
        self.changes.push(Change {
            op: WalOp::CreateNode,
            entity: id.to_string(),
            before: None,
            after: Some(Record::Node(node.clone())),
        });
        Ok(())
    }

    fn update_node(&mut self, node: &Node) -> Result<(), Violation> {
        let id = node.id();
        let Some(existing) = self.node(id).cloned() else {
            return Err(Violation::MissingNode(id.clone()));
        };
        if existing.kind() != node.kind() {
            return Err(Violation::KindMismatch {
                id: id.clone(),
                kind: node.kind(),
            });
        }
        if &existing == node {
            return Ok(());
        }
        self.check_qualified_name(node)?;
        if existing.qualified_name() != node.qualified_name() && node.kind().is_declaration() {
            self.qualified
                .insert(existing.qualified_name().to_string(), None);
            self.qualified
                .insert(node.qualified_name().to_string(), Some(id.clone()));
        }
        self.nodes.insert(id.clone(), Some(node.clone()));
        self.changes.push(Change {
            op: WalOp::UpdateNode,
            entity: id.to_string(),
            before: Some(Record::Node(existing)),
            after: Some(Record::Node(node.clone())),
        });
        Ok(())
    }

    fn delete_node(&mut self, id: &NodeId) -> Result<(), Violation> {
        let Some(existing) = self.node(id).cloned() else {
            return Err(Violation::MissingNode(id.clone()));
        };
        let incident: BTreeSet<EdgeId> = self
            .live_edges(id, true)
            .into_iter()
            .chain(self.live_edges(id, false))
            .map(|e| e.id.clone())
            .collect();
        for edge in incident {
            self.delete_edge(&edge)?;
        }
        if existing.kind().is_declaration()
            && self.qualified_owner(existing.qualified_name()) == Some(id)
        {
            self.qualified
                .insert(existing.qualified_name().to_string(), None);
        }
        self.nodes.insert(id.clone(), None);
        self.changes.push(Change {
            op: WalOp::DeleteNode,
            entity: id.to_string(),
            before: Some(Record::Node(existing)),
            after: None,
        });
        Ok(())
    }

    fn create_edge(&mut self, edge: &Edge) -> Result<(), Violation> {
        if edge.id != EdgeId::new(edge.kind, &edge.source, &edge.target) {
            return Err(Violation::EdgeIdMismatch(edge.id.clone()));
        }
        if self.edge(&edge.id).is_some() {
            return Err(Violation::DuplicateEdge(edge.id.clone()));
        }
        for endpoint in [&edge.source, &edge.target] {
            if self.node(endpoint).is_none() {
                return Err(Violation::MissingEndpoint {
                    edge: edge.id.clone(),
                    endpoint: endpoint.clone(),
                });
            }
        }
        let value = edge.confidence.value();
        if !(0.0..=1.0).contains(&value) {
            return Err(Violation::ConfidenceOutOfRange {
                edge: edge.id.clone(),
                value,
            });
        }
        if !edge.is_resolved && value > UNRESOLVED_CONFIDENCE_MAX {
            return Err(Violation::UnresolvedConfidenceTooHigh {
                edge: edge.id.clone(),
                value,
            });
        }
        match edge.kind {
            EdgeKind::Contains => {
                if let Some(parent) = self
                    .live_edges(&edge.target, false)
                    .into_iter()
                    .find(|e| e.kind == EdgeKind::Contains)
                {
                    return Err(Violation::SecondParent {
                        edge: edge.id.clone(),
                        child: edge.target.clone(),
                        parent: parent.source.clone(),
                    });
                }
                if self.reaches(&edge.target, &edge.source, EdgeKind::Contains) {
                    return Err(Violation::ContainsCycle(edge.id.clone()));
                }
            }
            EdgeKind::Inherits => {
                if self.reaches(&edge.target, &edge.source, EdgeKind::Inherits) {
                    return Err(Violation::InheritsCycle(edge.id.clone()));
                }
            }
            _ => {}
        }

        self.edges.insert(edge.id.clone(), Some(edge.clone()));
        self.added_out
            .entry(edge.source.clone())
            .or_default()
            .push(edge.id.clone());
        self.added_in
            .entry(edge.target.clone())
            .or_default()
            .push(edge.id.clone());
        self.changes.push(Change {
            op: WalOp::CreateEdge,
            entity: edge.id.to_string(),
            before: None,
            after: Some(Record::Edge(edge.clone())),
        });
        Ok(())
    }

    fn delete_edge(&mut self, id: &EdgeId) -> Result<(), Violation> {
        let existing = match self.edges.get(id) {
            // Already removed earlier in this transaction, usually by a node delete.
            Some(None) => return Ok(()),
            Some(Some(edge)) => edge.clone(),
            None => match self.base.edge(id) {
                Some(edge) => edge.clone(),
                None => return Err(Violation::MissingEdge(id.clone())),
            },
        };
        self.edges.insert(id.clone(), None);
        self.changes.push(Change {
            op: WalOp::DeleteEdge,
            entity: id.to_string(),
            before: Some(Record::Edge(existing)),
            after: None,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Confidence, EdgeMetadata, InheritKind, ParseStatus};
    use crate::store::test_support::{class_node, file_node, function_node};

    fn inherits(child: &Node, base: &Node) -> Edge {
        Edge::new(
            EdgeKind::Inherits,
            child.id().clone(),
            base.id().clone(),
            Confidence::RESOLVED,
            true,
            EdgeMetadata::Inherits {
                relation: InheritKind::Extends,
            },
        )
    }

    #[test]
    fn test_stage_rejects_duplicate_qualified_name() {
        let base = GraphState::default();
        let mut tx = Transaction::new();
        tx.create_node(function_node("a.py", "a", "f", 1));
        tx.create_node(class_node("a.py", "a", "f", 9));
        assert!(matches!(
            Staging::new(&base).stage_all(&tx),
            Err(Violation::DuplicateQualifiedName { .. })
        ));
    }

    #[test]
    fn test_stage_rejects_contains_cycle_and_second_parent() {
        let file = file_node("a.py", ParseStatus::Success);
        let f = function_node("a.py", "a", "f", 1);
        let base = GraphState::from_parts(
            vec![file.clone(), f.clone()],
            vec![Edge::contains(file.id().clone(), f.id().clone())],
        );

        let mut cycle = Transaction::new();
        cycle.create_edge(Edge::contains(f.id().clone(), file.id().clone()));
        assert!(matches!(
            Staging::new(&base).stage_all(&cycle),
            Err(Violation::ContainsCycle(_))
        ));

        let g = function_node("a.py", "a", "g", 4);
        let mut second = Transaction::new();
        second
            .create_node(g.clone())
            .create_edge(Edge::contains(g.id().clone(), f.id().clone()));
        assert!(matches!(
            Staging::new(&base).stage_all(&second),
            Err(Violation::SecondParent { .. })
        ));
    }

    #[test]
    fn test_stage_rejects_inherits_cycle_and_self_loop() {
        let a = class_node("m.py", "m", "A", 1);
        let b = class_node("m.py", "m", "B", 5);
        let base = GraphState::from_parts(vec![a.clone(), b.clone()], vec![inherits(&a, &b)]);

        let mut tx = Transaction::new();
        tx.create_edge(inherits(&b, &a));
        assert!(matches!(
            Staging::new(&base).stage_all(&tx),
            Err(Violation::InheritsCycle(_))
        ));

        let mut tx = Transaction::new();
        tx.create_edge(inherits(&a, &a));
        assert!(matches!(
            Staging::new(&base).stage_all(&tx),
            Err(Violation::InheritsCycle(_))
        ));
    }

    #[test]
    fn test_stage_rejects_overconfident_unresolved_edge() {
        let f = function_node("a.py", "a", "f", 1);
        let g = function_node("a.py", "a", "g", 4);
        let base = GraphState::from_parts(vec![f.clone(), g.clone()], vec![]);
        let mut edge = Edge::new(
            EdgeKind::Calls,
            f.id().clone(),
            g.id().clone(),
            Confidence::new(0.9),
            false,
            EdgeMetadata::Calls {
                lines: vec![2],
                call_kind: crate::models::CallKind::Direct,
                recursive: false,
            },
        );
        let mut tx = Transaction::new();
        tx.create_edge(edge.clone());
        assert!(matches!(
            Staging::new(&base).stage_all(&tx),
            Err(Violation::UnresolvedConfidenceTooHigh { .. })
        ));

        edge.confidence = Confidence::new(0.6);
        let mut tx = Transaction::new();
        tx.create_edge(edge);
        assert_eq!(Staging::new(&base).stage_all(&tx).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_node_logs_pruned_edges_once() {
        let file = file_node("a.py", ParseStatus::Success);
        let f = function_node("a.py", "a", "f", 1);
        let contains = Edge::contains(file.id().clone(), f.id().clone());
        let base = GraphState::from_parts(vec![file, f.clone()], vec![contains.clone()]);

        let mut tx = Transaction::new();
        tx.delete_node(f.id().clone()).delete_edge(contains.id.clone());
        let changes = Staging::new(&base).stage_all(&tx).unwrap();
        let ops: Vec<WalOp> = changes.iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![WalOp::DeleteEdge, WalOp::DeleteNode]);
    }

    #[test]
    fn test_diff_transaction_orders_deletes_first() {
        let file = file_node("a.py", ParseStatus::Success);
        let old = function_node("a.py", "a", "old", 1);
        let new = function_node("a.py", "a", "new", 1);
        let current_edges = vec![Edge::contains(file.id().clone(), old.id().clone())];
        let desired_edges = vec![Edge::contains(file.id().clone(), new.id().clone())];

        let tx = diff_transaction(
            [&file, &old],
            current_edges.iter(),
            &[file.clone(), new.clone()],
            &desired_edges,
        );
        let kinds: Vec<&str> = tx
            .ops()
            .iter()
            .map(|op| match op {
                Mutation::DeleteEdge(_) => "delete_edge",
                Mutation::DeleteNode(_) => "delete_node",
                Mutation::UpdateNode(_) => "update_node",
                Mutation::CreateNode(_) => "create_node",
                Mutation::CreateEdge(_) => "create_edge",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["delete_edge", "delete_node", "create_node", "create_edge"]
        );

        let base = GraphState::from_parts(vec![file, old], current_edges);
        assert!(Staging::new(&base).stage_all(&tx).is_ok());
    }
}
