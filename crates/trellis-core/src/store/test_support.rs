//! Node fixtures shared by the store tests.

use crate::models::{
    AccessKind, CallKind, ClassNode, Confidence, Edge, EdgeKind, EdgeMetadata, FileNode,
    FunctionNode, ImportKind, InheritKind, Language, LineRange, Node, NodeId, NodeKind,
    ParseStatus, TestNode,
};
use crate::store::GraphState;

pub(crate) fn file_node(path: &str, status: ParseStatus) -> Node {
    Node::File(FileNode {
        id: NodeId::file(path),
        path: path.to_string(),
        language: Language::Python,
        content_hash: format!("hash-{path}"),
        size_bytes: 0,
        line_count: 10,
        parse_status: status,
        error_count: u32::from(status != ParseStatus::Success),
        module: path.strip_suffix(".py").map(|m| m.replace('/', ".")),
        references: Vec::new(),
    })
}

pub(crate) fn function_node(path: &str, module: &str, name: &str, line: u32) -> Node {
    let qualified_name = format!("{module}.{name}");
    Node::Function(FunctionNode {
        id: NodeId::declaration(NodeKind::Function, &qualified_name),
        name: name.to_string(),
        structural_hash: format!("h-{qualified_name}"),
        qualified_name,
        file_path: path.to_string(),
        lines: LineRange::new(line, line + 2),
        parse_status: ParseStatus::Success,
        parent: NodeId::file(path),
        owner: None,
        signature: format!("def {name}()"),
        parameters: Vec::new(),
        return_type: None,
        is_async: false,
        docstring: None,
    })
}

pub(crate) fn class_node(path: &str, module: &str, name: &str, line: u32) -> Node {
    let qualified_name = format!("{module}.{name}");
    Node::Class(ClassNode {
        id: NodeId::declaration(NodeKind::Class, &qualified_name),
        name: name.to_string(),
        structural_hash: format!("h-{qualified_name}"),
        qualified_name,
        file_path: path.to_string(),
        lines: LineRange::new(line, line + 3),
        parse_status: ParseStatus::Success,
        parent: NodeId::file(path),
        is_interface: false,
        bases: Vec::new(),
        docstring: None,
    })
}

pub(crate) fn test_node(path: &str, module: &str, name: &str, line: u32) -> Node {
    let qualified_name = format!("{module}.{name}");
    Node::Test(TestNode {
        id: NodeId::declaration(NodeKind::Test, &qualified_name),
        name: name.to_string(),
        structural_hash: format!("h-{qualified_name}"),
        qualified_name,
        file_path: path.to_string(),
        lines: LineRange::new(line, line + 2),
        parse_status: ParseStatus::Success,
        parent: NodeId::file(path),
        owner: None,
        framework: "pytest".to_string(),
        signature: format!("def {name}()"),
    })
}

/// Edge of `kind` between two fixture nodes; unresolved below full confidence.
pub(crate) fn edge(kind: EdgeKind, source: &Node, target: &Node, confidence: f64) -> Edge {
    let metadata = match kind {
        EdgeKind::Contains => EdgeMetadata::Contains,
        EdgeKind::Imports => EdgeMetadata::Imports {
            names: Vec::new(),
            import_kind: ImportKind::Absolute,
            external: false,
        },
        EdgeKind::Calls => EdgeMetadata::Calls {
            lines: vec![1],
            call_kind: CallKind::Direct,
            recursive: false,
        },
        EdgeKind::Inherits => EdgeMetadata::Inherits {
            relation: InheritKind::Extends,
        },
        EdgeKind::ReadsWrites => EdgeMetadata::ReadsWrites {
            attributes: vec!["value".to_string()],
            access: AccessKind::Read,
            lines: vec![1],
        },
        EdgeKind::Tests => EdgeMetadata::Tests { lines: vec![1] },
    };
    Edge::new(
        kind,
        source.id().clone(),
        target.id().clone(),
        Confidence::new(confidence),
        confidence >= 1.0,
        metadata,
    )
}

/// Graph holding `nodes` plus a `Contains` edge from each declaration's file.
pub(crate) fn graph_with(nodes: Vec<Node>, edges: Vec<Edge>) -> GraphState {
    let mut all_edges = edges;
    for node in &nodes {
        if let Some(parent) = node.parent() {
            if nodes.iter().any(|n| n.id() == parent) {
                all_edges.push(Edge::contains(parent.clone(), node.id().clone()));
            }
        }
    }
    GraphState::from_parts(nodes, all_edges)
}
