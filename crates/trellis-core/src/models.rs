//! Shared typed models used across indexing, storage, and query layers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::UnresolvedReference;

// ---------------------------------------------------------------------------
// Confidence
// ---------------------------------------------------------------------------

/// Confidence assigned to statically resolved relationships.
pub const RESOLVED_CONFIDENCE: f64 = 1.0;

/// Upper bound for any edge whose target could not be statically resolved.
pub const UNRESOLVED_CONFIDENCE_MAX: f64 = 0.7;

/// Confidence at or below which results carry a warning annotation.
pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.70;

/// Certainty that an extracted node or edge reflects the source, in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Confidence(f64);

impl Confidence {
    pub const RESOLVED: Confidence = Confidence(RESOLVED_CONFIDENCE);

    /// Clamp into `[0, 1]`; NaN collapses to zero.
    pub fn new(value: f64) -> Self {
        if value.is_nan() {
            Confidence(0.0)
        } else {
            Confidence(value.clamp(0.0, 1.0))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn level(self) -> ConfidenceLevel {
        ConfidenceLevel::of(self.0)
    }

    pub fn should_warn(self, threshold: f64) -> bool {
        self.0 <= threshold
    }

    /// Confidence of declarations recovered from a file with `error_count`
    /// syntax errors.
    pub fn for_parse(status: ParseStatus, error_count: u32) -> Self {
        match status {
            ParseStatus::Success => Confidence::RESOLVED,
            ParseStatus::Partial => Confidence::new((1.0 - 0.1 * error_count as f64).max(0.5)),
            ParseStatus::Failed => Confidence(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    pub fn of(score: f64) -> Self {
        if score >= 0.9 {
            ConfidenceLevel::High
        } else if score >= 0.7 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConfidenceLevel::High => "high",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::Low => "low",
        }
    }
}

// ---------------------------------------------------------------------------
// Languages and parse status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    TypeScript,
    Go,
    Java,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Python,
        Language::TypeScript,
        Language::Go,
        Language::Java,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::TypeScript => "typescript",
            Language::Go => "go",
            Language::Java => "java",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Success,
    Partial,
    Failed,
}

impl ParseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseStatus::Success => "success",
            ParseStatus::Partial => "partial",
            ParseStatus::Failed => "failed",
        }
    }
}

/// 1-based inclusive line span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn contains(&self, line: u32) -> bool {
        self.start <= line && line <= self.end
    }
}

// ---------------------------------------------------------------------------
// Node identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Module,
    Class,
    Function,
    Test,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Module => "module",
            NodeKind::Class => "class",
            NodeKind::Function => "function",
            NodeKind::Test => "test",
        }
    }

    /// Kinds whose qualified names must be unique across the repository.
    pub fn is_declaration(self) -> bool {
        matches!(self, NodeKind::Class | NodeKind::Function | NodeKind::Test)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable node identifier: `<kind>:<qualified name>` (`file:<path>` for files).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn file(path: &str) -> Self {
        NodeId(format!("file:{path}"))
    }

    pub fn module(qualified_name: &str) -> Self {
        NodeId(format!("module:{qualified_name}"))
    }

    pub fn declaration(kind: NodeKind, qualified_name: &str) -> Self {
        NodeId(format!("{}:{qualified_name}", kind.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> Option<NodeKind> {
        let (prefix, _) = self.0.split_once(':')?;
        match prefix {
            "file" => Some(NodeKind::File),
            "module" => Some(NodeKind::Module),
            "class" => Some(NodeKind::Class),
            "function" => Some(NodeKind::Function),
            "test" => Some(NodeKind::Test),
            _ => None,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        NodeId(value)
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub id: NodeId,
    pub path: String,
    pub language: Language,
    /// SHA-256 of the raw file bytes.
    pub content_hash: String,
    pub size_bytes: u64,
    pub line_count: u32,
    pub parse_status: ParseStatus,
    pub error_count: u32,
    /// Qualified name of the module this file declares, if any.
    pub module: Option<String>,
    /// Unresolved references collected from the file, in source order.
    pub references: Vec<Reference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleNode {
    pub id: NodeId,
    pub name: String,
    pub qualified_name: String,
    /// True when no indexed file declares the module.
    pub external: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassNode {
    pub id: NodeId,
    pub name: String,
    pub qualified_name: String,
    pub file_path: String,
    pub lines: LineRange,
    pub parse_status: ParseStatus,
    pub parent: NodeId,
    pub is_interface: bool,
    pub bases: Vec<String>,
    pub docstring: Option<String>,
    pub structural_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionNode {
    pub id: NodeId,
    pub name: String,
    pub qualified_name: String,
    pub file_path: String,
    pub lines: LineRange,
    pub parse_status: ParseStatus,
    pub parent: NodeId,
    /// Enclosing class, or receiver type for Go methods.
    pub owner: Option<String>,
    pub signature: String,
    pub parameters: Vec<String>,
    pub return_type: Option<String>,
    pub is_async: bool,
    pub docstring: Option<String>,
    pub structural_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestNode {
    pub id: NodeId,
    pub name: String,
    pub qualified_name: String,
    pub file_path: String,
    pub lines: LineRange,
    pub parse_status: ParseStatus,
    pub parent: NodeId,
    pub owner: Option<String>,
    pub framework: String,
    pub signature: String,
    pub structural_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    File(FileNode),
    Module(ModuleNode),
    Class(ClassNode),
    Function(FunctionNode),
    Test(TestNode),
}

impl Node {
    pub fn id(&self) -> &NodeId {
        match self {
            Node::File(n) => &n.id,
            Node::Module(n) => &n.id,
            Node::Class(n) => &n.id,
            Node::Function(n) => &n.id,
            Node::Test(n) => &n.id,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::File(_) => NodeKind::File,
            Node::Module(_) => NodeKind::Module,
            Node::Class(_) => NodeKind::Class,
            Node::Function(_) => NodeKind::Function,
            Node::Test(_) => NodeKind::Test,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Node::File(n) => n.path.rsplit('/').next().unwrap_or(&n.path),
            Node::Module(n) => &n.name,
            Node::Class(n) => &n.name,
            Node::Function(n) => &n.name,
            Node::Test(n) => &n.name,
        }
    }

    pub fn qualified_name(&self) -> &str {
        match self {
            Node::File(n) => &n.path,
            Node::Module(n) => &n.qualified_name,
            Node::Class(n) => &n.qualified_name,
            Node::Function(n) => &n.qualified_name,
            Node::Test(n) => &n.qualified_name,
        }
    }

    pub fn file_path(&self) -> Option<&str> {
        match self {
            Node::File(n) => Some(&n.path),
            Node::Module(_) => None,
            Node::Class(n) => Some(&n.file_path),
            Node::Function(n) => Some(&n.file_path),
            Node::Test(n) => Some(&n.file_path),
        }
    }

    pub fn lines(&self) -> Option<LineRange> {
        match self {
            Node::File(n) => Some(LineRange::new(1, n.line_count.max(1))),
            Node::Module(_) => None,
            Node::Class(n) => Some(n.lines),
            Node::Function(n) => Some(n.lines),
            Node::Test(n) => Some(n.lines),
        }
    }

    pub fn parse_status(&self) -> ParseStatus {
        match self {
            Node::File(n) => n.parse_status,
            Node::Module(_) => ParseStatus::Success,
            Node::Class(n) => n.parse_status,
            Node::Function(n) => n.parse_status,
            Node::Test(n) => n.parse_status,
        }
    }

    pub fn parent(&self) -> Option<&NodeId> {
        match self {
            Node::Class(n) => Some(&n.parent),
            Node::Function(n) => Some(&n.parent),
            Node::Test(n) => Some(&n.parent),
            Node::File(_) | Node::Module(_) => None,
        }
    }

    pub fn owner(&self) -> Option<&str> {
        match self {
            Node::Function(n) => n.owner.as_deref(),
            Node::Test(n) => n.owner.as_deref(),
            _ => None,
        }
    }

    /// Hash used to key cached embeddings: structural hash for declarations,
    /// content hash for files.
    pub fn content_key(&self) -> Option<&str> {
        match self {
            Node::File(n) => Some(&n.content_hash),
            Node::Module(_) => None,
            Node::Class(n) => Some(&n.structural_hash),
            Node::Function(n) => Some(&n.structural_hash),
            Node::Test(n) => Some(&n.structural_hash),
        }
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match self {
            Node::File(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_module(&self) -> Option<&ModuleNode> {
        match self {
            Node::Module(n) => Some(n),
            _ => None,
        }
    }

    /// Copy of the node with its line span blanked, for move detection.
    pub fn without_position(&self) -> Node {
        let blank = LineRange::new(0, 0);
        let mut copy = self.clone();
        match &mut copy {
            Node::Class(n) => n.lines = blank,
            Node::Function(n) => n.lines = blank,
            Node::Test(n) => n.lines = blank,
            Node::File(_) | Node::Module(_) => {}
        }
        copy
    }

    /// Text handed to the embedding engine for this node.
    pub fn embedding_text(&self) -> String {
        match self {
            Node::Function(n) => format!(
                "{} {} {} {}",
                n.name,
                n.qualified_name,
                n.signature,
                n.docstring.as_deref().unwrap_or("")
            ),
            Node::Class(n) => format!(
                "{} {} {} {}",
                n.name,
                n.qualified_name,
                n.bases.join(" "),
                n.docstring.as_deref().unwrap_or("")
            ),
            Node::Test(n) => format!("{} {} {}", n.name, n.qualified_name, n.signature),
            Node::File(n) => n.path.clone(),
            Node::Module(n) => n.qualified_name.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// References recorded on file nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedName {
    pub name: String,
    pub alias: Option<String>,
}

impl ImportedName {
    pub fn local_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRef {
    pub line: u32,
    /// Module path as written (`a.b`, `./util`, `fmt`, `java.util.List`).
    pub module: String,
    pub names: Vec<ImportedName>,
    pub alias: Option<String>,
    /// Leading-dot count for Python relative imports.
    pub relative_level: u32,
    pub wildcard: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRef {
    pub source: NodeId,
    pub name: String,
    pub receiver: Option<String>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InheritRef {
    pub source: NodeId,
    pub name: String,
    pub qualifier: Option<String>,
    pub relation: InheritKind,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRef {
    pub source: NodeId,
    pub receiver: String,
    pub attribute: String,
    pub access: AccessKind,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ref", rename_all = "snake_case")]
pub enum Reference {
    Import(ImportRef),
    Call(CallRef),
    Inherit(InheritRef),
    Attribute(AttributeRef),
}

impl Reference {
    pub fn line(&self) -> u32 {
        match self {
            Reference::Import(r) => r.line,
            Reference::Call(r) => r.line,
            Reference::Inherit(r) => r.line,
            Reference::Attribute(r) => r.line,
        }
    }

    /// Identifiers whose resolution this reference depends on.
    pub fn mentions(&self) -> Vec<&str> {
        match self {
            Reference::Import(r) => {
                let mut names: Vec<&str> = r.names.iter().map(|n| n.name.as_str()).collect();
                names.push(&r.module);
                names
            }
            Reference::Call(r) => {
                let mut names = vec![r.name.as_str()];
                names.extend(r.receiver.as_deref());
                names
            }
            Reference::Inherit(r) => {
                let mut names = vec![r.name.as_str()];
                names.extend(r.qualifier.as_deref());
                names
            }
            Reference::Attribute(r) => vec![r.receiver.as_str(), r.attribute.as_str()],
        }
    }
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Contains,
    Imports,
    Calls,
    Inherits,
    ReadsWrites,
    Tests,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 6] = [
        EdgeKind::Contains,
        EdgeKind::Imports,
        EdgeKind::Calls,
        EdgeKind::Inherits,
        EdgeKind::ReadsWrites,
        EdgeKind::Tests,
    ];

    /// Edge kinds followed when expanding retrieval neighbourhoods.
    pub const RETRIEVAL: [EdgeKind; 3] = [EdgeKind::Imports, EdgeKind::Inherits, EdgeKind::Calls];

    pub fn as_str(self) -> &'static str {
        match self {
            EdgeKind::Contains => "contains",
            EdgeKind::Imports => "imports",
            EdgeKind::Calls => "calls",
            EdgeKind::Inherits => "inherits",
            EdgeKind::ReadsWrites => "reads_writes",
            EdgeKind::Tests => "tests",
        }
    }

    /// Kinds whose subgraph must stay acyclic.
    pub fn is_acyclic(self) -> bool {
        matches!(self, EdgeKind::Contains | EdgeKind::Inherits)
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(String);

impl EdgeId {
    pub fn new(kind: EdgeKind, source: &NodeId, target: &NodeId) -> Self {
        EdgeId(format!("{}:{}->{}", kind.as_str(), source, target))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportKind {
    Absolute,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Direct,
    Method,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritKind {
    Extends,
    Implements,
    Embeds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Write,
    ReadWrite,
}

impl AccessKind {
    pub fn merge(self, other: AccessKind) -> AccessKind {
        if self == other {
            self
        } else {
            AccessKind::ReadWrite
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeMetadata {
    Contains,
    Imports {
        names: Vec<String>,
        import_kind: ImportKind,
        external: bool,
    },
    Calls {
        lines: Vec<u32>,
        call_kind: CallKind,
        recursive: bool,
    },
    Inherits {
        relation: InheritKind,
    },
    ReadsWrites {
        attributes: Vec<String>,
        access: AccessKind,
        lines: Vec<u32>,
    },
    Tests {
        lines: Vec<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub kind: EdgeKind,
    pub source: NodeId,
    pub target: NodeId,
    pub confidence: Confidence,
    pub is_resolved: bool,
    pub metadata: EdgeMetadata,
}

impl Edge {
    pub fn new(
        kind: EdgeKind,
        source: NodeId,
        target: NodeId,
        confidence: Confidence,
        is_resolved: bool,
        metadata: EdgeMetadata,
    ) -> Self {
        Self {
            id: EdgeId::new(kind, &source, &target),
            kind,
            source,
            target,
            confidence,
            is_resolved,
            metadata,
        }
    }

    pub fn contains(parent: NodeId, child: NodeId) -> Self {
        Edge::new(
            EdgeKind::Contains,
            parent,
            child,
            Confidence::RESOLVED,
            true,
            EdgeMetadata::Contains,
        )
    }

    /// The node on the far side of this edge from `node`.
    pub fn other_end(&self, node: &NodeId) -> &NodeId {
        if &self.source == node {
            &self.target
        } else {
            &self.source
        }
    }
}

// ---------------------------------------------------------------------------
// Node and edge collections
// ---------------------------------------------------------------------------

/// Nodes ordered by id so that serialisation is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSet {
    pub nodes: Vec<Node>,
}

impl NodeSet {
    pub fn from_nodes(mut nodes: Vec<Node>) -> Self {
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        nodes.dedup_by(|a, b| a.id() == b.id());
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes
            .binary_search_by(|n| n.id().cmp(id))
            .ok()
            .map(|idx| &self.nodes[idx])
    }

    pub fn file(&self) -> Option<&FileNode> {
        self.nodes.iter().find_map(Node::as_file)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn declarations(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.kind().is_declaration())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EdgeSet {
    pub edges: Vec<Edge>,
    pub unresolved: Vec<UnresolvedReference>,
}

impl EdgeSet {
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Query output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub semantic: Option<f64>,
    pub graph: f64,
    pub execution: Option<f64>,
    pub graph_distance: Option<u32>,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReference {
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub qualified_name: String,
    pub lines: Option<LineRange>,
    pub score: f64,
    pub breakdown: Option<ScoreBreakdown>,
    /// Product of edge confidences along the path that reached this node.
    pub confidence: f64,
    /// Hops from the ranked node that pulled this one in; 0 for ranked nodes.
    pub hops: u32,
    pub via: Option<EdgeKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReference {
    pub path: String,
    pub relevance: f64,
    pub confidence: f64,
    pub rationale: String,
    pub related: Vec<NodeReference>,
}

/// Ranked, explained answer to one retrieval query. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPack {
    pub query: String,
    pub files: Vec<FileReference>,
    pub total_confidence: f64,
    pub max_hops: u32,
    pub truncated: bool,
    pub notes: Vec<String>,
}

impl ContextPack {
    pub fn empty(query: &str, max_hops: u32, note: impl Into<String>) -> Self {
        Self {
            query: query.to_string(),
            files: Vec::new(),
            total_confidence: 0.0,
            max_hops,
            truncated: false,
            notes: vec![note.into()],
        }
    }

    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Immutable point-in-time capture of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    /// Last WAL sequence number folded into the snapshot.
    pub wal_sequence: u64,
    pub node_count: usize,
    pub edge_count: usize,
    pub coverage_pct: f64,
    pub checksum: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

// ---------------------------------------------------------------------------
// Indexing reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStage {
    Read,
    Parse,
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexIssue {
    pub path: String,
    pub stage: IssueStage,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexResult {
    pub files_seen: usize,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub errors: Vec<IndexIssue>,
    pub coverage_pct: f64,
    pub node_count: usize,
    pub edge_count: usize,
    pub unresolved_references: usize,
    pub wal_entries: usize,
    pub elapsed_ms: u64,
    pub cancelled: bool,
}

/// Minimal change applied for one file update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub file_path: String,
    pub unchanged: bool,
    pub parse_status: Option<ParseStatus>,
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    pub modified: Vec<NodeId>,
    pub moved: Vec<NodeId>,
    pub edges_added: Vec<EdgeId>,
    pub edges_removed: Vec<EdgeId>,
    pub wal_entries: usize,
    pub errors: Vec<IndexIssue>,
}

impl Patch {
    pub fn unchanged(file_path: &str) -> Self {
        Self {
            file_path: file_path.to_string(),
            unchanged: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.modified.is_empty()
            && self.moved.is_empty()
            && self.edges_added.is_empty()
            && self.edges_removed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Impact and tests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactNode {
    pub node_id: NodeId,
    pub qualified_name: String,
    pub file_path: Option<String>,
    pub depth: u32,
    pub via: EdgeKind,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactReport {
    pub node_id: NodeId,
    /// Nodes that depend on the target (callers, importers, subclasses, tests).
    pub upstream: Vec<ImpactNode>,
    /// Nodes the target depends on.
    pub downstream: Vec<ImpactNode>,
    pub blast_radius: usize,
    pub risk: RiskLevel,
    pub affected_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedTest {
    pub node_id: NodeId,
    pub qualified_name: String,
    pub file_path: String,
    pub covers: NodeId,
    pub direct: bool,
    pub depth: u32,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSet {
    pub tests: Vec<RelatedTest>,
}

impl TestSet {
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.tests.iter().any(|t| &t.node_id == id)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub node_count: usize,
    pub edge_count: usize,
    pub nodes_by_kind: BTreeMap<String, usize>,
    pub edges_by_kind: BTreeMap<String, usize>,
    pub coverage_pct: f64,
    pub last_indexed: Option<DateTime<Utc>>,
    pub wal_sequence: u64,
    pub embedding_cache: CacheStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_clamps_and_levels() {
        assert_eq!(Confidence::new(1.7).value(), 1.0);
        assert_eq!(Confidence::new(-0.2).value(), 0.0);
        assert_eq!(Confidence::new(f64::NAN).value(), 0.0);
        assert_eq!(Confidence::new(0.95).level(), ConfidenceLevel::High);
        assert_eq!(Confidence::new(0.7).level(), ConfidenceLevel::Medium);
        assert_eq!(Confidence::new(0.69).level(), ConfidenceLevel::Low);
        assert!(Confidence::new(0.70).should_warn(DEFAULT_WARNING_THRESHOLD));
        assert!(!Confidence::new(0.71).should_warn(DEFAULT_WARNING_THRESHOLD));
    }

    #[test]
    fn test_partial_parse_confidence_floor() {
        let c = Confidence::for_parse(ParseStatus::Partial, 2);
        assert!((c.value() - 0.8).abs() < 1e-9);
        assert_eq!(Confidence::for_parse(ParseStatus::Partial, 12).value(), 0.5);
        assert_eq!(Confidence::for_parse(ParseStatus::Failed, 0).value(), 0.0);
    }

    #[test]
    fn test_node_id_kind_prefix() {
        let id = NodeId::declaration(NodeKind::Function, "auth.register.register_user");
        assert_eq!(id.as_str(), "function:auth.register.register_user");
        assert_eq!(id.kind(), Some(NodeKind::Function));
        assert_eq!(NodeId::file("a/b.py").kind(), Some(NodeKind::File));
    }

    #[test]
    fn test_edge_id_is_deterministic() {
        let a = NodeId::from("function:a.f");
        let b = NodeId::from("function:a.g");
        let edge = Edge::new(
            EdgeKind::Calls,
            a.clone(),
            b.clone(),
            Confidence::RESOLVED,
            true,
            EdgeMetadata::Calls {
                lines: vec![3],
                call_kind: CallKind::Direct,
                recursive: false,
            },
        );
        assert_eq!(edge.id.as_str(), "calls:function:a.f->function:a.g");
        assert_eq!(edge.other_end(&a), &b);
    }

    #[test]
    fn test_inherits_edge_serde_round_trip() {
        let edge = Edge::new(
            EdgeKind::Inherits,
            NodeId::from("class:a.B"),
            NodeId::from("class:a.A"),
            Confidence::RESOLVED,
            true,
            EdgeMetadata::Inherits {
                relation: InheritKind::Implements,
            },
        );
        let json = serde_json::to_string(&edge).unwrap();
        assert!(json.contains("\"type\":\"inherits\""), "{json}");
        let back: Edge = serde_json::from_str(&json).unwrap();
        assert_eq!(back, edge);
    }

    #[test]
    fn test_node_set_sorted_and_deduplicated() {
        let module = |name: &str| {
            Node::Module(ModuleNode {
                id: NodeId::module(name),
                name: name.to_string(),
                qualified_name: name.to_string(),
                external: true,
            })
        };
        let set = NodeSet::from_nodes(vec![module("b"), module("a"), module("b")]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.nodes[0].qualified_name(), "a");
        assert!(set.get(&NodeId::module("b")).is_some());
    }
}
