//! Turns one parsed file into graph nodes.
//!
//! The builder owns the syntax-tree traversal. Language adapters classify
//! individual nodes; the builder assigns qualified names and parents, and
//! records every import, call, base type and attribute access on the file
//! node as a [`Reference`]. Cross-file resolution happens later, against the
//! whole graph, in [`crate::indexer::relations`].
//!
//! The output is a pure function of `(path, bytes, language)`.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tree_sitter::Node as SyntaxNode;

use crate::indexer::filesystem::content_hash;
use crate::indexer::languages::{
    line_of, parser_for, squash, text, Construct, DeclKind, Declaration, LanguageParser,
    WalkContext,
};
use crate::indexer::parser::ParseOutput;
use crate::models::{
    AttributeRef, CallRef, ClassNode, Edge, FileNode, FunctionNode, InheritRef, Language,
    LineRange, Node, NodeId, NodeKind, NodeSet, ParseStatus, Reference, TestNode,
};

/// Nodes and containment edges derived from one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildOutput {
    pub nodes: NodeSet,
    /// `Contains` edges from the file (and its classes and functions) to the
    /// declarations nested in them. `Module -> File` is added at resolution.
    pub contains: Vec<Edge>,
}

impl BuildOutput {
    pub fn file(&self) -> Option<&FileNode> {
        self.nodes.file()
    }
}

#[derive(Debug)]
struct Scope {
    id: NodeId,
    qualified_name: String,
    kind: NodeKind,
    class_name: Option<String>,
    in_function: bool,
    receiver_var: Option<String>,
    parent: Option<usize>,
}

/// 1-based inclusive span. A node ending at column 0 of a later row ends on
/// the previous line.
pub fn line_span(node: SyntaxNode<'_>) -> LineRange {
    let start = node.start_position().row as u32 + 1;
    let end = node.end_position();
    let end_line = if end.column == 0 && end.row > node.start_position().row {
        end.row as u32
    } else {
        end.row as u32 + 1
    };
    LineRange::new(start, end_line)
}

pub fn structural_hash(kind: NodeKind, name: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(squash(body).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn line_count(source: &[u8]) -> u32 {
    let newlines = source.iter().filter(|b| **b == b'\n').count() as u32;
    if source.last().is_some_and(|b| *b != b'\n') {
        newlines + 1
    } else {
        newlines
    }
}

fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.split('.').next().unwrap_or(name)
}

struct Builder<'a> {
    path: &'a str,
    source: &'a [u8],
    language: Language,
    module: String,
    adapter: &'static dyn LanguageParser,
    scopes: Vec<Scope>,
    nodes: Vec<Node>,
    contains: Vec<Edge>,
    references: Vec<Reference>,
    taken: HashMap<String, u32>,
}

impl<'a> Builder<'a> {
    fn qualified_name(&mut self, scope: usize, decl: &Declaration<'_>) -> String {
        let parent = &self.scopes[scope];
        let base = match (&decl.owner, parent.kind) {
            (Some(owner), NodeKind::File) => format!("{}.{owner}.{}", parent.qualified_name, decl.name),
            _ if self.language == Language::Go
                && decl.name == "init"
                && parent.kind == NodeKind::File =>
            {
                format!("{}.init#{}", parent.qualified_name, file_stem(self.path))
            }
            _ => format!("{}.{}", parent.qualified_name, decl.name),
        };
        let seen = self.taken.entry(base.clone()).or_insert(0);
        *seen += 1;
        if *seen == 1 {
            base
        } else {
            format!("{base}#{seen}")
        }
    }

    /// Receiver variable of the nearest enclosing method.
    fn receiver_var(&self, scope: usize) -> Option<&str> {
        let mut current = Some(scope);
        while let Some(idx) = current {
            let s = &self.scopes[idx];
            if s.receiver_var.is_some() {
                return s.receiver_var.as_deref();
            }
            current = s.parent;
        }
        None
    }

    /// Rewrites a Go receiver variable (`s.listen()`) to `self`.
    fn normalize_receiver(&self, scope: usize, receiver: String) -> String {
        let Some(var) = self.receiver_var(scope) else {
            return receiver;
        };
        if receiver == var {
            "self".to_string()
        } else if let Some(rest) = receiver.strip_prefix(var).and_then(|r| r.strip_prefix('.')) {
            format!("self.{rest}")
        } else {
            receiver
        }
    }

    fn declare(&mut self, scope: usize, decl: Declaration<'_>) -> usize {
        let qualified_name = self.qualified_name(scope, &decl);
        let parent_scope = &self.scopes[scope];
        let parent = parent_scope.id.clone();
        let enclosing_class = if parent_scope.kind == NodeKind::Class {
            parent_scope.class_name.clone()
        } else {
            None
        };
        let owner = decl.owner.clone().or(enclosing_class);
        let lines = line_span(decl.node);
        let parse_status = if decl.node.has_error() {
            ParseStatus::Partial
        } else {
            ParseStatus::Success
        };
        let body = text(decl.node, self.source);

        let (kind, node) = match decl.kind {
            DeclKind::Class { interface } => {
                let id = NodeId::declaration(NodeKind::Class, &qualified_name);
                for base in &decl.bases {
                    self.references.push(Reference::Inherit(InheritRef {
                        source: id.clone(),
                        name: base.name.clone(),
                        qualifier: base.qualifier.clone(),
                        relation: base.relation,
                        line: lines.start,
                    }));
                }
                let node = Node::Class(ClassNode {
                    id,
                    name: decl.name.clone(),
                    qualified_name: qualified_name.clone(),
                    file_path: self.path.to_string(),
                    lines,
                    parse_status,
                    parent: parent.clone(),
                    is_interface: interface,
                    bases: decl
                        .bases
                        .iter()
                        .map(|b| match &b.qualifier {
                            Some(q) => format!("{q}.{}", b.name),
                            None => b.name.clone(),
                        })
                        .collect(),
                    docstring: decl.docstring.clone(),
                    structural_hash: structural_hash(NodeKind::Class, &decl.name, body),
                });
                (NodeKind::Class, node)
            }
            DeclKind::Function => {
                let node = Node::Function(FunctionNode {
                    id: NodeId::declaration(NodeKind::Function, &qualified_name),
                    name: decl.name.clone(),
                    qualified_name: qualified_name.clone(),
                    file_path: self.path.to_string(),
                    lines,
                    parse_status,
                    parent: parent.clone(),
                    owner: owner.clone(),
                    signature: decl.signature.clone(),
                    parameters: decl.parameters.clone(),
                    return_type: decl.return_type.clone(),
                    is_async: decl.is_async,
                    docstring: decl.docstring.clone(),
                    structural_hash: structural_hash(NodeKind::Function, &decl.name, body),
                });
                (NodeKind::Function, node)
            }
            DeclKind::Test { framework } => {
                let node = Node::Test(TestNode {
                    id: NodeId::declaration(NodeKind::Test, &qualified_name),
                    name: decl.name.clone(),
                    qualified_name: qualified_name.clone(),
                    file_path: self.path.to_string(),
                    lines,
                    parse_status,
                    parent: parent.clone(),
                    owner: owner.clone(),
                    framework: framework.to_string(),
                    signature: decl.signature.clone(),
                    structural_hash: structural_hash(NodeKind::Test, &decl.name, body),
                });
                (NodeKind::Test, node)
            }
        };

        let id = node.id().clone();
        self.contains.push(Edge::contains(parent, id.clone()));
        self.nodes.push(node);

        let inherited_class = self.scopes[scope].class_name.clone();
        let inherited_receiver = self.scopes[scope].receiver_var.clone();
        self.scopes.push(Scope {
            id,
            qualified_name,
            kind,
            class_name: match kind {
                NodeKind::Class => Some(decl.name.clone()),
                _ => decl.owner.clone().or(inherited_class),
            },
            in_function: kind != NodeKind::Class,
            receiver_var: match kind {
                NodeKind::Class => None,
                _ => decl.receiver_var.clone().or(inherited_receiver),
            },
            parent: Some(scope),
        });
        self.scopes.len() - 1
    }

    fn walk(&mut self, root: SyntaxNode<'_>) {
        let mut stack = vec![(root, 0usize)];
        while let Some((node, scope)) = stack.pop() {
            let class_name = self.scopes[scope].class_name.clone();
            let ctx = WalkContext {
                source: self.source,
                path: self.path,
                class_name: class_name.as_deref(),
                in_function: self.scopes[scope].in_function,
            };
            let mut child_scope = scope;
            match self.adapter.classify(node, &ctx) {
                Some(Construct::Declaration(decl)) => {
                    child_scope = self.declare(scope, *decl);
                }
                Some(Construct::Imports(imports)) => {
                    self.references
                        .extend(imports.into_iter().map(Reference::Import));
                    continue;
                }
                Some(Construct::Call { name, receiver }) => {
                    let receiver = receiver.map(|r| self.normalize_receiver(scope, r));
                    self.references.push(Reference::Call(CallRef {
                        source: self.scopes[scope].id.clone(),
                        name,
                        receiver,
                        line: line_of(node),
                    }));
                }
                Some(Construct::Attribute {
                    receiver,
                    attribute,
                    access,
                }) => {
                    let receiver = self.normalize_receiver(scope, receiver);
                    self.references.push(Reference::Attribute(AttributeRef {
                        source: self.scopes[scope].id.clone(),
                        receiver,
                        attribute,
                        access,
                        line: line_of(node),
                    }));
                }
                None => {}
            }
            let mut cursor = node.walk();
            let children: Vec<SyntaxNode<'_>> = node.children(&mut cursor).collect();
            stack.extend(children.into_iter().rev().map(|c| (c, child_scope)));
        }
    }
}

/// Module a file declares, independent of whether it parsed.
pub fn module_of(path: &str, language: Language, parsed: &ParseOutput, source: &[u8]) -> String {
    let adapter = parser_for(language);
    let package = parsed
        .root()
        .and_then(|root| adapter.package_name(root, source));
    adapter.module_name(path, package.as_deref())
}

pub fn build(path: &str, source: &[u8], parsed: &ParseOutput, language: Language) -> BuildOutput {
    let adapter = parser_for(language);
    let module = module_of(path, language, parsed, source);
    let file_id = NodeId::file(path);

    let mut builder = Builder {
        path,
        source,
        language,
        module: module.clone(),
        adapter,
        scopes: vec![Scope {
            id: file_id.clone(),
            qualified_name: module.clone(),
            kind: NodeKind::File,
            class_name: None,
            in_function: false,
            receiver_var: None,
            parent: None,
        }],
        nodes: Vec::new(),
        contains: Vec::new(),
        references: Vec::new(),
        taken: HashMap::new(),
    };
    if let Some(root) = parsed.root() {
        builder.walk(root);
    }

    let file = FileNode {
        id: file_id,
        path: path.to_string(),
        language,
        content_hash: content_hash(source),
        size_bytes: source.len() as u64,
        line_count: line_count(source),
        parse_status: parsed.status,
        error_count: parsed.error_count(),
        module: Some(builder.module),
        references: builder.references,
    };
    let mut nodes = builder.nodes;
    nodes.push(Node::File(file));
    let mut contains = builder.contains;
    contains.sort_by(|a, b| a.id.cmp(&b.id));
    BuildOutput {
        nodes: NodeSet::from_nodes(nodes),
        contains,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::parser::{parse, Grammar};

    fn build_source(path: &str, language: Language, src: &str) -> BuildOutput {
        let parsed = parse(Grammar::for_path(path, language), src.as_bytes());
        build(path, src.as_bytes(), &parsed, language)
    }

    fn qualified_names(out: &BuildOutput) -> Vec<&str> {
        out.nodes.declarations().map(|n| n.qualified_name()).collect()
    }

    const AUTH: &str = "\
from .validators import validate_email


class Registrar(BaseRegistrar):
    def register(self, email):
        if validate_email(email):
            self.save(email)

    def save(self, email):
        def audit():
            pass
        audit()


def register_user(email):
    return Registrar().register(email)


def register_user(email, name):
    return None
";

    #[test]
    fn test_qualified_names_and_parents() {
        let out = build_source("auth/register.py", Language::Python, AUTH);
        let names = qualified_names(&out);
        assert!(names.contains(&"auth.register.Registrar"));
        assert!(names.contains(&"auth.register.Registrar.register"));
        assert!(names.contains(&"auth.register.Registrar.save.audit"));
        assert!(names.contains(&"auth.register.register_user"));
        assert!(names.contains(&"auth.register.register_user#2"));

        let save = out
            .nodes
            .get(&NodeId::from("function:auth.register.Registrar.save"))
            .unwrap();
        assert_eq!(save.parent(), Some(&NodeId::from("class:auth.register.Registrar")));
        assert_eq!(save.owner(), Some("Registrar"));
        assert_eq!(save.lines(), Some(LineRange::new(9, 12)));

        let file = out.file().unwrap();
        assert_eq!(file.module.as_deref(), Some("auth.register"));
        assert_eq!(file.line_count, 20);
        assert_eq!(file.parse_status, ParseStatus::Success);
    }

    #[test]
    fn test_contains_tree_and_references() {
        let out = build_source("auth/register.py", Language::Python, AUTH);
        let contains: Vec<&str> = out.contains.iter().map(|e| e.id.as_str()).collect();
        assert!(contains.contains(
            &"contains:file:auth/register.py->class:auth.register.Registrar"
        ));
        assert!(contains.contains(
            &"contains:function:auth.register.Registrar.save->function:auth.register.Registrar.save.audit"
        ));
        assert_eq!(contains.len(), out.nodes.declarations().count());

        let refs = &out.file().unwrap().references;
        assert!(refs.iter().any(|r| matches!(r,
            Reference::Import(i) if i.module == "validators" && i.relative_level == 1)));
        assert!(refs.iter().any(|r| matches!(r,
            Reference::Inherit(i) if i.name == "BaseRegistrar")));
        assert!(refs.iter().any(|r| matches!(r,
            Reference::Call(c) if c.name == "save"
                && c.receiver.as_deref() == Some("self")
                && c.source.as_str() == "function:auth.register.Registrar.register")));
    }

    #[test]
    fn test_build_is_deterministic() {
        let a = build_source("auth/register.py", Language::Python, AUTH);
        let b = build_source("auth/register.py", Language::Python, AUTH);
        assert_eq!(a, b);
    }

    #[test]
    fn test_go_methods_and_receivers() {
        let src = "package server\n\nfunc init() {}\n\ntype Server struct{}\n\nfunc (s *Server) Start() {\n\ts.listen()\n}\n\nfunc (s *Server) listen() {}\n";
        let out = build_source("pkg/server/server.go", Language::Go, src);
        let names = qualified_names(&out);
        assert!(names.contains(&"pkg/server.init#server"));
        assert!(names.contains(&"pkg/server.Server"));
        assert!(names.contains(&"pkg/server.Server.Start"));

        let start = out
            .nodes
            .get(&NodeId::from("function:pkg/server.Server.Start"))
            .unwrap();
        assert_eq!(start.parent(), Some(&NodeId::file("pkg/server/server.go")));
        assert_eq!(start.owner(), Some("Server"));

        let refs = &out.file().unwrap().references;
        assert!(refs.iter().any(|r| matches!(r,
            Reference::Call(c) if c.name == "listen" && c.receiver.as_deref() == Some("self"))));
    }

    #[test]
    fn test_broken_file_keeps_valid_declarations() {
        let src = "def ok():\n    return 1\n\ndef broken(:\n    pass\n";
        let out = build_source("app/broken.py", Language::Python, src);
        let file = out.file().unwrap();
        assert_ne!(file.parse_status, ParseStatus::Success);
        assert!(file.error_count >= 1);
        assert!(out
            .nodes
            .get(&NodeId::from("function:app.broken.ok"))
            .is_some());
    }

    #[test]
    fn test_structural_hash_ignores_whitespace_layout() {
        let a = structural_hash(NodeKind::Function, "f", "def f():\n    return 1");
        let b = structural_hash(NodeKind::Function, "f", "def f():\n        return 1");
        let c = structural_hash(NodeKind::Function, "f", "def f():\n    return 2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
