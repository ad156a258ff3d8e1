//! Reference resolution: turns the references recorded on a file node into
//! `Imports`, `Calls`, `Tests`, `Inherits` and `ReadsWrites` edges.
//!
//! Resolution runs against a [`SymbolIndex`] built from the committed graph,
//! so a file's edges can be recomputed on their own whenever a declaration
//! they mention changes elsewhere. Targets that cannot be pinned down
//! statically get a guessed edge with confidence at most 0.6, or no edge and
//! an [`UnresolvedReference`] when there is nothing plausible to point at.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::errors::UnresolvedReference;
use crate::indexer::imports::{
    default_binding, import_kind, resolve_module, submodule, ModuleCatalog, ModuleTarget,
};
use crate::models::{
    AttributeRef, CallKind, CallRef, Confidence, Edge, EdgeId, EdgeKind, EdgeMetadata,
    EdgeSet, FileNode, ImportRef, InheritRef, Language, Node, NodeId, NodeKind, Reference,
    RESOLVED_CONFIDENCE,
};
use crate::store::GraphState;

/// Confidence of a unique name-only match.
pub const GUESS_CONFIDENCE: f64 = 0.6;
/// Confidence of an edge whose target is a module that is not indexed.
pub const EXTERNAL_CALL_CONFIDENCE: f64 = 0.4;
/// Lower bound for one of several ambiguous guesses.
pub const MIN_GUESS_CONFIDENCE: f64 = 0.1;
/// Most targets kept for an ambiguous reference.
pub const MAX_AMBIGUOUS_TARGETS: usize = 3;
const MAX_BASE_DEPTH: usize = 3;

const SELF_RECEIVERS: &[&str] = &["self", "this", "cls"];

// ---------------------------------------------------------------------------
// Symbol index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Symbol {
    kind: NodeKind,
    name: String,
    qualified_name: String,
    module: String,
    parent: NodeId,
    owner: Option<String>,
    bases: Vec<String>,
}

/// Declarations of the committed graph, indexed for name resolution.
#[derive(Debug, Default)]
pub struct SymbolIndex {
    symbols: HashMap<NodeId, Symbol>,
    /// Classes and functions by simple name, sorted by qualified name.
    by_name: HashMap<String, Vec<NodeId>>,
    /// Top-level classes and functions of each module.
    members: HashMap<(String, String), NodeId>,
    /// Class qualified name -> method name -> method.
    methods: HashMap<String, HashMap<String, NodeId>>,
    classes: HashMap<String, NodeId>,
    catalog: ModuleCatalog,
}

impl SymbolIndex {
    pub fn build(state: &GraphState) -> Self {
        let file_modules: HashMap<&str, &str> = state
            .files()
            .filter_map(|f| f.module.as_deref().map(|m| (f.path.as_str(), m)))
            .collect();
        let catalog = ModuleCatalog::new(
            state
                .files()
                .filter_map(|f| f.module.clone().map(|m| (m, f.language))),
        );

        let mut index = SymbolIndex {
            catalog,
            ..SymbolIndex::default()
        };
        for node in state.nodes() {
            let (Some(path), Some(parent)) = (node.file_path(), node.parent()) else {
                continue;
            };
            let module = file_modules.get(path).copied().unwrap_or_default();
            let bases = match node {
                Node::Class(c) => c.bases.clone(),
                _ => Vec::new(),
            };
            index.symbols.insert(
                node.id().clone(),
                Symbol {
                    kind: node.kind(),
                    name: node.name().to_string(),
                    qualified_name: node.qualified_name().to_string(),
                    module: module.to_string(),
                    parent: parent.clone(),
                    owner: node.owner().map(str::to_string),
                    bases,
                },
            );
        }

        // Second pass: parents are all known now.
        let mut ids: Vec<&NodeId> = index.symbols.keys().collect();
        ids.sort_by(|a, b| {
            index.symbols[*a]
                .qualified_name
                .cmp(&index.symbols[*b].qualified_name)
        });
        let mut by_name: HashMap<String, Vec<NodeId>> = HashMap::new();
        let mut members = HashMap::new();
        let mut methods: HashMap<String, HashMap<String, NodeId>> = HashMap::new();
        let mut classes = HashMap::new();
        for id in ids {
            let symbol = &index.symbols[id];
            let name = symbol.name.as_str();
            let top_level = symbol.parent.kind() == Some(NodeKind::File);
            match symbol.kind {
                NodeKind::Class => {
                    classes.insert(symbol.qualified_name.clone(), id.clone());
                    by_name.entry(name.to_string()).or_default().push(id.clone());
                    if top_level {
                        members
                            .entry((symbol.module.clone(), name.to_string()))
                            .or_insert_with(|| id.clone());
                    }
                }
                NodeKind::Function => {
                    by_name.entry(name.to_string()).or_default().push(id.clone());
                    match index.owning_class(symbol) {
                        Some(class) => {
                            methods
                                .entry(class)
                                .or_default()
                                .entry(name.to_string())
                                .or_insert_with(|| id.clone());
                        }
                        None if top_level => {
                            members
                                .entry((symbol.module.clone(), name.to_string()))
                                .or_insert_with(|| id.clone());
                        }
                        None => {}
                    }
                }
                _ => {}
            }
        }
        index.by_name = by_name;
        index.members = members;
        index.methods = methods;
        index.classes = classes;
        index
    }

    pub fn catalog(&self) -> &ModuleCatalog {
        &self.catalog
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Class a function is a method of: its parent class, or the receiver
    /// type for methods declared at file level.
    fn owning_class(&self, symbol: &Symbol) -> Option<String> {
        let owner = symbol.owner.as_ref()?;
        match symbol.parent.kind() {
            Some(NodeKind::Class) => self
                .symbols
                .get(&symbol.parent)
                .map(|p| p.qualified_name.clone()),
            Some(NodeKind::File) => Some(format!("{}.{owner}", symbol.module)),
            _ => None,
        }
    }

    /// Innermost class enclosing `id`, walking through nested functions.
    fn enclosing_class(&self, id: &NodeId) -> Option<String> {
        let mut current = id;
        for _ in 0..32 {
            let symbol = self.symbols.get(current)?;
            if symbol.kind == NodeKind::Class {
                return Some(symbol.qualified_name.clone());
            }
            if let Some(class) = self.owning_class(symbol) {
                return Some(class);
            }
            current = &symbol.parent;
        }
        None
    }

    fn member(&self, module: &str, name: &str) -> Option<&NodeId> {
        self.members.get(&(module.to_string(), name.to_string()))
    }

    fn member_class(&self, module: &str, name: &str) -> Option<&NodeId> {
        self.member(module, name)
            .filter(|id| id.kind() == Some(NodeKind::Class))
    }

    fn named(&self, name: &str, kind: Option<NodeKind>) -> Vec<NodeId> {
        self.by_name
            .get(name)
            .map(|ids| {
                ids.iter()
                    .filter(|id| kind.map_or(true, |k| id.kind() == Some(k)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn method_named(&self, name: &str) -> Vec<NodeId> {
        self.named(name, Some(NodeKind::Function))
            .into_iter()
            .filter(|id| {
                self.symbols
                    .get(id)
                    .is_some_and(|s| self.owning_class(s).is_some())
            })
            .collect()
    }

    /// Class a base-type name refers to from within `module`.
    fn base_class(&self, module: &str, raw: &str) -> Option<String> {
        let name = simple_name(raw);
        if let Some(id) = self.member_class(module, name) {
            return self.symbols.get(id).map(|s| s.qualified_name.clone());
        }
        let candidates = self.named(name, Some(NodeKind::Class));
        match candidates.as_slice() {
            [only] => self.symbols.get(only).map(|s| s.qualified_name.clone()),
            _ => None,
        }
    }

    /// Method `name` on `class` or, failing that, on its bases.
    fn find_method(&self, class: &str, name: &str, depth: usize) -> Option<NodeId> {
        if let Some(id) = self.methods.get(class).and_then(|m| m.get(name)) {
            return Some(id.clone());
        }
        if depth == 0 {
            return None;
        }
        let symbol = self.classes.get(class).and_then(|id| self.symbols.get(id))?;
        symbol
            .bases
            .iter()
            .filter_map(|base| self.base_class(&symbol.module, base))
            .filter(|base| base != class)
            .find_map(|base| self.find_method(&base, name, depth - 1))
    }
}

fn simple_name(qualified: &str) -> &str {
    qualified.rsplit('.').next().unwrap_or(qualified)
}

fn is_capitalized(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_uppercase)
}

// ---------------------------------------------------------------------------
// Per-file bindings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    Module(ModuleTarget),
    Symbol { module: ModuleTarget, name: String },
}

#[derive(Debug, Default)]
struct Bindings {
    names: HashMap<String, Binding>,
    wildcards: Vec<ModuleTarget>,
}

impl Bindings {
    /// Longest bound prefix of a dotted receiver, with the remainder.
    fn lookup<'r>(&self, receiver: &'r str) -> Option<(&Binding, Option<&'r str>)> {
        if let Some(binding) = self.names.get(receiver) {
            return Some((binding, None));
        }
        let mut end = receiver.len();
        while let Some(dot) = receiver[..end].rfind('.') {
            if let Some(binding) = self.names.get(&receiver[..dot]) {
                return Some((binding, Some(&receiver[dot + 1..])));
            }
            end = dot;
        }
        None
    }
}

/// Module targets of one import: the module itself plus any submodules
/// named by a `from pkg import mod` form.
fn import_targets(
    file: &FileNode,
    module: &str,
    import: &ImportRef,
    catalog: &ModuleCatalog,
) -> Vec<(ModuleTarget, Vec<String>)> {
    let base = resolve_module(file.language, &file.path, module, import, catalog);
    let mut targets: Vec<(ModuleTarget, Vec<String>)> = Vec::new();
    let mut base_names = Vec::new();
    for imported in &import.names {
        match submodule(file.language, &base, &imported.name, catalog) {
            Some(sub) => targets.push((ModuleTarget::Internal(sub), Vec::new())),
            None => base_names.push(imported.name.clone()),
        }
    }
    if import.names.is_empty() || !base_names.is_empty() || import.wildcard {
        targets.insert(0, (base, base_names));
    }
    targets
}

/// Modules a file's imports point at. Every one of them must exist as a
/// module node before the file's edges are written.
pub fn required_modules(file: &FileNode, catalog: &ModuleCatalog) -> Vec<ModuleTarget> {
    let module = file.module.as_deref().unwrap_or_default();
    let mut out = Vec::new();
    for reference in &file.references {
        if let Reference::Import(import) = reference {
            for (target, _) in import_targets(file, module, import, catalog) {
                if !out.contains(&target) {
                    out.push(target);
                }
            }
        }
    }
    out
}

fn bind_imports(file: &FileNode, module: &str, catalog: &ModuleCatalog) -> Bindings {
    let mut bindings = Bindings::default();
    for reference in &file.references {
        let Reference::Import(import) = reference else {
            continue;
        };
        let base = resolve_module(file.language, &file.path, module, import, catalog);
        if import.wildcard {
            bindings.wildcards.push(base.clone());
        }
        if import.names.is_empty() {
            if !import.wildcard || import.alias.is_some() {
                let local = import
                    .alias
                    .clone()
                    .unwrap_or_else(|| default_binding(file.language, import));
                bindings.names.insert(local, Binding::Module(base.clone()));
            }
            continue;
        }
        if let Some(alias) = &import.alias {
            bindings
                .names
                .insert(alias.clone(), Binding::Module(base.clone()));
        }
        for imported in &import.names {
            let local = imported.local_name().to_string();
            let binding = match submodule(file.language, &base, &imported.name, catalog) {
                Some(sub) => Binding::Module(ModuleTarget::Internal(sub)),
                None => Binding::Symbol {
                    module: base.clone(),
                    // Default exports are looked up under the local name.
                    name: if imported.name == "default" {
                        local.clone()
                    } else {
                        imported.name.clone()
                    },
                },
            };
            bindings.names.insert(local, binding);
        }
    }
    bindings
}

// ---------------------------------------------------------------------------
// Edge accumulation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Target {
    id: NodeId,
    confidence: f64,
    resolved: bool,
    call_kind: CallKind,
}

impl Target {
    fn resolved(id: NodeId, call_kind: CallKind) -> Self {
        Self {
            id,
            confidence: RESOLVED_CONFIDENCE,
            resolved: true,
            call_kind,
        }
    }

    fn external(module: &ModuleTarget) -> Self {
        Self {
            id: NodeId::module(module.qualified_name()),
            confidence: EXTERNAL_CALL_CONFIDENCE,
            resolved: false,
            call_kind: CallKind::External,
        }
    }
}

fn guesses(ids: Vec<NodeId>, call_kind: CallKind) -> Vec<Target> {
    let count = ids.len();
    if count == 0 {
        return Vec::new();
    }
    let confidence = if count == 1 {
        GUESS_CONFIDENCE
    } else {
        (GUESS_CONFIDENCE / count as f64).max(MIN_GUESS_CONFIDENCE)
    };
    ids.into_iter()
        .take(MAX_AMBIGUOUS_TARGETS)
        .map(|id| Target {
            id,
            confidence,
            resolved: false,
            call_kind,
        })
        .collect()
}

fn merge_lines(into: &mut Vec<u32>, from: &[u32]) {
    into.extend_from_slice(from);
    into.sort_unstable();
    into.dedup();
}

fn merge_metadata(into: &mut EdgeMetadata, from: &EdgeMetadata) {
    match (into, from) {
        (EdgeMetadata::Calls { lines, .. }, EdgeMetadata::Calls { lines: more, .. })
        | (EdgeMetadata::Tests { lines }, EdgeMetadata::Tests { lines: more }) => {
            merge_lines(lines, more)
        }
        (
            EdgeMetadata::ReadsWrites {
                attributes,
                access,
                lines,
            },
            EdgeMetadata::ReadsWrites {
                attributes: more_attrs,
                access: more_access,
                lines: more_lines,
            },
        ) => {
            for attr in more_attrs {
                if !attributes.contains(attr) {
                    attributes.push(attr.clone());
                }
            }
            attributes.sort();
            *access = access.merge(*more_access);
            merge_lines(lines, more_lines);
        }
        (EdgeMetadata::Imports { names, .. }, EdgeMetadata::Imports { names: more, .. }) => {
            for name in more {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        _ => {}
    }
}

/// One edge per `(kind, source, target)`; repeats merge into it.
#[derive(Debug, Default)]
struct EdgeAccumulator {
    edges: IndexMap<EdgeId, Edge>,
}

impl EdgeAccumulator {
    fn add(&mut self, edge: Edge) {
        match self.edges.get_mut(&edge.id) {
            Some(existing) => {
                if edge.confidence.value() > existing.confidence.value() {
                    existing.confidence = edge.confidence;
                }
                existing.is_resolved |= edge.is_resolved;
                merge_metadata(&mut existing.metadata, &edge.metadata);
            }
            None => {
                self.edges.insert(edge.id.clone(), edge);
            }
        }
    }

    fn into_edges(self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self.edges.into_values().collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

struct Resolver<'a> {
    file: &'a FileNode,
    module: &'a str,
    index: &'a SymbolIndex,
    bindings: Bindings,
    edges: EdgeAccumulator,
    unresolved: Vec<UnresolvedReference>,
}

impl Resolver<'_> {
    fn miss(&mut self, line: u32, name: &str, reason: &'static str) {
        self.unresolved.push(UnresolvedReference {
            path: self.file.path.clone(),
            line,
            name: name.to_string(),
            reason,
        });
    }

    fn imports(&mut self) {
        for reference in &self.file.references {
            let Reference::Import(import) = reference else {
                continue;
            };
            let kind = import_kind(self.file.language, import);
            for (target, names) in import_targets(self.file, self.module, import, self.index.catalog()) {
                let internal = target.is_internal();
                self.edges.add(Edge::new(
                    EdgeKind::Imports,
                    self.file.id.clone(),
                    NodeId::module(target.qualified_name()),
                    Confidence::new(if internal {
                        RESOLVED_CONFIDENCE
                    } else {
                        GUESS_CONFIDENCE
                    }),
                    internal,
                    EdgeMetadata::Imports {
                        names,
                        import_kind: kind,
                        external: !internal,
                    },
                ));
            }
        }
    }

    /// Class named by a capitalized receiver or base, via imports first.
    fn class_named(&self, name: &str) -> Option<(NodeId, bool)> {
        if let Some((binding, rest)) = self.bindings.lookup(name) {
            let found = match (binding, rest) {
                (Binding::Symbol { module, name }, None) if module.is_internal() => {
                    self.index.member_class(module.qualified_name(), name)
                }
                (Binding::Module(module), Some(rest)) if module.is_internal() => self
                    .index
                    .member_class(module.qualified_name(), simple_name(rest)),
                _ => None,
            };
            return found.map(|id| (id.clone(), true));
        }
        if let Some(id) = self.index.member_class(self.module, name) {
            return Some((id.clone(), true));
        }
        for module in &self.bindings.wildcards {
            if let Some(id) = module
                .is_internal()
                .then(|| self.index.member_class(module.qualified_name(), name))
                .flatten()
            {
                return Some((id.clone(), true));
            }
        }
        match self.index.named(name, Some(NodeKind::Class)).as_slice() {
            [only] => Some((only.clone(), false)),
            _ => None,
        }
    }

    fn class_qname(&self, id: &NodeId) -> Option<String> {
        self.index.symbols.get(id).map(|s| s.qualified_name.clone())
    }

    fn resolve_plain_call(&self, call: &CallRef) -> Vec<Target> {
        let name = call.name.as_str();
        if let Some(scope) = self.index.symbols.get(&call.source) {
            let nested = NodeId::declaration(
                NodeKind::Function,
                &format!("{}.{name}", scope.qualified_name),
            );
            if self.index.symbols.contains_key(&nested) {
                return vec![Target::resolved(nested, CallKind::Direct)];
            }
        }
        if let Some(id) = self.index.member(self.module, name) {
            return vec![Target::resolved(id.clone(), CallKind::Direct)];
        }
        if self.file.language == Language::Java {
            if let Some(method) = self
                .index
                .enclosing_class(&call.source)
                .and_then(|class| self.index.find_method(&class, name, MAX_BASE_DEPTH))
            {
                return vec![Target::resolved(method, CallKind::Method)];
            }
        }
        if let Some(binding) = self.bindings.names.get(name) {
            match binding {
                Binding::Symbol { module, name } if module.is_internal() => {
                    if let Some(id) = self.index.member(module.qualified_name(), name) {
                        return vec![Target::resolved(id.clone(), CallKind::Direct)];
                    }
                }
                Binding::Symbol { module, .. } => return vec![Target::external(module)],
                Binding::Module(module) if !module.is_internal() => {
                    return vec![Target::external(module)]
                }
                Binding::Module(_) => {}
            }
        }
        for module in &self.bindings.wildcards {
            if !module.is_internal() {
                continue;
            }
            if let Some(id) = self.index.member(module.qualified_name(), name) {
                return vec![Target::resolved(id.clone(), CallKind::Direct)];
            }
        }
        guesses(self.index.named(name, None), CallKind::Direct)
    }

    fn resolve_self_call(&self, call: &CallRef) -> Vec<Target> {
        let method = self
            .index
            .enclosing_class(&call.source)
            .and_then(|class| self.index.find_method(&class, &call.name, MAX_BASE_DEPTH));
        match method {
            Some(id) => vec![Target::resolved(id, CallKind::Method)],
            None => guesses(self.index.method_named(&call.name), CallKind::Method),
        }
    }

    fn resolve_receiver_call(&self, call: &CallRef, receiver: &str) -> Vec<Target> {
        if let Some((binding, rest)) = self.bindings.lookup(receiver) {
            match (binding, rest) {
                (Binding::Module(module), _) if !module.is_internal() => {
                    return vec![Target::external(module)];
                }
                (Binding::Symbol { module, .. }, _) if !module.is_internal() => {
                    return vec![Target::external(module)];
                }
                (Binding::Module(module), rest) => {
                    let mut target_module = module.qualified_name().to_string();
                    let mut class = None;
                    if let Some(rest) = rest {
                        let nested = format!("{target_module}.{rest}");
                        if self.index.catalog().contains(&nested) {
                            target_module = nested;
                        } else {
                            class = self.index.member_class(&target_module, simple_name(rest));
                        }
                    }
                    let found = match class {
                        Some(class) => self
                            .class_qname(class)
                            .and_then(|q| self.index.find_method(&q, &call.name, MAX_BASE_DEPTH))
                            .map(|id| Target::resolved(id, CallKind::Method)),
                        None => self
                            .index
                            .member(&target_module, &call.name)
                            .map(|id| Target::resolved(id.clone(), CallKind::Direct)),
                    };
                    if let Some(found) = found {
                        return vec![found];
                    }
                }
                (Binding::Symbol { module, name }, None) => {
                    let method = self
                        .index
                        .member_class(module.qualified_name(), name)
                        .and_then(|class| self.class_qname(class))
                        .and_then(|q| self.index.find_method(&q, &call.name, MAX_BASE_DEPTH));
                    if let Some(method) = method {
                        return vec![Target::resolved(method, CallKind::Method)];
                    }
                }
                (Binding::Symbol { .. }, Some(_)) => {}
            }
        } else if is_capitalized(receiver) && !receiver.contains('.') {
            if let Some((class, certain)) = self.class_named(receiver) {
                let method = self
                    .class_qname(&class)
                    .and_then(|q| self.index.find_method(&q, &call.name, MAX_BASE_DEPTH));
                if let Some(method) = method {
                    let mut target = Target::resolved(method, CallKind::Method);
                    if !certain {
                        target.confidence = GUESS_CONFIDENCE;
                        target.resolved = false;
                    }
                    return vec![target];
                }
            }
        }
        let methods = self.index.method_named(&call.name);
        if methods.is_empty() {
            guesses(self.index.named(&call.name, Some(NodeKind::Function)), CallKind::Method)
        } else {
            guesses(methods, CallKind::Method)
        }
    }

    fn call(&mut self, call: &CallRef) {
        let targets = match call.receiver.as_deref() {
            None => self.resolve_plain_call(call),
            Some(r) if SELF_RECEIVERS.contains(&r) => self.resolve_self_call(call),
            Some(r) => self.resolve_receiver_call(call, r),
        };
        if targets.is_empty() {
            self.miss(call.line, &call.name, "no declaration with this name");
            return;
        }
        let from_test = call.source.kind() == Some(NodeKind::Test);
        for target in targets {
            if from_test {
                if target.id.kind() == Some(NodeKind::Module) {
                    continue;
                }
                self.edges.add(Edge::new(
                    EdgeKind::Tests,
                    call.source.clone(),
                    target.id,
                    Confidence::new(target.confidence),
                    target.resolved,
                    EdgeMetadata::Tests {
                        lines: vec![call.line],
                    },
                ));
            } else {
                let recursive = target.id == call.source;
                self.edges.add(Edge::new(
                    EdgeKind::Calls,
                    call.source.clone(),
                    target.id,
                    Confidence::new(target.confidence),
                    target.resolved,
                    EdgeMetadata::Calls {
                        lines: vec![call.line],
                        call_kind: target.call_kind,
                        recursive,
                    },
                ));
            }
        }
    }

    fn inherit(&mut self, inherit: &InheritRef) {
        let lookup = match &inherit.qualifier {
            Some(qualifier) => self
                .class_named(&format!("{qualifier}.{}", inherit.name))
                .or_else(|| self.class_named(&inherit.name)),
            None => self.class_named(&inherit.name),
        };
        let external = inherit
            .qualifier
            .as_deref()
            .unwrap_or(&inherit.name)
            .split('.')
            .next()
            .and_then(|head| self.bindings.lookup(head))
            .is_some_and(|(binding, _)| match binding {
                Binding::Module(m) | Binding::Symbol { module: m, .. } => !m.is_internal(),
            });
        match lookup {
            Some((target, _)) if target == inherit.source => {}
            Some((target, certain)) if !external || certain => {
                self.edges.add(Edge::new(
                    EdgeKind::Inherits,
                    inherit.source.clone(),
                    target,
                    Confidence::new(if certain {
                        RESOLVED_CONFIDENCE
                    } else {
                        GUESS_CONFIDENCE
                    }),
                    certain,
                    EdgeMetadata::Inherits {
                        relation: inherit.relation,
                    },
                ));
            }
            _ if external => self.miss(inherit.line, &inherit.name, "base type is external"),
            _ => self.miss(inherit.line, &inherit.name, "base type not found"),
        }
    }

    fn attribute(&mut self, attribute: &AttributeRef) {
        let target = if SELF_RECEIVERS.contains(&attribute.receiver.as_str()) {
            self.index
                .enclosing_class(&attribute.source)
                .and_then(|q| self.index.classes.get(&q).cloned())
                .map(|id| (id, true))
        } else if is_capitalized(&attribute.receiver) {
            self.class_named(&attribute.receiver)
        } else {
            None
        };
        let Some((class, certain)) = target else {
            return;
        };
        self.edges.add(Edge::new(
            EdgeKind::ReadsWrites,
            attribute.source.clone(),
            class,
            Confidence::new(if certain {
                RESOLVED_CONFIDENCE
            } else {
                GUESS_CONFIDENCE
            }),
            certain,
            EdgeMetadata::ReadsWrites {
                attributes: vec![attribute.attribute.clone()],
                access: attribute.access,
                lines: vec![attribute.line],
            },
        ));
    }
}

/// Resolve every reference recorded on `file` against `index`.
///
/// Also emits the `Module -> File` containment edge for the module the file
/// declares. Callers must make sure every module in
/// [`required_modules`] exists before committing the result.
pub fn extract(file: &FileNode, index: &SymbolIndex) -> EdgeSet {
    let module = file.module.as_deref().unwrap_or_default();
    let mut resolver = Resolver {
        file,
        module,
        index,
        bindings: bind_imports(file, module, index.catalog()),
        edges: EdgeAccumulator::default(),
        unresolved: Vec::new(),
    };
    if !module.is_empty() {
        resolver
            .edges
            .add(Edge::contains(NodeId::module(module), file.id.clone()));
    }
    resolver.imports();
    for reference in &file.references {
        match reference {
            Reference::Import(_) => {}
            Reference::Call(call) => resolver.call(call),
            Reference::Inherit(inherit) => resolver.inherit(inherit),
            Reference::Attribute(attribute) => resolver.attribute(attribute),
        }
    }
    debug_assert!(resolver
        .edges
        .edges
        .values()
        .all(|e| e.is_resolved || e.confidence.value() <= crate::models::UNRESOLVED_CONFIDENCE_MAX));
    EdgeSet {
        edges: resolver.edges.into_edges(),
        unresolved: resolver.unresolved,
    }
}

/// Edges whose existence is decided by the references of the file at `path`:
/// everything sourced in the file except containment, plus the
/// `Module -> File` edge.
pub fn owned_edges<'a>(state: &'a GraphState, path: &str) -> Vec<&'a Edge> {
    let file_id = NodeId::file(path);
    let mut edges: Vec<&Edge> = Vec::new();
    for node in state.nodes_in_file(path) {
        edges.extend(state.outgoing(node.id()).filter(|e| e.kind != EdgeKind::Contains));
    }
    edges.extend(state.incoming(&file_id).filter(|e| {
        e.kind == EdgeKind::Contains && e.source.kind() == Some(NodeKind::Module)
    }));
    edges
}

/// Containment edges produced by the builder for the file at `path`.
pub fn structural_edges<'a>(state: &'a GraphState, path: &str) -> Vec<&'a Edge> {
    let mut edges: Vec<&Edge> = Vec::new();
    for node in state.nodes_in_file(path) {
        edges.extend(state.outgoing(node.id()).filter(|e| e.kind == EdgeKind::Contains));
    }
    edges
}
