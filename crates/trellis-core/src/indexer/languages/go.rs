use tree_sitter::Node;

use super::{
    field_text, header_text, is_field_of_parent, leading_comment, split_type_name, text, unquote,
    BaseRef, Construct, DeclKind, Declaration, LanguageParser, WalkContext,
};
use crate::models::{AccessKind, ImportRef, InheritKind, Language};

const TEST_PREFIXES: &[&str] = &["Test", "Benchmark", "Fuzz", "Example"];

pub struct GoParser;

impl LanguageParser for GoParser {
    fn language(&self) -> Language {
        Language::Go
    }

    /// Go packages are directories; files at the repository root fall back to
    /// their declared package name.
    fn module_name(&self, path: &str, package: Option<&str>) -> String {
        match path.rsplit_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => package.unwrap_or("main").to_string(),
        }
    }

    fn package_name(&self, root: Node<'_>, source: &[u8]) -> Option<String> {
        let mut cursor = root.walk();
        let clause = root
            .named_children(&mut cursor)
            .find(|c| c.kind() == "package_clause")?;
        let mut inner = clause.walk();
        let name = clause
            .named_children(&mut inner)
            .find(|c| c.kind() == "package_identifier")
            .map(|c| text(c, source).to_string());
        name
    }

    fn classify<'t>(&self, node: Node<'t>, ctx: &WalkContext<'_>) -> Option<Construct<'t>> {
        match node.kind() {
            "function_declaration" => function(node, ctx),
            "method_declaration" => method(node, ctx),
            "method_elem" | "method_spec" => {
                let name = field_text(node, "name", ctx.source)?;
                let mut decl = Declaration::new(DeclKind::Function, name, node);
                fill_signature(&mut decl, node, ctx.source);
                Some(Construct::Declaration(Box::new(decl)))
            }
            "type_spec" => type_spec(node, ctx),
            "import_declaration" => Some(Construct::Imports(imports(node, ctx.source))),
            "call_expression" => call(node, ctx.source),
            "selector_expression" => attribute(node, ctx.source),
            _ => None,
        }
    }
}

fn is_test_file(path: &str) -> bool {
    path.ends_with("_test.go")
}

fn parameter_names(params: Node<'_>, source: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut cursor = params.walk();
    for param in params.named_children(&mut cursor) {
        let mut inner = param.walk();
        let before = names.len();
        for name in param.children_by_field_name("name", &mut inner) {
            names.push(text(name, source).to_string());
        }
        if names.len() == before {
            if let Some(ty) = param.child_by_field_name("type") {
                names.push(text(ty, source).to_string());
            }
        }
    }
    names
}

fn fill_signature(decl: &mut Declaration<'_>, node: Node<'_>, source: &[u8]) {
    if let Some(params) = node.child_by_field_name("parameters") {
        decl.parameters = parameter_names(params, source);
    }
    decl.return_type = field_text(node, "result", source);
    decl.docstring = leading_comment(node, source);
    decl.signature = header_text(node, source);
}

fn function<'t>(node: Node<'t>, ctx: &WalkContext<'_>) -> Option<Construct<'t>> {
    let name = field_text(node, "name", ctx.source)?;
    let is_test =
        is_test_file(ctx.path) && TEST_PREFIXES.iter().any(|prefix| name.starts_with(prefix));
    let kind = if is_test {
        DeclKind::Test { framework: "go" }
    } else {
        DeclKind::Function
    };
    let mut decl = Declaration::new(kind, name, node);
    fill_signature(&mut decl, node, ctx.source);
    Some(Construct::Declaration(Box::new(decl)))
}

/// `*Server`, `Server[T]` -> `Server`.
fn receiver_type(raw: &str) -> String {
    let base = raw.split('[').next().unwrap_or(raw);
    split_type_name(base).1
}

fn method<'t>(node: Node<'t>, ctx: &WalkContext<'_>) -> Option<Construct<'t>> {
    let name = field_text(node, "name", ctx.source)?;
    let mut decl = Declaration::new(DeclKind::Function, name, node);
    if let Some(receiver) = node
        .child_by_field_name("receiver")
        .and_then(|list| list.named_child(0))
    {
        decl.receiver_var = field_text(receiver, "name", ctx.source);
        decl.owner = receiver
            .child_by_field_name("type")
            .map(|t| receiver_type(text(t, ctx.source)))
            .filter(|t| !t.is_empty());
    }
    fill_signature(&mut decl, node, ctx.source);
    Some(Construct::Declaration(Box::new(decl)))
}

fn embedded_bases(body: Node<'_>, source: &[u8], bases: &mut Vec<BaseRef>) {
    let mut stack = vec![body];
    while let Some(node) = stack.pop() {
        match node.kind() {
            "field_declaration" if node.child_by_field_name("name").is_none() => {
                if let Some(ty) = node.child_by_field_name("type") {
                    push_base(text(ty, source), bases);
                }
            }
            "type_elem" | "interface_type_name" => push_base(text(node, source), bases),
            "struct_type" | "interface_type" | "field_declaration_list" => {
                let mut cursor = node.walk();
                let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
                stack.extend(children.into_iter().rev());
            }
            _ => {}
        }
    }
}

fn push_base(raw: &str, bases: &mut Vec<BaseRef>) {
    let raw = raw.split('[').next().unwrap_or(raw);
    let (qualifier, name) = split_type_name(raw);
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return;
    }
    bases.push(BaseRef {
        name,
        qualifier,
        relation: InheritKind::Embeds,
    });
}

fn type_spec<'t>(node: Node<'t>, ctx: &WalkContext<'_>) -> Option<Construct<'t>> {
    let body = node.child_by_field_name("type")?;
    let interface = match body.kind() {
        "struct_type" => false,
        "interface_type" => true,
        _ => return None,
    };
    let name = field_text(node, "name", ctx.source)?;
    let mut decl = Declaration::new(DeclKind::Class { interface }, name, node);
    embedded_bases(body, ctx.source, &mut decl.bases);
    let anchor = match node.parent() {
        Some(p) if p.kind() == "type_declaration" && p.named_child_count() == 1 => p,
        _ => node,
    };
    decl.docstring = leading_comment(anchor, ctx.source);
    let header = text(node, ctx.source);
    decl.signature = format!(
        "type {}",
        header.split('{').next().unwrap_or(header).trim()
    );
    Some(Construct::Declaration(Box::new(decl)))
}

fn imports(node: Node<'_>, source: &[u8]) -> Vec<ImportRef> {
    let mut refs = Vec::new();
    let mut stack = vec![node];
    while let Some(current) = stack.pop() {
        match current.kind() {
            "import_spec" => {
                let Some(path) = current.child_by_field_name("path") else {
                    continue;
                };
                let module = unquote(text(path, source));
                let local = field_text(current, "name", source);
                let wildcard = local.as_deref() == Some(".");
                refs.push(ImportRef {
                    line: super::line_of(current),
                    module,
                    names: Vec::new(),
                    alias: local.filter(|l| l != "." && l != "_"),
                    relative_level: 0,
                    wildcard,
                });
            }
            _ => {
                let mut cursor = current.walk();
                let children: Vec<Node<'_>> = current.named_children(&mut cursor).collect();
                stack.extend(children.into_iter().rev());
            }
        }
    }
    refs
}

fn simple_receiver(node: Node<'_>, source: &[u8]) -> String {
    let raw = text(node, source);
    let simple = matches!(node.kind(), "identifier" | "selector_expression")
        && raw.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.');
    if simple {
        raw.to_string()
    } else {
        "<expr>".to_string()
    }
}

fn call<'t>(node: Node<'t>, source: &[u8]) -> Option<Construct<'t>> {
    let function = node.child_by_field_name("function")?;
    match function.kind() {
        "identifier" => Some(Construct::Call {
            name: text(function, source).to_string(),
            receiver: None,
        }),
        "selector_expression" => Some(Construct::Call {
            name: field_text(function, "field", source)?,
            receiver: function
                .child_by_field_name("operand")
                .map(|o| simple_receiver(o, source)),
        }),
        _ => None,
    }
}

fn access(node: Node<'_>, source: &[u8]) -> AccessKind {
    let Some(parent) = node.parent() else {
        return AccessKind::Read;
    };
    match parent.kind() {
        "inc_statement" | "dec_statement" => AccessKind::ReadWrite,
        "expression_list" if is_field_of_parent(parent, "left") => {
            let operator = parent
                .parent()
                .and_then(|stmt| stmt.child_by_field_name("operator"))
                .map(|op| text(op, source))
                .unwrap_or("=");
            if matches!(operator, "=" | ":=") {
                AccessKind::Write
            } else {
                AccessKind::ReadWrite
            }
        }
        _ => AccessKind::Read,
    }
}

fn attribute<'t>(node: Node<'t>, source: &[u8]) -> Option<Construct<'t>> {
    if node.parent()?.kind() == "call_expression" && is_field_of_parent(node, "function") {
        return None;
    }
    let operand = node.child_by_field_name("operand")?;
    if operand.kind() != "identifier" {
        return None;
    }
    Some(Construct::Attribute {
        receiver: text(operand, source).to_string(),
        attribute: field_text(node, "field", source)?,
        access: access(node, source),
    })
}
