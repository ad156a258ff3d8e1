use tree_sitter::Node;

use super::{
    access_of, field_text, header_text, is_field_of_parent, leading_comment, line_of,
    split_type_name, text, unquote, BaseRef, Construct, DeclKind, Declaration, LanguageParser,
    WalkContext,
};
use crate::models::{ImportRef, ImportedName, InheritKind, Language};

const TEST_CALLEES: &[&str] = &["it", "test"];

pub struct TypeScriptParser;

impl LanguageParser for TypeScriptParser {
    fn language(&self) -> Language {
        Language::TypeScript
    }

    fn module_name(&self, path: &str, _package: Option<&str>) -> String {
        for ext in [".d.ts", ".tsx", ".ts"] {
            if let Some(stem) = path.strip_suffix(ext) {
                return stem.to_string();
            }
        }
        path.to_string()
    }

    fn classify<'t>(&self, node: Node<'t>, ctx: &WalkContext<'_>) -> Option<Construct<'t>> {
        match node.kind() {
            "function_declaration" | "generator_function_declaration" => {
                let name = field_text(node, "name", ctx.source)?;
                Some(function(node, name, node, ctx))
            }
            "method_definition" | "method_signature" | "abstract_method_signature" => {
                let name = field_text(node, "name", ctx.source)?;
                Some(function(node, name, node, ctx))
            }
            "variable_declarator" => {
                let value = node.child_by_field_name("value")?;
                if !matches!(value.kind(), "arrow_function" | "function_expression" | "function") {
                    return None;
                }
                let name = field_text(node, "name", ctx.source)?;
                Some(function(node, name, value, ctx))
            }
            "class_declaration" | "abstract_class_declaration" | "class" => class(node, ctx),
            "interface_declaration" => interface(node, ctx),
            "import_statement" => import(node, ctx.source).map(|r| Construct::Imports(vec![r])),
            "call_expression" => call(node, ctx),
            "new_expression" => {
                let constructor = node.child_by_field_name("constructor")?;
                callee(constructor, ctx.source)
            }
            "member_expression" => attribute(node, ctx.source),
            _ => None,
        }
    }
}

fn function<'t>(
    node: Node<'t>,
    name: String,
    function_node: Node<'t>,
    ctx: &WalkContext<'_>,
) -> Construct<'t> {
    let mut decl = Declaration::new(DeclKind::Function, name, node);
    let mut cursor = function_node.walk();
    decl.is_async = function_node
        .children(&mut cursor)
        .any(|c| c.kind() == "async");
    let params = function_node
        .child_by_field_name("parameters")
        .or_else(|| function_node.child_by_field_name("parameter"));
    if let Some(params) = params {
        if params.kind() == "identifier" {
            decl.parameters.push(text(params, ctx.source).to_string());
        } else {
            let mut cursor = params.walk();
            decl.parameters = params
                .named_children(&mut cursor)
                .filter_map(|p| {
                    let pattern = p.child_by_field_name("pattern").unwrap_or(p);
                    let name = text(pattern, ctx.source);
                    (pattern.kind() != "this" && !name.is_empty()).then(|| name.to_string())
                })
                .collect();
        }
    }
    decl.return_type = function_node
        .child_by_field_name("return_type")
        .map(|t| text(t, ctx.source).trim_start_matches(':').trim().to_string())
        .filter(|t| !t.is_empty());
    let comment_anchor = match node.parent() {
        Some(p) if p.kind() == "export_statement" => p,
        _ if node.kind() == "variable_declarator" => node.parent().unwrap_or(node),
        _ => node,
    };
    decl.docstring = leading_comment(comment_anchor, ctx.source);
    decl.signature = header_text(function_node, ctx.source);
    if function_node.id() != node.id() {
        decl.signature = format!("{} = {}", decl.name, decl.signature);
    }
    Construct::Declaration(Box::new(decl))
}

fn heritage_bases(node: Node<'_>, source: &[u8], bases: &mut Vec<BaseRef>) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        let relation = match child.kind() {
            "class_heritage" => {
                heritage_bases(child, source, bases);
                continue;
            }
            "extends_clause" | "extends_type_clause" => InheritKind::Extends,
            "implements_clause" => InheritKind::Implements,
            _ => continue,
        };
        let mut inner = child.walk();
        for ty in child.named_children(&mut inner) {
            if matches!(ty.kind(), "type_arguments" | "arguments") {
                continue;
            }
            let (qualifier, name) = split_type_name(text(ty, source));
            if !name.is_empty() {
                bases.push(BaseRef {
                    name,
                    qualifier,
                    relation,
                });
            }
        }
    }
}

fn class<'t>(node: Node<'t>, ctx: &WalkContext<'_>) -> Option<Construct<'t>> {
    let name = field_text(node, "name", ctx.source)?;
    let mut decl = Declaration::new(DeclKind::Class { interface: false }, name, node);
    heritage_bases(node, ctx.source, &mut decl.bases);
    let anchor = match node.parent() {
        Some(p) if p.kind() == "export_statement" => p,
        _ => node,
    };
    decl.docstring = leading_comment(anchor, ctx.source);
    decl.signature = header_text(node, ctx.source);
    Some(Construct::Declaration(Box::new(decl)))
}

fn interface<'t>(node: Node<'t>, ctx: &WalkContext<'_>) -> Option<Construct<'t>> {
    let name = field_text(node, "name", ctx.source)?;
    let mut decl = Declaration::new(DeclKind::Class { interface: true }, name, node);
    heritage_bases(node, ctx.source, &mut decl.bases);
    decl.docstring = leading_comment(node, ctx.source);
    decl.signature = header_text(node, ctx.source);
    Some(Construct::Declaration(Box::new(decl)))
}

fn import(node: Node<'_>, source: &[u8]) -> Option<ImportRef> {
    let module = unquote(text(node.child_by_field_name("source")?, source));
    let mut import = ImportRef {
        line: line_of(node),
        relative_level: u32::from(module.starts_with('.')),
        module,
        names: Vec::new(),
        alias: None,
        wildcard: false,
    };
    let mut cursor = node.walk();
    let clause = node
        .children(&mut cursor)
        .find(|c| c.kind() == "import_clause");
    let Some(clause) = clause else {
        return Some(import);
    };
    let mut cursor = clause.walk();
    for part in clause.children(&mut cursor) {
        match part.kind() {
            "identifier" => import.names.push(ImportedName {
                name: "default".to_string(),
                alias: Some(text(part, source).to_string()),
            }),
            "namespace_import" => {
                let mut inner = part.walk();
                import.alias = part
                    .named_children(&mut inner)
                    .find(|c| c.kind() == "identifier")
                    .map(|c| text(c, source).to_string());
            }
            "named_imports" => {
                let mut inner = part.walk();
                for spec in part.named_children(&mut inner) {
                    if spec.kind() != "import_specifier" {
                        continue;
                    }
                    if let Some(name) = field_text(spec, "name", source) {
                        import.names.push(ImportedName {
                            name,
                            alias: field_text(spec, "alias", source),
                        });
                    }
                }
            }
            _ => {}
        }
    }
    Some(import)
}

fn simple_receiver(node: Node<'_>, source: &[u8]) -> String {
    let raw = text(node, source);
    let simple = matches!(node.kind(), "identifier" | "this" | "member_expression")
        && raw
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '$');
    if simple {
        raw.to_string()
    } else {
        "<expr>".to_string()
    }
}

fn callee<'t>(function: Node<'_>, source: &[u8]) -> Option<Construct<'t>> {
    match function.kind() {
        "identifier" => Some(Construct::Call {
            name: text(function, source).to_string(),
            receiver: None,
        }),
        "member_expression" => {
            let name = field_text(function, "property", source)?;
            let receiver = function
                .child_by_field_name("object")
                .map(|o| simple_receiver(o, source));
            Some(Construct::Call { name, receiver })
        }
        _ => None,
    }
}

fn call<'t>(node: Node<'t>, ctx: &WalkContext<'_>) -> Option<Construct<'t>> {
    let function = node.child_by_field_name("function")?;
    if function.kind() == "identifier" && TEST_CALLEES.contains(&text(function, ctx.source)) {
        if let Some(title) = node
            .child_by_field_name("arguments")
            .and_then(|args| args.named_child(0))
            .filter(|first| matches!(first.kind(), "string" | "template_string"))
        {
            let name = unquote(text(title, ctx.source));
            let mut decl = Declaration::new(DeclKind::Test { framework: "jest" }, name, node);
            decl.signature = format!("{}({})", text(function, ctx.source), text(title, ctx.source));
            return Some(Construct::Declaration(Box::new(decl)));
        }
    }
    callee(function, ctx.source)
}

fn attribute<'t>(node: Node<'t>, source: &[u8]) -> Option<Construct<'t>> {
    let parent = node.parent()?;
    if matches!(parent.kind(), "call_expression" | "new_expression")
        && (is_field_of_parent(node, "function") || is_field_of_parent(node, "constructor"))
    {
        return None;
    }
    let object = node.child_by_field_name("object")?;
    if !matches!(object.kind(), "identifier" | "this") {
        return None;
    }
    Some(Construct::Attribute {
        receiver: text(object, source).to_string(),
        attribute: field_text(node, "property", source)?,
        access: access_of(
            node,
            &["assignment_expression"],
            &["augmented_assignment_expression"],
        ),
    })
}
