use tree_sitter::Node;

use super::{
    access_of, field_text, header_text, is_field_of_parent, split_type_name, squash, text,
    unquote, BaseRef, Construct, DeclKind, Declaration, LanguageParser, WalkContext,
};
use crate::models::{ImportRef, ImportedName, InheritKind, Language};

pub struct PythonParser;

impl LanguageParser for PythonParser {
    fn language(&self) -> Language {
        Language::Python
    }

    fn module_name(&self, path: &str, _package: Option<&str>) -> String {
        let stem = path.strip_suffix(".py").unwrap_or(path);
        let stem = stem.strip_suffix("/__init__").unwrap_or(stem);
        stem.replace('/', ".")
    }

    fn classify<'t>(&self, node: Node<'t>, ctx: &WalkContext<'_>) -> Option<Construct<'t>> {
        match node.kind() {
            "function_definition" => function(node, ctx),
            "class_definition" => class(node, ctx),
            "import_statement" => Some(Construct::Imports(plain_imports(node, ctx.source))),
            "import_from_statement" => Some(Construct::Imports(from_import(node, ctx.source))),
            "future_import_statement" => Some(Construct::Imports(Vec::new())),
            "call" => call(node, ctx.source),
            "attribute" => attribute(node, ctx.source),
            _ => None,
        }
    }
}

fn is_test_file(path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or(path);
    file.starts_with("test_") || file.ends_with("_test.py")
}

fn docstring(node: Node<'_>, source: &[u8]) -> Option<String> {
    let body = node.child_by_field_name("body")?;
    let first = body.named_child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let literal = first.named_child(0)?;
    if literal.kind() != "string" {
        return None;
    }
    let doc = squash(&unquote(text(literal, source)));
    (!doc.is_empty()).then_some(doc)
}

fn parameter_name(param: Node<'_>, source: &[u8]) -> Option<String> {
    let name = match param.kind() {
        "identifier" => text(param, source).to_string(),
        "default_parameter" | "typed_default_parameter" => field_text(param, "name", source)?,
        "typed_parameter" => {
            let inner = param.named_child(0)?;
            parameter_name(inner, source)?
        }
        "list_splat_pattern" => format!("*{}", text(param.named_child(0)?, source)),
        "dictionary_splat_pattern" => format!("**{}", text(param.named_child(0)?, source)),
        _ => return None,
    };
    (!matches!(name.as_str(), "self" | "cls")).then_some(name)
}

fn function<'t>(node: Node<'t>, ctx: &WalkContext<'_>) -> Option<Construct<'t>> {
    let name = field_text(node, "name", ctx.source)?;
    let is_test = name.starts_with("test")
        && (is_test_file(ctx.path) || ctx.class_name.is_some_and(|c| c.starts_with("Test")));
    let kind = if is_test {
        DeclKind::Test {
            framework: if ctx.class_name.is_some() {
                "unittest"
            } else {
                "pytest"
            },
        }
    } else {
        DeclKind::Function
    };

    let mut decl = Declaration::new(kind, name, node);
    decl.is_async = node.child(0).is_some_and(|c| c.kind() == "async");
    if let Some(params) = node.child_by_field_name("parameters") {
        let mut cursor = params.walk();
        decl.parameters = params
            .named_children(&mut cursor)
            .filter_map(|p| parameter_name(p, ctx.source))
            .collect();
    }
    decl.return_type = field_text(node, "return_type", ctx.source);
    decl.docstring = docstring(node, ctx.source);
    decl.signature = header_text(node, ctx.source);
    Some(Construct::Declaration(Box::new(decl)))
}

fn class<'t>(node: Node<'t>, ctx: &WalkContext<'_>) -> Option<Construct<'t>> {
    let name = field_text(node, "name", ctx.source)?;
    let mut decl = Declaration::new(DeclKind::Class { interface: false }, name, node);
    if let Some(supers) = node.child_by_field_name("superclasses") {
        let mut cursor = supers.walk();
        for base in supers.named_children(&mut cursor) {
            let raw = match base.kind() {
                "identifier" | "attribute" => text(base, ctx.source),
                "subscript" => base
                    .child_by_field_name("value")
                    .map(|v| text(v, ctx.source))
                    .unwrap_or(""),
                _ => continue,
            };
            if raw.is_empty() {
                continue;
            }
            let (qualifier, name) = split_type_name(raw);
            decl.bases.push(BaseRef {
                name,
                qualifier,
                relation: InheritKind::Extends,
            });
        }
    }
    decl.docstring = docstring(node, ctx.source);
    decl.signature = header_text(node, ctx.source);
    Some(Construct::Declaration(Box::new(decl)))
}

fn imported_name(node: Node<'_>, source: &[u8]) -> Option<ImportedName> {
    match node.kind() {
        "dotted_name" | "identifier" => Some(ImportedName {
            name: text(node, source).to_string(),
            alias: None,
        }),
        "aliased_import" => Some(ImportedName {
            name: field_text(node, "name", source)?,
            alias: field_text(node, "alias", source),
        }),
        _ => None,
    }
}

fn plain_imports(node: Node<'_>, source: &[u8]) -> Vec<ImportRef> {
    let line = super::line_of(node);
    let mut cursor = node.walk();
    node.children_by_field_name("name", &mut cursor)
        .filter_map(|n| imported_name(n, source))
        .map(|imported| ImportRef {
            line,
            module: imported.name,
            names: Vec::new(),
            alias: imported.alias,
            relative_level: 0,
            wildcard: false,
        })
        .collect()
}

fn from_import(node: Node<'_>, source: &[u8]) -> Vec<ImportRef> {
    let Some(module_node) = node.child_by_field_name("module_name") else {
        return Vec::new();
    };
    let (module, relative_level) = if module_node.kind() == "relative_import" {
        let mut level = 0u32;
        let mut module = String::new();
        let mut cursor = module_node.walk();
        for child in module_node.children(&mut cursor) {
            match child.kind() {
                "import_prefix" => level += text(child, source).matches('.').count() as u32,
                "dotted_name" => module = text(child, source).to_string(),
                _ => {}
            }
        }
        (module, level)
    } else {
        (text(module_node, source).to_string(), 0)
    };

    let mut cursor = node.walk();
    let names: Vec<ImportedName> = node
        .children_by_field_name("name", &mut cursor)
        .filter_map(|n| imported_name(n, source))
        .collect();
    let mut cursor = node.walk();
    let wildcard = node
        .children(&mut cursor)
        .any(|c| c.kind() == "wildcard_import");

    vec![ImportRef {
        line: super::line_of(node),
        module,
        names,
        alias: None,
        relative_level,
        wildcard,
    }]
}

/// Dotted receiver text, or `None` for computed receivers.
fn simple_receiver(node: Node<'_>, source: &[u8]) -> Option<String> {
    let raw = text(node, source);
    let simple = matches!(node.kind(), "identifier" | "attribute")
        && raw
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.');
    simple.then(|| raw.to_string())
}

fn call<'t>(node: Node<'t>, source: &[u8]) -> Option<Construct<'t>> {
    let function = node.child_by_field_name("function")?;
    match function.kind() {
        "identifier" => Some(Construct::Call {
            name: text(function, source).to_string(),
            receiver: None,
        }),
        "attribute" => {
            let name = field_text(function, "attribute", source)?;
            let receiver = function
                .child_by_field_name("object")
                .map(|o| simple_receiver(o, source).unwrap_or_else(|| "<expr>".to_string()));
            Some(Construct::Call { name, receiver })
        }
        _ => None,
    }
}

fn attribute<'t>(node: Node<'t>, source: &[u8]) -> Option<Construct<'t>> {
    if node.parent().is_some_and(|p| p.kind() == "call") && is_field_of_parent(node, "function") {
        return None;
    }
    let object = node.child_by_field_name("object")?;
    if object.kind() != "identifier" {
        return None;
    }
    Some(Construct::Attribute {
        receiver: text(object, source).to_string(),
        attribute: field_text(node, "attribute", source)?,
        access: access_of(node, &["assignment"], &["augmented_assignment"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::parser::{parse, Grammar};

    fn constructs(src: &str, path: &str) -> Vec<String> {
        let out = parse(Grammar::Python, src.as_bytes());
        let tree = out.tree.unwrap();
        let mut found = Vec::new();
        let mut stack = vec![(tree.root_node(), None::<String>)];
        while let Some((node, class)) = stack.pop() {
            let ctx = WalkContext {
                source: src.as_bytes(),
                path,
                class_name: class.as_deref(),
                in_function: false,
            };
            let mut next_class = class.clone();
            match PythonParser.classify(node, &ctx) {
                Some(Construct::Declaration(d)) => {
                    if matches!(d.kind, DeclKind::Class { .. }) {
                        next_class = Some(d.name.clone());
                    }
                    found.push(format!("{:?}:{}", d.kind, d.name));
                }
                Some(Construct::Imports(refs)) => {
                    for r in refs {
                        found.push(format!("import:{}:{}", r.relative_level, r.module));
                    }
                    continue;
                }
                Some(Construct::Call { name, receiver }) => {
                    found.push(format!("call:{}:{name}", receiver.unwrap_or_default()));
                }
                Some(Construct::Attribute {
                    receiver,
                    attribute,
                    access,
                }) => found.push(format!("attr:{receiver}.{attribute}:{access:?}")),
                None => {}
            }
            let mut cursor = node.walk();
            let children: Vec<_> = node.children(&mut cursor).collect();
            for child in children.into_iter().rev() {
                stack.push((child, next_class.clone()));
            }
        }
        found
    }

    #[test]
    fn test_module_names() {
        assert_eq!(PythonParser.module_name("pkg/mod.py", None), "pkg.mod");
        assert_eq!(PythonParser.module_name("pkg/__init__.py", None), "pkg");
        assert_eq!(PythonParser.module_name("main.py", None), "main");
    }

    #[test]
    fn test_declarations_calls_and_attributes() {
        let src = "\
from .validators import validate_email as check
import os.path

class UserService(Base):
    def register(self, email):
        self.count += 1
        return check(email)
";
        let found = constructs(src, "app/service.py");
        assert!(found.contains(&"import:1:validators".to_string()));
        assert!(found.contains(&"import:0:os.path".to_string()));
        assert!(found.contains(&"Class { interface: false }:UserService".to_string()));
        assert!(found.contains(&"Function:register".to_string()));
        assert!(found.contains(&"attr:self.count:ReadWrite".to_string()));
        assert!(found.contains(&"call::check".to_string()));
    }

    #[test]
    fn test_test_detection_by_file_and_class() {
        let src = "def test_register():\n    pass\n\ndef helper():\n    pass\n";
        let found = constructs(src, "tests/test_auth.py");
        assert!(found.contains(&"Test { framework: \"pytest\" }:test_register".to_string()));
        assert!(found.contains(&"Function:helper".to_string()));

        let src = "class TestAuth:\n    def test_login(self):\n        pass\n";
        let found = constructs(src, "auth_checks.py");
        assert!(found.contains(&"Test { framework: \"unittest\" }:test_login".to_string()));

        let found = constructs("def test_like():\n    pass\n", "app/util.py");
        assert!(found.contains(&"Function:test_like".to_string()));
    }

    #[test]
    fn test_function_details() {
        let src = "async def fetch(self, url: str, *args, retries=3) -> bytes:\n    \"\"\"Fetch a URL.\"\"\"\n    pass\n";
        let out = parse(Grammar::Python, src.as_bytes());
        let tree = out.tree.unwrap();
        let node = tree.root_node().named_child(0).unwrap();
        let ctx = WalkContext {
            source: src.as_bytes(),
            path: "net.py",
            class_name: None,
            in_function: false,
        };
        let Some(Construct::Declaration(decl)) = PythonParser.classify(node, &ctx) else {
            panic!("expected declaration");
        };
        assert!(decl.is_async);
        assert_eq!(decl.parameters, vec!["url", "*args", "retries"]);
        assert_eq!(decl.return_type.as_deref(), Some("bytes"));
        assert_eq!(decl.docstring.as_deref(), Some("Fetch a URL."));
        assert!(decl.signature.starts_with("async def fetch("));
    }
}
