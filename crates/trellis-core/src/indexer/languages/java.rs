use tree_sitter::Node;

use super::{
    field_text, header_text, is_field_of_parent, leading_comment, split_type_name, text, BaseRef,
    Construct, DeclKind, Declaration, LanguageParser, WalkContext,
};
use crate::models::{AccessKind, ImportRef, ImportedName, InheritKind, Language};

const TEST_ANNOTATIONS: &[&str] = &["Test", "ParameterizedTest", "RepeatedTest", "TestFactory"];

pub struct JavaParser;

impl LanguageParser for JavaParser {
    fn language(&self) -> Language {
        Language::Java
    }

    fn module_name(&self, path: &str, package: Option<&str>) -> String {
        if let Some(package) = package.filter(|p| !p.is_empty()) {
            return package.to_string();
        }
        match path.rsplit_once('/') {
            Some((dir, _)) => dir.replace('/', "."),
            None => "default".to_string(),
        }
    }

    fn package_name(&self, root: Node<'_>, source: &[u8]) -> Option<String> {
        let mut cursor = root.walk();
        let decl = root
            .named_children(&mut cursor)
            .find(|c| c.kind() == "package_declaration")?;
        let mut inner = decl.walk();
        let name = decl
            .named_children(&mut inner)
            .find(|c| matches!(c.kind(), "scoped_identifier" | "identifier"))
            .map(|c| text(c, source).to_string());
        name
    }

    fn classify<'t>(&self, node: Node<'t>, ctx: &WalkContext<'_>) -> Option<Construct<'t>> {
        match node.kind() {
            "class_declaration" | "enum_declaration" | "record_declaration" => {
                type_declaration(node, false, ctx)
            }
            "interface_declaration" | "annotation_type_declaration" => {
                type_declaration(node, true, ctx)
            }
            "method_declaration" | "constructor_declaration" => method(node, ctx),
            "import_declaration" => import(node, ctx.source).map(|r| Construct::Imports(vec![r])),
            "method_invocation" => invocation(node, ctx.source),
            "object_creation_expression" => {
                let ty = node.child_by_field_name("type")?;
                let (_, name) = split_type_name(text(ty, ctx.source));
                (!name.is_empty()).then_some(Construct::Call {
                    name,
                    receiver: None,
                })
            }
            "field_access" => field_access(node, ctx.source),
            _ => None,
        }
    }
}

fn modifiers(node: Node<'_>) -> Option<Node<'_>> {
    let mut cursor = node.walk();
    let found = node
        .children(&mut cursor)
        .find(|c| c.kind() == "modifiers");
    found
}

fn has_test_annotation(node: Node<'_>, source: &[u8]) -> bool {
    let Some(mods) = modifiers(node) else {
        return false;
    };
    let mut cursor = mods.walk();
    let found = mods.named_children(&mut cursor).any(|m| {
        matches!(m.kind(), "marker_annotation" | "annotation")
            && m.child_by_field_name("name")
                .map(|n| split_type_name(text(n, source)).1)
                .is_some_and(|n| TEST_ANNOTATIONS.contains(&n.as_str()))
    });
    found
}

fn type_bases(node: Node<'_>, source: &[u8], bases: &mut Vec<BaseRef>) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        let relation = match child.kind() {
            "superclass" | "extends_interfaces" => InheritKind::Extends,
            "super_interfaces" => InheritKind::Implements,
            _ => continue,
        };
        let mut stack = vec![child];
        while let Some(current) = stack.pop() {
            match current.kind() {
                "type_identifier" | "scoped_type_identifier" | "generic_type" => {
                    let (qualifier, name) = split_type_name(text(current, source));
                    if !name.is_empty() {
                        bases.push(BaseRef {
                            name,
                            qualifier,
                            relation,
                        });
                    }
                }
                _ => {
                    let mut inner = current.walk();
                    let children: Vec<Node<'_>> = current.named_children(&mut inner).collect();
                    stack.extend(children.into_iter().rev());
                }
            }
        }
    }
}

fn type_declaration<'t>(
    node: Node<'t>,
    interface: bool,
    ctx: &WalkContext<'_>,
) -> Option<Construct<'t>> {
    let name = field_text(node, "name", ctx.source)?;
    let mut decl = Declaration::new(DeclKind::Class { interface }, name, node);
    type_bases(node, ctx.source, &mut decl.bases);
    decl.docstring = leading_comment(node, ctx.source);
    decl.signature = header_text(node, ctx.source);
    Some(Construct::Declaration(Box::new(decl)))
}

fn method<'t>(node: Node<'t>, ctx: &WalkContext<'_>) -> Option<Construct<'t>> {
    let name = field_text(node, "name", ctx.source)?;
    let kind = if has_test_annotation(node, ctx.source) {
        DeclKind::Test { framework: "junit" }
    } else {
        DeclKind::Function
    };
    let mut decl = Declaration::new(kind, name, node);
    if let Some(params) = node.child_by_field_name("parameters") {
        let mut cursor = params.walk();
        decl.parameters = params
            .named_children(&mut cursor)
            .filter(|p| matches!(p.kind(), "formal_parameter" | "spread_parameter"))
            .filter_map(|p| {
                p.child_by_field_name("name")
                    .or_else(|| {
                        let mut inner = p.walk();
                        let last = p.named_children(&mut inner).last();
                        last
                    })
                    .map(|n| text(n, ctx.source).to_string())
            })
            .collect();
    }
    decl.return_type = field_text(node, "type", ctx.source);
    decl.docstring = leading_comment(node, ctx.source);
    decl.signature = header_text(node, ctx.source);
    Some(Construct::Declaration(Box::new(decl)))
}

fn import(node: Node<'_>, source: &[u8]) -> Option<ImportRef> {
    let mut cursor = node.walk();
    let mut wildcard = false;
    let mut path = None;
    for child in node.children(&mut cursor) {
        match child.kind() {
            "asterisk" => wildcard = true,
            "scoped_identifier" | "identifier" => path = Some(text(child, source).to_string()),
            _ => {}
        }
    }
    let path = path?;
    let line = super::line_of(node);
    if wildcard {
        return Some(ImportRef {
            line,
            module: path,
            names: Vec::new(),
            alias: None,
            relative_level: 0,
            wildcard: true,
        });
    }
    // `import a.b.C;` imports type C from package a.b. A static import names
    // a member of a type; the resolver retries shorter prefixes as modules.
    let (module, name) = match path.rsplit_once('.') {
        Some((module, name)) => (module.to_string(), name.to_string()),
        None => (String::new(), path.clone()),
    };
    Some(ImportRef {
        line,
        module,
        names: vec![ImportedName { name, alias: None }],
        alias: None,
        relative_level: 0,
        wildcard: false,
    })
}

fn simple_receiver(node: Node<'_>, source: &[u8]) -> String {
    let raw = text(node, source);
    let simple = matches!(node.kind(), "identifier" | "this" | "field_access" | "super")
        && raw.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '$');
    if simple {
        raw.to_string()
    } else {
        "<expr>".to_string()
    }
}

fn invocation<'t>(node: Node<'t>, source: &[u8]) -> Option<Construct<'t>> {
    Some(Construct::Call {
        name: field_text(node, "name", source)?,
        receiver: node
            .child_by_field_name("object")
            .map(|o| simple_receiver(o, source)),
    })
}

fn access(node: Node<'_>, source: &[u8]) -> AccessKind {
    let Some(parent) = node.parent() else {
        return AccessKind::Read;
    };
    match parent.kind() {
        "assignment_expression" if is_field_of_parent(node, "left") => {
            let operator = parent
                .child_by_field_name("operator")
                .map(|op| text(op, source))
                .unwrap_or("=");
            if operator == "=" {
                AccessKind::Write
            } else {
                AccessKind::ReadWrite
            }
        }
        "update_expression" => AccessKind::ReadWrite,
        _ => AccessKind::Read,
    }
}

fn field_access<'t>(node: Node<'t>, source: &[u8]) -> Option<Construct<'t>> {
    let object = node.child_by_field_name("object")?;
    if !matches!(object.kind(), "identifier" | "this") {
        return None;
    }
    Some(Construct::Attribute {
        receiver: text(object, source).to_string(),
        attribute: field_text(node, "field", source)?,
        access: access(node, source),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::parser::{parse, Grammar};

    fn walk(src: &str) -> Vec<String> {
        let out = parse(Grammar::Java, src.as_bytes());
        let tree = out.tree.unwrap();
        let mut found = Vec::new();
        let mut stack = vec![tree.root_node()];
        while let Some(node) = stack.pop() {
            let ctx = WalkContext {
                source: src.as_bytes(),
                path: "src/main/java/com/acme/UserService.java",
                class_name: None,
                in_function: false,
            };
            match JavaParser.classify(node, &ctx) {
                Some(Construct::Declaration(d)) => found.push(format!(
                    "{:?}:{}:{:?}",
                    d.kind,
                    d.name,
                    d.bases.iter().map(|b| b.name.as_str()).collect::<Vec<_>>()
                )),
                Some(Construct::Imports(refs)) => {
                    for r in refs {
                        let names: Vec<&str> = r.names.iter().map(|n| n.name.as_str()).collect();
                        found.push(format!("import:{}:{}:{}", r.module, names.join(","), r.wildcard));
                    }
                    continue;
                }
                Some(Construct::Call { name, receiver }) => {
                    found.push(format!("call:{}:{name}", receiver.unwrap_or_default()))
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
            stack.extend(children.into_iter().rev());
        }
        found
    }

    #[test]
    fn test_module_prefers_package() {
        assert_eq!(JavaParser.module_name("src/com/acme/A.java", Some("com.acme")), "com.acme");
        assert_eq!(JavaParser.module_name("src/com/acme/A.java", None), "src.com.acme");
    }

    #[test]
    fn test_package_declaration() {
        let src = "package com.acme.users;\n\nclass A {}\n";
        let out = parse(Grammar::Java, src.as_bytes());
        assert_eq!(
            JavaParser
                .package_name(out.root().unwrap(), src.as_bytes())
                .as_deref(),
            Some("com.acme.users")
        );
    }

    #[test]
    fn test_classes_methods_and_references() {
        let src = r#"package com.acme.users;

import java.util.List;
import com.acme.validation.*;

/** Registers users. */
public class UserService extends BaseService implements Auditable {
    private int count;

    public boolean register(String email) {
        this.count = 1;
        Validator v = new Validator();
        return v.validate(email) && helper();
    }
}
"#;
        let found = walk(src);
        assert!(found.contains(&"import:java.util:List:false".to_string()));
        assert!(found.contains(&"import:com.acme.validation::true".to_string()));
        assert!(found.contains(
            &"Class { interface: false }:UserService:[\"BaseService\", \"Auditable\"]".to_string()
        ));
        assert!(found.contains(&"Function:register:[]".to_string()));
        assert!(found.contains(&"attr:this.count:Write".to_string()));
        assert!(found.contains(&"call::Validator".to_string()));
        assert!(found.contains(&"call:v:validate".to_string()));
        assert!(found.contains(&"call::helper".to_string()));
    }

    #[test]
    fn test_junit_annotation_marks_tests() {
        let src = "class UserServiceTest {\n  @Test\n  void registersUser() {\n    service.register(\"a\");\n  }\n\n  void setUp() {}\n}\n";
        let found = walk(src);
        assert!(found.contains(&"Test { framework: \"junit\" }:registersUser:[]".to_string()));
        assert!(found.contains(&"Function:setUp:[]".to_string()));
        assert!(found.contains(&"call:service:register".to_string()));
    }
}
