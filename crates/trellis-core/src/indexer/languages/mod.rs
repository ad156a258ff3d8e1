//! Per-language syntax interpretation.
//!
//! Each supported language implements [`LanguageParser`]: given one syntax
//! node and the enclosing scope, it says whether the node declares something,
//! imports something, calls something or touches an attribute. The graph
//! builder owns the traversal; adapters hold no state.

pub mod go;
pub mod java;
pub mod python;
pub mod typescript;

use tree_sitter::Node;

use crate::models::{AccessKind, ImportRef, InheritKind, Language};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclKind {
    Class { interface: bool },
    Function,
    Test { framework: &'static str },
}

/// Base type named in a class header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseRef {
    pub name: String,
    pub qualifier: Option<String>,
    pub relation: InheritKind,
}

#[derive(Debug, Clone)]
pub struct Declaration<'t> {
    pub kind: DeclKind,
    pub name: String,
    /// Node whose extent is the declaration (decorators included).
    pub node: Node<'t>,
    /// Receiver type for methods declared outside their type (Go).
    pub owner: Option<String>,
    /// Local name bound to the receiver inside the body (Go).
    pub receiver_var: Option<String>,
    pub bases: Vec<BaseRef>,
    pub parameters: Vec<String>,
    pub return_type: Option<String>,
    pub is_async: bool,
    pub docstring: Option<String>,
    pub signature: String,
}

impl<'t> Declaration<'t> {
    pub fn new(kind: DeclKind, name: String, node: Node<'t>) -> Self {
        Self {
            kind,
            name,
            node,
            owner: None,
            receiver_var: None,
            bases: Vec::new(),
            parameters: Vec::new(),
            return_type: None,
            is_async: false,
            docstring: None,
            signature: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Construct<'t> {
    Declaration(Box<Declaration<'t>>),
    /// Import statement; the builder does not descend into it.
    Imports(Vec<ImportRef>),
    Call {
        name: String,
        receiver: Option<String>,
    },
    Attribute {
        receiver: String,
        attribute: String,
        access: AccessKind,
    },
}

/// Scope information handed to adapters while walking.
#[derive(Debug, Clone, Copy)]
pub struct WalkContext<'a> {
    pub source: &'a [u8],
    pub path: &'a str,
    /// Name of the innermost enclosing class, if any.
    pub class_name: Option<&'a str>,
    /// True inside a function, method or test body.
    pub in_function: bool,
}

pub trait LanguageParser: Send + Sync {
    fn language(&self) -> Language;

    /// Qualified module name for a file. `package` is the in-source package
    /// declaration for languages that have one.
    fn module_name(&self, path: &str, package: Option<&str>) -> String;

    /// In-source package declaration (Go `package`, Java `package`).
    fn package_name(&self, _root: Node<'_>, _source: &[u8]) -> Option<String> {
        None
    }

    fn classify<'t>(&self, node: Node<'t>, ctx: &WalkContext<'_>) -> Option<Construct<'t>>;
}

static PYTHON: python::PythonParser = python::PythonParser;
static TYPESCRIPT: typescript::TypeScriptParser = typescript::TypeScriptParser;
static GO: go::GoParser = go::GoParser;
static JAVA: java::JavaParser = java::JavaParser;

pub fn parser_for(language: Language) -> &'static dyn LanguageParser {
    match language {
        Language::Python => &PYTHON,
        Language::TypeScript => &TYPESCRIPT,
        Language::Go => &GO,
        Language::Java => &JAVA,
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub(crate) fn text<'s>(node: Node<'_>, source: &'s [u8]) -> &'s str {
    node.utf8_text(source).unwrap_or("")
}

pub(crate) fn field_text(node: Node<'_>, field: &str, source: &[u8]) -> Option<String> {
    node.child_by_field_name(field)
        .map(|n| text(n, source).to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn line_of(node: Node<'_>) -> u32 {
    node.start_position().row as u32 + 1
}

/// Collapse all whitespace runs to single spaces.
pub(crate) fn squash(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Source text of `node` up to (not including) its `body` field.
pub(crate) fn header_text(node: Node<'_>, source: &[u8]) -> String {
    let end = node
        .child_by_field_name("body")
        .map(|b| b.start_byte())
        .unwrap_or(node.end_byte());
    let raw = source
        .get(node.start_byte()..end)
        .and_then(|b| std::str::from_utf8(b).ok())
        .unwrap_or("");
    squash(raw.trim_end_matches(['{', ':', ' ', '\n', '\t', '\r']))
}

/// `a.b.C<T>` -> (`Some("a.b")`, `"C"`).
pub(crate) fn split_type_name(raw: &str) -> (Option<String>, String) {
    let base = raw.split('<').next().unwrap_or(raw).trim();
    let base = base.trim_start_matches('*').trim_start_matches('&').trim();
    match base.rsplit_once('.') {
        Some((qualifier, name)) => (Some(qualifier.to_string()), name.to_string()),
        None => (None, base.to_string()),
    }
}

/// Contiguous comment block directly above `node`.
pub(crate) fn leading_comment(node: Node<'_>, source: &[u8]) -> Option<String> {
    let mut lines = Vec::new();
    let mut expected_row = node.start_position().row;
    let mut current = node.prev_sibling();
    while let Some(prev) = current {
        if !prev.kind().contains("comment") || prev.end_position().row + 1 < expected_row {
            break;
        }
        lines.push(text(prev, source).to_string());
        expected_row = prev.start_position().row;
        current = prev.prev_sibling();
    }
    if lines.is_empty() {
        return None;
    }
    lines.reverse();
    let cleaned: Vec<String> = lines
        .iter()
        .flat_map(|block| block.lines())
        .map(|line| {
            line.trim()
                .trim_start_matches("/**")
                .trim_start_matches("/*")
                .trim_end_matches("*/")
                .trim_start_matches("//")
                .trim_start_matches('*')
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .collect();
    (!cleaned.is_empty()).then(|| cleaned.join(" "))
}

/// Whether `node` is the `field` child of its parent.
pub(crate) fn is_field_of_parent(node: Node<'_>, field: &str) -> bool {
    node.parent()
        .and_then(|p| p.child_by_field_name(field))
        .is_some_and(|child| child.id() == node.id())
}

/// Access kind for an attribute node given the assignment node kinds of a
/// language (`plain`, `augmented`).
pub(crate) fn access_of(node: Node<'_>, plain: &[&str], augmented: &[&str]) -> AccessKind {
    let Some(parent) = node.parent() else {
        return AccessKind::Read;
    };
    let on_left = is_field_of_parent(node, "left");
    if on_left && plain.contains(&parent.kind()) {
        AccessKind::Write
    } else if on_left && augmented.contains(&parent.kind()) {
        AccessKind::ReadWrite
    } else {
        AccessKind::Read
    }
}

/// Strip matching quotes from a string literal.
pub(crate) fn unquote(raw: &str) -> String {
    let trimmed = raw.trim();
    for quote in ["\"\"\"", "'''", "\"", "'", "`"] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|s| s.strip_suffix(quote))
        {
            return inner.to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_type_name() {
        assert_eq!(split_type_name("Base"), (None, "Base".to_string()));
        assert_eq!(
            split_type_name("models.Base"),
            (Some("models".to_string()), "Base".to_string())
        );
        assert_eq!(
            split_type_name("java.util.List<String>"),
            (Some("java.util".to_string()), "List".to_string())
        );
        assert_eq!(split_type_name("*Server"), (None, "Server".to_string()));
    }

    #[test]
    fn test_unquote_variants() {
        assert_eq!(unquote("\"abc\""), "abc");
        assert_eq!(unquote("'''doc'''"), "doc");
        assert_eq!(unquote("`tpl`"), "tpl");
        assert_eq!(unquote("bare"), "bare");
    }

    #[test]
    fn test_parser_for_covers_every_language() {
        for language in Language::ALL {
            assert_eq!(parser_for(language).language(), language);
        }
    }
}
