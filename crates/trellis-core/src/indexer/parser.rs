//! Error-tolerant, incremental parsing on top of tree-sitter.
//!
//! Parsing never fails on malformed input: tree-sitter recovers and marks the
//! damage with `ERROR`/`MISSING` nodes, which are collected into
//! [`ParseError`]s. A file is only `Failed` when no tree could be produced.

use std::collections::HashMap;

use parking_lot::Mutex;
use tree_sitter::{InputEdit, Node, Parser, Point, Tree};

use crate::errors::ParseError;
use crate::models::{Language, ParseStatus};

/// Grammar actually used for a file. TypeScript has two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Grammar {
    Python,
    TypeScript,
    Tsx,
    Go,
    Java,
}

impl Grammar {
    pub fn for_path(path: &str, language: Language) -> Self {
        match language {
            Language::Python => Grammar::Python,
            Language::TypeScript if path.to_lowercase().ends_with(".tsx") => Grammar::Tsx,
            Language::TypeScript => Grammar::TypeScript,
            Language::Go => Grammar::Go,
            Language::Java => Grammar::Java,
        }
    }

    pub fn language(self) -> Language {
        match self {
            Grammar::Python => Language::Python,
            Grammar::TypeScript | Grammar::Tsx => Language::TypeScript,
            Grammar::Go => Language::Go,
            Grammar::Java => Language::Java,
        }
    }

    fn ts_language(self) -> tree_sitter::Language {
        match self {
            Grammar::Python => tree_sitter_python::LANGUAGE.into(),
            Grammar::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Grammar::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
            Grammar::Go => tree_sitter_go::LANGUAGE.into(),
            Grammar::Java => tree_sitter_java::LANGUAGE.into(),
        }
    }
}

/// Result of parsing one file.
#[derive(Debug, Clone)]
pub struct ParseOutput {
    pub grammar: Grammar,
    pub tree: Option<Tree>,
    pub errors: Vec<ParseError>,
    pub status: ParseStatus,
}

impl ParseOutput {
    pub fn error_count(&self) -> u32 {
        self.errors.len() as u32
    }

    pub fn root(&self) -> Option<Node<'_>> {
        self.tree.as_ref().map(Tree::root_node)
    }

    fn failed(grammar: Grammar, description: String) -> Self {
        Self {
            grammar,
            tree: None,
            errors: vec![ParseError {
                line: 1,
                column: 0,
                byte: 0,
                description,
            }],
            status: ParseStatus::Failed,
        }
    }
}

/// Byte-range edit between two versions of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceEdit {
    pub start_byte: usize,
    pub old_end_byte: usize,
    pub new_end_byte: usize,
}

impl SourceEdit {
    /// Smallest single edit turning `old` into `new`, or `None` if identical.
    pub fn between(old: &[u8], new: &[u8]) -> Option<Self> {
        if old == new {
            return None;
        }
        let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
        let max_suffix = old.len().min(new.len()) - prefix;
        let suffix = old
            .iter()
            .rev()
            .zip(new.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();
        Some(Self {
            start_byte: prefix,
            old_end_byte: old.len() - suffix,
            new_end_byte: new.len() - suffix,
        })
    }

    fn input_edit(&self, old: &[u8], new: &[u8]) -> InputEdit {
        InputEdit {
            start_byte: self.start_byte,
            old_end_byte: self.old_end_byte,
            new_end_byte: self.new_end_byte,
            start_position: point_at(old, self.start_byte),
            old_end_position: point_at(old, self.old_end_byte),
            new_end_position: point_at(new, self.new_end_byte),
        }
    }
}

fn point_at(source: &[u8], offset: usize) -> Point {
    let offset = offset.min(source.len());
    let before = &source[..offset];
    let row = before.iter().filter(|b| **b == b'\n').count();
    let column = match before.iter().rposition(|b| *b == b'\n') {
        Some(newline) => offset - newline - 1,
        None => offset,
    };
    Point { row, column }
}

/// Parse `source` from scratch.
pub fn parse(grammar: Grammar, source: &[u8]) -> ParseOutput {
    run_parser(grammar, source, None)
}

/// Re-parse `new` reusing `old_tree` (built from `old`); unchanged subtrees
/// are shared, so the work is proportional to the edit.
pub fn reparse(grammar: Grammar, old: &[u8], old_tree: &Tree, new: &[u8]) -> ParseOutput {
    let Some(edit) = SourceEdit::between(old, new) else {
        return finish(grammar, new, old_tree.clone());
    };
    let mut edited = old_tree.clone();
    edited.edit(&edit.input_edit(old, new));
    run_parser(grammar, new, Some(&edited))
}

fn run_parser(grammar: Grammar, source: &[u8], old_tree: Option<&Tree>) -> ParseOutput {
    if std::str::from_utf8(source).is_err() {
        return ParseOutput::failed(grammar, "source is not valid UTF-8".to_string());
    }
    let mut parser = Parser::new();
    if let Err(err) = parser.set_language(&grammar.ts_language()) {
        return ParseOutput::failed(grammar, format!("grammar unavailable: {err}"));
    }
    match parser.parse(source, old_tree) {
        Some(tree) => finish(grammar, source, tree),
        None => ParseOutput::failed(grammar, "parser produced no tree".to_string()),
    }
}

fn finish(grammar: Grammar, source: &[u8], tree: Tree) -> ParseOutput {
    let errors = collect_errors(tree.root_node(), source);
    let status = if errors.is_empty() {
        ParseStatus::Success
    } else if tree.root_node().is_error() && tree.root_node().named_child_count() == 0 {
        ParseStatus::Failed
    } else {
        ParseStatus::Partial
    };
    ParseOutput {
        grammar,
        tree: Some(tree),
        errors,
        status,
    }
}

/// Outermost `ERROR` and every `MISSING` node, in document order.
pub fn collect_errors(root: Node<'_>, source: &[u8]) -> Vec<ParseError> {
    let mut errors = Vec::new();
    if !root.has_error() {
        return errors;
    }
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_missing() {
            errors.push(ParseError {
                line: node.start_position().row as u32 + 1,
                column: node.start_position().column as u32,
                byte: node.start_byte(),
                description: format!("missing `{}`", node.kind()),
            });
            continue;
        }
        if node.is_error() {
            let snippet: String = node
                .utf8_text(source)
                .unwrap_or("")
                .chars()
                .take(40)
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            errors.push(ParseError {
                line: node.start_position().row as u32 + 1,
                column: node.start_position().column as u32,
                byte: node.start_byte(),
                description: format!("unexpected `{snippet}`"),
            });
            continue;
        }
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node
            .children(&mut cursor)
            .filter(|c| c.has_error() || c.is_missing())
            .collect();
        stack.extend(children.into_iter().rev());
    }
    errors
}

// ---------------------------------------------------------------------------
// Tree cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CachedTree {
    grammar: Grammar,
    source: Vec<u8>,
    tree: Tree,
}

/// Last tree parsed for each file, so that the next edit re-parses
/// incrementally. Owned by one engine; never shared between repositories.
#[derive(Debug, Default)]
pub struct TreeCache {
    entries: Mutex<HashMap<String, CachedTree>>,
}

impl TreeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `source` as the new content of `path`, reusing the cached tree
    /// when one exists for the same grammar.
    pub fn parse(&self, path: &str, grammar: Grammar, source: &[u8]) -> ParseOutput {
        let previous = self
            .entries
            .lock()
            .get(path)
            .filter(|cached| cached.grammar == grammar)
            .cloned();
        let out = match previous {
            Some(cached) => reparse(grammar, &cached.source, &cached.tree, source),
            None => parse(grammar, source),
        };
        self.remember(path, &out, source);
        out
    }

    pub fn remember(&self, path: &str, out: &ParseOutput, source: &[u8]) {
        let mut entries = self.entries.lock();
        match &out.tree {
            Some(tree) => {
                entries.insert(
                    path.to_string(),
                    CachedTree {
                        grammar: out.grammar,
                        source: source.to_vec(),
                        tree: tree.clone(),
                    },
                );
            }
            None => {
                entries.remove(path);
            }
        }
    }

    pub fn forget(&self, path: &str) {
        self.entries.lock().remove(path);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_source_parses_successfully() {
        let out = parse(Grammar::Python, b"def f():\n    return 1\n");
        assert_eq!(out.status, ParseStatus::Success);
        assert!(out.errors.is_empty());
        assert_eq!(out.root().unwrap().kind(), "module");
    }

    #[test]
    fn test_broken_source_is_partial_with_errors() {
        let src = b"def ok():\n    return 1\n\ndef broken(:\n    pass\n";
        let out = parse(Grammar::Python, src);
        assert_eq!(out.status, ParseStatus::Partial);
        assert!(!out.errors.is_empty());
        assert!(out.errors[0].line >= 4);
    }

    #[test]
    fn test_invalid_utf8_fails() {
        let out = parse(Grammar::Go, &[0xff, 0xfe, 0x00]);
        assert_eq!(out.status, ParseStatus::Failed);
        assert!(out.tree.is_none());
    }

    #[test]
    fn test_source_edit_bounds() {
        let edit = SourceEdit::between(b"abcXYZdef", b"abcQdef").unwrap();
        assert_eq!(
            edit,
            SourceEdit {
                start_byte: 3,
                old_end_byte: 6,
                new_end_byte: 4
            }
        );
        assert!(SourceEdit::between(b"same", b"same").is_none());

        let append = SourceEdit::between(b"aa", b"aaa").unwrap();
        assert_eq!(append.start_byte, 2);
        assert_eq!(append.old_end_byte, 2);
        assert_eq!(append.new_end_byte, 3);
    }

    #[test]
    fn test_point_at_counts_rows_and_columns() {
        assert_eq!(point_at(b"ab\ncd", 4), Point { row: 1, column: 1 });
        assert_eq!(point_at(b"ab\ncd", 1), Point { row: 0, column: 1 });
    }

    #[test]
    fn test_reparse_matches_fresh_parse() {
        let old = b"def f():\n    return 1\n".to_vec();
        let new = b"def f():\n    return 2\n\ndef g():\n    pass\n".to_vec();
        let first = parse(Grammar::Python, &old);
        let incremental = reparse(Grammar::Python, &old, first.tree.as_ref().unwrap(), &new);
        let fresh = parse(Grammar::Python, &new);
        assert_eq!(
            incremental.root().unwrap().to_sexp(),
            fresh.root().unwrap().to_sexp()
        );
    }

    #[test]
    fn test_tree_cache_reuses_and_forgets() {
        let cache = TreeCache::new();
        let first = cache.parse("a.py", Grammar::Python, b"def f():\n    pass\n");
        assert_eq!(first.status, ParseStatus::Success);
        assert_eq!(cache.len(), 1);

        let second = cache.parse("a.py", Grammar::Python, b"def f():\n    pass\n\ndef g():\n    pass\n");
        assert_eq!(second.root().unwrap().named_child_count(), 2);

        cache.forget("a.py");
        assert!(cache.is_empty());
    }
}
