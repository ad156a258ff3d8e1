//! Identifier-aware tokenization shared by seeding and the hashing encoder.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap());

/// Minimum shared prefix for two terms to count as the same stem.
pub const STEM_PREFIX: usize = 5;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "does", "for", "from", "how", "in",
    "into", "is", "it", "of", "on", "or", "that", "the", "this", "to", "was", "what", "when",
    "where", "which", "why", "with", "add", "fix", "implement", "change", "make", "find", "show",
    "please", "should", "need", "self", "def", "func", "fn", "py", "ts", "tsx", "go", "java",
];

static STOPWORD_SET: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| STOPWORDS.iter().copied().collect());

pub fn is_stopword(term: &str) -> bool {
    STOPWORD_SET.contains(term)
}

/// Split one identifier on underscores and case changes, lowercased.
///
/// `validateEmail` -> `validate`, `email`; `HTTPServer` -> `http`, `server`.
pub fn split_identifier(word: &str) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    let mut parts = Vec::new();
    let mut current = String::new();
    for (i, &c) in chars.iter().enumerate() {
        if c == '_' || !c.is_alphanumeric() {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            continue;
        }
        if c.is_uppercase() && !current.is_empty() {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower) {
                parts.push(std::mem::take(&mut current));
            }
        }
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn raw_terms(text: &str) -> Vec<String> {
    WORD_RE
        .find_iter(text)
        .flat_map(|m| split_identifier(m.as_str()))
        .filter(|t| t.len() >= 2)
        .collect()
}

/// Distinct content terms in order of first appearance.
///
/// Falls back to every term when the text holds nothing but stopwords, so
/// that a query like "update" still has something to match.
pub fn terms(text: &str) -> Vec<String> {
    let all = raw_terms(text);
    let mut seen = HashSet::new();
    let content: Vec<String> = all
        .iter()
        .filter(|t| !is_stopword(t))
        .filter(|t| seen.insert((*t).clone()))
        .cloned()
        .collect();
    if !content.is_empty() {
        return content;
    }
    let mut seen = HashSet::new();
    all.into_iter().filter(|t| seen.insert(t.clone())).collect()
}

fn singular(term: &str) -> &str {
    if term.len() > 4 {
        if let Some(stripped) = term.strip_suffix("es") {
            if stripped.ends_with('s') || stripped.ends_with('x') || stripped.ends_with("ch") {
                return stripped;
            }
        }
    }
    if term.len() > 3 {
        if let Some(stripped) = term.strip_suffix('s') {
            if !stripped.ends_with('s') {
                return stripped;
            }
        }
    }
    term
}

/// Exact match, plural variant, or a shared stem of [`STEM_PREFIX`] chars.
pub fn term_matches(a: &str, b: &str) -> bool {
    if a == b || singular(a) == singular(b) {
        return true;
    }
    let shared = a
        .chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .count();
    shared >= STEM_PREFIX
}

/// How well `target` terms cover `query` terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LexicalMatch {
    /// Share of query terms found in the target.
    pub query_coverage: f64,
    /// Share of target terms found in the query.
    pub target_coverage: f64,
    pub matched: usize,
}

impl LexicalMatch {
    pub fn score(&self) -> f64 {
        0.5 * self.query_coverage + 0.5 * self.target_coverage
    }
}

pub fn lexical_match(query: &[String], target: &[String]) -> Option<LexicalMatch> {
    if query.is_empty() || target.is_empty() {
        return None;
    }
    let matched = query
        .iter()
        .filter(|q| target.iter().any(|t| term_matches(q, t)))
        .count();
    if matched == 0 {
        return None;
    }
    let target_hits = target
        .iter()
        .filter(|t| query.iter().any(|q| term_matches(q, t)))
        .count();
    Some(LexicalMatch {
        query_coverage: matched as f64 / query.len() as f64,
        target_coverage: target_hits as f64 / target.len() as f64,
        matched,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_identifier_cases() {
        assert_eq!(split_identifier("register_user"), vec!["register", "user"]);
        assert_eq!(split_identifier("validateEmail"), vec!["validate", "email"]);
        assert_eq!(split_identifier("HTTPServer"), vec!["http", "server"]);
        assert_eq!(split_identifier("UserRepo2"), vec!["user", "repo2"]);
    }

    #[test]
    fn test_terms_drop_stopwords_and_duplicates() {
        assert_eq!(
            terms("add email validation to user registration for the user"),
            vec!["email", "validation", "user", "registration"]
        );
        assert_eq!(terms("add"), vec!["add"]);
        assert!(terms("  ").is_empty());
    }

    #[test]
    fn test_term_matching_rules() {
        assert!(term_matches("validation", "validate"));
        assert!(term_matches("registration", "register"));
        assert!(term_matches("users", "user"));
        assert!(term_matches("classes", "class"));
        assert!(!term_matches("user", "use"));
        assert!(!term_matches("email", "mail"));
    }

    #[test]
    fn test_lexical_match_coverage() {
        let query = terms("add email validation to user registration");
        let hit = lexical_match(&query, &terms("register_user")).unwrap();
        assert_eq!(hit.matched, 2);
        assert_eq!(hit.target_coverage, 1.0);
        assert_eq!(hit.query_coverage, 0.5);
        assert!(lexical_match(&query, &terms("parse_config")).is_none());
    }
}
