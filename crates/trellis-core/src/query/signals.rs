//! Execution evidence pulled from logs and stack traces.
//!
//! The log format is an external, versioned contract. Version 1 recognises
//! Python traceback frames, Java stack frames and generic `path.ext:line`
//! mentions. Any other version yields no signal.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::indexer::filesystem::normalize_path;
use crate::models::LineRange;

pub const SUPPORTED_LOG_VERSION: u32 = 1;

const FRAME_WEIGHT: f64 = 1.0;
const MENTION_WEIGHT: f64 = 0.8;
/// Evidence in the right file but outside the candidate's lines.
const SAME_FILE_FACTOR: f64 = 0.5;

static PYTHON_FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "([^"]+)", line (\d+)"#).unwrap());

static JAVA_FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bat\s+[\w$.<>/]+\(([\w$-]+\.java):(\d+)\)").unwrap());

static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([\w./\\-]+\.(?:py|pyi|ts|tsx|mts|cts|go|java)):(\d+)").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub version: u32,
    pub text: String,
}

impl ExecutionLog {
    pub fn v1(text: impl Into<String>) -> Self {
        Self {
            version: SUPPORTED_LOG_VERSION,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evidence {
    pub path: String,
    pub line: u32,
    pub weight: f64,
}

/// Parsed evidence, grouped by the file name it was reported under.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSignals {
    by_name: HashMap<String, Vec<Evidence>>,
    len: usize,
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `reported` names `indexed` when it is the same path or a suffix of it on
/// a directory boundary, in either direction.
fn same_file(reported: &str, indexed: &str) -> bool {
    let boundary = |long: &str, short: &str| {
        long.ends_with(short)
            && (long.len() == short.len() || long.as_bytes()[long.len() - short.len() - 1] == b'/')
    };
    boundary(reported, indexed) || boundary(indexed, reported)
}

impl ExecutionSignals {
    /// `None` when the log version is not understood.
    pub fn parse(log: &ExecutionLog) -> Option<Self> {
        if log.version != SUPPORTED_LOG_VERSION {
            return None;
        }
        let mut signals = ExecutionSignals::default();
        for line in log.text.lines() {
            let mut framed = false;
            for caps in PYTHON_FRAME_RE
                .captures_iter(line)
                .chain(JAVA_FRAME_RE.captures_iter(line))
            {
                framed = true;
                signals.push(&caps[1], &caps[2], FRAME_WEIGHT);
            }
            if framed {
                continue;
            }
            for caps in MENTION_RE.captures_iter(line) {
                signals.push(&caps[1], &caps[2], MENTION_WEIGHT);
            }
        }
        Some(signals)
    }

    fn push(&mut self, path: &str, line: &str, weight: f64) {
        let Ok(line) = line.parse::<u32>() else {
            return;
        };
        let path = normalize_path(path);
        self.by_name
            .entry(file_name(&path).to_string())
            .or_default()
            .push(Evidence { path, line, weight });
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn evidence(&self) -> impl Iterator<Item = &Evidence> {
        self.by_name.values().flatten()
    }

    /// Unnormalised evidence for a code unit in `path` spanning `lines`.
    pub fn raw_score(&self, path: &str, lines: Option<LineRange>) -> f64 {
        let Some(candidates) = self.by_name.get(file_name(path)) else {
            return 0.0;
        };
        candidates
            .iter()
            .filter(|e| same_file(&e.path, path))
            .map(|e| match lines {
                Some(range) if !range.contains(e.line) => e.weight * SAME_FILE_FACTOR,
                _ => e.weight,
            })
            .sum()
    }

    /// First evidence line that falls inside `lines`, for rationales.
    pub fn first_hit(&self, path: &str, lines: Option<LineRange>) -> Option<u32> {
        self.by_name
            .get(file_name(path))?
            .iter()
            .filter(|e| same_file(&e.path, path))
            .find(|e| lines.map_or(true, |r| r.contains(e.line)))
            .map(|e| e.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = r#"Traceback (most recent call last):
  File "/srv/app/auth/register.py", line 12, in register_user
    validate_email(email)
  File "/srv/app/auth/validators.py", line 4, in validate_email
    raise ValueError("bad email")
ValueError: bad email
"#;

    #[test]
    fn test_python_traceback_frames() {
        let signals = ExecutionSignals::parse(&ExecutionLog::v1(TRACE)).unwrap();
        assert_eq!(signals.len(), 2);
        assert_eq!(signals.raw_score("auth/register.py", Some(LineRange::new(10, 15))), 1.0);
        assert_eq!(signals.raw_score("auth/register.py", Some(LineRange::new(1, 5))), 0.5);
        assert_eq!(signals.raw_score("other/register.py", None), 0.0);
        assert_eq!(signals.first_hit("auth/validators.py", None), Some(4));
    }

    #[test]
    fn test_java_frames_are_not_double_counted() {
        let log = "java.lang.IllegalStateException\n\tat com.acme.UserService.save(UserService.java:42)\n";
        let signals = ExecutionSignals::parse(&ExecutionLog::v1(log)).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(
            signals.raw_score("src/main/java/com/acme/UserService.java", Some(LineRange::new(40, 50))),
            1.0
        );
    }

    #[test]
    fn test_generic_mentions() {
        let log = "error at ./pkg/store/db.go:88: connection refused\nsee web/app.tsx:3";
        let signals = ExecutionSignals::parse(&ExecutionLog::v1(log)).unwrap();
        assert_eq!(signals.len(), 2);
        assert!((signals.raw_score("pkg/store/db.go", None) - 0.8).abs() < 1e-9);
        assert_eq!(signals.raw_score("store/db.go", None), 0.8);
        assert_eq!(signals.raw_score("xstore/db.go", None), 0.0);
    }

    #[test]
    fn test_unknown_version_is_ignored() {
        let log = ExecutionLog {
            version: 2,
            text: TRACE.to_string(),
        };
        assert!(ExecutionSignals::parse(&log).is_none());
    }
}
