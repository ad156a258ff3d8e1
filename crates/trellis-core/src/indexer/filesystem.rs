//! Repository scanning for indexing passes.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{EngineConfig, DEFAULT_STATE_DIR};
use crate::errors::{TrellisError, TrellisResult};
use crate::models::{IndexIssue, IssueStage, Language};

const LANGUAGE_BY_EXTENSION: &[(&str, Language)] = &[
    ("py", Language::Python),
    ("java", Language::Java),
    ("ts", Language::TypeScript),
    ("tsx", Language::TypeScript),
    ("go", Language::Go),
];

const SENSITIVE_EXCLUDE_PATTERNS: &[&str] = &[
    ".env",
    ".env.*",
    "*.pem",
    "*.key",
    "*.p12",
    "*secret*",
    "*secrets*",
    "*credential*",
    "id_rsa",
    "id_dsa",
];

const IMPLICIT_IGNORED_DIRS: &[&str] = &[".git", DEFAULT_STATE_DIR];

/// Per-repository ignore file read in addition to `.gitignore`.
pub const IGNORE_FILE: &str = ".trellisignore";

static SENSITIVE: LazyLock<Gitignore> = LazyLock::new(|| {
    let mut builder = GitignoreBuilder::new("");
    for pattern in SENSITIVE_EXCLUDE_PATTERNS {
        let _ = builder.add_line(None, pattern);
    }
    builder.build().unwrap_or_else(|_| Gitignore::empty())
});

#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub exclude_sensitive: bool,
    pub max_file_bytes: u64,
}

impl From<&EngineConfig> for ScanOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            include_patterns: config.include_patterns.clone(),
            exclude_patterns: config.exclude_patterns.clone(),
            exclude_sensitive: config.exclude_sensitive,
            max_file_bytes: config.max_file_bytes,
        }
    }
}

/// A supported source file found by the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub abs_path: PathBuf,
    /// Repository-relative path with `/` separators.
    pub rel_path: String,
    pub language: Language,
    pub size_bytes: u64,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub files: Vec<SourceFile>,
    pub skipped: Vec<IndexIssue>,
}

pub fn detect_language(path: &str) -> Option<Language> {
    let ext = Path::new(path).extension()?.to_str()?.to_lowercase();
    LANGUAGE_BY_EXTENSION
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, lang)| *lang)
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Whether a repository-relative path looks like credential material.
pub fn is_sensitive(rel_path: &str) -> bool {
    SENSITIVE
        .matched_path_or_any_parents(normalize_path(rel_path), false)
        .is_ignore()
}

pub fn normalize_path(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    normalized
        .strip_prefix("./")
        .unwrap_or(&normalized)
        .to_string()
}

pub fn relative_path(root: &Path, path: &Path) -> String {
    normalize_path(&path.strip_prefix(root).unwrap_or(path).to_string_lossy())
}

fn clean_pattern(pattern: &str) -> Option<String> {
    let trimmed = pattern.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.strip_prefix("./").unwrap_or(trimmed).to_string())
}

/// Walk `root` honouring `.gitignore`, [`IGNORE_FILE`], the configured
/// include/exclude globs and, optionally, the sensitive-file patterns.
pub fn scan_repository(root: &Path, options: &ScanOptions) -> TrellisResult<ScanOutcome> {
    if !root.is_dir() {
        return Err(TrellisError::InvalidRoot(root.to_path_buf()));
    }

    let mut overrides = OverrideBuilder::new(root);
    let add = |builder: &mut OverrideBuilder, glob: &str| {
        builder
            .add(glob)
            .map(|_| ())
            .map_err(|e| TrellisError::Config(format!("invalid pattern `{glob}`: {e}")))
    };
    for pattern in options.include_patterns.iter().filter_map(|p| clean_pattern(p)) {
        add(&mut overrides, &pattern)?;
    }
    for pattern in options.exclude_patterns.iter().filter_map(|p| clean_pattern(p)) {
        add(&mut overrides, &format!("!{pattern}"))?;
    }
    if options.exclude_sensitive {
        for pattern in SENSITIVE_EXCLUDE_PATTERNS {
            add(&mut overrides, &format!("!{pattern}"))?;
        }
    }
    let overrides = overrides
        .build()
        .map_err(|e| TrellisError::Config(e.to_string()))?;

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_global(false)
        .require_git(false)
        .add_custom_ignore_filename(IGNORE_FILE)
        .overrides(overrides)
        .filter_entry(|entry| {
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            !(is_dir
                && IMPLICIT_IGNORED_DIRS
                    .iter()
                    .any(|d| entry.file_name() == std::ffi::OsStr::new(d)))
        })
        .build();

    let mut outcome = ScanOutcome::default();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                outcome.skipped.push(IndexIssue {
                    path: root.display().to_string(),
                    stage: IssueStage::Read,
                    message: err.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let rel_path = relative_path(root, entry.path());
        let Some(language) = detect_language(&rel_path) else {
            continue;
        };
        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size_bytes > options.max_file_bytes {
            outcome.skipped.push(IndexIssue {
                path: rel_path,
                stage: IssueStage::Read,
                message: format!(
                    "file is {size_bytes} bytes, over the {} byte limit",
                    options.max_file_bytes
                ),
            });
            continue;
        }
        outcome.files.push(SourceFile {
            abs_path: entry.path().to_path_buf(),
            rel_path,
            language,
            size_bytes,
        });
    }
    outcome.files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    debug!(
        root = %root.display(),
        files = outcome.files.len(),
        skipped = outcome.skipped.len(),
        "repository scanned"
    );
    Ok(outcome)
}
