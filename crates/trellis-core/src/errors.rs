//! Error types for the trellis core library.

use std::path::PathBuf;

use crate::store::StoreError;

/// Top-level error enum for the trellis core library.
#[derive(Debug, thiserror::Error)]
pub enum TrellisError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Repository root is not a directory: {}", .0.display())]
    InvalidRoot(PathBuf),

    #[error("Unsupported file type: {0}")]
    UnsupportedFile(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Indexing cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type TrellisResult<T> = Result<T, TrellisError>;

/// One syntax error recovered by the parser. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{line}:{column}: {description}")]
pub struct ParseError {
    /// 1-based line.
    pub line: u32,
    /// 0-based byte column.
    pub column: u32,
    pub byte: usize,
    pub description: String,
}

/// A reference whose target could not be statically located.
///
/// Non-fatal: an edge with reduced confidence is kept whenever a plausible
/// endpoint exists; otherwise only this diagnostic is recorded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unresolved reference `{name}` at {path}:{line}: {reason}")]
pub struct UnresolvedReference {
    pub path: String,
    pub line: u32,
    pub name: String,
    pub reason: &'static str,
}

/// Encoder failures. The embedding engine turns these into `None`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding encoder unavailable: {0}")]
    Unavailable(String),

    #[error("encoder returned {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}
