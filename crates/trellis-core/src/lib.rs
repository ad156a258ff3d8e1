//! Trellis core library: a code-graph engine for context retrieval.
//!
//! Source files in Python, TypeScript, Go and Java are parsed into a typed
//! graph of files, modules, classes, functions and tests, connected by
//! imports, calls, inheritance, attribute access and test relationships.
//! The graph is kept current one file at a time, persisted through a
//! write-ahead log with SQLite snapshots, and queried with a hybrid of
//! semantic similarity, graph distance and execution evidence to assemble
//! context packs.
//!
//! [`Engine`] is the entry point; the modules below are public for callers
//! that need finer control.

pub mod config;
pub mod engine;
pub mod errors;
pub mod indexer;
pub mod logging;
pub mod models;
pub mod query;
pub mod store;
pub mod updater;

pub use config::EngineConfig;
pub use engine::Engine;
pub use errors::{TrellisError, TrellisResult};
pub use models::{ContextPack, ImpactReport, IndexResult, NodeId, Patch, StatusReport, TestSet};
pub use query::{ExecutionLog, QueryRequest};
pub use updater::FileChange;
