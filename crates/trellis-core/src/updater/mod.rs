//! Keeping the graph current as files change.

pub mod incremental;
pub mod queue;

pub use incremental::{affected_files, diff_declarations, remove_file, update_file, DeclarationDiff};
pub use queue::{FileChange, ReadyUpdate, UpdateQueue};
