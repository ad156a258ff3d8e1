//! Source to graph: scanning, parsing, building and reference resolution.

pub mod builder;
pub mod filesystem;
pub mod imports;
pub mod languages;
pub mod parser;
pub mod pipeline;
pub mod relations;

pub use builder::{build, BuildOutput};
pub use parser::{parse, reparse, Grammar, ParseOutput, TreeCache};
pub use pipeline::{index_repository, parse_and_build, ParsedFile};
pub use relations::{extract, SymbolIndex};
