//! Retrieval and analysis over the committed graph.

pub mod blast;
pub mod context;
pub mod embedding;
pub mod guards;
pub mod hybrid;
pub mod neighbors;
pub mod signals;
pub mod tokenizer;

pub use blast::{impact, related_tests, risk_level};
pub use context::{assemble, run_query, AssembleOptions, QueryRequest, RankedCandidate};
pub use embedding::{cosine_similarity, EmbeddingEngine, Encoder, HashingEncoder};
pub use hybrid::{HybridScorer, Signals};
pub use neighbors::neighbors;
pub use signals::{ExecutionLog, ExecutionSignals};
