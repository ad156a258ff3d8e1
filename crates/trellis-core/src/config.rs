//! Engine configuration.
//!
//! Loading configuration files is the caller's job; this module only defines
//! the typed, defaulted shape and a few environment overrides.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{TrellisError, TrellisResult};
use crate::query::guards::{MAX_HOPS, MAX_RESULTS, MIN_HOPS};

/// Directory (relative to the repository root) holding WAL segments and snapshots.
pub const DEFAULT_STATE_DIR: &str = ".trellis";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where persisted state lives. `None` keeps the graph in memory only.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Worker threads for full indexing.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Files larger than this are skipped with an issue recorded.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Glob patterns a file must match to be indexed (empty = everything).
    #[serde(default)]
    pub include_patterns: Vec<String>,

    /// Extra glob patterns to skip, on top of `.gitignore`.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Skip `.env`, key material and other credential-looking files.
    #[serde(default = "default_true")]
    pub exclude_sensitive: bool,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub updates: UpdateConfig,

    /// Confidence at or below which returned results are annotated.
    #[serde(default = "default_warning_threshold")]
    pub confidence_warning_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// WAL segments rotate once they exceed this size.
    #[serde(default = "default_segment_bytes")]
    pub wal_segment_bytes: u64,

    /// Take an automatic snapshot after this many WAL entries.
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every_entries: Option<u64>,

    /// Take an automatic snapshot when this long has passed since the last one.
    #[serde(default)]
    pub snapshot_interval_secs: Option<u64>,

    /// fsync each committed transaction.
    #[serde(default = "default_true")]
    pub sync_writes: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Embed every declaration right after a full index.
    #[serde(default)]
    pub warm_on_index: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    #[serde(default = "default_max_hops")]
    pub max_hops: u32,

    /// Graph distances beyond this contribute nothing to the score.
    #[serde(default = "default_max_graph_distance")]
    pub max_graph_distance: u32,

    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,

    /// Best semantic matches promoted to graph seeds.
    #[serde(default = "default_semantic_seeds")]
    pub semantic_seed_count: usize,

    /// Minimum similarity for a semantic seed.
    #[serde(default = "default_seed_similarity")]
    pub seed_similarity: f64,

    #[serde(default)]
    pub weights: ScoreWeights,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub semantic: f64,
    pub graph: f64,
    pub execution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Quiet period before a burst of edits to one file is applied.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_workers() -> usize {
    4
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_warning_threshold() -> f64 {
    crate::models::DEFAULT_WARNING_THRESHOLD
}

fn default_segment_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_snapshot_every() -> Option<u64> {
    Some(10_000)
}

fn default_dimensions() -> usize {
    256
}

fn default_cache_capacity() -> usize {
    4096
}

fn default_max_results() -> usize {
    12
}

fn default_max_hops() -> u32 {
    2
}

fn default_max_graph_distance() -> u32 {
    5
}

fn default_deadline_ms() -> u64 {
    2000
}

fn default_semantic_seeds() -> usize {
    3
}

fn default_seed_similarity() -> f64 {
    0.25
}

fn default_debounce_ms() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            workers: default_workers(),
            max_file_bytes: default_max_file_bytes(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            exclude_sensitive: true,
            store: StoreConfig::default(),
            embedding: EmbeddingConfig::default(),
            query: QueryConfig::default(),
            updates: UpdateConfig::default(),
            confidence_warning_threshold: default_warning_threshold(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            wal_segment_bytes: default_segment_bytes(),
            snapshot_every_entries: default_snapshot_every(),
            snapshot_interval_secs: None,
            sync_writes: true,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimensions: default_dimensions(),
            cache_capacity: default_cache_capacity(),
            warm_on_index: false,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            max_hops: default_max_hops(),
            max_graph_distance: default_max_graph_distance(),
            deadline_ms: default_deadline_ms(),
            semantic_seed_count: default_semantic_seeds(),
            seed_similarity: default_seed_similarity(),
            weights: ScoreWeights::default(),
        }
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            semantic: 0.4,
            graph: 0.4,
            execution: 0.2,
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    let v = value.trim().to_lowercase();
    Some(!matches!(v.as_str(), "0" | "false" | "no" | "off"))
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

impl EngineConfig {
    /// Persist state under `<root>/.trellis`.
    pub fn persistent(root: &std::path::Path) -> Self {
        Self {
            state_dir: Some(root.join(DEFAULT_STATE_DIR)),
            ..Self::default()
        }
    }

    /// Defaults overlaid with `TRELLIS_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        if let Some(workers) = env_number::<usize>("TRELLIS_WORKERS") {
            self.workers = workers;
        }
        if let Some(capacity) = env_number::<usize>("TRELLIS_EMBED_CACHE") {
            self.embedding.cache_capacity = capacity;
        }
        if let Some(deadline) = env_number::<u64>("TRELLIS_QUERY_DEADLINE_MS") {
            self.query.deadline_ms = deadline;
        }
        if let Some(flag) = env_flag("TRELLIS_EXCLUDE_SENSITIVE") {
            self.exclude_sensitive = flag;
        }
    }

    /// Clamp bounded knobs into range and reject inconsistent weights.
    pub fn validate(&mut self) -> TrellisResult<()> {
        self.workers = self.workers.max(1);
        self.query.max_hops = self.query.max_hops.clamp(MIN_HOPS, MAX_HOPS);
        self.query.max_results = self.query.max_results.clamp(1, MAX_RESULTS);
        self.embedding.cache_capacity = self.embedding.cache_capacity.max(1);
        if self.embedding.dimensions == 0 {
            return Err(TrellisError::Config("embedding dimensions must be > 0".into()));
        }
        let w = self.query.weights;
        if [w.semantic, w.graph, w.execution].iter().any(|v| *v < 0.0) {
            return Err(TrellisError::Config("score weights must be non-negative".into()));
        }
        let total = w.semantic + w.graph + w.execution;
        if (total - 1.0).abs() > 1e-6 {
            return Err(TrellisError::Config(format!(
                "score weights must sum to 1.0, got {total:.3}"
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_warning_threshold) {
            return Err(TrellisError::Config(
                "confidence_warning_threshold must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.query.max_results, 12);
        assert_eq!(config.query.max_hops, 2);
        assert_eq!(config.query.max_graph_distance, 5);
        assert_eq!(config.query.weights, ScoreWeights::default());
        assert!((config.confidence_warning_threshold - 0.70).abs() < 1e-9);
        assert!(config.state_dir.is_none());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"workers": 2, "query": {"max_hops": 9}}"#).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.query.max_hops, 9);
        assert_eq!(config.query.max_results, 12);
        assert_eq!(config.embedding.cache_capacity, 4096);
    }

    #[test]
    fn test_validate_clamps_hops_and_rejects_bad_weights() {
        let mut config = EngineConfig::default();
        config.query.max_hops = 9;
        config.validate().unwrap();
        assert_eq!(config.query.max_hops, MAX_HOPS);

        config.query.weights.execution = 0.5;
        assert!(matches!(config.validate(), Err(TrellisError::Config(_))));
    }
}
