//! Fixed-length vectors for code units, cached by content.
//!
//! The engine owns a bounded LRU shared by every query thread. Encoding runs
//! outside the cache lock so a slow encoder never blocks cache readers, and
//! encoder failures surface as `None` so callers can fall back to the
//! remaining signals.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::errors::EmbeddingError;
use crate::models::{CacheStats, Node};
use crate::query::tokenizer::{terms, STEM_PREFIX};

pub type Vector = Arc<Vec<f32>>;

/// Turns text into a vector of [`Encoder::dimensions`] floats.
///
/// Implementations must be deterministic for a given input.
pub trait Encoder: Send + Sync {
    fn dimensions(&self) -> usize;

    fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Hashing encoder
// ---------------------------------------------------------------------------

const TERM_WEIGHT: f32 = 1.0;
const STEM_WEIGHT: f32 = 0.8;
const TRIGRAM_WEIGHT: f32 = 0.3;

/// Feature-hashing encoder over identifier terms, their stems and character
/// trigrams. No model files and no network.
#[derive(Debug, Clone)]
pub struct HashingEncoder {
    dimensions: usize,
}

impl HashingEncoder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn add(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let mut hasher = DefaultHasher::new();
        feature.hash(&mut hasher);
        let hash = hasher.finish();
        let slot = (hash % self.dimensions as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign * weight;
    }
}

impl Encoder for HashingEncoder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = vec![0.0f32; self.dimensions];
        for term in terms(text) {
            self.add(&mut vector, &format!("t:{term}"), TERM_WEIGHT);
            let chars: Vec<char> = term.chars().collect();
            if chars.len() >= STEM_PREFIX {
                let stem: String = chars[..STEM_PREFIX].iter().collect();
                self.add(&mut vector, &format!("s:{stem}"), STEM_WEIGHT);
            }
            let padded: Vec<char> = std::iter::once('^')
                .chain(chars.iter().copied())
                .chain(std::iter::once('$'))
                .collect();
            for window in padded.windows(3) {
                let gram: String = window.iter().collect();
                self.add(&mut vector, &format!("g:{gram}"), TRIGRAM_WEIGHT);
            }
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        Ok(vector)
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

/// Cosine similarity clamped to `[0, 1]`; zero for empty or mismatched inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct EmbeddingEngine {
    encoder: Arc<dyn Encoder>,
    cache: Mutex<LruCache<String, Vector>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
}

impl std::fmt::Debug for EmbeddingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingEngine")
            .field("encoder", &self.encoder.name())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl EmbeddingEngine {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self::with_encoder(
            Arc::new(HashingEncoder::new(config.dimensions)),
            config.cache_capacity,
        )
    }

    pub fn with_encoder(encoder: Arc<dyn Encoder>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let size = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            encoder,
            cache: Mutex::new(LruCache::new(size)),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn encoder_name(&self) -> &str {
        self.encoder.name()
    }

    /// Embed free text, cached under the SHA-256 of the text.
    pub fn embed(&self, text: &str) -> Option<Vector> {
        let key = format!("{:x}", Sha256::digest(text.as_bytes()));
        self.embed_keyed(&key, text)
    }

    /// Embed a node, cached under its id and content hash so an edit to the
    /// node yields a fresh key.
    pub fn embed_node(&self, node: &Node) -> Option<Vector> {
        let key = node_cache_key(node)?;
        self.embed_keyed(&key, &node.embedding_text())
    }

    pub fn embed_keyed(&self, key: &str, text: &str) -> Option<Vector> {
        if let Some(hit) = self.cache.lock().get(key).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let encoded = self.encoder.encode(text).and_then(|v| {
            if v.len() == self.encoder.dimensions() {
                Ok(v)
            } else {
                Err(EmbeddingError::DimensionMismatch {
                    expected: self.encoder.dimensions(),
                    actual: v.len(),
                })
            }
        });
        match encoded {
            Ok(vector) => {
                let vector = Arc::new(vector);
                self.cache.lock().put(key.to_string(), Arc::clone(&vector));
                Some(vector)
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(key, error = %err, "embedding failed");
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.lock().contains(key)
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.cache.lock().pop(key).is_some()
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.cache.lock().len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Cache key for a node's embedding, `None` for nodes that are never embedded.
pub fn node_cache_key(node: &Node) -> Option<String> {
    node.content_key().map(|hash| format!("{}#{hash}", node.id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenEncoder;

    impl Encoder for BrokenEncoder {
        fn dimensions(&self) -> usize {
            8
        }

        fn encode(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::Unavailable("model not loaded".into()))
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    struct ShortEncoder;

    impl Encoder for ShortEncoder {
        fn dimensions(&self) -> usize {
            8
        }

        fn encode(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0; 3])
        }

        fn name(&self) -> &str {
            "short"
        }
    }

    #[test]
    fn test_hashing_encoder_is_deterministic_and_normalized() {
        let encoder = HashingEncoder::new(64);
        let a = encoder.encode("validate_email address").unwrap();
        let b = encoder.encode("validate_email address").unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(encoder.encode("").unwrap().iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_related_text_is_more_similar() {
        let encoder = HashingEncoder::new(256);
        let query = encoder.encode("email validation").unwrap();
        let related = encoder.encode("def validate_email(address)").unwrap();
        let unrelated = encoder.encode("def render_chart(points)").unwrap();
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
        assert!(cosine_similarity(&query, &related) > 0.25);
    }

    #[test]
    fn test_cache_hits_and_eviction() {
        let engine = EmbeddingEngine::with_encoder(Arc::new(HashingEncoder::new(16)), 2);
        assert!(engine.embed_keyed("a", "alpha").is_some());
        assert!(engine.embed_keyed("a", "alpha").is_some());
        engine.embed_keyed("b", "beta");
        engine.embed_keyed("c", "gamma");
        assert!(!engine.contains("a"));
        let stats = engine.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.capacity, 2);
    }

    #[test]
    fn test_encoder_failures_degrade_to_none() {
        let engine = EmbeddingEngine::with_encoder(Arc::new(BrokenEncoder), 4);
        assert!(engine.embed("anything").is_none());
        let short = EmbeddingEngine::with_encoder(Arc::new(ShortEncoder), 4);
        assert!(short.embed("anything").is_none());
        assert_eq!(engine.stats().failures, 1);
        assert_eq!(short.stats().entries, 0);
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-9);
    }
}
