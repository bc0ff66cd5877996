//! Resonance: vector encoding and top-k agent selection.
//!
//! The selection stage is pluggable at two seams: an [`Encoder`] turns text
//! into a dense vector (typically a remote embedding endpoint), and a
//! [`ResonanceDetector`] ranks the registered agents against the formulated
//! demand.  The bundled [`CosineResonanceDetector`] scores by cosine
//! similarity and keeps the top k\* above a minimum score; the bundled
//! [`HashingEncoder`] is a deterministic hashed bag-of-words embedding so the
//! crate works end-to-end without a remote service.
//!
//! Profile vectors are cached in an [`EncodingCache`] keyed by a Sha-256 hash
//! of the profile text, so an edited profile re-encodes while untouched
//! profiles are never re-sent to the encoder.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Text → dense vector.
///
/// Implementations are typically thin wrappers over an embedding API; the
/// engine shares one encoder across every session.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&self, text: &str) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>>;
}

/// One agent's id paired with its encoded profile vector.
#[derive(Clone)]
pub struct AgentVector {
    pub agent_id: String,
    pub vector: Arc<Vec<f32>>,
}

/// One selected (or filtered) agent with its resonance score.
#[derive(Debug, Clone, PartialEq)]
pub struct ResonanceMatch {
    pub agent_id: String,
    pub score: f32,
}

/// Result of a detection pass: the selection plus the agents that scored
/// below the threshold (surfaced in `resonance.activated` for observability).
#[derive(Debug, Clone, Default)]
pub struct ResonanceOutcome {
    /// Top k\* agents at or above the minimum score, best first.
    pub selected: Vec<ResonanceMatch>,
    /// Agents excluded by the threshold (not by the k\* cut), best first.
    pub filtered: Vec<ResonanceMatch>,
}

/// Ranks agent vectors against a demand vector.
pub trait ResonanceDetector: Send + Sync {
    fn detect(
        &self,
        demand_vector: &[f32],
        agent_vectors: &[AgentVector],
        k_star: usize,
        min_score: f32,
    ) -> ResonanceOutcome;
}

/// Cosine similarity of two vectors; 0.0 when either has no magnitude or the
/// dimensions disagree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Default detector: cosine similarity, threshold filter, top-k cut.
pub struct CosineResonanceDetector;

impl ResonanceDetector for CosineResonanceDetector {
    fn detect(
        &self,
        demand_vector: &[f32],
        agent_vectors: &[AgentVector],
        k_star: usize,
        min_score: f32,
    ) -> ResonanceOutcome {
        let mut scored: Vec<ResonanceMatch> = agent_vectors
            .iter()
            .map(|av| ResonanceMatch {
                agent_id: av.agent_id.clone(),
                score: cosine_similarity(demand_vector, &av.vector),
            })
            .collect();
        // Ties broken by agent id so the selection is deterministic.
        scored.sort_by(|x, y| {
            y.score
                .partial_cmp(&x.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| x.agent_id.cmp(&y.agent_id))
        });

        let mut outcome = ResonanceOutcome::default();
        for m in scored {
            if m.score >= min_score && outcome.selected.len() < k_star {
                outcome.selected.push(m);
            } else if m.score < min_score {
                outcome.filtered.push(m);
            }
            // Above threshold but beyond k*: silently dropped from both lists,
            // matching the "top k* by score" contract.
        }
        outcome
    }
}

/// Deterministic hashed bag-of-words encoder.
///
/// Tokenises like the rest of the crate's text heuristics (lowercase, strip
/// non-alphanumerics, drop words shorter than three characters), hashes each
/// token into one of `dimensions` signed buckets, and L2-normalises.  Not a
/// semantic embedding — inject a real [`Encoder`] for production — but stable
/// across runs, which is what the engine's tests and local setups need.
pub struct HashingEncoder {
    dimensions: usize,
}

impl HashingEncoder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(8),
        }
    }
}

impl Default for HashingEncoder {
    fn default() -> Self {
        Self::new(256)
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() > 2)
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .into_iter()
}

#[async_trait]
impl Encoder for HashingEncoder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>, Box<dyn Error + Send + Sync>> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&digest[..8]);
            let hash = u64::from_be_bytes(raw);
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if hash & (1u64 << 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

/// Hex Sha-256 of a profile text, used as the vector cache key.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Content-addressed cache of encoded profile vectors.
///
/// Shared across sessions; safe because the key is the hash of the encoded
/// text itself, so stale entries cannot exist.
pub struct EncodingCache {
    entries: RwLock<HashMap<String, Arc<Vec<f32>>>>,
}

impl EncodingCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the vector for `text`, encoding on a cache miss.
    pub async fn get_or_encode(
        &self,
        encoder: &dyn Encoder,
        text: &str,
    ) -> Result<Arc<Vec<f32>>, Box<dyn Error + Send + Sync>> {
        let key = content_hash(text);
        if let Some(hit) = self.entries.read().await.get(&key) {
            return Ok(hit.clone());
        }
        let vector = Arc::new(encoder.encode(text).await?);
        self.entries
            .write()
            .await
            .insert(key, vector.clone());
        Ok(vector)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for EncodingCache {
    fn default() -> Self {
        Self::new()
    }
}
