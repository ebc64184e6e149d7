//! Vector record store with cosine similarity search.
//!
//! Holds at most one embedding per owner and ranks candidates by linear
//! scan. The store knows nothing about intents; callers must only compare
//! vectors produced under the same one.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored embedding. Replaced wholesale, never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    /// Id of the item this vector represents
    pub owner_id: u64,
    pub vector: Vec<f32>,
    pub dimension: usize,
    /// Tag of the model that produced the vector
    pub model_version: String,
    pub created_at: DateTime<Utc>,
}

impl Embedding {
    pub fn new(owner_id: u64, vector: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            owner_id,
            dimension: vector.len(),
            vector,
            model_version: model_version.into(),
            created_at: Utc::now(),
        }
    }

    /// Whether this embedding was produced by the given model configuration.
    pub fn matches(&self, model_version: &str, dimension: usize) -> bool {
        self.dimension == dimension && self.model_version == model_version
    }
}

/// Search result from the vector store.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredOwner {
    pub owner_id: u64,
    /// Cosine similarity in [-1.0, 1.0]
    pub score: f32,
}

/// Errors that can occur during vector store operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Embedding declares dimension {declared} but holds {actual} values")]
    InconsistentDimension { declared: usize, actual: usize },

    #[error("Vector store lock poisoned")]
    Poisoned,
}

/// Compute L2 norm of a vector.
fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity between two vectors of equal length.
///
/// Returns `0.0` when either vector has zero norm. Inputs need not be
/// normalized.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, VectorError> {
    if a.len() != b.len() {
        return Err(VectorError::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }

    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    Ok(cosine_with_norm(a, norm_a, b, norm_b))
}

fn cosine_with_norm(a: &[f32], norm_a: f32, b: &[f32], norm_b: f32) -> f32 {
    if norm_a < f32::EPSILON || norm_b < f32::EPSILON {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let score = dot_product / (norm_a * norm_b);
    if score.is_finite() {
        score.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Rank `candidates` by cosine similarity to `query`.
///
/// Candidates whose dimension differs from the query are skipped with a
/// warning. Results are sorted by descending score, ties keep candidate
/// order, and at most `top_k` are returned.
pub fn search<'a>(
    query: &[f32],
    candidates: impl IntoIterator<Item = &'a Embedding>,
    top_k: usize,
) -> Vec<ScoredOwner> {
    if top_k == 0 {
        return Vec::new();
    }

    let query_norm = l2_norm(query);
    let mut skipped = 0usize;

    let mut results: Vec<ScoredOwner> = candidates
        .into_iter()
        .filter_map(|candidate| {
            if candidate.vector.len() != query.len() {
                skipped += 1;
                log::warn!(
                    "Skipping embedding of owner {}: dimension {} does not match query dimension {}",
                    candidate.owner_id,
                    candidate.vector.len(),
                    query.len()
                );
                return None;
            }

            let score = cosine_with_norm(
                query,
                query_norm,
                &candidate.vector,
                l2_norm(&candidate.vector),
            );
            Some(ScoredOwner {
                owner_id: candidate.owner_id,
                score,
            })
        })
        .collect();

    if skipped > 0 {
        log::debug!("{skipped} candidates skipped due to dimension mismatch");
    }

    // sort_by is stable, so equal scores keep their input order
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    results.truncate(top_k);

    results
}

/// In-memory vector record store keyed by owner id.
///
/// Reads run concurrently. Each write replaces or removes a whole record
/// under the write lock, so a reader never sees a partially written vector.
#[derive(Debug, Default)]
pub struct VectorStore {
    entries: RwLock<BTreeMap<u64, Embedding>>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from previously persisted embeddings.
    ///
    /// Later duplicates of an owner replace earlier ones.
    pub fn from_embeddings(embeddings: impl IntoIterator<Item = Embedding>) -> Self {
        let entries = embeddings
            .into_iter()
            .map(|embedding| (embedding.owner_id, embedding))
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<u64, Embedding>>, VectorError> {
        self.entries.read().map_err(|_| VectorError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<u64, Embedding>>, VectorError> {
        self.entries.write().map_err(|_| VectorError::Poisoned)
    }

    /// Insert or replace the embedding for `owner_id`.
    ///
    /// Returns the embedding it replaced, if any.
    pub fn upsert(
        &self,
        owner_id: u64,
        mut embedding: Embedding,
    ) -> Result<Option<Embedding>, VectorError> {
        if embedding.vector.len() != embedding.dimension {
            return Err(VectorError::InconsistentDimension {
                declared: embedding.dimension,
                actual: embedding.vector.len(),
            });
        }
        embedding.owner_id = owner_id;

        Ok(self.write()?.insert(owner_id, embedding))
    }

    pub fn get(&self, owner_id: u64) -> Result<Option<Embedding>, VectorError> {
        Ok(self.read()?.get(&owner_id).cloned())
    }

    pub fn contains(&self, owner_id: u64) -> Result<bool, VectorError> {
        Ok(self.read()?.contains_key(&owner_id))
    }

    /// Snapshot of every embedding, ordered by owner id.
    pub fn get_all(&self) -> Result<Vec<Embedding>, VectorError> {
        Ok(self.read()?.values().cloned().collect())
    }

    pub fn delete_by_owner(&self, owner_id: u64) -> Result<Option<Embedding>, VectorError> {
        Ok(self.write()?.remove(&owner_id))
    }

    pub fn len(&self) -> usize {
        self.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rank every stored embedding against `query`.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<ScoredOwner>, VectorError> {
        let entries = self.read()?;
        Ok(search(query, entries.values(), top_k))
    }
}
