//! In-memory vector store with cosine similarity search.
//!
//! Same contract as the Qdrant gateway; used by the `memory` backend and by tests.

use std::collections::HashMap;
use std::sync::RwLock;

use super::embeddings::Embedding;
use super::store::{HitPayload, ScoredHit, StoreError, VectorStore};

/// An entry in the vector index.
#[derive(Debug, Clone)]
struct VectorEntry {
    embedding: Embedding,
    payload: HitPayload,
}

/// In-memory vector index keyed by entity id.
pub struct MemoryVectorStore {
    entries: RwLock<HashMap<u64, VectorEntry>>,
    /// Expected embedding dimensions
    dimensions: usize,
}

impl MemoryVectorStore {
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            dimensions,
        }
    }

    fn check_dimensions(&self, vector: &Embedding) -> Result<(), StoreError> {
        if vector.len() != self.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        Ok(())
    }
}

fn poisoned<T>(err: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Unavailable(format!("index lock poisoned: {err}"))
}

impl VectorStore for MemoryVectorStore {
    fn provision(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn upsert(&self, id: u64, vector: &Embedding, payload: &HitPayload) -> Result<(), StoreError> {
        self.check_dimensions(vector)?;

        self.entries.write().map_err(poisoned)?.insert(
            id,
            VectorEntry {
                embedding: vector.clone(),
                payload: payload.clone(),
            },
        );

        Ok(())
    }

    fn search(
        &self,
        vector: &Embedding,
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<ScoredHit>, StoreError> {
        self.check_dimensions(vector)?;

        let entries = self.entries.read().map_err(poisoned)?;

        let mut results: Vec<ScoredHit> = entries
            .iter()
            .filter_map(|(id, entry)| {
                let score = vector.cosine(&entry.embedding);
                if score >= score_threshold {
                    Some(ScoredHit {
                        id: *id,
                        payload: entry.payload.clone(),
                        score,
                    })
                } else {
                    None
                }
            })
            .collect();

        // Sort by score descending, ids break ties so results are reproducible
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });

        results.truncate(limit);

        Ok(results)
    }

    fn delete(&self, id: u64) -> Result<(), StoreError> {
        self.entries.write().map_err(poisoned)?.remove(&id);
        Ok(())
    }
}
