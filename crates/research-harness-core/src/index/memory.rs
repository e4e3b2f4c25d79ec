//! In-memory index and durable-store implementations for tests and
//! embedded use.
//!
//! [`InMemoryIndex`] implements both [`VectorIndex`] (brute-force cosine
//! over stored vectors, term overlap for text queries) and [`CodeIndex`]
//! (term-count matching). Every write bumps the repository's generation.
//! [`MemoryDurableStore`] is a `BTreeMap` behind a lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::{chunk_key, CodeIndex, DurableStore, IndexFilter, VectorIndex, VectorQuery};
use crate::embedding::cosine_similarity;
use crate::models::ContextChunk;
use crate::rank::{keyword_overlap, tokenize, Candidate};

struct StoredChunk {
    key: String,
    chunk: ContextChunk,
    vector: Option<Vec<f32>>,
}

/// In-memory chunk index. Insertion order is preserved for equal scores.
pub struct InMemoryIndex {
    chunks: RwLock<Vec<StoredChunk>>,
    generations: RwLock<HashMap<String, u64>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
            generations: RwLock::new(HashMap::new()),
        }
    }

    fn bump(&self, repository_id: &str) {
        *self
            .generations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(repository_id.to_string())
            .or_insert(0) += 1;
    }

    fn current_generation(&self, repository_id: &str) -> u64 {
        self.generations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(repository_id)
            .copied()
            .unwrap_or(0)
    }

    /// Insert or replace chunks by `chunk:{repo}:{id}` key.
    ///
    /// `vectors`, when given, must be parallel to `chunks`.
    pub fn upsert(&self, chunks: Vec<ContextChunk>, vectors: Option<Vec<Vec<f32>>>) -> Result<()> {
        if let Some(v) = &vectors {
            if v.len() != chunks.len() {
                bail!(
                    "vector count {} does not match chunk count {}",
                    v.len(),
                    chunks.len()
                );
            }
        }
        let mut vectors = vectors.map(|v| v.into_iter());
        let mut touched: Vec<String> = Vec::new();
        let mut stored = self.chunks.write().unwrap_or_else(PoisonError::into_inner);
        for chunk in chunks {
            if !touched.contains(&chunk.metadata.repository_id) {
                touched.push(chunk.metadata.repository_id.clone());
            }
            let key = chunk_key(&chunk.metadata.repository_id, &chunk.id);
            let vector = vectors.as_mut().and_then(|it| it.next());
            match stored.iter_mut().find(|s| s.key == key) {
                Some(slot) => {
                    slot.chunk = chunk;
                    slot.vector = vector;
                }
                None => stored.push(StoredChunk { key, chunk, vector }),
            }
        }
        drop(stored);
        for repository_id in &touched {
            self.bump(repository_id);
        }
        Ok(())
    }

    /// Drop every chunk of `repository_id`.
    pub fn remove_repository(&self, repository_id: &str) {
        self.chunks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.chunk.metadata.repository_id != repository_id);
        self.bump(repository_id);
    }

    pub fn len(&self) -> usize {
        self.chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn scan<F>(&self, filter: &IndexFilter, limit: usize, score: F) -> Vec<Candidate>
    where
        F: Fn(&StoredChunk) -> Option<f64>,
    {
        let stored = self.chunks.read().unwrap_or_else(PoisonError::into_inner);
        let mut candidates: Vec<Candidate> = stored
            .iter()
            .filter(|s| filter.matches(&s.chunk.metadata.repository_id, s.chunk.source_type))
            .filter_map(|s| {
                score(s).map(|raw_score| Candidate {
                    chunk: s.chunk.clone(),
                    raw_score,
                })
            })
            .collect();
        // Stable sort keeps insertion order among equal scores.
        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(limit);
        candidates
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn query(
        &self,
        query: VectorQuery<'_>,
        filter: &IndexFilter,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        Ok(match query {
            VectorQuery::Embedding(qv) => self.scan(filter, limit, |s| {
                s.vector
                    .as_ref()
                    .map(|v| cosine_similarity(qv, v) as f64)
            }),
            VectorQuery::Text(text) => {
                let terms = tokenize(text);
                self.scan(filter, limit, |s| {
                    let overlap = keyword_overlap(&terms, &s.chunk.content);
                    (overlap > 0.0).then_some(overlap)
                })
            }
        })
    }

    async fn generation(&self, repository_id: &str) -> Result<Option<u64>> {
        Ok(Some(self.current_generation(repository_id)))
    }
}

#[async_trait]
impl CodeIndex for InMemoryIndex {
    async fn query(
        &self,
        text: &str,
        filter: &IndexFilter,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let terms: Vec<String> = tokenize(text);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.scan(filter, limit, |s| {
            let content = s.chunk.content.to_lowercase();
            let matches = terms.iter().filter(|t| content.contains(t.as_str())).count();
            (matches > 0).then_some(matches as f64)
        }))
    }

    async fn generation(&self, repository_id: &str) -> Result<Option<u64>> {
        Ok(Some(self.current_generation(repository_id)))
    }
}

/// `BTreeMap`-backed [`DurableStore`].
#[derive(Default)]
pub struct MemoryDurableStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
