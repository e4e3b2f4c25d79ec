//! Index and persistence abstractions.
//!
//! The retrieval pipeline reads from two indexes and the engine persists
//! state through one key/value store:
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`VectorIndex`] | Semantic lookup over documentation chunks |
//! | [`CodeIndex`] | Text lookup over code chunks |
//! | [`DurableStore`] | Backing half of the hybrid cache |
//!
//! Implementations must be `Send + Sync`. An `Err` from an index means the
//! backend is unreachable; "no data for this repository" is an empty `Ok`.
//!
//! Persisted key layout:
//!
//! ```text
//! task:{id}                  task snapshot JSON
//! chunk:{repoId}:{chunkId}   chunk record
//! cache:{sha256(key)}        {value, expires_at}
//! ```

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::SourceType;
use crate::rank::Candidate;

/// Key for a persisted task snapshot.
pub fn task_key(task_id: &str) -> String {
    format!("task:{}", task_id)
}

/// Key for a persisted chunk record.
pub fn chunk_key(repository_id: &str, chunk_id: &str) -> String {
    format!("chunk:{}:{}", repository_id, chunk_id)
}

/// Scope applied to every index query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFilter {
    pub repository_id: String,
    pub source_type: Option<SourceType>,
}

impl IndexFilter {
    pub fn new(repository_id: &str, source_type: Option<SourceType>) -> Self {
        Self {
            repository_id: repository_id.to_string(),
            source_type,
        }
    }

    pub fn matches(&self, repository_id: &str, source_type: SourceType) -> bool {
        self.repository_id == repository_id
            && self.source_type.map_or(true, |t| t == source_type)
    }
}

/// Query input for [`VectorIndex`]: a precomputed embedding or raw text.
#[derive(Debug, Clone, Copy)]
pub enum VectorQuery<'a> {
    Embedding(&'a [f32]),
    Text(&'a str),
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Up to `limit` candidates, best first.
    async fn query(
        &self,
        query: VectorQuery<'_>,
        filter: &IndexFilter,
        limit: usize,
    ) -> Result<Vec<Candidate>>;

    /// Counter that moves whenever `repository_id`'s chunks change.
    /// `None` means changes are not tracked and results must not be cached.
    async fn generation(&self, _repository_id: &str) -> Result<Option<u64>> {
        Ok(None)
    }
}

#[async_trait]
pub trait CodeIndex: Send + Sync {
    /// Up to `limit` text-matching candidates, best first.
    async fn query(&self, text: &str, filter: &IndexFilter, limit: usize)
        -> Result<Vec<Candidate>>;

    /// See [`VectorIndex::generation`].
    async fn generation(&self, _repository_id: &str) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// Durable key/value storage. Writes are single-key atomic, last writer wins.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>>;

    async fn write(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, in ascending order.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}
