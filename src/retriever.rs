//! Hybrid context retrieval over the documentation and code indexes.
//!
//! # Pipeline
//!
//! ```text
//! query ─┬─ useDocs → VectorIndex (repo, documentation) ─┐
//!        └─ useCode → CodeIndex   (repo, code)          ─┴→ rank → top-k
//! ```
//!
//! Both index queries run concurrently. When an embedder is configured
//! the query is embedded for the vector index; otherwise (or when the
//! embedding call fails) the raw text is passed instead. Ranking is
//! delegated to [`research_harness_core::rank`].
//!
//! # Failure semantics
//!
//! | Situation | Result |
//! |-----------|--------|
//! | blank query, `k = 0`, or both flags off | empty result |
//! | no chunks for the repository | empty result |
//! | one requested index unreachable | partial result, `degraded = true` |
//! | every requested index unreachable | [`ResearchError::RetrievalUnavailable`] |
//!
//! # Caching
//!
//! Results are cached in the store's in-memory tier only, never in the
//! durable store. The key carries both indexes' generation for the
//! repository, so any write to the repository's chunks makes earlier
//! entries unreachable. Indexes that do not report a generation are never
//! cached.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use research_harness_core::embedding::Embedder;
use research_harness_core::index::{CodeIndex, IndexFilter, VectorIndex, VectorQuery};
use research_harness_core::models::{RetrievalResult, SourceType};
use research_harness_core::rank::{build_result, rank_candidates, Candidate, RankParams};

use crate::config::RetrievalConfig;
use crate::error::{ResearchError, Result};
use crate::hybrid_store::HybridStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalOptions {
    #[serde(default = "default_true")]
    pub use_docs: bool,
    #[serde(default = "default_true")]
    pub use_code: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            use_docs: true,
            use_code: true,
        }
    }
}

pub struct ContextRetriever {
    vector: Arc<dyn VectorIndex>,
    code: Arc<dyn CodeIndex>,
    embedder: Option<Arc<dyn Embedder>>,
    params: RankParams,
    candidate_k: usize,
    default_k: usize,
    cache: Option<(Arc<HybridStore>, Duration)>,
}

impl ContextRetriever {
    pub fn new(vector: Arc<dyn VectorIndex>, code: Arc<dyn CodeIndex>) -> Self {
        let defaults = RetrievalConfig::default();
        Self {
            vector,
            code,
            embedder: None,
            params: RankParams::default(),
            candidate_k: defaults.candidate_k,
            default_k: defaults.default_k,
            cache: None,
        }
    }

    pub fn with_config(mut self, config: &RetrievalConfig) -> Self {
        self.params = RankParams {
            semantic_weight: config.semantic_weight,
        };
        self.candidate_k = config.candidate_k.max(1);
        self.default_k = config.default_k;
        self
    }

    pub fn with_embedder(mut self, embedder: Option<Arc<dyn Embedder>>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Cache results in `store`'s memory tier for `ttl`. A zero TTL
    /// disables caching.
    pub fn with_cache(mut self, store: Arc<HybridStore>, ttl: Duration) -> Self {
        self.cache = (!ttl.is_zero()).then_some((store, ttl));
        self
    }

    pub fn default_k(&self) -> usize {
        self.default_k
    }

    pub async fn retrieve(
        &self,
        query: &str,
        repository_id: &str,
        k: usize,
        opts: RetrievalOptions,
    ) -> Result<RetrievalResult> {
        let query = query.trim();
        if query.is_empty() || k == 0 || !(opts.use_docs || opts.use_code) {
            return Ok(RetrievalResult::empty(query, repository_id));
        }

        let cache_key = self.cache_key(query, repository_id, k, opts).await;
        if let Some(hit) = cache_key.as_deref().and_then(|key| self.cached(key)) {
            return Ok(hit);
        }

        let (docs, code) = tokio::join!(
            self.query_docs(query, repository_id, opts.use_docs),
            self.query_code(query, repository_id, opts.use_code),
        );

        let mut failures = Vec::new();
        let docs = match docs {
            Ok(c) => c,
            Err(e) => {
                failures.push(format!("vector index: {:#}", e));
                Vec::new()
            }
        };
        let code = match code {
            Ok(c) => c,
            Err(e) => {
                failures.push(format!("code index: {:#}", e));
                Vec::new()
            }
        };

        let requested = usize::from(opts.use_docs) + usize::from(opts.use_code);
        if failures.len() == requested {
            return Err(ResearchError::RetrievalUnavailable(failures.join("; ")));
        }
        let degraded = !failures.is_empty();
        if degraded {
            tracing::warn!(
                repository_id,
                failures = ?failures,
                "context retrieval degraded"
            );
        }

        let ranked = rank_candidates(query, &docs, &code, k, &self.params);
        let result = build_result(query, repository_id, ranked, degraded);
        if let (false, Some(key)) = (degraded, cache_key.as_deref()) {
            self.store_cached(key, &result);
        }
        Ok(result)
    }

    /// Like [`ContextRetriever::retrieve`], but an unreachable backend
    /// yields an empty, degraded result instead of an error.
    pub async fn retrieve_or_empty(
        &self,
        query: &str,
        repository_id: &str,
        k: usize,
        opts: RetrievalOptions,
    ) -> RetrievalResult {
        match self.retrieve(query, repository_id, k, opts).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(repository_id, error = %e, "treating retrieval failure as empty context");
                RetrievalResult {
                    degraded: true,
                    ..RetrievalResult::empty(query, repository_id)
                }
            }
        }
    }

    async fn query_docs(
        &self,
        query: &str,
        repository_id: &str,
        enabled: bool,
    ) -> anyhow::Result<Vec<Candidate>> {
        if !enabled {
            return Ok(Vec::new());
        }
        let filter = IndexFilter::new(repository_id, Some(SourceType::Documentation));
        let embedding = match &self.embedder {
            Some(embedder) => match embedder.embed_query(query).await {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(error = %e, "query embedding failed, using text query");
                    None
                }
            },
            None => None,
        };
        let vq = match &embedding {
            Some(v) => VectorQuery::Embedding(v),
            None => VectorQuery::Text(query),
        };
        self.vector.query(vq, &filter, self.candidate_k).await
    }

    async fn query_code(
        &self,
        query: &str,
        repository_id: &str,
        enabled: bool,
    ) -> anyhow::Result<Vec<Candidate>> {
        if !enabled {
            return Ok(Vec::new());
        }
        let filter = IndexFilter::new(repository_id, Some(SourceType::Code));
        self.code.query(query, &filter, self.candidate_k).await
    }

    /// `None` when caching is off or either index cannot say whether the
    /// repository changed.
    async fn cache_key(
        &self,
        query: &str,
        repository_id: &str,
        k: usize,
        opts: RetrievalOptions,
    ) -> Option<String> {
        self.cache.as_ref()?;
        let (docs, code) = tokio::join!(
            self.vector.generation(repository_id),
            self.code.generation(repository_id),
        );
        let (Ok(Some(docs)), Ok(Some(code))) = (docs, code) else {
            return None;
        };
        Some(format!(
            "retrieval:{}:{}.{}|{}|{}|{}|{}",
            repository_id, docs, code, k, opts.use_docs, opts.use_code, query
        ))
    }

    fn cached(&self, key: &str) -> Option<RetrievalResult> {
        let (store, _) = self.cache.as_ref()?;
        serde_json::from_str(&store.recall(key)?).ok()
    }

    fn store_cached(&self, key: &str, result: &RetrievalResult) {
        let Some((store, ttl)) = &self.cache else {
            return;
        };
        match serde_json::to_string(result) {
            Ok(raw) => store.remember(key, raw, *ttl),
            Err(e) => tracing::debug!(error = %e, "retrieval result not serializable"),
        }
    }
}
