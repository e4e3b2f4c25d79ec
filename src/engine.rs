//! The engine facade: one object that owns the store, gateway, retriever,
//! and coordinator, and exposes the operations the CLI and HTTP server call.
//!
//! [`ResearchEngine::from_config`] wires the SQLite backends;
//! [`EngineBuilder`] lets tests and embedders supply their own indexes,
//! durable store, and provider adapters.

use std::sync::{Arc, Weak};
use std::time::Duration;

use research_harness_core::embedding::Embedder;
use research_harness_core::index::memory::{InMemoryIndex, MemoryDurableStore};
use research_harness_core::index::{CodeIndex, DurableStore, VectorIndex};
use research_harness_core::models::{Report, RetrievalResult, TaskOptions};
use research_harness_core::task::TaskStatus;

use crate::config::Config;
use crate::coordinator::TaskCoordinator;
use crate::error::{ResearchError, Result};
use crate::hybrid_store::HybridStore;
use crate::providers::{create_providers, ProviderAdapter, ProviderGateway, ProviderInfo, ProviderKind};
use crate::retriever::{ContextRetriever, RetrievalOptions};
use crate::sqlite_store::{SqliteDurableStore, SqliteIndex};

pub struct ResearchEngine {
    config: Config,
    store: Arc<HybridStore>,
    gateway: Arc<ProviderGateway>,
    retriever: Arc<ContextRetriever>,
    coordinator: TaskCoordinator,
}

impl ResearchEngine {
    /// Open the configured database (running migrations) and build the
    /// engine on top of it.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let pool = crate::db::connect(&config).await?;
        crate::migrate::migrate_pool(&pool).await?;

        let index = Arc::new(SqliteIndex::new(pool.clone()));
        let embedder = crate::embedding::create_embedder(&config.embedding)?;
        let providers = create_providers(&config.providers)?;

        let engine = EngineBuilder::new(config)
            .durable(Arc::new(SqliteDurableStore::new(pool)))
            .indexes(index.clone(), index)
            .embedder(embedder)
            .providers(providers)
            .build();
        if let Err(e) = engine.store.sweep_expired_cached().await {
            tracing::warn!(error = %e, "cache sweep on open failed");
        }
        Ok(engine)
    }

    /// Periodically delete expired response envelopes from the durable
    /// store. `None` when `cache.sweep_interval_secs` is 0.
    pub fn spawn_cache_sweeper(&self) -> Option<tokio::task::JoinHandle<()>> {
        let secs = self.config.cache.sweep_interval_secs;
        if secs == 0 {
            return None;
        }
        let store: Weak<HybridStore> = Arc::downgrade(&self.store);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    return;
                };
                store.evict_expired();
                if let Err(e) = store.sweep_expired_cached().await {
                    tracing::warn!(error = %e, "cache sweep failed");
                }
            }
        }))
    }

    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<HybridStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<ProviderGateway> {
        &self.gateway
    }

    pub fn coordinator(&self) -> &TaskCoordinator {
        &self.coordinator
    }

    pub async fn start_task(&self, query: &str, options: TaskOptions) -> Result<String> {
        self.coordinator.start(query, options).await
    }

    pub async fn get_status(&self, task_id: &str) -> Result<TaskStatus> {
        self.coordinator.status(task_id).await
    }

    pub async fn get_result(&self, task_id: &str) -> Result<Report> {
        self.coordinator.result(task_id).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        self.coordinator.cancel(task_id).await
    }

    pub fn list_tasks(&self) -> Vec<TaskStatus> {
        self.coordinator.list_tasks()
    }

    /// Ranked context chunks for prompt construction. `k` defaults to
    /// `retrieval.default_k`. An unreachable index degrades to an empty
    /// result rather than an error.
    pub async fn get_context(
        &self,
        query: &str,
        repository_id: &str,
        k: Option<usize>,
        opts: RetrievalOptions,
    ) -> Result<RetrievalResult> {
        if repository_id.trim().is_empty() {
            return Err(ResearchError::Validation(
                "repository_id must not be empty".into(),
            ));
        }
        let k = k.unwrap_or_else(|| self.retriever.default_k());
        Ok(self
            .retriever
            .retrieve_or_empty(query, repository_id, k, opts)
            .await)
    }

    /// Make `name` the first provider tried for `kind` ("model" or "search").
    pub fn switch_provider(&self, kind: &str, name: &str) -> Result<()> {
        let kind = ProviderKind::parse(kind).ok_or_else(|| {
            ResearchError::Validation(format!(
                "unknown provider kind '{}', expected model or search",
                kind
            ))
        })?;
        self.gateway.switch_default(kind, name)
    }

    pub async fn list_providers(&self) -> Vec<ProviderInfo> {
        self.gateway.list_providers().await
    }
}

/// Assembles a [`ResearchEngine`]. Unset parts default to in-memory
/// backends and no providers.
pub struct EngineBuilder {
    config: Config,
    durable: Option<Arc<dyn DurableStore>>,
    vector: Option<Arc<dyn VectorIndex>>,
    code: Option<Arc<dyn CodeIndex>>,
    embedder: Option<Arc<dyn Embedder>>,
    providers: Vec<Arc<dyn ProviderAdapter>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            durable: None,
            vector: None,
            code: None,
            embedder: None,
            providers: Vec::new(),
        }
    }

    pub fn durable(mut self, durable: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn indexes(mut self, vector: Arc<dyn VectorIndex>, code: Arc<dyn CodeIndex>) -> Self {
        self.vector = Some(vector);
        self.code = Some(code);
        self
    }

    pub fn embedder(mut self, embedder: Option<Arc<dyn Embedder>>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn providers(mut self, providers: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        self.providers = providers;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn ProviderAdapter>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn build(self) -> ResearchEngine {
        let config = self.config;
        let durable = self
            .durable
            .unwrap_or_else(|| Arc::new(MemoryDurableStore::new()));
        let (vector, code) = match (self.vector, self.code) {
            (Some(v), Some(c)) => (v, c),
            _ => {
                let index = Arc::new(InMemoryIndex::new());
                (index.clone() as Arc<dyn VectorIndex>, index as Arc<dyn CodeIndex>)
            }
        };

        let task_ttl = Duration::from_secs(config.cache.task_ttl_secs);
        let store = Arc::new(HybridStore::new(
            durable,
            task_ttl,
            config.cache.max_entries,
        ));

        let mut gateway = ProviderGateway::new(self.providers)
            .with_retry_backoff(config.research.retry_backoff());
        if config.cache.response_ttl_secs > 0 {
            gateway = gateway.with_response_cache(
                store.clone(),
                Duration::from_secs(config.cache.response_ttl_secs),
            );
        }
        let gateway = Arc::new(gateway);

        let retriever = Arc::new(
            ContextRetriever::new(vector, code)
                .with_config(&config.retrieval)
                .with_embedder(self.embedder)
                .with_cache(
                    store.clone(),
                    Duration::from_secs(config.retrieval.cache_ttl_secs),
                ),
        );

        let coordinator = TaskCoordinator::new(
            store.clone(),
            gateway.clone(),
            retriever.clone(),
            config.research.clone(),
            task_ttl,
        );

        ResearchEngine {
            config,
            store,
            gateway,
            retriever,
            coordinator,
        }
    }
}
