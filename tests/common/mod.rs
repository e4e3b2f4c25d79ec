#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use research_harness::config::Config;
use research_harness::engine::ResearchEngine;
use research_harness::error::ProviderError;
use research_harness::providers::{
    GenerateOptions, GenerateResponse, ProviderAdapter, ProviderKind, SearchOptions,
};
use research_harness_core::models::SearchResult;
use research_harness_core::task::TaskStatus;

/// Marker that makes [`ScriptedSearch`] fail a query permanently.
pub const FAIL: &str = "FAIL";

/// Marker that makes [`ScriptedSearch`] sleep its delay before answering.
pub const SLOW: &str = "SLOW";

/// Config tuned for fast tests: short backoff and grace, no response
/// caching. Retrieval caching keeps its default.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.research.retry_backoff_ms = 5;
    config.research.cancel_grace_secs = 1;
    config.cache.response_ttl_secs = 0;
    config
}

/// Model adapter that answers planning prompts with a fixed plan,
/// reformulation prompts with `"<query> refined"`, and anything else
/// with a short report citing `[1]`.
pub struct ScriptedModel {
    pub name: String,
    pub plan: Vec<String>,
    pub calls: AtomicUsize,
    pub available: bool,
}

impl ScriptedModel {
    pub fn new(name: &str, plan: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            plan: plan.iter().map(|s| s.to_string()).collect(),
            calls: AtomicUsize::new(0),
            available: true,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, kind: ProviderKind) -> bool {
        kind == ProviderKind::Model
    }

    async fn generate(
        &self,
        prompt: &str,
        _opts: &GenerateOptions,
    ) -> Result<GenerateResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = if prompt.starts_with("Break the research question") {
            serde_json::to_string(&self.plan).unwrap()
        } else if let Some(rest) = prompt.split("Query: ").nth(1) {
            format!("{} refined", rest.trim())
        } else {
            "## Findings\n\nThe evidence points one way [1].".to_string()
        };
        Ok(GenerateResponse {
            text,
            tokens_used: 10,
        })
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec![format!("{}-large", self.name)])
    }
}

/// Search adapter returning `per_query` hits per query. Queries
/// containing [`FAIL`] fail permanently; queries containing [`SLOW`]
/// wait `delay` first.
pub struct ScriptedSearch {
    pub name: String,
    pub per_query: usize,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedSearch {
    pub fn new(name: &str, per_query: usize) -> Arc<Self> {
        Self::slow(name, per_query, Duration::ZERO)
    }

    pub fn slow(name: &str, per_query: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            per_query,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedSearch {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, kind: ProviderKind) -> bool {
        kind == ProviderKind::Search
    }

    async fn search(
        &self,
        query: &str,
        _opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if query.contains(SLOW) {
            tokio::time::sleep(self.delay).await;
        }
        if query.contains(FAIL) {
            return Err(ProviderError::Permanent(format!("rejected: {}", query)));
        }
        let slug: String = query
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        Ok((0..self.per_query)
            .map(|i| SearchResult {
                title: format!("{} result {}", query, i),
                url: format!("https://example.com/{}/{}", slug, i),
                content: format!("Notes on {} from source {}.", query, i),
                score: 0.9 - i as f64 * 0.1,
            })
            .collect())
    }

    async fn is_available(&self) -> bool {
        true
    }
}

/// An adapter whose liveness probe always fails.
pub struct Unavailable(pub &'static str);

#[async_trait]
impl ProviderAdapter for Unavailable {
    fn name(&self) -> &str {
        self.0
    }

    fn supports(&self, _kind: ProviderKind) -> bool {
        true
    }

    async fn generate(
        &self,
        _prompt: &str,
        _opts: &GenerateOptions,
    ) -> Result<GenerateResponse, ProviderError> {
        panic!("unavailable provider must not be called")
    }

    async fn search(
        &self,
        _query: &str,
        _opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        panic!("unavailable provider must not be called")
    }

    async fn is_available(&self) -> bool {
        false
    }
}

/// Poll until the task reaches a terminal stage, asserting that progress
/// never goes backwards.
pub async fn wait_terminal(engine: &ResearchEngine, task_id: &str) -> TaskStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    let mut last_progress = 0u8;
    loop {
        let status = engine.get_status(task_id).await.unwrap();
        assert!(
            status.progress >= last_progress,
            "progress regressed from {} to {}",
            last_progress,
            status.progress
        );
        last_progress = status.progress;
        if status.stage.is_terminal() {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {} stuck in {}",
            task_id,
            status.stage
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
