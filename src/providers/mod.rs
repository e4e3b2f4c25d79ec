//! Provider adapters and the fallback gateway.
//!
//! A [`ProviderAdapter`] offers some subset of {generate, search} plus a
//! cheap liveness probe and model listing. [`ProviderGateway`] holds the
//! adapters in priority order and, for each call, tries the adapters that
//! support the operation:
//!
//! 1. adapters whose probe reports unavailable are skipped;
//! 2. a transient failure or timeout is retried once after a backoff;
//! 3. any remaining failure falls back to the next adapter;
//! 4. when every adapter fails and the last failures were all transient
//!    the call returns [`ResearchError::TransientProvider`]; otherwise
//!    [`ResearchError::AllProvidersUnavailable`].
//!
//! Priority is kept per [`ProviderKind`], so promoting an adapter for
//! search leaves the model order untouched even when the adapter offers
//! both.
//!
//! Responses can be cached in the [`HybridStore`] under `cache:{sha256}`
//! keys with the response TTL.

pub mod ollama;
pub mod openai;
pub mod tavily;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{bail, Result as AnyResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use research_harness_core::models::SearchResult;

use crate::config::ProviderConfig;
use crate::error::{ProviderError, ResearchError, Result};
use crate::hybrid_store::HybridStore;

pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;
pub use tavily::TavilyAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Text generation.
    Model,
    /// Web search.
    Search,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Model => "model",
            ProviderKind::Search => "search",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "model" | "generate" | "llm" => Some(ProviderKind::Model),
            "search" | "web" => Some(ProviderKind::Search),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Overrides the adapter's configured model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub max_results: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { max_results: 5 }
    }
}

/// Text returned by one adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    pub tokens_used: u64,
}

/// Gateway-level generation result, tagged with the serving provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub tokens_used: u64,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub provider: String,
}

/// One pluggable backend.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, kind: ProviderKind) -> bool;

    async fn generate(
        &self,
        _prompt: &str,
        _opts: &GenerateOptions,
    ) -> Result<GenerateResponse, ProviderError> {
        Err(ProviderError::Unsupported)
    }

    async fn search(
        &self,
        _query: &str,
        _opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        Err(ProviderError::Unsupported)
    }

    /// Cheap liveness probe, consulted before every call.
    async fn is_available(&self) -> bool;

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub capabilities: Vec<ProviderKind>,
    pub available: bool,
    pub models: Vec<String>,
}

pub struct ProviderGateway {
    /// Declared order, used for listing.
    providers: Vec<Arc<dyn ProviderAdapter>>,
    /// Current call order per kind.
    priority: RwLock<HashMap<ProviderKind, Vec<Arc<dyn ProviderAdapter>>>>,
    cache: Option<Arc<HybridStore>>,
    response_ttl: Duration,
    retry_backoff: Duration,
    fallbacks: AtomicU64,
}

#[derive(Serialize)]
struct CacheKey<'a, T: Serialize> {
    op: &'a str,
    input: &'a str,
    opts: &'a T,
}

impl ProviderGateway {
    pub fn new(providers: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        let priority = [ProviderKind::Model, ProviderKind::Search]
            .into_iter()
            .map(|kind| {
                let order = providers.iter().filter(|p| p.supports(kind)).cloned().collect();
                (kind, order)
            })
            .collect();
        Self {
            providers,
            priority: RwLock::new(priority),
            cache: None,
            response_ttl: Duration::from_secs(300),
            retry_backoff: Duration::from_millis(500),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Cache successful responses in `store` for `ttl`.
    pub fn with_response_cache(mut self, store: Arc<HybridStore>, ttl: Duration) -> Self {
        self.cache = Some(store);
        self.response_ttl = ttl;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Number of calls served by a provider other than the first candidate.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Current priority order for `kind`.
    pub fn provider_names(&self, kind: ProviderKind) -> Vec<String> {
        self.candidates(kind)
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    fn candidates(&self, kind: ProviderKind) -> Vec<Arc<dyn ProviderAdapter>> {
        self.priority
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<Generation> {
        let cache_key = self.cache_key(ProviderKind::Model, prompt, opts);
        if let Some(hit) = self.cached::<Generation>(cache_key.as_deref()).await {
            return Ok(hit);
        }

        let generation = self
            .call_with_fallback(ProviderKind::Model, |p| {
                let prompt = prompt.to_string();
                let opts = opts.clone();
                async move { p.generate(&prompt, &opts).await }
            })
            .await
            .map(|(resp, provider)| Generation {
                text: resp.text,
                tokens_used: resp.tokens_used,
                provider,
            })?;

        self.store_cached(cache_key.as_deref(), &generation).await;
        Ok(generation)
    }

    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<SearchOutcome> {
        let cache_key = self.cache_key(ProviderKind::Search, query, opts);
        if let Some(hit) = self.cached::<SearchOutcome>(cache_key.as_deref()).await {
            return Ok(hit);
        }

        let outcome = self
            .call_with_fallback(ProviderKind::Search, |p| {
                let query = query.to_string();
                let opts = opts.clone();
                async move { p.search(&query, &opts).await }
            })
            .await
            .map(|(results, provider)| SearchOutcome { results, provider })?;

        self.store_cached(cache_key.as_deref(), &outcome).await;
        Ok(outcome)
    }

    async fn call_with_fallback<T, F, Fut>(&self, kind: ProviderKind, call: F) -> Result<(T, String)>
    where
        F: Fn(Arc<dyn ProviderAdapter>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let candidates = self.candidates(kind);
        let mut failures: Vec<String> = Vec::new();
        // Provider whose failure left the call retryable, if every attempted
        // provider since failed the same way.
        let mut transient: Option<String> = None;

        for (position, provider) in candidates.iter().enumerate() {
            let name = provider.name().to_string();
            if !provider.is_available().await {
                tracing::debug!(provider = %name, %kind, "skipping unavailable provider");
                failures.push(format!("{}: unavailable", name));
                continue;
            }

            let mut attempt = call(provider.clone()).await;
            if let Err(e) = &attempt {
                if e.is_retryable() {
                    tracing::debug!(provider = %name, error = %e, "retrying provider once");
                    tokio::time::sleep(self.retry_backoff).await;
                    attempt = call(provider.clone()).await;
                }
            }

            match attempt {
                Ok(value) => {
                    if position > 0 {
                        self.fallbacks.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            provider = %name,
                            %kind,
                            skipped = ?failures,
                            "served by fallback provider"
                        );
                    }
                    return Ok((value, name));
                }
                Err(e) => {
                    tracing::warn!(provider = %name, %kind, error = %e, "provider failed, falling back");
                    transient = e.is_retryable().then(|| name.clone());
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }

        if let Some(provider) = transient {
            return Err(ResearchError::TransientProvider {
                provider,
                message: format!("{} ({})", kind, failures.join("; ")),
            });
        }
        Err(ResearchError::AllProvidersUnavailable(if failures.is_empty() {
            format!("{} (no providers configured)", kind)
        } else {
            format!("{} ({})", kind, failures.join("; "))
        }))
    }

    fn cache_key<T: Serialize>(&self, kind: ProviderKind, input: &str, opts: &T) -> Option<String> {
        self.cache.as_ref()?;
        let names = self.provider_names(kind).join(",");
        let op = kind.as_str();
        serde_json::to_string(&CacheKey { op, input, opts })
            .ok()
            .map(|k| format!("{}|{}", names, k))
    }

    async fn cached<T: DeserializeOwned>(&self, key: Option<&str>) -> Option<T> {
        let (store, key) = (self.cache.as_ref()?, key?);
        match store.get_cached(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "response cache read failed");
                None
            }
        }
    }

    async fn store_cached<T: Serialize>(&self, key: Option<&str>, value: &T) {
        let (Some(store), Some(key)) = (self.cache.as_ref(), key) else {
            return;
        };
        let Ok(raw) = serde_json::to_string(value) else {
            return;
        };
        if let Err(e) = store.put_cached(key, &raw, self.response_ttl).await {
            tracing::warn!(error = %e, "response cache write failed");
        }
    }

    /// Move `name` to the front of `kind`'s priority list for subsequent
    /// calls. Other kinds keep their order.
    pub fn switch_default(&self, kind: ProviderKind, name: &str) -> Result<()> {
        let Some(adapter) = self.providers.iter().find(|p| p.name() == name) else {
            return Err(ResearchError::NotFound(format!("provider '{}'", name)));
        };
        if !adapter.supports(kind) {
            return Err(ResearchError::Validation(format!(
                "provider '{}' does not support {}",
                name, kind
            )));
        }
        let mut priority = self.priority.write().unwrap_or_else(PoisonError::into_inner);
        let order = priority.entry(kind).or_default();
        if let Some(pos) = order.iter().position(|p| p.name() == name) {
            let provider = order.remove(pos);
            order.insert(0, provider);
        }
        tracing::info!(provider = %name, %kind, "default provider switched");
        Ok(())
    }

    pub async fn list_providers(&self) -> Vec<ProviderInfo> {
        let mut out = Vec::new();
        for provider in &self.providers {
            let available = provider.is_available().await;
            let models = if available {
                provider.list_models().await.unwrap_or_default()
            } else {
                Vec::new()
            };
            out.push(ProviderInfo {
                name: provider.name().to_string(),
                capabilities: [ProviderKind::Model, ProviderKind::Search]
                    .into_iter()
                    .filter(|k| provider.supports(*k))
                    .collect(),
                available,
                models,
            });
        }
        out
    }
}

/// Map an HTTP status to a provider error: 429 and 5xx are transient.
pub(crate) fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> ProviderError {
    let message = format!("{} returned {}: {}", provider, status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

/// Classify a transport error. `timeout` is the limit the request ran under.
pub(crate) fn request_error(provider: &str, timeout: Duration, e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(timeout)
    } else if e.is_decode() {
        ProviderError::Permanent(format!("{}: malformed response: {}", provider, e))
    } else {
        ProviderError::Transient(format!("{}: {}", provider, e))
    }
}

pub(crate) fn http_client(timeout: Duration) -> AnyResult<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Build adapters from `[[providers]]`, preserving declared order.
pub fn create_providers(configs: &[ProviderConfig]) -> AnyResult<Vec<Arc<dyn ProviderAdapter>>> {
    let mut out: Vec<Arc<dyn ProviderAdapter>> = Vec::with_capacity(configs.len());
    for config in configs {
        let adapter: Arc<dyn ProviderAdapter> = match config.kind.as_str() {
            "openai" => Arc::new(OpenAiAdapter::from_config(config)?),
            "ollama" => Arc::new(OllamaAdapter::from_config(config)?),
            "tavily" => Arc::new(TavilyAdapter::from_config(config)?),
            other => bail!("Unknown provider type: {}", other),
        };
        out.push(adapter);
    }
    Ok(out)
}

/// Read an API key from `api_key_env`, or `default_env` when unset.
pub(crate) fn api_key(config: &ProviderConfig, default_env: &str) -> Option<String> {
    let var = config.api_key_env.as_deref().unwrap_or(default_env);
    std::env::var(var).ok().filter(|k| !k.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Flaky {
        name: &'static str,
        available: bool,
        failures_before_success: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProviderAdapter for Flaky {
        fn name(&self) -> &str {
            self.name
        }

        fn supports(&self, kind: ProviderKind) -> bool {
            kind == ProviderKind::Model
        }

        async fn generate(
            &self,
            prompt: &str,
            _opts: &GenerateOptions,
        ) -> Result<GenerateResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                return Err(ProviderError::Transient("503".into()));
            }
            Ok(GenerateResponse {
                text: format!("{}:{}", self.name, prompt),
                tokens_used: 3,
            })
        }

        async fn is_available(&self) -> bool {
            self.available
        }
    }

    fn flaky(name: &'static str, available: bool, failures: usize) -> Arc<Flaky> {
        Arc::new(Flaky {
            name,
            available,
            failures_before_success: failures,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let primary = flaky("primary", true, 1);
        let gateway = ProviderGateway::new(vec![primary.clone() as Arc<dyn ProviderAdapter>])
            .with_retry_backoff(Duration::from_millis(1));
        let out = gateway.generate("hi", &GenerateOptions::default()).await.unwrap();
        assert_eq!(out.provider, "primary");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
        assert_eq!(gateway.fallback_count(), 0);
    }

    #[tokio::test]
    async fn falls_back_after_retry_exhausted() {
        let primary = flaky("primary", true, 5);
        let backup = flaky("backup", true, 0);
        let gateway = ProviderGateway::new(vec![primary.clone() as Arc<dyn ProviderAdapter>, backup])
            .with_retry_backoff(Duration::from_millis(1));
        let out = gateway.generate("hi", &GenerateOptions::default()).await.unwrap();
        assert_eq!(out.provider, "backup");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
        assert_eq!(gateway.fallback_count(), 1);
    }

    #[tokio::test]
    async fn search_without_search_providers_is_unavailable() {
        let gateway = ProviderGateway::new(vec![flaky("m", true, 0) as Arc<dyn ProviderAdapter>]);
        let err = gateway
            .search("q", &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::AllProvidersUnavailable(_)));
    }

    #[test]
    fn switch_default_validates() {
        let gateway = ProviderGateway::new(vec![
            flaky("a", true, 0) as Arc<dyn ProviderAdapter>,
            flaky("b", true, 0),
        ]);
        gateway.switch_default(ProviderKind::Model, "b").unwrap();
        assert_eq!(gateway.provider_names(ProviderKind::Model), vec!["b", "a"]);
        assert!(matches!(
            gateway.switch_default(ProviderKind::Model, "zzz"),
            Err(ResearchError::NotFound(_))
        ));
        assert!(matches!(
            gateway.switch_default(ProviderKind::Search, "a"),
            Err(ResearchError::Validation(_))
        ));
    }

    struct Static {
        name: &'static str,
        kinds: &'static [ProviderKind],
    }

    #[async_trait]
    impl ProviderAdapter for Static {
        fn name(&self) -> &str {
            self.name
        }

        fn supports(&self, kind: ProviderKind) -> bool {
            self.kinds.contains(&kind)
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn switch_default_keeps_other_kind_order() {
        const BOTH: &[ProviderKind] = &[ProviderKind::Model, ProviderKind::Search];
        let gateway = ProviderGateway::new(vec![
            Arc::new(Static { name: "hybrid", kinds: BOTH }) as Arc<dyn ProviderAdapter>,
            Arc::new(Static { name: "llm", kinds: &[ProviderKind::Model] }),
            Arc::new(Static { name: "web", kinds: &[ProviderKind::Search] }),
        ]);

        gateway.switch_default(ProviderKind::Search, "web").unwrap();
        assert_eq!(gateway.provider_names(ProviderKind::Search), vec!["web", "hybrid"]);
        assert_eq!(gateway.provider_names(ProviderKind::Model), vec!["hybrid", "llm"]);

        gateway.switch_default(ProviderKind::Model, "llm").unwrap();
        assert_eq!(gateway.provider_names(ProviderKind::Model), vec!["llm", "hybrid"]);
        assert_eq!(gateway.provider_names(ProviderKind::Search), vec!["web", "hybrid"]);

        let listed: Vec<String> = gateway
            .list_providers()
            .await
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(listed, vec!["hybrid", "llm", "web"]);
    }

    #[tokio::test]
    async fn exhausted_transient_failures_surface_as_transient() {
        let primary = flaky("primary", true, 10);
        let gateway = ProviderGateway::new(vec![
            flaky("down", false, 0) as Arc<dyn ProviderAdapter>,
            primary.clone(),
        ])
        .with_retry_backoff(Duration::from_millis(1));

        let err = gateway
            .generate("hi", &GenerateOptions::default())
            .await
            .unwrap_err();
        match err {
            ResearchError::TransientProvider { provider, message } => {
                assert_eq!(provider, "primary");
                assert!(message.contains("down: unavailable"), "{}", message);
            }
            other => panic!("expected TransientProvider, got {:?}", other),
        }
        assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn request_timeout_reports_client_limit() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let limit = Duration::from_millis(100);
        let client = http_client(limit).unwrap();
        let err = client
            .get(format!("http://{}/slow", addr))
            .send()
            .await
            .unwrap_err();
        let classified = request_error("slow", limit, err);
        assert!(matches!(classified, ProviderError::Timeout(d) if d == limit));
        assert_eq!(classified.to_string(), "timed out after 100ms");
    }

    #[test]
    fn status_classification() {
        assert!(status_error("x", reqwest::StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(status_error("x", reqwest::StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(!status_error("x", reqwest::StatusCode::UNAUTHORIZED, "").is_retryable());
    }

    #[test]
    fn kind_parse() {
        assert_eq!(ProviderKind::parse("model"), Some(ProviderKind::Model));
        assert_eq!(ProviderKind::parse("search"), Some(ProviderKind::Search));
        assert_eq!(ProviderKind::parse("x"), None);
    }
}
