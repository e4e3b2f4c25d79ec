//! Tavily web search adapter.

use std::time::Duration;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde::Deserialize;

use research_harness_core::models::SearchResult;

use super::{
    api_key, http_client, request_error, status_error, ProviderAdapter, ProviderKind, SearchOptions,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

const DEFAULT_BASE_URL: &str = "https://api.tavily.com";

pub struct TavilyAdapter {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: f64,
}

impl TavilyAdapter {
    pub fn from_config(config: &ProviderConfig) -> AnyResult<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self {
            name: config.name.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key(config, "TAVILY_API_KEY"),
            client: http_client(timeout)?,
            timeout,
        })
    }
}

#[async_trait]
impl ProviderAdapter for TavilyAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, kind: ProviderKind) -> bool {
        kind == ProviderKind::Search
    }

    async fn search(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>, ProviderError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Permanent(format!("{}: API key not set", self.name)))?;
        let body = serde_json::json!({
            "api_key": key,
            "query": query,
            "max_results": opts.max_results,
            "include_answer": false,
        });

        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(&self.name, self.timeout, e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(&self.name, status, &text));
        }

        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|e| request_error(&self.name, self.timeout, e))?;
        Ok(parsed
            .results
            .into_iter()
            .filter(|r| !r.url.trim().is_empty())
            .map(|r| SearchResult {
                title: r.title,
                url: r.url,
                content: r.content,
                score: r.score,
            })
            .collect())
    }

    async fn is_available(&self) -> bool {
        self.api_key.is_some()
    }
}
