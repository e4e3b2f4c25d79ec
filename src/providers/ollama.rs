//! Local Ollama adapter.
//!
//! `GET /api/tags` doubles as the liveness probe and the model listing.

use std::time::Duration;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde::Deserialize;

use super::{
    http_client, request_error, status_error, GenerateOptions, GenerateResponse, ProviderAdapter,
    ProviderKind,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.1";
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct OllamaAdapter {
    name: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Deserialize)]
struct GenerateBody {
    response: String,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Deserialize)]
struct TagsBody {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

impl OllamaAdapter {
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
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            client: http_client(timeout)?,
            timeout,
        })
    }

    async fn tags(&self, timeout: Duration) -> Result<TagsBody, ProviderError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(&self.name, timeout, e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(&self.name, status, &text));
        }
        response
            .json()
            .await
            .map_err(|e| request_error(&self.name, timeout, e))
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, kind: ProviderKind) -> bool {
        kind == ProviderKind::Model
    }

    async fn generate(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> Result<GenerateResponse, ProviderError> {
        let mut options = serde_json::Map::new();
        if let Some(t) = opts.temperature {
            options.insert("temperature".into(), t.into());
        }
        if let Some(n) = opts.max_tokens {
            options.insert("num_predict".into(), n.into());
        }
        let mut body = serde_json::json!({
            "model": opts.model.as_deref().unwrap_or(&self.model),
            "prompt": prompt,
            "stream": false,
            "options": options,
        });
        if let Some(system) = &opts.system {
            body["system"] = system.as_str().into();
        }

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(&self.name, self.timeout, e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(&self.name, status, &text));
        }
        let parsed: GenerateBody = response
            .json()
            .await
            .map_err(|e| request_error(&self.name, self.timeout, e))?;
        Ok(GenerateResponse {
            text: parsed.response,
            tokens_used: parsed.prompt_eval_count + parsed.eval_count,
        })
    }

    async fn is_available(&self) -> bool {
        match self.tags(PROBE_TIMEOUT).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(provider = %self.name, error = %e, "ollama probe failed");
                false
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self
            .tags(self.timeout)
            .await?
            .models
            .into_iter()
            .map(|m| m.name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        let adapter = OllamaAdapter::from_config(&ProviderConfig {
            name: "local".into(),
            kind: "ollama".into(),
            // Port 9 (discard) is closed on test hosts.
            base_url: Some("http://127.0.0.1:9".into()),
            model: None,
            api_key_env: None,
            timeout_secs: 1,
        })
        .unwrap();
        assert!(!adapter.is_available().await);
        assert!(adapter.list_models().await.is_err());
    }

    #[test]
    fn parses_generate_body() {
        let body: GenerateBody =
            serde_json::from_str(r#"{"response":"ok","done":true,"eval_count":4}"#).unwrap();
        assert_eq!(body.response, "ok");
        assert_eq!(body.prompt_eval_count + body.eval_count, 4);
    }
}
