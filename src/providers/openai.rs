//! OpenAI-compatible chat completions adapter.
//!
//! Works against any server exposing `POST {base}/chat/completions` and
//! `GET {base}/models`. Availability is the presence of an API key; the
//! key is read from `api_key_env` (default `OPENAI_API_KEY`).

use std::time::Duration;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde::Deserialize;

use super::{
    api_key, http_client, request_error, status_error, GenerateOptions, GenerateResponse, ProviderAdapter,
    ProviderKind,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiAdapter {
    name: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

impl OpenAiAdapter {
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
            api_key: api_key(config, "OPENAI_API_KEY"),
            client: http_client(timeout)?,
            timeout,
        })
    }

    fn key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Permanent(format!("{}: API key not set", self.name)))
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
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
        let mut messages = Vec::new();
        if let Some(system) = &opts.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": prompt}));

        let mut body = serde_json::json!({
            "model": opts.model.as_deref().unwrap_or(&self.model),
            "messages": messages,
        });
        if let Some(max_tokens) = opts.max_tokens {
            body["max_tokens"] = max_tokens.into();
        }
        if let Some(temperature) = opts.temperature {
            body["temperature"] = temperature.into();
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.key()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(&self.name, self.timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(&self.name, status, &text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| request_error(&self.name, self.timeout, e))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Permanent(format!("{}: empty completion", self.name)))?;
        Ok(GenerateResponse {
            text,
            tokens_used: parsed.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }

    async fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(self.key()?)
            .send()
            .await
            .map_err(|e| request_error(&self.name, self.timeout, e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(&self.name, status, &text));
        }
        let list: ModelList = response
            .json()
            .await
            .map_err(|e| request_error(&self.name, self.timeout, e))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            name: "remote".into(),
            kind: "openai".into(),
            base_url: base_url.map(String::from),
            model: None,
            api_key_env: Some("RH_TEST_OPENAI_KEY_UNSET".into()),
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn missing_key_means_unavailable() {
        let adapter = OpenAiAdapter::from_config(&config(Some("http://localhost:1/v1/"))).unwrap();
        assert_eq!(adapter.base_url, "http://localhost:1/v1");
        assert_eq!(adapter.model, DEFAULT_MODEL);
        assert!(!adapter.is_available().await);
        assert!(adapter.supports(ProviderKind::Model));
        assert!(!adapter.supports(ProviderKind::Search));
    }

    #[test]
    fn parses_chat_response() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"hello"}}],"usage":{"total_tokens":12}}"#,
        )
        .unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(parsed.usage.unwrap().total_tokens, 12);
    }
}
