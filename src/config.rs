//! TOML configuration.
//!
//! Every section has serde defaults, so an empty file is a valid config.
//! [`load_config`] parses and validates; [`Config::validate`] can be
//! called on configs built in code.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/research.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Cache lifetime of task snapshots.
    #[serde(default = "default_task_ttl")]
    pub task_ttl_secs: u64,
    /// Lifetime of cached provider responses.
    #[serde(default = "default_response_ttl")]
    pub response_ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// How often `rh serve` deletes expired response envelopes. 0 disables.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            task_ttl_secs: default_task_ttl(),
            response_ttl_secs: default_response_ttl(),
            max_entries: default_max_entries(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_task_ttl() -> u64 {
    3600
}
fn default_response_ttl() -> u64 {
    300
}
fn default_max_entries() -> usize {
    10_000
}
fn default_sweep_interval() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// `combined = w·semantic + (1-w)·keyword`.
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    /// Candidates fetched from each index before ranking.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_k")]
    pub default_k: usize,
    /// Lifetime of cached retrieval results; `0` disables caching.
    #[serde(default = "default_retrieval_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            semantic_weight: default_semantic_weight(),
            candidate_k: default_candidate_k(),
            default_k: default_k(),
            cache_ttl_secs: default_retrieval_cache_ttl(),
        }
    }
}

fn default_semantic_weight() -> f64 {
    research_harness_core::rank::DEFAULT_SEMANTIC_WEIGHT
}
fn default_candidate_k() -> usize {
    40
}
fn default_k() -> usize {
    5
}
fn default_retrieval_cache_ttl() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResearchConfig {
    #[serde(default = "default_max_subagents")]
    pub max_subagents: usize,
    /// Upper bound accepted for a caller-supplied `max_subagents`.
    #[serde(default = "default_max_subagents_cap")]
    pub max_subagents_cap: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
    #[serde(default = "default_subagent_timeout")]
    pub subagent_timeout_secs: u64,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,
    /// Minimum successful subagents for a task to complete.
    #[serde(default = "default_quorum")]
    pub quorum: usize,
    /// How long terminal tasks stay queryable.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    #[serde(default = "default_max_sources_per_agent")]
    pub max_sources_per_agent: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Capacity of each task's progress channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_subagents: default_max_subagents(),
            max_subagents_cap: default_max_subagents_cap(),
            max_iterations: default_max_iterations(),
            max_query_chars: default_max_query_chars(),
            subagent_timeout_secs: default_subagent_timeout(),
            task_timeout_secs: default_task_timeout(),
            cancel_grace_secs: default_cancel_grace(),
            quorum: default_quorum(),
            retention_secs: default_retention(),
            max_sources_per_agent: default_max_sources_per_agent(),
            retry_backoff_ms: default_retry_backoff_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl ResearchConfig {
    pub fn subagent_timeout(&self) -> Duration {
        Duration::from_secs(self.subagent_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn default_max_subagents() -> usize {
    3
}
fn default_max_subagents_cap() -> usize {
    16
}
fn default_max_iterations() -> u32 {
    1
}
fn default_max_query_chars() -> usize {
    4000
}
fn default_subagent_timeout() -> u64 {
    60
}
fn default_task_timeout() -> u64 {
    300
}
fn default_cancel_grace() -> u64 {
    5
}
fn default_quorum() -> usize {
    1
}
fn default_retention() -> u64 {
    3600
}
fn default_max_sources_per_agent() -> usize {
    8
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_event_buffer() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// One entry of the ordered `[[providers]]` list.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub name: String,
    /// `openai`, `ollama`, or `tavily`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_provider_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
    /// Extensions treated as documentation; everything else is code.
    #[serde(default = "default_doc_extensions")]
    pub doc_extensions: Vec<String>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            include_globs: default_include_globs(),
            exclude_globs: default_exclude_globs(),
            doc_extensions: default_doc_extensions(),
        }
    }
}

fn default_max_tokens() -> usize {
    700
}
fn default_include_globs() -> Vec<String> {
    [
        "**/*.md", "**/*.mdx", "**/*.rst", "**/*.txt", "**/*.rs", "**/*.py", "**/*.ts",
        "**/*.tsx", "**/*.js", "**/*.go", "**/*.java", "**/*.toml", "**/*.yaml",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_exclude_globs() -> Vec<String> {
    vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ]
}
fn default_doc_extensions() -> Vec<String> {
    ["md", "mdx", "rst", "txt", "adoc"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.retrieval.semantic_weight) {
            bail!("retrieval.semantic_weight must be in [0.0, 1.0]");
        }
        if self.retrieval.default_k == 0 {
            bail!("retrieval.default_k must be >= 1");
        }

        let r = &self.research;
        if r.quorum == 0 {
            bail!("research.quorum must be >= 1");
        }
        if r.max_subagents == 0 || r.max_subagents > r.max_subagents_cap {
            bail!(
                "research.max_subagents must be in [1, {}]",
                r.max_subagents_cap
            );
        }
        if r.max_iterations == 0 {
            bail!("research.max_iterations must be >= 1");
        }
        if r.event_buffer == 0 {
            bail!("research.event_buffer must be >= 1");
        }

        if self.indexing.max_tokens == 0 {
            bail!("indexing.max_tokens must be > 0");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "hash" => {}
            "openai" => {
                if self.embedding.model.is_none() {
                    bail!("embedding.model must be specified when provider is 'openai'");
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or hash.",
                other
            ),
        }
        if self.embedding.is_enabled() && matches!(self.embedding.dims, None | Some(0)) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                self.embedding.provider
            );
        }

        let mut names = HashSet::new();
        for p in &self.providers {
            match p.kind.as_str() {
                "openai" | "ollama" | "tavily" => {}
                other => bail!(
                    "Unknown provider type '{}' for provider '{}'. Must be openai, ollama, or tavily.",
                    other,
                    p.name
                ),
            }
            if !names.insert(p.name.as_str()) {
                bail!("Duplicate provider name: '{}'", p.name);
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.research.max_subagents, 3);
        assert_eq!(config.research.quorum, 1);
        assert_eq!(config.retrieval.default_k, 5);
        assert!((config.retrieval.semantic_weight - 0.7).abs() < 1e-9);
        assert!(!config.embedding.is_enabled());
        assert!(config.providers.is_empty());
    }

    #[test]
    fn providers_keep_declared_order() {
        let config = parse_config(
            r#"
[[providers]]
name = "local"
type = "ollama"
model = "llama3.1"

[[providers]]
name = "remote"
type = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
"#,
        )
        .unwrap();
        let names: Vec<_> = config.providers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["local", "remote"]);
        assert_eq!(config.providers[0].timeout_secs, 60);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(parse_config("[retrieval]\nsemantic_weight = 1.5").is_err());
        assert!(parse_config("[research]\nquorum = 0").is_err());
        assert!(parse_config("[research]\nmax_subagents = 40").is_err());
        assert!(parse_config("[embedding]\nprovider = \"magic\"").is_err());
        assert!(parse_config("[embedding]\nprovider = \"hash\"").is_err());
        assert!(parse_config(
            "[[providers]]\nname = \"a\"\ntype = \"ollama\"\n[[providers]]\nname = \"a\"\ntype = \"openai\""
        )
        .is_err());
        assert!(parse_config("[[providers]]\nname = \"a\"\ntype = \"grpc\"").is_err());
    }

    #[test]
    fn hash_embedding_with_dims_is_valid() {
        let config = parse_config("[embedding]\nprovider = \"hash\"\ndims = 256").unwrap();
        assert!(config.embedding.is_enabled());
    }
}
