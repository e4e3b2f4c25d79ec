//! Core data models shared by retrieval, subagents, and synthesis.
//!
//! These types describe the chunks that flow out of the indexes, the
//! sources that subagents collect, and the final cited report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where a [`ContextChunk`] came from.
///
/// The declaration order doubles as the ranking tie-break priority:
/// documentation sorts before code when scores are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Documentation,
    Code,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Documentation => "documentation",
            SourceType::Code => "code",
        }
    }

    /// Tie-break priority; lower sorts first.
    pub fn priority(&self) -> u8 {
        match self {
            SourceType::Documentation => 0,
            SourceType::Code => 1,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "documentation" | "docs" => Some(SourceType::Documentation),
            "code" => Some(SourceType::Code),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of a chunk inside a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub repository_id: String,
    /// Path of the source file, relative to the repository root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Documentation category (e.g. `"readme"`, `"guide"`), when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    pub chunk_index: i64,
}

/// A unit of retrievable content. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextChunk {
    pub id: String,
    pub content: String,
    pub source_type: SourceType,
    pub metadata: ChunkMetadata,
    /// Relevance in `[0, 1]`; zero at index time, set by ranking.
    #[serde(default)]
    pub relevance_score: f64,
}

impl ContextChunk {
    /// Human-readable location used in citations and prompt headers.
    pub fn location(&self) -> String {
        match (&self.metadata.file_path, &self.metadata.doc_type) {
            (Some(path), _) => path.clone(),
            (None, Some(doc_type)) => format!("{}#{}", doc_type, self.metadata.chunk_index),
            (None, None) => format!("{}#{}", self.id, self.metadata.chunk_index),
        }
    }
}

/// Per-chunk scoring breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Min-max normalised score from the index that produced the chunk.
    pub semantic: f64,
    /// Fraction of distinct query terms present in the chunk.
    pub keyword: f64,
    /// Weight applied to `semantic`; `keyword` receives `1 - weight`.
    pub semantic_weight: f64,
}

/// A chunk with its position in a [`RetrievalResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedChunk {
    /// 1-based rank.
    pub rank: usize,
    pub combined_score: f64,
    pub chunk: ContextChunk,
    pub explain: ScoreBreakdown,
}

/// Ordered top-k context for one query. Recomputed per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query: String,
    pub repository_id: String,
    pub chunks: Vec<RankedChunk>,
    /// Mean combined score of the returned chunks (0 when empty).
    pub combined_score: f64,
    /// True when one of the requested indexes was unreachable.
    #[serde(default)]
    pub degraded: bool,
}

impl RetrievalResult {
    pub fn empty(query: &str, repository_id: &str) -> Self {
        Self {
            query: query.to_string(),
            repository_id: repository_id.to_string(),
            chunks: Vec::new(),
            combined_score: 0.0,
            degraded: false,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Render the chunks as prompt context, one provenance header per chunk.
    ///
    /// ```rust
    /// use research_harness_core::models::RetrievalResult;
    ///
    /// let empty = RetrievalResult::empty("auth flow", "repo-1");
    /// assert_eq!(empty.to_prompt_context(), "");
    /// ```
    pub fn to_prompt_context(&self) -> String {
        let mut out = String::new();
        for ranked in &self.chunks {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&format!(
                "### [{}] {} ({}, score {:.2})\n{}",
                ranked.rank,
                ranked.chunk.location(),
                ranked.chunk.source_type,
                ranked.combined_score,
                ranked.chunk.content.trim()
            ));
        }
        out
    }
}

/// A hit returned by an external web-search backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub content: String,
    pub score: f64,
}

/// What kind of evidence a [`Source`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Web,
    Documentation,
    Code,
}

impl From<SourceType> for SourceKind {
    fn from(t: SourceType) -> Self {
        match t {
            SourceType::Documentation => SourceKind::Documentation,
            SourceType::Code => SourceKind::Code,
        }
    }
}

/// A piece of evidence collected by a subagent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub kind: SourceKind,
    pub title: String,
    /// URL for web sources, file path for repository chunks.
    pub location: String,
    pub snippet: String,
    pub score: f64,
    /// Subagent that found this source.
    pub agent_id: String,
}

impl Source {
    pub fn from_search_result(result: &SearchResult, agent_id: &str) -> Self {
        Self {
            id: format!("web:{}", short_hash(&normalize_location(&result.url))),
            kind: SourceKind::Web,
            title: if result.title.trim().is_empty() {
                result.url.clone()
            } else {
                result.title.trim().to_string()
            },
            location: result.url.clone(),
            snippet: snippet(&result.content),
            score: result.score.clamp(0.0, 1.0),
            agent_id: agent_id.to_string(),
        }
    }

    pub fn from_ranked_chunk(ranked: &RankedChunk, agent_id: &str) -> Self {
        let location = ranked.chunk.location();
        Self {
            id: ranked.chunk.id.clone(),
            kind: ranked.chunk.source_type.into(),
            title: location.clone(),
            location,
            snippet: snippet(&ranked.chunk.content),
            score: ranked.combined_score,
            agent_id: agent_id.to_string(),
        }
    }

    /// Key under which two sources are considered the same evidence.
    ///
    /// Web sources collapse on their normalised URL; repository chunks on
    /// their chunk id.
    pub fn dedup_key(&self) -> String {
        match self.kind {
            SourceKind::Web => normalize_location(&self.location),
            _ => self.id.clone(),
        }
    }
}

/// Lowercase, strip the fragment, and drop trailing slashes.
pub fn normalize_location(location: &str) -> String {
    let without_fragment = location.split('#').next().unwrap_or(location);
    without_fragment
        .trim()
        .trim_end_matches('/')
        .to_lowercase()
}

fn short_hash(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    format!("{:x}", digest)[..16].to_string()
}

const SNIPPET_CHARS: usize = 240;

fn snippet(text: &str) -> String {
    text.trim().chars().take(SNIPPET_CHARS).collect()
}

/// A numbered reference from the report body to a [`Source`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// The `[n]` marker used in the report body.
    pub index: usize,
    pub source_id: String,
    pub title: String,
    pub location: String,
}

/// Final output of a completed research task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub task_id: String,
    pub query: String,
    /// Markdown body, including a trailing sources section.
    pub content: String,
    pub citations: Vec<Citation>,
    /// Deduplicated sources, numbered in citation order.
    pub sources: Vec<Source>,
    pub sub_queries: Vec<String>,
    /// Provider that wrote the synthesis, `None` for the extractive fallback.
    pub generated_by: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Lifecycle of a single subagent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Searching,
    Analyzing,
    Done,
    Failed,
    Cancelled,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Done | AgentStatus::Failed | AgentStatus::Cancelled
        )
    }
}

/// Snapshot of one subagent, emitted on every state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentActivity {
    pub agent_id: String,
    pub sub_query: String,
    pub status: AgentStatus,
    pub sources_found: usize,
    pub tokens_used: u64,
    pub last_update: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentActivity {
    pub fn idle(agent_id: &str, sub_query: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            sub_query: sub_query.to_string(),
            status: AgentStatus::Idle,
            sources_found: 0,
            tokens_used: 0,
            last_update: Utc::now(),
            error: None,
        }
    }

    /// A new activity record with `status` applied. The receiver is untouched.
    pub fn with_status(&self, status: AgentStatus) -> Self {
        Self {
            status,
            last_update: Utc::now(),
            ..self.clone()
        }
    }
}

/// Caller-supplied knobs for a research task. Unset fields use config defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOptions {
    #[serde(default)]
    pub max_subagents: Option<usize>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Overall task timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Repository whose indexed context subagents may consult.
    #[serde(default)]
    pub repository_id: Option<String>,
    #[serde(default = "default_true")]
    pub use_web: bool,
    #[serde(default = "default_true")]
    pub use_context: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_subagents: None,
            max_iterations: None,
            timeout_secs: None,
            repository_id: None,
            use_web: true,
            use_context: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documentation_sorts_before_code() {
        assert!(SourceType::Documentation < SourceType::Code);
        assert!(SourceType::Documentation.priority() < SourceType::Code.priority());
    }

    #[test]
    fn web_sources_dedup_on_normalized_url() {
        let a = Source::from_search_result(
            &SearchResult {
                title: "Tokio".into(),
                url: "https://Tokio.rs/docs/#intro".into(),
                content: "runtime".into(),
                score: 0.4,
            },
            "agent-1",
        );
        let b = Source::from_search_result(
            &SearchResult {
                title: "Tokio docs".into(),
                url: "https://tokio.rs/docs".into(),
                content: "runtime".into(),
                score: 0.9,
            },
            "agent-2",
        );
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn blank_title_falls_back_to_url() {
        let s = Source::from_search_result(
            &SearchResult {
                title: "  ".into(),
                url: "https://example.com/a".into(),
                content: String::new(),
                score: 3.0,
            },
            "agent-1",
        );
        assert_eq!(s.title, "https://example.com/a");
        assert_eq!(s.score, 1.0);
    }

    #[test]
    fn task_options_deserialize_with_defaults() {
        let opts: TaskOptions = serde_json::from_str(r#"{"max_subagents": 2}"#).unwrap();
        assert_eq!(opts.max_subagents, Some(2));
        assert!(opts.use_web);
        assert!(opts.use_context);
        assert_eq!(opts.timeout_secs, None);
    }

    #[test]
    fn activity_with_status_copies() {
        let idle = AgentActivity::idle("a1", "what is x");
        let searching = idle.with_status(AgentStatus::Searching);
        assert_eq!(idle.status, AgentStatus::Idle);
        assert_eq!(searching.status, AgentStatus::Searching);
        assert_eq!(searching.sub_query, "what is x");
    }
}
