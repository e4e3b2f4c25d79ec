//! Search subagent: runs one decomposed sub-query end to end.
//!
//! ```text
//! idle → searching ─(rounds ≤ maxIterations)→ analyzing → done
//!            └─────────────────────────────────────────→ failed | cancelled
//! ```
//!
//! Each round searches the web through the [`ProviderGateway`] and/or the
//! repository through the [`ContextRetriever`]. When a round yields fewer
//! than [`MIN_SOURCES_PER_ROUND`] sources and rounds remain, the model is
//! asked to reformulate the query. Collected sources are deduplicated,
//! scored against the sub-query, and truncated.
//!
//! Cancellation is cooperative: the token is checked before every
//! external call and before scoring, never during a call. Every status
//! change is pushed to the coordinator as an [`AgentActivity`] event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use research_harness_core::chunk::estimate_tokens;
use research_harness_core::models::{AgentActivity, AgentStatus, Source};
use research_harness_core::rank::{keyword_overlap, tokenize};

use crate::error::{ResearchError, Result};
use crate::providers::{GenerateOptions, ProviderGateway, SearchOptions};
use crate::retriever::{ContextRetriever, RetrievalOptions};

/// Below this many sources after a round, the subagent reformulates.
pub const MIN_SOURCES_PER_ROUND: usize = 3;

const PROVIDER_SCORE_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct SubagentSpec {
    pub agent_id: String,
    pub sub_query: String,
    /// Repository to consult for internal context; `None` skips retrieval.
    pub repository_id: Option<String>,
    pub use_web: bool,
    pub use_context: bool,
    pub max_iterations: u32,
    pub timeout: Duration,
    pub max_sources: usize,
    /// Base delay before the single subagent-level retry.
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct SubagentOutcome {
    pub agent_id: String,
    pub sub_query: String,
    pub status: AgentStatus,
    pub sources: Vec<Source>,
    pub tokens_used: u64,
    pub error: Option<String>,
}

impl SubagentOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == AgentStatus::Done
    }
}

pub struct SearchSubagent {
    spec: SubagentSpec,
    gateway: Arc<ProviderGateway>,
    retriever: Arc<ContextRetriever>,
    events: mpsc::Sender<AgentActivity>,
    cancel: CancellationToken,
    activity: AgentActivity,
    sources: Vec<Source>,
}

impl SearchSubagent {
    pub fn new(
        spec: SubagentSpec,
        gateway: Arc<ProviderGateway>,
        retriever: Arc<ContextRetriever>,
        events: mpsc::Sender<AgentActivity>,
        cancel: CancellationToken,
    ) -> Self {
        let activity = AgentActivity::idle(&spec.agent_id, &spec.sub_query);
        Self {
            spec,
            gateway,
            retriever,
            events,
            cancel,
            activity,
            sources: Vec::new(),
        }
    }

    /// Run to a terminal status. Never panics on provider or index errors;
    /// they are reported on the outcome instead.
    pub async fn run(mut self) -> SubagentOutcome {
        let timeout = self.spec.timeout;
        let result = match tokio::time::timeout(timeout, self.execute()).await {
            Ok(r) => r,
            Err(_) => Err(ResearchError::SubagentFailure {
                agent_id: self.spec.agent_id.clone(),
                message: format!("timed out after {:?}", timeout),
            }),
        };

        let (status, error) = match result {
            Ok(()) => (AgentStatus::Done, None),
            Err(ResearchError::CancellationRequested) => {
                tracing::info!(agent_id = %self.spec.agent_id, "subagent acknowledged cancellation");
                (AgentStatus::Cancelled, None)
            }
            Err(e) => {
                tracing::warn!(agent_id = %self.spec.agent_id, error = %e, "subagent failed");
                (AgentStatus::Failed, Some(e.to_string()))
            }
        };
        self.activity.error = error.clone();
        self.set_status(status).await;

        SubagentOutcome {
            agent_id: self.spec.agent_id.clone(),
            sub_query: self.spec.sub_query.clone(),
            status,
            sources: std::mem::take(&mut self.sources),
            tokens_used: self.activity.tokens_used,
            error,
        }
    }

    async fn execute(&mut self) -> Result<()> {
        let mut query = self.spec.sub_query.clone();
        let mut failures: Vec<String> = Vec::new();
        let mut any_channel_ok = false;

        let rounds = self.spec.max_iterations.max(1);
        for round in 0..rounds {
            self.checkpoint()?;
            self.set_status(AgentStatus::Searching).await;
            let before = self.sources.len();

            if self.spec.use_web {
                self.checkpoint()?;
                match self.search_web(&query).await {
                    Ok(()) => any_channel_ok = true,
                    Err(ResearchError::CancellationRequested) => {
                        return Err(ResearchError::CancellationRequested)
                    }
                    Err(e) => failures.push(format!("web search: {}", e)),
                }
            }

            if self.spec.use_context {
                if let Some(repo) = self.spec.repository_id.clone() {
                    self.checkpoint()?;
                    let retrieved = self
                        .retriever
                        .retrieve(&query, &repo, self.spec.max_sources, RetrievalOptions::default())
                        .await;
                    match retrieved {
                        Ok(result) => {
                            any_channel_ok = true;
                            let agent_id = self.spec.agent_id.clone();
                            self.add_sources(
                                result
                                    .chunks
                                    .iter()
                                    .map(|c| Source::from_ranked_chunk(c, &agent_id)),
                            )
                            .await;
                        }
                        Err(e) => {
                            tracing::warn!(agent_id = %self.spec.agent_id, error = %e, "context unavailable, continuing without it");
                            failures.push(format!("context: {}", e));
                        }
                    }
                }
            }

            let found = self.sources.len() - before;
            let last_round = round + 1 == rounds;
            if last_round || found >= MIN_SOURCES_PER_ROUND {
                break;
            }

            self.checkpoint()?;
            match self.reformulate(&query).await {
                Some(next) => {
                    tracing::debug!(agent_id = %self.spec.agent_id, round, query = %next, "reformulated sub-query");
                    query = next;
                }
                None => break,
            }
        }

        if !any_channel_ok && !failures.is_empty() {
            return Err(ResearchError::SubagentFailure {
                agent_id: self.spec.agent_id.clone(),
                message: failures.join("; "),
            });
        }

        self.checkpoint()?;
        self.set_status(AgentStatus::Analyzing).await;
        self.score_and_dedupe();
        self.activity.sources_found = self.sources.len();
        Ok(())
    }

    /// Gateway search with one subagent-level retry after a backoff.
    async fn search_web(&mut self, query: &str) -> Result<()> {
        let opts = SearchOptions {
            max_results: self.spec.max_sources.max(1),
        };
        let outcome = match self.gateway.search(query, &opts).await {
            Ok(o) => o,
            Err(first) => {
                tracing::debug!(agent_id = %self.spec.agent_id, error = %first, "search failed, retrying once");
                self.backoff(self.spec.retry_backoff).await?;
                self.checkpoint()?;
                self.gateway.search(query, &opts).await?
            }
        };
        let agent_id = self.spec.agent_id.clone();
        self.add_sources(
            outcome
                .results
                .iter()
                .map(|r| Source::from_search_result(r, &agent_id)),
        )
        .await;
        Ok(())
    }

    async fn reformulate(&mut self, query: &str) -> Option<String> {
        let prompt = format!(
            "The search query below returned too few useful sources. \
             Rewrite it as a single, more specific search query. \
             Reply with the query only.\n\nQuery: {}",
            query
        );
        let opts = GenerateOptions {
            max_tokens: Some(64),
            temperature: Some(0.2),
            ..Default::default()
        };
        match self.gateway.generate(&prompt, &opts).await {
            Ok(generation) => {
                self.activity.tokens_used += generation.tokens_used;
                let next = generation
                    .text
                    .lines()
                    .map(|l| l.trim().trim_matches('"').trim())
                    .find(|l| !l.is_empty())?
                    .to_string();
                (!next.eq_ignore_ascii_case(query)).then_some(next)
            }
            Err(e) => {
                tracing::debug!(agent_id = %self.spec.agent_id, error = %e, "reformulation unavailable");
                None
            }
        }
    }

    async fn add_sources(&mut self, sources: impl Iterator<Item = Source>) {
        for source in sources {
            self.activity.tokens_used += estimate_tokens(&source.snippet);
            self.sources.push(source);
        }
        self.activity.sources_found = self.sources.len();
        self.emit().await;
    }

    /// Blend provider score with sub-query term overlap, collapse
    /// duplicates onto the best-scoring copy, and keep the top sources.
    fn score_and_dedupe(&mut self) {
        let terms = tokenize(&self.spec.sub_query);
        let mut best: Vec<Source> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for mut source in self.sources.drain(..) {
            let text = format!("{} {}", source.title, source.snippet);
            source.score = (PROVIDER_SCORE_WEIGHT * source.score
                + (1.0 - PROVIDER_SCORE_WEIGHT) * keyword_overlap(&terms, &text))
            .clamp(0.0, 1.0);

            match positions.get(&source.dedup_key()).copied() {
                Some(pos) => {
                    if source.score > best[pos].score {
                        best[pos] = source;
                    }
                }
                None => {
                    positions.insert(source.dedup_key(), best.len());
                    best.push(source);
                }
            }
        }

        // Stable: equal scores keep discovery order.
        best.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        best.truncate(self.spec.max_sources.max(1));
        self.sources = best;
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(ResearchError::CancellationRequested)
        } else {
            Ok(())
        }
    }

    async fn backoff(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(ResearchError::CancellationRequested),
        }
    }

    async fn set_status(&mut self, status: AgentStatus) {
        if self.activity.status == status {
            return;
        }
        self.activity = self.activity.with_status(status);
        self.emit().await;
    }

    async fn emit(&self) {
        // A closed channel means the coordinator is gone; nothing to report to.
        let _ = self.events.send(self.activity.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::providers::{ProviderAdapter, ProviderKind};
    use crate::providers::GenerateResponse;
    use async_trait::async_trait;
    use research_harness_core::index::memory::InMemoryIndex;
    use std::sync::Mutex;
    use research_harness_core::models::SearchResult;

    struct FixedSearch(Vec<SearchResult>);

    #[async_trait]
    impl ProviderAdapter for FixedSearch {
        fn name(&self) -> &str {
            "fixed"
        }

        fn supports(&self, kind: ProviderKind) -> bool {
            kind == ProviderKind::Search
        }

        async fn search(
            &self,
            _query: &str,
            _opts: &SearchOptions,
        ) -> std::result::Result<Vec<SearchResult>, ProviderError> {
            Ok(self.0.clone())
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    fn hit(url: &str, content: &str, score: f64) -> SearchResult {
        SearchResult {
            title: url.to_string(),
            url: url.to_string(),
            content: content.to_string(),
            score,
        }
    }

    fn spec() -> SubagentSpec {
        SubagentSpec {
            agent_id: "agent-1".into(),
            sub_query: "tokio runtime".into(),
            repository_id: None,
            use_web: true,
            use_context: false,
            max_iterations: 1,
            timeout: Duration::from_secs(5),
            max_sources: 2,
            retry_backoff: Duration::from_millis(1),
        }
    }

    /// Returns one hit per query, echoing the query into the URL.
    struct EchoSearch {
        queries: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl EchoSearch {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                queries: Mutex::new(Vec::new()),
                delay,
            })
        }

        fn queries(&self) -> Vec<String> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProviderAdapter for EchoSearch {
        fn name(&self) -> &str {
            "echo"
        }

        fn supports(&self, kind: ProviderKind) -> bool {
            kind == ProviderKind::Search
        }

        async fn search(
            &self,
            query: &str,
            _opts: &SearchOptions,
        ) -> std::result::Result<Vec<SearchResult>, ProviderError> {
            self.queries.lock().unwrap().push(query.to_string());
            tokio::time::sleep(self.delay).await;
            let url = format!("https://echo.dev/{}", query.replace(' ', "-"));
            Ok(vec![hit(&url, query, 0.5)])
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    struct Rewriter;

    #[async_trait]
    impl ProviderAdapter for Rewriter {
        fn name(&self) -> &str {
            "rewriter"
        }

        fn supports(&self, kind: ProviderKind) -> bool {
            kind == ProviderKind::Model
        }

        async fn generate(
            &self,
            prompt: &str,
            _opts: &GenerateOptions,
        ) -> std::result::Result<GenerateResponse, ProviderError> {
            let query = prompt.rsplit("Query: ").next().unwrap_or_default().trim();
            Ok(GenerateResponse {
                text: format!("\"{} internals\"\n", query),
                tokens_used: 4,
            })
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    fn agent(
        providers: Vec<Arc<dyn ProviderAdapter>>,
        cancel: CancellationToken,
    ) -> (SearchSubagent, mpsc::Receiver<AgentActivity>) {
        agent_with(spec(), providers, cancel)
    }

    fn agent_with(
        spec: SubagentSpec,
        providers: Vec<Arc<dyn ProviderAdapter>>,
        cancel: CancellationToken,
    ) -> (SearchSubagent, mpsc::Receiver<AgentActivity>) {
        let (tx, rx) = mpsc::channel(64);
        let index = Arc::new(InMemoryIndex::new());
        let retriever = Arc::new(ContextRetriever::new(index.clone(), index));
        let gateway = Arc::new(ProviderGateway::new(providers));
        (SearchSubagent::new(spec, gateway, retriever, tx, cancel), rx)
    }

    #[tokio::test]
    async fn dedupes_and_truncates() {
        let search = FixedSearch(vec![
            hit("https://a.dev/x", "tokio runtime internals", 0.9),
            hit("https://A.dev/x/", "tokio runtime internals", 0.2),
            hit("https://b.dev", "unrelated", 0.1),
            hit("https://c.dev", "tokio", 0.5),
        ]);
        let (agent, mut rx) = agent(
            vec![Arc::new(search) as Arc<dyn ProviderAdapter>],
            CancellationToken::new(),
        );
        let outcome = agent.run().await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.sources.len(), 2);
        assert_eq!(outcome.sources[0].location, "https://a.dev/x");

        let mut statuses = Vec::new();
        while let Ok(a) = rx.try_recv() {
            statuses.push(a.status);
        }
        assert_eq!(statuses.first(), Some(&AgentStatus::Searching));
        assert!(statuses.contains(&AgentStatus::Analyzing));
        assert_eq!(statuses.last(), Some(&AgentStatus::Done));
    }

    #[tokio::test]
    async fn no_search_provider_fails() {
        let (agent, _rx) = agent(Vec::new(), CancellationToken::new());
        let outcome = agent.run().await;
        assert_eq!(outcome.status, AgentStatus::Failed);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn pre_cancelled_agent_stops_immediately() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (agent, _rx) = agent(
            vec![Arc::new(FixedSearch(vec![hit("https://a.dev", "x", 1.0)])) as Arc<dyn ProviderAdapter>],
            cancel,
        );
        let outcome = agent.run().await;
        assert_eq!(outcome.status, AgentStatus::Cancelled);
        assert!(outcome.sources.is_empty());
    }

    #[tokio::test]
    async fn sparse_round_is_reformulated() {
        let search = EchoSearch::new(Duration::ZERO);
        let spec = SubagentSpec {
            max_iterations: 3,
            max_sources: 8,
            ..spec()
        };
        let (agent, _rx) = agent_with(
            spec,
            vec![
                search.clone() as Arc<dyn ProviderAdapter>,
                Arc::new(Rewriter) as Arc<dyn ProviderAdapter>,
            ],
            CancellationToken::new(),
        );
        let outcome = agent.run().await;

        assert!(outcome.succeeded());
        assert_eq!(
            search.queries(),
            vec![
                "tokio runtime",
                "tokio runtime internals",
                "tokio runtime internals internals"
            ]
        );
        assert_eq!(outcome.sources.len(), 3);
        assert!(outcome.tokens_used >= 8);
    }

    #[tokio::test]
    async fn reformulation_unavailable_ends_search() {
        let search = EchoSearch::new(Duration::ZERO);
        let spec = SubagentSpec {
            max_iterations: 3,
            ..spec()
        };
        let (agent, _rx) = agent_with(
            spec,
            vec![search.clone() as Arc<dyn ProviderAdapter>],
            CancellationToken::new(),
        );
        let outcome = agent.run().await;

        assert!(outcome.succeeded());
        assert_eq!(search.queries(), vec!["tokio runtime"]);
    }

    #[tokio::test]
    async fn exceeding_timeout_fails_the_agent() {
        let spec = SubagentSpec {
            timeout: Duration::from_millis(50),
            ..spec()
        };
        let (agent, mut rx) = agent_with(
            spec,
            vec![EchoSearch::new(Duration::from_secs(5)) as Arc<dyn ProviderAdapter>],
            CancellationToken::new(),
        );
        let outcome = agent.run().await;

        assert_eq!(outcome.status, AgentStatus::Failed);
        assert!(outcome.error.as_deref().unwrap().contains("timed out after 50ms"));
        assert!(outcome.sources.is_empty());

        let mut last = None;
        while let Ok(a) = rx.try_recv() {
            last = Some(a);
        }
        let last = last.unwrap();
        assert_eq!(last.status, AgentStatus::Failed);
        assert!(last.error.is_some());
    }
}
