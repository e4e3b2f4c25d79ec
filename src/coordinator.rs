//! Research task lifecycle.
//!
//! [`TaskCoordinator::start`] validates the request, records the task in
//! `planning`, and spawns one driver per task. The driver is the only
//! code path that advances a task through its stages:
//!
//! ```text
//! planning     decompose the query into ≤ maxSubagents sub-queries
//! executing    run one SearchSubagent per sub-query, at most
//!              maxSubagents at a time, folding their AgentActivity
//!              events into the task as they arrive
//! synthesizing merge sources and draft the report
//! citing       resolve citations, attach the report
//! completed
//! ```
//!
//! Every stage transition is persisted as `task:{id}` through the
//! [`HybridStore`]. Subagent failures are recorded on their activity and
//! only fail the task when fewer than `quorum` subagents succeed.
//!
//! # Cancellation
//!
//! [`TaskCoordinator::cancel`] trips the task's token. Subagents stop at
//! their next checkpoint; the driver waits for them up to the grace
//! period, then aborts stragglers. A watchdog forces `cancelled` after the
//! same grace period if the driver is still blocked in a model call, so a
//! cancelled task never stays live indefinitely. Sources gathered before
//! cancellation stay on the task.
//!
//! Terminal tasks are evicted from memory and the store after the
//! retention period.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use research_harness_core::index::task_key;
use research_harness_core::models::{AgentActivity, AgentStatus, Report, TaskOptions};
use research_harness_core::task::{executing_progress, ResearchTask, TaskStage, TaskStatus};

use crate::config::ResearchConfig;
use crate::error::{ResearchError, Result};
use crate::hybrid_store::HybridStore;
use crate::providers::{GenerateOptions, ProviderGateway};
use crate::retriever::ContextRetriever;
use crate::subagent::{SearchSubagent, SubagentOutcome, SubagentSpec};
use crate::synthesis::SynthesisStage;

struct TaskHandle {
    state: Mutex<ResearchTask>,
    cancel: CancellationToken,
}

impl TaskHandle {
    fn with_task<R>(&self, f: impl FnOnce(&mut ResearchTask) -> R) -> R {
        let mut task = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut task)
    }

    fn snapshot(&self) -> ResearchTask {
        self.with_task(|t| t.clone())
    }
}

struct Inner {
    store: Arc<HybridStore>,
    gateway: Arc<ProviderGateway>,
    retriever: Arc<ContextRetriever>,
    synthesis: SynthesisStage,
    config: ResearchConfig,
    task_ttl: Duration,
    tasks: Mutex<HashMap<String, Arc<TaskHandle>>>,
}

/// Cheap to clone; clones share the same task table.
#[derive(Clone)]
pub struct TaskCoordinator {
    inner: Arc<Inner>,
}

impl TaskCoordinator {
    pub fn new(
        store: Arc<HybridStore>,
        gateway: Arc<ProviderGateway>,
        retriever: Arc<ContextRetriever>,
        config: ResearchConfig,
        task_ttl: Duration,
    ) -> Self {
        let synthesis = SynthesisStage::new(gateway.clone());
        Self {
            inner: Arc::new(Inner {
                store,
                gateway,
                retriever,
                synthesis,
                config,
                task_ttl,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Validate, record the task in `planning`, and return its id without
    /// waiting for any research to happen.
    pub async fn start(&self, query: &str, options: TaskOptions) -> Result<String> {
        let query = query.trim();
        self.validate(query, &options)?;

        let id = uuid::Uuid::new_v4().to_string();
        let mut task = ResearchTask::new(id.clone(), query.to_string(), options);
        task.transition(TaskStage::Planning)
            .map_err(|e| ResearchError::Storage(e.into()))?;

        let handle = Arc::new(TaskHandle {
            state: Mutex::new(task),
            cancel: CancellationToken::new(),
        });
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), handle.clone());
        self.inner.persist(&handle).await;

        tracing::info!(task_id = %id, stage = "planning", "research task started");
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.drive(handle).await });
        Ok(id)
    }

    fn validate(&self, query: &str, options: &TaskOptions) -> Result<()> {
        let cfg = &self.inner.config;
        if query.is_empty() {
            return Err(ResearchError::Validation("query must not be empty".into()));
        }
        let chars = query.chars().count();
        if chars > cfg.max_query_chars {
            return Err(ResearchError::Validation(format!(
                "query is {} characters, limit is {}",
                chars, cfg.max_query_chars
            )));
        }
        if let Some(n) = options.max_subagents {
            if n == 0 || n > cfg.max_subagents_cap {
                return Err(ResearchError::Validation(format!(
                    "max_subagents must be in [1, {}]",
                    cfg.max_subagents_cap
                )));
            }
        }
        if options.max_iterations == Some(0) {
            return Err(ResearchError::Validation("max_iterations must be >= 1".into()));
        }
        if options.timeout_secs == Some(0) {
            return Err(ResearchError::Validation("timeout must be > 0".into()));
        }
        if matches!(options.repository_id.as_deref(), Some(r) if r.trim().is_empty()) {
            return Err(ResearchError::Validation("repository_id must not be blank".into()));
        }
        Ok(())
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskStatus> {
        Ok(self.inner.load(task_id).await?.snapshot())
    }

    /// The final report; `NotReady` until the task is `completed`.
    pub async fn result(&self, task_id: &str) -> Result<Report> {
        let task = self.inner.load(task_id).await?;
        match (task.stage, task.result) {
            (TaskStage::Completed, Some(report)) => Ok(report),
            (stage, _) => Err(ResearchError::NotReady {
                task_id: task_id.to_string(),
                stage: stage.to_string(),
            }),
        }
    }

    /// Request cancellation. A no-op for tasks that already finished.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let Some(handle) = self.inner.handle(task_id) else {
            // Known only to the store: finished before a restart, or evicted.
            let task = self.inner.load(task_id).await?;
            if task.stage.is_terminal() {
                return Ok(());
            }
            return Err(ResearchError::NotFound(format!("task {} is not running", task_id)));
        };
        if handle.with_task(|t| t.stage.is_terminal()) || handle.cancel.is_cancelled() {
            return Ok(());
        }

        tracing::info!(task_id, "cancellation requested");
        handle.cancel.cancel();

        let inner = Arc::downgrade(&self.inner);
        let grace = self.inner.config.cancel_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = inner.upgrade() {
                if inner.finish(&handle, TaskStage::Cancelled, None).await {
                    tracing::warn!(task_id = %handle.snapshot().id, "cancellation grace expired, forced cancelled");
                }
            }
        });
        Ok(())
    }

    /// Snapshots of all live tasks, newest first.
    pub fn list_tasks(&self) -> Vec<TaskStatus> {
        let handles: Vec<Arc<TaskHandle>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<TaskStatus> = handles
            .iter()
            .map(|h| h.with_task(|t| t.snapshot()))
            .collect();
        snapshots.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        snapshots
    }
}

impl Inner {
    fn handle(&self, task_id: &str) -> Option<Arc<TaskHandle>> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    /// Live task first, then the persisted snapshot.
    async fn load(&self, task_id: &str) -> Result<ResearchTask> {
        if let Some(handle) = self.handle(task_id) {
            return Ok(handle.snapshot());
        }
        self.store
            .get_json::<ResearchTask>(&task_key(task_id))
            .await?
            .ok_or_else(|| ResearchError::NotFound(format!("task {}", task_id)))
    }

    async fn persist(&self, handle: &TaskHandle) {
        let task = handle.snapshot();
        if let Err(e) = self
            .store
            .put_json(&task_key(&task.id), &task, Some(self.task_ttl))
            .await
        {
            tracing::warn!(task_id = %task.id, error = %e, "failed to persist task snapshot");
        }
    }

    /// Move the task to `stage`. Fails with `CancellationRequested` when the
    /// task was cancelled or already reached a terminal stage.
    async fn advance(&self, handle: &TaskHandle, stage: TaskStage) -> Result<()> {
        if handle.cancel.is_cancelled() {
            return Err(ResearchError::CancellationRequested);
        }
        let moved = handle.with_task(|t| t.transition(stage).is_ok());
        if !moved {
            return Err(ResearchError::CancellationRequested);
        }
        tracing::info!(task_id = %handle.snapshot().id, stage = %stage, "task stage changed");
        self.persist(handle).await;
        Ok(())
    }

    /// Enter a terminal stage unless one was already reached. Returns
    /// whether this call made the transition.
    async fn finish(&self, handle: &TaskHandle, stage: TaskStage, error: Option<String>) -> bool {
        let (moved, id) = handle.with_task(|t| {
            if t.stage.is_terminal() {
                return (false, t.id.clone());
            }
            for agent in t.agents.iter_mut() {
                if !agent.status.is_terminal() {
                    *agent = agent.with_status(AgentStatus::Cancelled);
                }
            }
            t.error = error.clone();
            (t.transition(stage).is_ok(), t.id.clone())
        });
        if moved {
            match stage {
                TaskStage::Failed => tracing::warn!(task_id = %id, error = ?error, "task failed"),
                _ => tracing::info!(task_id = %id, stage = %stage, "task finished"),
            }
            self.persist(handle).await;
        }
        moved
    }

    async fn drive(self: Arc<Self>, handle: Arc<TaskHandle>) {
        let (id, timeout) = handle.with_task(|t| {
            (
                t.id.clone(),
                t.options
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.config.task_timeout()),
            )
        });

        match tokio::time::timeout(timeout, self.run_pipeline(&handle)).await {
            Ok(Ok(())) => {}
            Ok(Err(ResearchError::CancellationRequested)) => {
                self.finish(&handle, TaskStage::Cancelled, None).await;
            }
            Ok(Err(e)) => {
                self.finish(&handle, TaskStage::Failed, Some(e.to_string())).await;
            }
            Err(_) => {
                // Dropping the pipeline aborted every running subagent.
                self.finish(
                    &handle,
                    TaskStage::Failed,
                    Some(format!("task timed out after {}s", timeout.as_secs())),
                )
                .await;
            }
        }

        self.schedule_eviction(id);
    }

    async fn run_pipeline(&self, handle: &TaskHandle) -> Result<()> {
        let (query, options) = handle.with_task(|t| (t.query.clone(), t.options.clone()));
        let max_subagents = options.max_subagents.unwrap_or(self.config.max_subagents);

        // planning
        if handle.cancel.is_cancelled() {
            return Err(ResearchError::CancellationRequested);
        }
        let (sub_queries, plan_tokens) = self.plan(&query, max_subagents).await;
        handle.with_task(|t| {
            t.sub_queries = sub_queries.clone();
            t.coordinator_tokens += plan_tokens;
            t.raise_progress(TaskStage::Planning.progress_band().1);
        });

        // executing
        self.advance(handle, TaskStage::Executing).await?;
        let outcomes = self
            .execute(handle, &sub_queries, &options, max_subagents)
            .await?;

        let dispatched = outcomes.len();
        let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
        let required = self.config.quorum.min(dispatched);
        if succeeded < required {
            let detail = outcomes
                .iter()
                .filter(|o| !o.succeeded())
                .map(|o| {
                    format!(
                        "{}: {}",
                        o.agent_id,
                        o.error.as_deref().unwrap_or("did not finish")
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ResearchError::QuorumNotMet {
                succeeded,
                dispatched,
                required,
                detail,
            });
        }

        // synthesizing
        self.advance(handle, TaskStage::Synthesizing).await?;
        let sources = handle.with_task(|t| t.sources.clone());
        let draft = self.synthesis.synthesize(&query, &sub_queries, sources).await;
        handle.with_task(|t| {
            t.coordinator_tokens += draft.tokens_used;
            t.raise_progress(TaskStage::Synthesizing.progress_band().1);
        });

        // citing
        self.advance(handle, TaskStage::Citing).await?;
        let task_id = handle.with_task(|t| t.id.clone());
        let report = self.synthesis.cite(&task_id, &query, &sub_queries, draft);
        let completed = handle.with_task(|t| {
            if t.stage.is_terminal() {
                return false;
            }
            t.sources = report.sources.clone();
            t.result = Some(report);
            t.transition(TaskStage::Completed).is_ok()
        });
        if completed {
            tracing::info!(task_id = %task_id, stage = "completed", "task stage changed");
            self.persist(handle).await;
        }
        Ok(())
    }

    /// Decompose `query` into at most `max` sub-queries. Any planning
    /// failure degrades to the original query.
    async fn plan(&self, query: &str, max: usize) -> (Vec<String>, u64) {
        if max <= 1 {
            return (vec![query.to_string()], 0);
        }
        let prompt = format!(
            "Break the research question below into at most {} focused, non-overlapping \
             web search queries. Respond with a JSON array of strings and nothing else.\n\n\
             Question: {}",
            max, query
        );
        let opts = GenerateOptions {
            temperature: Some(0.2),
            max_tokens: Some(512),
            ..Default::default()
        };
        match self.gateway.generate(&prompt, &opts).await {
            Ok(generation) => {
                let plan = parse_plan(&generation.text, max);
                if plan.is_empty() {
                    tracing::warn!("planner returned no usable sub-queries, using the original query");
                    (vec![query.to_string()], generation.tokens_used)
                } else {
                    (plan, generation.tokens_used)
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "planning failed, using the original query");
                (vec![query.to_string()], 0)
            }
        }
    }

    async fn execute(
        &self,
        handle: &TaskHandle,
        sub_queries: &[String],
        options: &TaskOptions,
        max_subagents: usize,
    ) -> Result<Vec<SubagentOutcome>> {
        let (tx, mut rx) = mpsc::channel::<AgentActivity>(self.config.event_buffer.max(1));
        let semaphore = Arc::new(Semaphore::new(max_subagents.max(1)));
        let agent_cancel = handle.cancel.child_token();
        let mut set = JoinSet::new();

        let total = sub_queries.len();
        for (i, sub_query) in sub_queries.iter().enumerate() {
            let spec = SubagentSpec {
                agent_id: format!("agent-{}", i + 1),
                sub_query: sub_query.clone(),
                repository_id: options.repository_id.clone(),
                use_web: options.use_web,
                use_context: options.use_context,
                max_iterations: options.max_iterations.unwrap_or(self.config.max_iterations),
                timeout: self.config.subagent_timeout(),
                max_sources: self.config.max_sources_per_agent,
                retry_backoff: self.config.retry_backoff(),
            };
            handle.with_task(|t| t.record_activity(AgentActivity::idle(&spec.agent_id, sub_query)));

            let agent = SearchSubagent::new(
                spec,
                self.gateway.clone(),
                self.retriever.clone(),
                tx.clone(),
                agent_cancel.clone(),
            );
            let semaphore = semaphore.clone();
            set.spawn(async move {
                // The semaphore is never closed, so acquire only fails if it is.
                let _permit = semaphore.acquire_owned().await.ok();
                agent.run().await
            });
        }
        drop(tx);

        let mut outcomes: Vec<SubagentOutcome> = Vec::with_capacity(total);
        let mut finished = 0usize;
        let mut grace_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                Some(activity) = rx.recv() => {
                    handle.with_task(|t| t.record_activity(activity));
                }
                joined = set.join_next() => match joined {
                    None => break,
                    Some(joined) => {
                        finished += 1;
                        match joined {
                            Ok(outcome) => {
                                handle.with_task(|t| {
                                    t.sources.extend(outcome.sources.iter().cloned());
                                    t.raise_progress(executing_progress(finished, total));
                                });
                                outcomes.push(outcome);
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "subagent task aborted");
                                handle.with_task(|t| t.raise_progress(executing_progress(finished, total)));
                            }
                        }
                    }
                },
                _ = handle.cancel.cancelled(), if grace_deadline.is_none() => {
                    tracing::info!(
                        running = total - finished,
                        "cancellation observed, waiting for subagents"
                    );
                    grace_deadline = Some(Instant::now() + self.config.cancel_grace());
                }
                _ = tokio::time::sleep_until(grace_deadline.unwrap_or_else(Instant::now)), if grace_deadline.is_some() => {
                    tracing::warn!(running = total - finished, "cancellation grace expired, aborting subagents");
                    set.abort_all();
                    break;
                }
            }
        }
        while let Ok(activity) = rx.try_recv() {
            handle.with_task(|t| t.record_activity(activity));
        }

        // Agents that never reported an outcome were aborted or panicked.
        let cancelled = handle.cancel.is_cancelled();
        let reported: HashSet<String> = outcomes.iter().map(|o| o.agent_id.clone()).collect();
        let unreported: Vec<AgentActivity> = handle.with_task(|t| {
            let mut missing = Vec::new();
            for agent in t.agents.iter_mut() {
                if reported.contains(&agent.agent_id) {
                    continue;
                }
                if !agent.status.is_terminal() {
                    *agent = agent.with_status(if cancelled {
                        AgentStatus::Cancelled
                    } else {
                        AgentStatus::Failed
                    });
                }
                missing.push(agent.clone());
            }
            missing
        });
        outcomes.extend(unreported.into_iter().map(|a| SubagentOutcome {
            agent_id: a.agent_id,
            sub_query: a.sub_query,
            status: a.status,
            sources: Vec::new(),
            tokens_used: a.tokens_used,
            error: Some("subagent did not finish".into()),
        }));

        if handle.cancel.is_cancelled() {
            return Err(ResearchError::CancellationRequested);
        }
        Ok(outcomes)
    }

    fn schedule_eviction(self: &Arc<Self>, task_id: String) {
        let inner: Weak<Inner> = Arc::downgrade(self);
        let retention = self.config.retention();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&task_id);
            if let Err(e) = inner.store.invalidate(&task_key(&task_id)).await {
                tracing::warn!(task_id = %task_id, error = %e, "failed to evict task snapshot");
            } else {
                tracing::debug!(task_id = %task_id, "task evicted");
            }
        });
    }
}

/// Parse a planner reply: a JSON array of strings, or failing that one
/// query per line with list markers stripped. Deduplicated, at most `max`.
pub fn parse_plan(text: &str, max: usize) -> Vec<String> {
    let from_json = match (text.find('['), text.rfind(']')) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str::<Vec<String>>(&text[start..=end]).ok()
        }
        _ => None,
    };
    let candidates: Vec<String> = from_json.unwrap_or_else(|| {
        text.lines()
            .map(strip_list_marker)
            .filter(|l| !l.is_empty() && !l.ends_with(':'))
            .map(str::to_string)
            .collect()
    });

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .map(|q| q.trim().trim_matches('"').trim().to_string())
        .filter(|q| !q.is_empty())
        .filter(|q| seen.insert(q.to_lowercase()))
        .take(max)
        .collect()
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    let line = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .or_else(|| line.strip_prefix("• "))
        .unwrap_or(line);
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(r) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return r.trim();
        }
    }
    line.trim()
}
