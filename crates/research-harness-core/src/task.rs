//! Research task record and its stage machine.
//!
//! ```text
//! queued → planning → executing → synthesizing → citing → completed
//!    └──────────┴──────────┴────────────┴───────────┴──→ failed | cancelled
//! ```
//!
//! Progress is banded per stage: planning 0–15, executing 15–75 (driven by
//! the fraction of finished subagents), synthesizing 75–90, citing 90–100.
//! [`ResearchTask`] only ever moves progress forward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AgentActivity, Report, Source, TaskOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Queued,
    Planning,
    Executing,
    Synthesizing,
    Citing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStage::Queued => "queued",
            TaskStage::Planning => "planning",
            TaskStage::Executing => "executing",
            TaskStage::Synthesizing => "synthesizing",
            TaskStage::Citing => "citing",
            TaskStage::Completed => "completed",
            TaskStage::Failed => "failed",
            TaskStage::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStage::Completed | TaskStage::Failed | TaskStage::Cancelled
        )
    }

    /// The forward successor on the happy path.
    pub fn next(&self) -> Option<TaskStage> {
        match self {
            TaskStage::Queued => Some(TaskStage::Planning),
            TaskStage::Planning => Some(TaskStage::Executing),
            TaskStage::Executing => Some(TaskStage::Synthesizing),
            TaskStage::Synthesizing => Some(TaskStage::Citing),
            TaskStage::Citing => Some(TaskStage::Completed),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, to: TaskStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            TaskStage::Failed | TaskStage::Cancelled => true,
            other => self.next() == Some(other),
        }
    }

    /// Progress range `(start, end)` owned by this stage.
    pub fn progress_band(&self) -> (u8, u8) {
        match self {
            TaskStage::Queued => (0, 0),
            TaskStage::Planning => (0, 15),
            TaskStage::Executing => (15, 75),
            TaskStage::Synthesizing => (75, 90),
            TaskStage::Citing => (90, 100),
            TaskStage::Completed => (100, 100),
            TaskStage::Failed | TaskStage::Cancelled => (0, 100),
        }
    }
}

impl std::fmt::Display for TaskStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress inside the executing band for `done` of `total` subagents.
pub fn executing_progress(done: usize, total: usize) -> u8 {
    let (start, end) = TaskStage::Executing.progress_band();
    if total == 0 {
        return end;
    }
    let fraction = done.min(total) as f64 / total as f64;
    start + ((end - start) as f64 * fraction).floor() as u8
}

/// Rejected stage change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TaskStage,
    pub to: TaskStage,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid stage transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    pub stage: TaskStage,
    pub at: DateTime<Utc>,
}

/// One end-to-end research request. Mutated only by its coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchTask {
    pub id: String,
    pub query: String,
    pub options: TaskOptions,
    pub stage: TaskStage,
    pub progress: u8,
    pub stage_history: Vec<StageTransition>,
    pub sub_queries: Vec<String>,
    /// Latest activity per subagent, in dispatch order.
    pub agents: Vec<AgentActivity>,
    /// Sources gathered so far; kept on failure and cancellation.
    pub sources: Vec<Source>,
    /// Tokens spent outside subagents (planning, synthesis).
    pub coordinator_tokens: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<Report>,
    pub error: Option<String>,
}

impl ResearchTask {
    pub fn new(id: String, query: String, options: TaskOptions) -> Self {
        let now = Utc::now();
        Self {
            id,
            query,
            options,
            stage: TaskStage::Queued,
            progress: 0,
            stage_history: vec![StageTransition {
                stage: TaskStage::Queued,
                at: now,
            }],
            sub_queries: Vec::new(),
            agents: Vec::new(),
            sources: Vec::new(),
            coordinator_tokens: 0,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
        }
    }

    /// Move to `to`, recording the transition and raising progress to the
    /// start of the new stage's band.
    pub fn transition(&mut self, to: TaskStage) -> Result<(), InvalidTransition> {
        if !self.stage.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.stage,
                to,
            });
        }
        let now = Utc::now();
        self.stage = to;
        self.stage_history.push(StageTransition { stage: to, at: now });
        self.updated_at = now;
        match to {
            TaskStage::Failed | TaskStage::Cancelled => {}
            _ => self.raise_progress(to.progress_band().0),
        }
        Ok(())
    }

    /// Raise progress to `value`; lower values are ignored.
    pub fn raise_progress(&mut self, value: u8) {
        let value = value.min(100);
        if value > self.progress {
            self.progress = value;
            self.updated_at = Utc::now();
        }
    }

    /// Replace the activity for `activity.agent_id`, appending unseen agents.
    pub fn record_activity(&mut self, activity: AgentActivity) {
        match self
            .agents
            .iter_mut()
            .find(|a| a.agent_id == activity.agent_id)
        {
            Some(slot) => *slot = activity,
            None => self.agents.push(activity),
        }
        self.updated_at = Utc::now();
    }

    pub fn sources_found(&self) -> usize {
        if self.sources.is_empty() {
            self.agents.iter().map(|a| a.sources_found).sum()
        } else {
            self.sources.len()
        }
    }

    pub fn tokens_used(&self) -> u64 {
        self.agents.iter().map(|a| a.tokens_used).sum::<u64>() + self.coordinator_tokens
    }

    /// Copy-on-read snapshot for status polling.
    pub fn snapshot(&self) -> TaskStatus {
        TaskStatus {
            task_id: self.id.clone(),
            query: self.query.clone(),
            stage: self.stage,
            progress: self.progress,
            agent_activities: self.agents.clone(),
            sources_found: self.sources_found(),
            tokens_used: self.tokens_used(),
            stage_history: self.stage_history.clone(),
            partial_sources: if self.stage == TaskStage::Completed {
                Vec::new()
            } else {
                self.sources.clone()
            },
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Point-in-time view of a task returned by `status()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub query: String,
    pub stage: TaskStage,
    pub progress: u8,
    pub agent_activities: Vec<AgentActivity>,
    pub sources_found: usize,
    pub tokens_used: u64,
    pub stage_history: Vec<StageTransition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partial_sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskStatus {
    pub fn stages(&self) -> Vec<TaskStage> {
        self.stage_history.iter().map(|t| t.stage).collect()
    }
}
