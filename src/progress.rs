//! Progress reporting for `rh index` and `rh research`.
//!
//! Progress goes to **stderr** so stdout stays parseable: the final report
//! or JSON result is the only thing `rh research` prints to stdout.

use std::io::Write;

use research_harness_core::models::AgentStatus;
use research_harness_core::task::TaskStatus;

#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Directory walk for a repository is running; total unknown.
    Discovering { repository: String },
    /// `n` of `total` files chunked and written.
    Indexing { repository: String, n: u64, total: u64 },
    /// A research task changed since the last poll.
    Research(TaskStatus),
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly lines: `research 3f2a…  executing  45%  2/3 agents done  12 sources`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Discovering { repository } => {
                format!("index {}  discovering...\n", repository)
            }
            ProgressEvent::Indexing { repository, n, total } => format!(
                "index {}  indexing  {} / {} files\n",
                repository,
                format_number(*n),
                format_number(*total)
            ),
            ProgressEvent::Research(status) => {
                let done = status
                    .agent_activities
                    .iter()
                    .filter(|a| a.status.is_terminal())
                    .count();
                let failed = status
                    .agent_activities
                    .iter()
                    .filter(|a| a.status == AgentStatus::Failed)
                    .count();
                let mut line = format!(
                    "research {}  {:<12} {:>3}%  {}/{} agents done  {} sources",
                    short_id(&status.task_id),
                    status.stage.as_str(),
                    status.progress,
                    done,
                    status.agent_activities.len(),
                    format_number(status.sources_found as u64)
                );
                if failed > 0 {
                    line.push_str(&format!("  ({} failed)", failed));
                }
                line.push('\n');
                line
            }
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Discovering { repository } => serde_json::json!({
                "event": "progress",
                "repository": repository,
                "phase": "discovering"
            }),
            ProgressEvent::Indexing { repository, n, total } => serde_json::json!({
                "event": "progress",
                "repository": repository,
                "phase": "indexing",
                "n": n,
                "total": total
            }),
            ProgressEvent::Research(status) => serde_json::json!({
                "event": "progress",
                "task_id": status.task_id,
                "stage": status.stage,
                "progress": status.progress,
                "sources_found": status.sources_found,
                "tokens_used": status.tokens_used,
                "agents": status.agent_activities,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" | "none" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
