//! Report synthesis and citation.
//!
//! Synthesis runs in two steps that map onto the task's `synthesizing` and
//! `citing` stages:
//!
//! 1. [`SynthesisStage::synthesize`] merges every subagent's sources
//!    (duplicates collapse onto the best-scoring copy), numbers them, and
//!    asks the model gateway for a markdown report that cites them as
//!    `[n]`. If no model is reachable an extractive report is built from
//!    the source snippets instead.
//! 2. [`SynthesisStage::cite`] resolves the `[n]` markers into
//!    [`Citation`]s, drops markers that point at no source, and appends a
//!    sources section. Code spans are left alone, and a bracketed number
//!    directly after an identifier or closing bracket (`args[0]`,
//!    `grid[1][2]`) is an index expression, not a citation.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;

use research_harness_core::models::{Citation, Report, Source};

use crate::providers::{GenerateOptions, ProviderGateway};

/// Fenced blocks and inline code spans are matched first so markers inside
/// them are never rewritten.
static CITATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)(```.*?```|`[^`\n]*`)|\[(\d+)\]").expect("citation pattern is valid")
});

/// Sources beyond this rank are left out of the synthesis prompt.
const MAX_PROMPT_SOURCES: usize = 20;

const SYSTEM_PROMPT: &str = "You are a research analyst. Write a concise, well-structured \
markdown report answering the question using only the numbered sources provided. \
Cite sources inline as [n]. Do not invent sources.";

/// Report body before citation resolution.
#[derive(Debug, Clone)]
pub struct Draft {
    pub content: String,
    /// Numbered sources; `sources[i]` is cited as `[i + 1]`.
    pub sources: Vec<Source>,
    pub generated_by: Option<String>,
    pub tokens_used: u64,
}

pub struct SynthesisStage {
    gateway: Arc<ProviderGateway>,
}

impl SynthesisStage {
    pub fn new(gateway: Arc<ProviderGateway>) -> Self {
        Self { gateway }
    }

    pub async fn synthesize(&self, query: &str, sub_queries: &[String], sources: Vec<Source>) -> Draft {
        let sources = merge_sources(sources);
        if sources.is_empty() {
            return Draft {
                content: format!("# {}\n\nNo sources were found for this question.", query),
                sources,
                generated_by: None,
                tokens_used: 0,
            };
        }

        let prompt = build_prompt(query, sub_queries, &sources);
        let opts = GenerateOptions {
            system: Some(SYSTEM_PROMPT.to_string()),
            temperature: Some(0.3),
            ..Default::default()
        };
        match self.gateway.generate(&prompt, &opts).await {
            Ok(generation) if !generation.text.trim().is_empty() => Draft {
                content: generation.text.trim().to_string(),
                sources,
                generated_by: Some(generation.provider),
                tokens_used: generation.tokens_used,
            },
            Ok(_) => {
                tracing::warn!("model returned an empty report, using extractive synthesis");
                extractive(query, sources)
            }
            Err(e) => {
                tracing::warn!(error = %e, "no model available for synthesis, using extractive synthesis");
                extractive(query, sources)
            }
        }
    }

    pub fn cite(&self, task_id: &str, query: &str, sub_queries: &[String], draft: Draft) -> Report {
        let count = draft.sources.len();
        let (mut content, mut referenced) = resolve_markers(&draft.content, count);

        // A report that cites nothing still credits everything it was built from.
        if referenced.is_empty() {
            referenced.extend(1..=count);
        }

        let citations: Vec<Citation> = referenced
            .iter()
            .map(|&n| {
                let source = &draft.sources[n - 1];
                Citation {
                    index: n,
                    source_id: source.id.clone(),
                    title: source.title.clone(),
                    location: source.location.clone(),
                }
            })
            .collect();

        if !citations.is_empty() {
            content.push_str("\n\n## Sources\n");
            for c in &citations {
                content.push_str(&format!("\n[{}] {} ({})", c.index, c.title, c.location));
            }
            content.push('\n');
        }

        Report {
            task_id: task_id.to_string(),
            query: query.to_string(),
            content,
            citations,
            sources: draft.sources,
            sub_queries: sub_queries.to_vec(),
            generated_by: draft.generated_by,
            completed_at: Utc::now(),
        }
    }
}

/// Keep `[n]` markers that cite one of `count` sources, drop the ones that
/// cite nothing, and return the cited numbers.
fn resolve_markers(text: &str, count: usize) -> (String, BTreeSet<usize>) {
    let mut referenced = BTreeSet::new();
    // End offset of the previous citation marker, so `[1][2]` reads as two.
    let mut last_marker_end = None;

    let body = CITATION_RE.replace_all(text, |caps: &regex::Captures| {
        let whole = &caps[0];
        let Some(number) = caps.get(2) else {
            return whole.to_string();
        };
        let start = caps.get(0).map_or(0, |m| m.start());
        let follows_marker = last_marker_end == Some(start);
        let indexes_expression = text[..start]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric() || matches!(c, '_' | ')' | ']'));
        if indexes_expression && !follows_marker {
            return whole.to_string();
        }

        last_marker_end = Some(start + whole.len());
        match number.as_str().parse::<usize>() {
            Ok(n) if (1..=count).contains(&n) => {
                referenced.insert(n);
                whole.to_string()
            }
            _ => String::new(),
        }
    });
    (body.into_owned(), referenced)
}

/// Collapse duplicates onto their best-scoring copy; order by score
/// descending, then first appearance.
pub fn merge_sources(sources: Vec<Source>) -> Vec<Source> {
    let mut merged: Vec<Source> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for source in sources {
        let key = source.dedup_key();
        match positions.get(&key).copied() {
            Some(pos) => {
                if source.score > merged[pos].score {
                    merged[pos] = source;
                }
            }
            None => {
                positions.insert(key, merged.len());
                merged.push(source);
            }
        }
    }
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged
}

fn build_prompt(query: &str, sub_queries: &[String], sources: &[Source]) -> String {
    let mut prompt = format!("Question: {}\n", query);
    if sub_queries.len() > 1 {
        prompt.push_str("\nResearch angles:\n");
        for sq in sub_queries {
            prompt.push_str(&format!("- {}\n", sq));
        }
    }
    prompt.push_str("\nSources:\n");
    for (i, s) in sources.iter().take(MAX_PROMPT_SOURCES).enumerate() {
        prompt.push_str(&format!("\n[{}] {} ({})\n{}\n", i + 1, s.title, s.location, s.snippet));
    }
    prompt.push_str("\nWrite the report now.");
    prompt
}

fn extractive(query: &str, sources: Vec<Source>) -> Draft {
    let mut content = format!("# {}\n\n## Findings\n", query);
    for (i, s) in sources.iter().enumerate() {
        let snippet = s.snippet.split_whitespace().collect::<Vec<_>>().join(" ");
        content.push_str(&format!("\n- **{}**: {} [{}]", s.title, snippet, i + 1));
    }
    Draft {
        content,
        sources,
        generated_by: None,
        tokens_used: 0,
    }
}
