//! Deterministic merge-and-rank for context retrieval.
//!
//! The ranking operates on candidate lists already fetched from the
//! documentation (vector) and code (text) indexes. It is synchronous and
//! never touches a backend.
//!
//! # Scoring
//!
//! 1. Normalise each candidate list's raw scores to `[0, 1]` (min-max,
//!    all-equal lists normalise to `1.0`). This is the `semantic` score.
//! 2. `keyword` = fraction of distinct query terms present in the chunk.
//! 3. `combined = w × semantic + (1 − w) × keyword`, `w` = `semantic_weight`.
//! 4. Merge (documentation list first, then code), collapsing duplicate
//!    chunk ids onto their first position with the higher semantic score.
//! 5. Sort by `combined` desc, then documentation before code, then
//!    insertion order.
//! 6. Truncate to `k`; ranks are 1-based.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::models::{ContextChunk, RankedChunk, RetrievalResult, ScoreBreakdown};

/// Default weight of the semantic component.
pub const DEFAULT_SEMANTIC_WEIGHT: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankParams {
    pub semantic_weight: f64,
}

impl Default for RankParams {
    fn default() -> Self {
        Self {
            semantic_weight: DEFAULT_SEMANTIC_WEIGHT,
        }
    }
}

/// A chunk returned by an index together with the index's raw score.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub chunk: ContextChunk,
    /// Cosine similarity, BM25 score, or term overlap, depending on backend.
    pub raw_score: f64,
}

/// Lowercased alphanumeric terms of length ≥ 2, deduplicated in order.
///
/// ```rust
/// use research_harness_core::rank::tokenize;
///
/// assert_eq!(tokenize("HybridStore::get(key) get"), vec!["hybridstore", "get", "key"]);
/// ```
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Fraction of `terms` that appear as whole tokens in `content`.
pub fn keyword_overlap(terms: &[String], content: &str) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let content_terms: HashSet<String> = tokenize(content).into_iter().collect();
    let hits = terms.iter().filter(|t| content_terms.contains(*t)).count();
    hits as f64 / terms.len() as f64
}

/// Min-max normalise raw scores to `[0.0, 1.0]`, preserving input order.
pub fn normalize_scores(candidates: &[Candidate]) -> Vec<f64> {
    let (min, max) = candidates.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY),
        |(lo, hi), c| (lo.min(c.raw_score), hi.max(c.raw_score)),
    );
    candidates
        .iter()
        .map(|c| {
            if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                ((c.raw_score - min) / (max - min)).clamp(0.0, 1.0)
            }
        })
        .collect()
}

struct Merged {
    chunk: ContextChunk,
    semantic: f64,
    order: usize,
}

/// Merge, score, sort, and truncate the two candidate lists.
pub fn rank_candidates(
    query: &str,
    doc_candidates: &[Candidate],
    code_candidates: &[Candidate],
    k: usize,
    params: &RankParams,
) -> Vec<RankedChunk> {
    if k == 0 {
        return Vec::new();
    }

    let terms = tokenize(query);
    let weight = params.semantic_weight.clamp(0.0, 1.0);

    let mut merged: Vec<Merged> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for list in [doc_candidates, code_candidates] {
        for (cand, semantic) in list.iter().zip(normalize_scores(list)) {
            match positions.get(&cand.chunk.id).copied() {
                Some(pos) => {
                    let existing = &mut merged[pos];
                    existing.semantic = existing.semantic.max(semantic);
                }
                None => {
                    positions.insert(cand.chunk.id.clone(), merged.len());
                    merged.push(Merged {
                        chunk: cand.chunk.clone(),
                        semantic,
                        order: merged.len(),
                    });
                }
            }
        }
    }

    let mut scored: Vec<(Merged, ScoreBreakdown, f64)> = merged
        .into_iter()
        .map(|m| {
            let keyword = keyword_overlap(&terms, &m.chunk.content);
            let combined = (weight * m.semantic + (1.0 - weight) * keyword).clamp(0.0, 1.0);
            let explain = ScoreBreakdown {
                semantic: m.semantic,
                keyword,
                semantic_weight: weight,
            };
            (m, explain, combined)
        })
        .collect();

    scored.sort_by(|(a, _, sa), (b, _, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(Ordering::Equal)
            .then(a.chunk.source_type.priority().cmp(&b.chunk.source_type.priority()))
            .then(a.order.cmp(&b.order))
    });
    scored.truncate(k);

    scored
        .into_iter()
        .enumerate()
        .map(|(i, (m, explain, combined))| {
            let mut chunk = m.chunk;
            chunk.relevance_score = combined;
            RankedChunk {
                rank: i + 1,
                combined_score: combined,
                chunk,
                explain,
            }
        })
        .collect()
}

/// Wrap ranked chunks into a [`RetrievalResult`].
pub fn build_result(
    query: &str,
    repository_id: &str,
    chunks: Vec<RankedChunk>,
    degraded: bool,
) -> RetrievalResult {
    let combined_score = if chunks.is_empty() {
        0.0
    } else {
        chunks.iter().map(|c| c.combined_score).sum::<f64>() / chunks.len() as f64
    };
    RetrievalResult {
        query: query.to_string(),
        repository_id: repository_id.to_string(),
        chunks,
        combined_score,
        degraded,
    }
}
