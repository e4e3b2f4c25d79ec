//! Paragraph-boundary chunker for repository files.
//!
//! Splits a file into [`ContextChunk`]s that respect a `max_tokens` budget.
//! Splitting happens on blank lines (`\n\n`) so a chunk holds whole
//! paragraphs or whole top-level code blocks whenever they fit.
//!
//! Chunk ids are derived from `(repository, path, index)` so re-indexing an
//! unchanged file reproduces the same ids.
//!
//! # Example
//!
//! ```rust
//! use research_harness_core::chunk::chunk_file;
//! use research_harness_core::models::SourceType;
//!
//! let chunks = chunk_file("repo-1", "README.md", SourceType::Documentation,
//!     "Intro.\n\nUsage.", 700);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].metadata.doc_type.as_deref(), Some("readme"));
//! ```

use sha2::{Digest, Sha256};

use crate::models::{ChunkMetadata, ContextChunk, SourceType};

/// Rough token estimate: 4 characters ≈ 1 token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count for `text`.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() / CHARS_PER_TOKEN) as u64
}

/// Chunk one file into [`ContextChunk`]s with contiguous `chunk_index`.
///
/// Empty or whitespace-only files produce no chunks.
pub fn chunk_file(
    repository_id: &str,
    file_path: &str,
    source_type: SourceType,
    text: &str,
    max_tokens: usize,
) -> Vec<ContextChunk> {
    let doc_type = match source_type {
        SourceType::Documentation => Some(doc_type_for(file_path)),
        SourceType::Code => None,
    };

    split_paragraphs(text, max_tokens * CHARS_PER_TOKEN)
        .into_iter()
        .enumerate()
        .map(|(i, content)| ContextChunk {
            id: chunk_id(repository_id, file_path, i),
            content,
            source_type,
            metadata: ChunkMetadata {
                repository_id: repository_id.to_string(),
                file_path: Some(file_path.to_string()),
                doc_type: doc_type.clone(),
                chunk_index: i as i64,
            },
            relevance_score: 0.0,
        })
        .collect()
}

/// Deterministic chunk id: first 32 hex chars of `sha256(repo \0 path \0 index)`.
pub fn chunk_id(repository_id: &str, file_path: &str, index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repository_id.as_bytes());
    hasher.update([0]);
    hasher.update(file_path.as_bytes());
    hasher.update([0]);
    hasher.update(index.to_le_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}

fn doc_type_for(file_path: &str) -> String {
    let name = file_path
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_path)
        .to_lowercase();
    if name.starts_with("readme") {
        "readme".to_string()
    } else if name.starts_with("changelog") {
        "changelog".to_string()
    } else {
        name.rsplit_once('.')
            .map(|(_, ext)| ext.to_string())
            .unwrap_or_else(|| "text".to_string())
    }
}

/// Accumulate paragraphs into pieces of at most `max_chars` bytes.
///
/// Paragraphs larger than `max_chars` are hard-split at the last newline
/// or space before the limit.
pub fn split_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut pieces = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if buf.is_empty() {
            trimmed.len()
        } else {
            buf.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if trimmed.len() > max_chars {
            pieces.extend(hard_split(trimmed, max_chars));
            continue;
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(trimmed);
    }

    if !buf.is_empty() {
        pieces.push(buf);
    }
    pieces
}

fn hard_split(mut remaining: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    while !remaining.is_empty() {
        let limit = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
        let mut cut = if limit < remaining.len() {
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        if cut == 0 {
            // A single char wider than the budget still has to make progress.
            cut = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }
        let piece = remaining[..cut].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        remaining = &remaining[cut..];
    }
    pieces
}

fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_file_is_one_chunk() {
        let chunks = chunk_file("r", "src/lib.rs", SourceType::Code, "fn main() {}", 700);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata.chunk_index, 0);
        assert_eq!(chunks[0].content, "fn main() {}");
        assert_eq!(chunks[0].metadata.doc_type, None);
    }

    #[test]
    fn empty_file_has_no_chunks() {
        assert!(chunk_file("r", "a.md", SourceType::Documentation, " \n\n ", 700).is_empty());
    }

    #[test]
    fn paragraphs_split_when_over_budget() {
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = chunk_file("r", "guide.md", SourceType::Documentation, text, 5);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.metadata.chunk_index, i as i64);
            assert_eq!(c.metadata.doc_type.as_deref(), Some("md"));
        }
    }

    #[test]
    fn ids_are_stable_across_runs() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let a = chunk_file("r", "x.md", SourceType::Documentation, text, 2);
        let b = chunk_file("r", "x.md", SourceType::Documentation, text, 2);
        let ids_a: Vec<_> = a.iter().map(|c| c.id.clone()).collect();
        let ids_b: Vec<_> = b.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids_a, ids_b);
        assert_ne!(chunk_id("r", "x.md", 0), chunk_id("other", "x.md", 0));
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let pieces = split_paragraphs(text, 7);
        assert!(!pieces.is_empty());
        assert!(pieces.iter().all(|p| !p.is_empty()));
    }

    #[test]
    fn readme_doc_type() {
        assert_eq!(doc_type_for("docs/README.md"), "readme");
        assert_eq!(doc_type_for("CHANGELOG"), "changelog");
        assert_eq!(doc_type_for("notes"), "text");
    }
}
