//! Directory indexing for `rh index`.
//!
//! Walks a directory, classifies each file as documentation or code by
//! extension, chunks it on paragraph boundaries, optionally embeds the
//! chunks, and replaces that file's chunks in the [`SqliteIndex`].
//! Embedding failures are not fatal: chunks are still written and remain
//! reachable through keyword search.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use research_harness_core::chunk::chunk_file;
use research_harness_core::embedding::Embedder;
use research_harness_core::models::SourceType;

use crate::config::IndexingConfig;
use crate::embedding::embed_batched;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::sqlite_store::SqliteIndex;

#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    /// Path relative to the scan root, `/`-separated.
    pub relative_path: String,
    pub source_type: SourceType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub files: u64,
    pub skipped: u64,
    pub chunks: u64,
    pub embedded: u64,
    pub removed: u64,
}

/// List indexable files under `root`, sorted by relative path.
pub fn scan_directory(root: &Path, config: &IndexingConfig) -> Result<Vec<ScannedFile>> {
    if !root.is_dir() {
        bail!("index root is not a directory: {}", root.display());
    }
    let include = build_globset(&config.include_globs)?;
    let exclude = build_globset(&config.exclude_globs)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        if exclude.is_match(&relative) || !include.is_match(&relative) {
            continue;
        }
        files.push(ScannedFile {
            path: path.to_path_buf(),
            source_type: classify(&relative, &config.doc_extensions),
            relative_path: relative,
        });
    }
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

/// Documentation if the extension is listed in `doc_extensions`, else code.
pub fn classify(path: &str, doc_extensions: &[String]) -> SourceType {
    let ext = Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase());
    match ext {
        Some(ext) if doc_extensions.iter().any(|d| d.eq_ignore_ascii_case(&ext)) => {
            SourceType::Documentation
        }
        _ => SourceType::Code,
    }
}

/// Index `root` as `repository_id`. With `full`, the repository's existing
/// chunks are dropped first so deleted files disappear too.
pub async fn index_directory(
    index: &SqliteIndex,
    embedder: Option<&dyn Embedder>,
    embed_batch_size: usize,
    config: &IndexingConfig,
    repository_id: &str,
    root: &Path,
    full: bool,
    progress: &dyn ProgressReporter,
) -> Result<IndexStats> {
    let mut stats = IndexStats::default();
    progress.report(ProgressEvent::Discovering {
        repository: repository_id.to_string(),
    });
    let files = scan_directory(root, config)?;
    let total = files.len() as u64;

    if full {
        stats.removed = index.remove_repository(repository_id).await?;
    }

    for (n, file) in files.iter().enumerate() {
        let body = match std::fs::read_to_string(&file.path) {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(path = %file.relative_path, error = %e, "skipping unreadable file");
                stats.skipped += 1;
                continue;
            }
        };

        let chunks = chunk_file(
            repository_id,
            &file.relative_path,
            file.source_type,
            &body,
            config.max_tokens,
        );

        let vectors = match embedder {
            Some(embedder) if !chunks.is_empty() => {
                let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
                match embed_batched(embedder, &texts, embed_batch_size).await {
                    Ok(v) => Some(v),
                    Err(e) => {
                        tracing::warn!(path = %file.relative_path, error = %e, "embedding failed, storing chunks without vectors");
                        None
                    }
                }
            }
            _ => None,
        };

        if !full {
            index.remove_file(repository_id, &file.relative_path).await?;
        }
        index
            .upsert_chunks(&chunks, vectors.as_deref())
            .await
            .with_context(|| format!("writing chunks for {}", file.relative_path))?;

        stats.files += 1;
        stats.chunks += chunks.len() as u64;
        if vectors.is_some() {
            stats.embedded += chunks.len() as u64;
        }
        progress.report(ProgressEvent::Indexing {
            repository: repository_id.to_string(),
            n: n as u64 + 1,
            total,
        });
    }

    tracing::info!(
        repository_id,
        files = stats.files,
        chunks = stats.chunks,
        embedded = stats.embedded,
        "repository indexed"
    );
    Ok(stats)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use research_harness_core::embedding::HashEmbedder;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn classify_by_extension() {
        let docs = IndexingConfig::default().doc_extensions;
        assert_eq!(classify("docs/README.MD", &docs), SourceType::Documentation);
        assert_eq!(classify("src/lib.rs", &docs), SourceType::Code);
        assert_eq!(classify("Makefile", &docs), SourceType::Code);
    }

    #[test]
    fn scan_applies_globs_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/main.rs", "fn main() {}");
        write(dir.path(), "docs/guide.md", "# Guide");
        write(dir.path(), "target/debug/out.rs", "fn x() {}");
        write(dir.path(), "image.png", "not text");

        let files = scan_directory(dir.path(), &IndexingConfig::default()).unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["docs/guide.md", "src/main.rs"]);
        assert_eq!(files[0].source_type, SourceType::Documentation);
    }

    #[tokio::test]
    async fn reindex_replaces_file_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("t.sqlite")).await.unwrap();
        crate::migrate::migrate_pool(&pool).await.unwrap();
        let index = SqliteIndex::new(pool);

        let repo_dir = dir.path().join("repo");
        write(&repo_dir, "docs/a.md", "first paragraph\n\nsecond paragraph");
        let config = IndexingConfig {
            max_tokens: 4,
            ..IndexingConfig::default()
        };
        let embedder = HashEmbedder::new(16).unwrap();

        let stats = index_directory(&index, Some(&embedder), 8, &config, "r", &repo_dir, false, &NoProgress)
            .await
            .unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(stats.embedded, stats.chunks);
        let before = index.count_chunks("r").await.unwrap();
        assert!(before >= 2);

        write(&repo_dir, "docs/a.md", "short");
        index_directory(&index, None, 8, &config, "r", &repo_dir, false, &NoProgress)
            .await
            .unwrap();
        assert_eq!(index.count_chunks("r").await.unwrap(), 1);
    }
}
