use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use research_harness::config::Config;
use research_harness::engine::ResearchEngine;
use research_harness::hybrid_store::HybridStore;
use research_harness::ingest::index_directory;
use research_harness::progress::NoProgress;
use research_harness::retriever::RetrievalOptions;
use research_harness::sqlite_store::{SqliteDurableStore, SqliteIndex};
use research_harness::ResearchError;
use research_harness_core::models::SourceType;

fn write(root: &Path, rel: &str, body: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.db.path = tmp.path().join("data/research.sqlite");
    config.embedding.provider = "hash".to_string();
    config.embedding.dims = Some(64);
    config
}

fn write_repository(tmp: &TempDir) -> std::path::PathBuf {
    let repo = tmp.path().join("repo");
    write(
        &repo,
        "docs/deploy.md",
        "# Deployment\n\nDeployments roll out through a canary stage before production.",
    );
    write(
        &repo,
        "docs/auth.md",
        "# Authentication\n\nSession tokens are signed and expire after one hour.",
    );
    write(
        &repo,
        "src/deploy.rs",
        "pub fn canary_deployment(stage: &str) -> bool { stage == \"canary\" }",
    );
    write(
        &repo,
        "src/auth.rs",
        "pub fn verify_session(token: &str) -> bool { !token.is_empty() }",
    );
    repo
}

/// Index the fixture repository as "platform" through its own pool, the
/// way `rh index` runs beside a live engine.
async fn index_platform(tmp: &TempDir) {
    let repo = write_repository(tmp);
    let config = test_config(tmp);
    let pool = research_harness::db::connect(&config).await.unwrap();
    research_harness::migrate::migrate_pool(&pool).await.unwrap();
    let index = SqliteIndex::new(pool.clone());
    let embedder = research_harness::embedding::create_embedder(&config.embedding)
        .unwrap()
        .unwrap();
    let stats = index_directory(
        &index,
        Some(embedder.as_ref()),
        16,
        &config.indexing,
        "platform",
        &repo,
        true,
        &NoProgress,
    )
    .await
    .unwrap();
    assert_eq!(stats.files, 4);
    assert_eq!(stats.embedded, stats.chunks);
    pool.close().await;
}

async fn indexed_engine(tmp: &TempDir) -> ResearchEngine {
    index_platform(tmp).await;
    ResearchEngine::from_config(test_config(tmp)).await.unwrap()
}

#[tokio::test]
async fn context_is_ranked_bounded_and_deterministic() {
    let tmp = TempDir::new().unwrap();
    let engine = indexed_engine(&tmp).await;

    let first = engine
        .get_context("canary deployment", "platform", Some(3), RetrievalOptions::default())
        .await
        .unwrap();
    assert!(!first.is_empty());
    assert!(first.len() <= 3);
    assert!(!first.degraded);
    for pair in first.chunks.windows(2) {
        assert!(pair[0].combined_score >= pair[1].combined_score);
    }
    let top_paths: Vec<_> = first
        .chunks
        .iter()
        .filter_map(|c| c.chunk.metadata.file_path.clone())
        .collect();
    assert!(top_paths.iter().any(|p| p.contains("deploy")));

    let second = engine
        .get_context("canary deployment", "platform", Some(3), RetrievalOptions::default())
        .await
        .unwrap();
    let ids = |r: &research_harness_core::models::RetrievalResult| {
        r.chunks.iter().map(|c| c.chunk.id.clone()).collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
}

#[tokio::test]
async fn flags_restrict_source_types() {
    let tmp = TempDir::new().unwrap();
    let engine = indexed_engine(&tmp).await;

    let docs_only = engine
        .get_context(
            "session tokens",
            "platform",
            None,
            RetrievalOptions {
                use_docs: true,
                use_code: false,
            },
        )
        .await
        .unwrap();
    assert!(!docs_only.is_empty());
    assert!(docs_only
        .chunks
        .iter()
        .all(|c| c.chunk.source_type == SourceType::Documentation));

    let code_only = engine
        .get_context(
            "verify session",
            "platform",
            None,
            RetrievalOptions {
                use_docs: false,
                use_code: true,
            },
        )
        .await
        .unwrap();
    assert!(!code_only.is_empty());
    assert!(code_only
        .chunks
        .iter()
        .all(|c| c.chunk.source_type == SourceType::Code));
}

#[tokio::test]
async fn unknown_repository_yields_empty_context() {
    let tmp = TempDir::new().unwrap();
    let engine = indexed_engine(&tmp).await;

    let result = engine
        .get_context("deployment", "nonexistent", Some(5), RetrievalOptions::default())
        .await
        .unwrap();
    assert!(result.is_empty());
    assert!(!result.degraded);

    assert!(matches!(
        engine
            .get_context("deployment", " ", Some(5), RetrievalOptions::default())
            .await,
        Err(ResearchError::Validation(_))
    ));
}

#[tokio::test]
async fn prompt_context_carries_provenance() {
    let tmp = TempDir::new().unwrap();
    let engine = indexed_engine(&tmp).await;

    let result = engine
        .get_context("session tokens", "platform", Some(2), RetrievalOptions::default())
        .await
        .unwrap();
    let rendered = result.to_prompt_context();
    assert!(rendered.contains("auth"));
}

#[tokio::test]
async fn hybrid_store_falls_back_to_sqlite_after_expiry() {
    let tmp = TempDir::new().unwrap();
    let pool = research_harness::db::connect_path(&tmp.path().join("kv.sqlite"))
        .await
        .unwrap();
    research_harness::migrate::migrate_pool(&pool).await.unwrap();
    let store = HybridStore::new(
        Arc::new(SqliteDurableStore::new(pool)),
        Duration::from_secs(60),
        100,
    );

    store
        .put("task:abc", "{\"v\":1}", Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(store.get("task:abc").await.unwrap().as_deref(), Some("{\"v\":1}"));
    assert_eq!(store.stats().durable_reads, 0);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(store.evict_expired(), 1);
    assert!(!store.cache_contains("task:abc"));

    assert_eq!(store.get("task:abc").await.unwrap().as_deref(), Some("{\"v\":1}"));
    assert_eq!(store.stats().durable_reads, 1);
    assert!(store.cache_contains("task:abc"));

    assert_eq!(store.keys("task:").await.unwrap(), vec!["task:abc".to_string()]);
}

#[tokio::test]
async fn cached_context_follows_reindexing() {
    let tmp = TempDir::new().unwrap();
    let engine = ResearchEngine::from_config(test_config(&tmp)).await.unwrap();
    assert!(engine.config().retrieval.cache_ttl_secs > 0);

    let before = engine
        .get_context("session tokens", "platform", Some(3), RetrievalOptions::default())
        .await
        .unwrap();
    assert!(before.is_empty());
    let repeat = engine
        .get_context("session tokens", "platform", Some(3), RetrievalOptions::default())
        .await
        .unwrap();
    assert!(repeat.is_empty());
    assert!(engine.store().stats().hits >= 1);

    index_platform(&tmp).await;

    let after = engine
        .get_context("session tokens", "platform", Some(3), RetrievalOptions::default())
        .await
        .unwrap();
    assert!(!after.is_empty());
    assert!(after
        .chunks
        .iter()
        .any(|c| c.chunk.metadata.file_path.as_deref().unwrap_or_default().contains("auth")));

    // Retrieval results never reach the durable tier.
    assert!(engine.store().keys("cache:").await.unwrap().is_empty());
    assert!(engine.store().keys("retrieval:").await.unwrap().is_empty());
}

async fn expired_envelope(store: &HybridStore, key: &str) {
    store
        .put_cached(key, "stale", Duration::from_millis(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn opening_the_engine_sweeps_expired_envelopes() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let pool = research_harness::db::connect(&config).await.unwrap();
    research_harness::migrate::migrate_pool(&pool).await.unwrap();
    let store = HybridStore::new(
        Arc::new(SqliteDurableStore::new(pool.clone())),
        Duration::from_secs(60),
        100,
    );
    expired_envelope(&store, "gone").await;
    store
        .put_cached("live", "fresh", Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(store.keys("cache:").await.unwrap().len(), 2);
    pool.close().await;

    let engine = ResearchEngine::from_config(config).await.unwrap();
    assert_eq!(engine.store().keys("cache:").await.unwrap().len(), 1);
    assert_eq!(
        engine.store().get_cached("live").await.unwrap().as_deref(),
        Some("fresh")
    );
}

#[tokio::test]
async fn sweeper_removes_envelopes_that_expire_later() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.cache.sweep_interval_secs = 1;
    let engine = ResearchEngine::from_config(config).await.unwrap();

    expired_envelope(engine.store(), "later").await;
    engine.store().clear_cache();
    assert_eq!(engine.store().keys("cache:").await.unwrap().len(), 1);

    let sweeper = engine.spawn_cache_sweeper().expect("sweeper enabled");
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(engine.store().keys("cache:").await.unwrap().is_empty());
    sweeper.abort();

    let mut disabled = test_config(&tmp);
    disabled.cache.sweep_interval_secs = 0;
    let engine = ResearchEngine::from_config(disabled).await.unwrap();
    assert!(engine.spawn_cache_sweeper().is_none());
}
