mod common;

use std::sync::Arc;

use common::*;
use research_harness::engine::ResearchEngine;
use research_harness::providers::{
    GenerateOptions, ProviderAdapter, ProviderKind, SearchOptions,
};
use research_harness::ResearchError;

#[tokio::test]
async fn unavailable_provider_is_skipped_and_counted_as_fallback() {
    let model = ScriptedModel::new("backup", &[]);
    let engine = ResearchEngine::builder(test_config())
        .provider(Arc::new(Unavailable("primary")) as Arc<dyn ProviderAdapter>)
        .provider(model.clone() as Arc<dyn ProviderAdapter>)
        .build();

    let generation = engine
        .gateway()
        .generate("hello", &GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(generation.provider, "backup");
    assert_eq!(model.calls(), 1);
    assert_eq!(engine.gateway().fallback_count(), 1);
}

#[tokio::test]
async fn switch_provider_changes_priority() {
    let first = ScriptedSearch::new("first", 1);
    let second = ScriptedSearch::new("second", 1);
    let engine = ResearchEngine::builder(test_config())
        .provider(first.clone() as Arc<dyn ProviderAdapter>)
        .provider(second.clone() as Arc<dyn ProviderAdapter>)
        .provider(ScriptedModel::new("model", &[]) as Arc<dyn ProviderAdapter>)
        .build();

    engine.switch_provider("search", "second").unwrap();
    let outcome = engine
        .gateway()
        .search("query", &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.provider, "second");
    assert_eq!(first.calls(), 0);
    assert_eq!(engine.gateway().provider_names(ProviderKind::Search)[0], "second");
    assert_eq!(engine.gateway().fallback_count(), 0);
}

#[tokio::test]
async fn switch_provider_rejects_bad_input() {
    let engine = ResearchEngine::builder(test_config())
        .provider(ScriptedSearch::new("web", 1) as Arc<dyn ProviderAdapter>)
        .build();

    assert!(matches!(
        engine.switch_provider("telepathy", "web"),
        Err(ResearchError::Validation(_))
    ));
    assert!(matches!(
        engine.switch_provider("search", "missing"),
        Err(ResearchError::NotFound(_))
    ));
    assert!(matches!(
        engine.switch_provider("model", "web"),
        Err(ResearchError::Validation(_))
    ));
}

#[tokio::test]
async fn list_providers_reports_capabilities_and_models() {
    let engine = ResearchEngine::builder(test_config())
        .provider(ScriptedModel::new("model", &[]) as Arc<dyn ProviderAdapter>)
        .provider(Arc::new(Unavailable("down")) as Arc<dyn ProviderAdapter>)
        .build();

    let providers = engine.list_providers().await;
    assert_eq!(providers.len(), 2);
    assert_eq!(providers[0].name, "model");
    assert_eq!(providers[0].capabilities, vec![ProviderKind::Model]);
    assert!(providers[0].available);
    assert_eq!(providers[0].models, vec!["model-large"]);
    assert!(!providers[1].available);
    assert!(providers[1].models.is_empty());
}

#[tokio::test]
async fn responses_are_cached_in_hybrid_store() {
    let mut config = test_config();
    config.cache.response_ttl_secs = 60;
    let model = ScriptedModel::new("model", &[]);
    let engine = ResearchEngine::builder(config)
        .provider(model.clone() as Arc<dyn ProviderAdapter>)
        .build();

    let opts = GenerateOptions::default();
    let first = engine.gateway().generate("same prompt", &opts).await.unwrap();
    let second = engine.gateway().generate("same prompt", &opts).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(model.calls(), 1);

    engine.gateway().generate("other prompt", &opts).await.unwrap();
    assert_eq!(model.calls(), 2);
    assert!(!engine.store().keys("cache:").await.unwrap().is_empty());
}

#[tokio::test]
async fn no_capable_provider_is_all_unavailable() {
    let engine = ResearchEngine::builder(test_config())
        .provider(ScriptedModel::new("model", &[]) as Arc<dyn ProviderAdapter>)
        .build();

    let err = engine
        .gateway()
        .search("q", &SearchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ResearchError::AllProvidersUnavailable(_)));
}
