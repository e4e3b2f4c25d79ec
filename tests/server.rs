mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use research_harness::engine::ResearchEngine;
use research_harness::providers::ProviderAdapter;
use research_harness::server::serve;
use research_harness_core::chunk::chunk_file;
use research_harness_core::index::memory::InMemoryIndex;
use research_harness_core::models::SourceType;
use serde_json::{json, Value};

async fn start_server() -> String {
    let index = Arc::new(InMemoryIndex::new());
    index
        .upsert(
            chunk_file(
                "repo",
                "docs/cache.md",
                SourceType::Documentation,
                "The cache evicts entries after their TTL expires.",
                700,
            ),
            None,
        )
        .unwrap();

    let engine = ResearchEngine::builder(test_config())
        .indexes(index.clone(), index)
        .provider(ScriptedModel::new("model", &["cache eviction"]) as Arc<dyn ProviderAdapter>)
        .provider(ScriptedSearch::new("web", 2) as Arc<dyn ProviderAdapter>)
        .build();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        serve(listener, Arc::new(engine)).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn wait_for_stage(client: &reqwest::Client, base: &str, id: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status: Value = client
            .get(format!("{}/research/{}", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let stage = status["stage"].as_str().unwrap().to_string();
        if ["completed", "failed", "cancelled"].contains(&stage.as_str()) {
            return status;
        }
        assert!(tokio::time::Instant::now() < deadline, "stuck in {}", stage);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn health_reports_version() {
    let base = start_server().await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn research_round_trip_over_http() {
    let base = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/research", base))
        .json(&json!({ "query": "How does cache eviction work?", "repository_id": "repo" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let id = resp.json::<Value>().await.unwrap()["task_id"]
        .as_str()
        .unwrap()
        .to_string();

    let status = wait_for_stage(&client, &base, &id).await;
    assert_eq!(status["stage"], "completed");
    assert_eq!(status["progress"], 100);

    let report: Value = client
        .get(format!("{}/research/{}/result", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["task_id"], id.as_str());
    assert!(!report["citations"].as_array().unwrap().is_empty());

    let list: Value = client
        .get(format!("{}/research", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["tasks"][0]["task_id"], id.as_str());
}

#[tokio::test]
async fn errors_follow_contract() {
    let base = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/research", base))
        .json(&json!({ "query": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .get(format!("{}/research/missing", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = client
        .post(format!("{}/providers/default", base))
        .json(&json!({ "kind": "search", "name": "nobody" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn context_and_providers_endpoints() {
    let base = start_server().await;
    let client = reqwest::Client::new();

    let result: Value = client
        .post(format!("{}/context", base))
        .json(&json!({ "query": "cache TTL", "repository_id": "repo", "k": 2 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chunks = result["chunks"].as_array().unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0]["chunk"]["source_type"], "documentation");

    let providers: Value = client
        .get(format!("{}/providers", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = providers["providers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["model", "web"]);

    let resp = client
        .post(format!("{}/providers/default", base))
        .json(&json!({ "kind": "search", "name": "web" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
}
