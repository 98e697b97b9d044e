//! HTTP API tests against a live router on an ephemeral port.

mod common;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

use common::{harness, test_config, EchoGenerator, HashEmbedder, Harness, PUMP_DOC};
use hybrid_rag::engine::{Collaborators, Engine};
use hybrid_rag::generate::REFUSAL;
use hybrid_rag::index::InMemoryIndex;
use hybrid_rag::models::DocumentRef;
use hybrid_rag::server::router;
use hybrid_rag::sources::{DocumentSource, InMemorySource};
use hybrid_rag::sparse::TermWeightEncoder;

/// Serve `engine` on 127.0.0.1 and return its base URL.
async fn spawn_server(h: Harness) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(Arc::new(h.engine));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_healthz() {
    let index = Arc::new(InMemoryIndex::new());
    let base = spawn_server(harness(&test_config(), index.clone())).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/healthz", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["api_status"], "ok");
    assert_eq!(body["index_status"], "ok");

    index.set_reachable(false);
    let resp = client.get(format!("{}/healthz", base)).send().await.unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["api_status"], "ok");
    assert_eq!(body["index_status"], "unreachable");
}

#[tokio::test]
async fn test_query_returns_answer_and_citations() {
    let index = Arc::new(InMemoryIndex::new());
    let h = harness(&test_config(), index);
    h.source.put_text("pumps.txt", PUMP_DOC);
    h.engine.ingest_all().await;
    let base = spawn_server(h).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/query", base))
        .json(&json!({ "question": "pump pressure", "retrieval_mode": "hybrid" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["degraded"], false);
    assert_eq!(body["citations"][0]["chunk_id"], "pumps.txt#0");
    assert_eq!(body["citations"][0]["source_filename"], "pumps.txt");
    assert!(body["answer"].as_str().unwrap().contains("pump pressure"));
    assert!(!body["query_id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_query_accepts_legacy_mode_name() {
    let index = Arc::new(InMemoryIndex::new());
    let h = harness(&test_config(), index);
    h.source.put_text("pumps.txt", PUMP_DOC);
    h.engine.ingest_all().await;
    let base = spawn_server(h).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/query", base))
        .json(&json!({ "question": "valve", "retrieval_mode": "elser_only" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_query_on_empty_index_refuses() {
    let index = Arc::new(InMemoryIndex::new());
    let base = spawn_server(harness(&test_config(), index)).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/query", base))
        .json(&json!({ "question": "what is the pump pressure?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["answer"], REFUSAL);
    assert_eq!(body["citations"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_query_bad_requests() {
    let index = Arc::new(InMemoryIndex::new());
    let base = spawn_server(harness(&test_config(), index)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/query", base))
        .json(&json!({ "question": "pump", "retrieval_mode": "fuzzy" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("fuzzy"));

    let resp = client
        .post(format!("{}/query", base))
        .json(&json!({ "question": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_ingest_runs_in_background() {
    let index = Arc::new(InMemoryIndex::new());
    let h = harness(&test_config(), index.clone());
    h.source.put_text("pumps.txt", PUMP_DOC);
    let base = spawn_server(h).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/ingest", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "accepted");

    for _ in 0..50 {
        if index.visible_ids("pumps.txt").len() == 2 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("background ingestion did not finish");
}

/// Panics on its first listing, then serves the wrapped source.
struct PanicsOnce {
    inner: InMemorySource,
    panicked: AtomicBool,
}

#[async_trait]
impl DocumentSource for PanicsOnce {
    fn name(&self) -> &str {
        "panics-once"
    }

    async fn list_documents(&self) -> anyhow::Result<Vec<DocumentRef>> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("listing blew up");
        }
        self.inner.list_documents().await
    }

    async fn fetch(&self, doc: &DocumentRef) -> anyhow::Result<Vec<u8>> {
        self.inner.fetch(doc).await
    }
}

#[tokio::test]
async fn test_ingest_available_again_after_task_panics() {
    let config = test_config();
    let index = Arc::new(InMemoryIndex::new());
    let inner = InMemorySource::new();
    inner.put_text("pumps.txt", PUMP_DOC);
    let source = PanicsOnce {
        inner,
        panicked: AtomicBool::new(false),
    };
    let engine = Engine::new(
        &config,
        Collaborators {
            index: index.clone(),
            embedder: Arc::new(HashEmbedder::default()),
            encoder: Arc::new(TermWeightEncoder::new(config.sparse.max_terms)),
            generator: Arc::new(EchoGenerator::default()),
            sources: vec![Arc::new(source) as Arc<dyn DocumentSource>],
        },
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = router(Arc::new(engine));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let client = reqwest::Client::new();

    let resp = client.post(format!("{}/ingest", base)).send().await.unwrap();
    assert_eq!(resp.status(), 202);

    // The first task dies; a later request must be accepted, not 409 forever.
    let mut accepted = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let resp = client.post(format!("{}/ingest", base)).send().await.unwrap();
        if resp.status() == 202 {
            accepted = true;
            break;
        }
        assert_eq!(resp.status(), 409);
    }
    assert!(accepted, "ingestion flag was never cleared");

    for _ in 0..50 {
        if index.visible_ids("pumps.txt").len() == 2 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("second ingestion did not finish");
}
