use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use ragflow_filter::{RECALL_HEADER, RagFilter, RetrievalConfig};
use ragflow_gateway::{AppState, app_router};
use serde_json::{Value, json};

#[derive(Clone, Default)]
struct Backend {
    reply: Arc<Mutex<Value>>,
    delay: Option<Duration>,
    seen: Arc<Mutex<Vec<(HeaderMap, Value)>>>,
}

async fn retrieval(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    backend.seen.lock().unwrap().push((headers, body));
    if let Some(delay) = backend.delay {
        tokio::time::sleep(delay).await;
    }
    let reply = backend.reply.lock().unwrap().clone();
    Json(reply)
}

async fn echo(headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let declared = headers
        .get("x-test-marker")
        .map(|v| v.to_str().unwrap_or_default().to_string())
        .unwrap_or_default();
    let headers = [("content-type", "application/json"), ("x-echo-marker", declared.as_str())];
    (StatusCode::OK, headers, body).into_response()
}

async fn spawn(app: Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server run");
    });
    (format!("http://{}", addr), handle)
}

struct Harness {
    gateway: String,
    backend: Backend,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

async fn harness(reply: Value, delay: Option<Duration>) -> Harness {
    let backend = Backend { reply: Arc::new(Mutex::new(reply)), delay, ..Default::default() };
    let (ragflow, ragflow_handle) = spawn(
        Router::new().route("/api/v1/retrieval", post(retrieval)).with_state(backend.clone()),
    )
    .await;
    let (upstream, upstream_handle) =
        spawn(Router::new().route("/v1/chat/completions", post(echo))).await;

    let port = ragflow.rsplit(':').next().unwrap().parse::<u16>().unwrap();
    let config = RetrievalConfig::load(&json!({
        "rag": {
            "api_key": "ragflow-gw-key",
            "endpoint": "/api/v1/retrieval",
            "serviceHost": "ragflow.internal",
            "serviceFQDN": "127.0.0.1",
            "servicePort": port,
            "dataset_ids": ["ds1"],
            "timeout_ms": 300
        }
    }))
    .unwrap();

    let (gateway, gateway_handle) =
        spawn(app_router(AppState::new(RagFilter::from_config(config), upstream))).await;

    Harness { gateway, backend, handles: vec![ragflow_handle, upstream_handle, gateway_handle] }
}

fn chat(messages: Value) -> Value {
    json!({"model": "qwen-max", "stream": false, "messages": messages})
}

async fn send(harness: &Harness, body: &Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", harness.gateway))
        .header("x-test-marker", "kept")
        .json(body)
        .send()
        .await
        .expect("gateway response")
}

#[tokio::test]
async fn injects_context_and_marks_response() {
    let harness = harness(
        json!({"code": 0, "data": {"chunks": [
            {"id": "c1", "document_id": "doc-1", "content": "X", "similarity": 0.5}
        ], "doc_aggs": [], "total": 1}}),
        None,
    )
    .await;

    let response = send(&harness, &chat(json!([{"role": "user", "content": "what is X?"}]))).await;
    assert!(response.status().is_success());
    assert_eq!(response.headers()[RECALL_HEADER], "true");
    assert_eq!(response.headers()["x-echo-marker"], "kept");

    let forwarded: Value = response.json().await.unwrap();
    assert_eq!(forwarded["model"], "qwen-max");
    assert_eq!(
        forwarded["messages"],
        json!([
            {"role": "user", "content": "X"},
            {"role": "user", "content": "Now, please answer the following question:\nwhat is X?"}
        ])
    );

    let seen = harness.backend.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (headers, body) = &seen[0];
    assert_eq!(headers["authorization"], "Bearer ragflow-gw-key");
    assert_eq!(headers["host"], "ragflow.internal");
    assert_eq!(body["question"], "what is X?");
}

#[tokio::test]
async fn low_similarity_forwards_original_body() {
    let harness = harness(
        json!({"code": 0, "data": {"chunks": [
            {"id": "c1", "document_id": "doc-1", "content": "X", "similarity": 0.1}
        ], "doc_aggs": [], "total": 1}}),
        None,
    )
    .await;

    let request = chat(json!([{"role": "user", "content": "what is X?"}]));
    let response = send(&harness, &request).await;
    assert_eq!(response.headers()[RECALL_HEADER], "false");
    let forwarded: Value = response.json().await.unwrap();
    assert_eq!(forwarded, request);
}

#[tokio::test]
async fn slow_backend_times_out_and_forwards_original_body() {
    let harness =
        harness(json!({"code": 0, "data": {"chunks": []}}), Some(Duration::from_secs(5))).await;

    let request = chat(json!([{"role": "user", "content": "what is X?"}]));
    let response = tokio::time::timeout(Duration::from_secs(3), send(&harness, &request))
        .await
        .expect("gateway answered within the retrieval budget");
    assert!(response.status().is_success());
    assert_eq!(response.headers()[RECALL_HEADER], "false");
    let forwarded: Value = response.json().await.unwrap();
    assert_eq!(forwarded, request);
}

#[tokio::test]
async fn empty_conversation_is_not_retrieved() {
    let harness = harness(json!({"code": 0, "data": {"chunks": []}}), None).await;

    let request = chat(json!([]));
    let response = send(&harness, &request).await;
    assert_eq!(response.headers()[RECALL_HEADER], "false");
    let forwarded: Value = response.json().await.unwrap();
    assert_eq!(forwarded, request);
    assert!(harness.backend.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn other_methods_are_forwarded_and_still_marked() {
    let harness = harness(json!({"code": 0, "data": {"chunks": []}}), None).await;

    let response = reqwest::get(format!("{}/v1/models", harness.gateway)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(response.headers()[RECALL_HEADER], "false");
    assert!(harness.backend.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn health_reports_ok() {
    let harness = harness(json!({"code": 0}), None).await;
    let body: Value = reqwest::get(format!("{}/health", harness.gateway))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}
