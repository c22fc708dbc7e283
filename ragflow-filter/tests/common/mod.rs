#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use ragflow_filter::{
    FilterHost, RagFilter, RetrievalClient, RetrievalConfig, RetrievalFailure,
    RetrievalTransport, TransportRequest, TransportResponse,
};
use serde_json::{Value, json};

/// A host that records every call the filter makes.
#[derive(Debug, Default)]
pub struct RecordingHost {
    pub removed_headers: Vec<String>,
    pub replaced_body: Option<Bytes>,
    pub response_headers: Vec<(String, String)>,
    pub trace_tags: Vec<(String, String)>,
    pub suspends: usize,
    pub resumes: usize,
}

impl RecordingHost {
    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn replaced_json(&self) -> Option<Value> {
        self.replaced_body.as_ref().map(|b| serde_json::from_slice(b).unwrap())
    }
}

impl FilterHost for RecordingHost {
    fn remove_request_header(&mut self, name: &str) {
        self.removed_headers.push(name.to_string());
    }

    fn replace_request_body(&mut self, body: Bytes) {
        self.replaced_body = Some(body);
    }

    fn add_response_header(&mut self, name: &str, value: &str) {
        self.response_headers.push((name.to_string(), value.to_string()));
    }

    fn suspend(&mut self) {
        self.suspends += 1;
    }

    fn resume(&mut self) {
        self.resumes += 1;
    }

    fn set_trace_tag(&mut self, key: &str, value: &str) {
        self.trace_tags.push((key.to_string(), value.to_string()));
    }
}

/// What a [`ScriptedTransport`] does with each request.
#[derive(Debug, Clone)]
pub enum Script {
    Reply(u16, String),
    Fail(RetrievalFailure),
    Hang,
}

/// A transport that answers from a script and counts its calls.
#[derive(Debug)]
pub struct ScriptedTransport {
    pub script: Script,
    pub requests: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self { script, requests: Mutex::new(Vec::new()) })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl RetrievalTransport for ScriptedTransport {
    async fn post(&self, request: TransportRequest) -> Result<TransportResponse, RetrievalFailure> {
        self.requests.lock().unwrap().push(request);
        match &self.script {
            Script::Reply(status, body) => {
                Ok(TransportResponse { status: *status, body: Bytes::from(body.clone()) })
            }
            Script::Fail(failure) => Err(failure.clone()),
            Script::Hang => std::future::pending().await,
        }
    }
}

pub fn config() -> RetrievalConfig {
    RetrievalConfig::load(&json!({
        "rag": {
            "api_key": "ragflow-test-key",
            "endpoint": "/api/v1/retrieval",
            "serviceHost": "ragflow.local",
            "serviceFQDN": "ragflow.dns",
            "servicePort": 9380,
            "dataset_ids": ["ds1"],
            "similarity_threshold": 0.2
        }
    }))
    .unwrap()
}

pub fn filter_with(transport: Arc<ScriptedTransport>) -> RagFilter {
    let config = config();
    let client = RetrievalClient::new(&config, transport);
    RagFilter::new(Arc::new(config), client)
}

/// A retrieval response carrying `(document_id, content, similarity)` chunks.
pub fn retrieval_body(chunks: &[(&str, &str, f64)]) -> String {
    let chunks: Vec<Value> = chunks
        .iter()
        .enumerate()
        .map(|(i, (doc, content, similarity))| {
            json!({
                "id": format!("chunk-{i}"),
                "document_id": doc,
                "content": content,
                "similarity": similarity
            })
        })
        .collect();
    let total = chunks.len();
    json!({
        "code": 0,
        "data": { "chunks": chunks, "doc_aggs": [], "total": total }
    })
    .to_string()
}

pub fn chat_body() -> Vec<u8> {
    json!({
        "model": "qwen-max",
        "temperature": 0.7,
        "messages": [
            {"role": "system", "content": "You are a helpful assistant."},
            {"role": "user", "content": "What is RAGFlow?"}
        ]
    })
    .to_string()
    .into_bytes()
}
