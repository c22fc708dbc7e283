//! Wire types for the RAGFlow retrieval API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RetrievalFailure;
use crate::message::null_as_default;

/// Body of a `POST <endpoint>` retrieval call.
///
/// Empty, zero and `false` values are omitted on the wire, except for
/// `question` and `rerank_id`, which are always sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalQuery {
    pub question: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dataset_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub document_ids: Vec<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub page: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub page_size: u32,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub similarity_threshold: f64,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub vector_similarity_weight: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub top_k: u32,
    /// Empty when no rerank model is configured.
    pub rerank_id: String,
    #[serde(skip_serializing_if = "is_false")]
    pub keyword: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub highlight: bool,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn is_zero_f64(n: &f64) -> bool {
    *n == 0.0
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A chunk returned by the retrieval backend.
///
/// Missing and `null` members decode to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RetrievedChunk {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub document_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub content: String,
    /// Hybrid similarity score; compared against the configured threshold.
    #[serde(deserialize_with = "null_as_default")]
    pub similarity: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub term_similarity: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub vector_similarity: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub highlight: String,
    #[serde(deserialize_with = "null_as_default")]
    pub kb_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub document_keyword: String,
    #[serde(deserialize_with = "null_as_default")]
    pub important_keywords: Vec<String>,
}

/// Per-document hit counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DocAggregate {
    #[serde(deserialize_with = "null_as_default")]
    pub doc_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub doc_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub count: u64,
}

/// The `data` member of a successful retrieval response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RetrievalData {
    #[serde(deserialize_with = "null_as_default")]
    pub chunks: Vec<RetrievedChunk>,
    #[serde(deserialize_with = "null_as_default")]
    pub doc_aggs: Vec<DocAggregate>,
    #[serde(deserialize_with = "null_as_default")]
    pub total: u64,
}

#[derive(Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

/// A decoded, successful retrieval response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetrievalResult {
    /// Result code of the envelope; always 0 once decoded.
    pub code: i64,
    /// Chunks in backend order.
    pub chunks: Vec<RetrievedChunk>,
    pub doc_aggs: Vec<DocAggregate>,
    pub total: u64,
}

impl RetrievalResult {
    /// Interpret a raw response from the retrieval service.
    ///
    /// # Errors
    ///
    /// - [`RetrievalFailure::Decode`] if the body is not a retrieval envelope.
    /// - [`RetrievalFailure::Backend`] if the envelope's `code` is non-zero.
    pub fn from_reply(status: u16, body: &[u8]) -> Result<Self, RetrievalFailure> {
        let envelope: Envelope = serde_json::from_slice(body)
            .map_err(|e| RetrievalFailure::Decode { status, reason: e.to_string() })?;

        if envelope.code != 0 {
            return Err(RetrievalFailure::Backend {
                code: envelope.code,
                message: envelope.message.unwrap_or_default(),
            });
        }

        let data = match envelope.data {
            Value::Null => RetrievalData::default(),
            data => serde_json::from_value::<RetrievalData>(data)
                .map_err(|e| RetrievalFailure::Decode { status, reason: e.to_string() })?,
        };

        Ok(Self {
            code: envelope.code,
            chunks: data.chunks,
            doc_aggs: data.doc_aggs,
            total: data.total,
        })
    }
}
