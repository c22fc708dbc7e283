//! Retrieval-augmented generation filter for chat-completion requests.
//!
//! The filter sits in front of a model endpoint. For each chat-completion
//! request it takes the latest message as a question, asks a RAGFlow
//! retrieval service for matching chunks, and rewrites the conversation so
//! the model sees the retrieved context before the question. Retrieval
//! problems never fail the client's request: it is forwarded unmodified.
//!
//! - [`config`] – validated, immutable filter configuration
//! - [`message`] – chat request envelope
//! - [`retrieval`] – retrieval API wire types
//! - [`transform`] – query extraction and context injection
//! - [`client`] – asynchronous retrieval client
//! - [`host`] – services the host runtime provides
//! - [`pipeline`] – the per-request state machine

pub mod client;
pub mod config;
pub mod error;
pub mod host;
pub mod message;
pub mod pipeline;
pub mod retrieval;
pub mod transform;

pub use client::{
    Completion, HttpTransport, PendingRetrieval, RetrievalClient, RetrievalTransport,
    TransportRequest, TransportResponse,
};
pub use config::{ApiKey, RetrievalConfig, RetrievalConfigBuilder, ServiceEndpoint};
pub use error::{ConfigError, RetrievalFailure, TransformError};
pub use host::{FilterHost, RAG_DOCS_TAG, RECALL_HEADER};
pub use message::{ChatMessage, ChatRequest, Conversation, Role};
pub use pipeline::{BodyAction, Phase, RagFilter, RequestContext, RequestFilter};
pub use retrieval::{DocAggregate, RetrievalQuery, RetrievalResult, RetrievedChunk};
pub use transform::{MergeOutcome, build_retrieval_query, extract_query, merge_result};
