//! Standalone host for the RAGFlow retrieval filter.
//!
//! Accepts chat-completion requests, runs them through
//! [`ragflow_filter::RagFilter`] and forwards them to the upstream model
//! endpoint, relaying the response with the recall marker header.

pub mod exchange;
pub mod server;

pub use exchange::Exchange;
pub use server::{AppState, ServerConfig, app_router, run_server};
