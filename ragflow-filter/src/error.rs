//! Error types for the `ragflow-filter` crate.

use thiserror::Error;

/// Errors raised while loading the plugin configuration.
///
/// These are the only errors allowed to stop the filter from activating.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required configuration key is absent.
    #[error("{0} not found in plugin config")]
    MissingField(&'static str),

    /// Neither `rag.dataset_ids` nor `rag.document_ids` was provided.
    #[error("either 'rag.dataset_ids' or 'rag.document_ids' must be provided")]
    MissingSelector,

    /// A key is present but its value is of the wrong type or out of range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// The offending configuration key.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Errors raised while extracting the query from a conversation.
///
/// The request path recovers from all of them by passing the request through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransformError {
    /// The inbound conversation has no messages to take a query from.
    #[error("conversation contains no messages")]
    EmptyConversation,
}

/// Reasons a retrieval call did not yield a usable result.
///
/// Never surfaced to the end user: the request proceeds unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetrievalFailure {
    /// No response arrived within the configured budget.
    #[error("retrieval timed out after {0} ms")]
    Timeout(u64),

    /// The request could not be sent or the response could not be read.
    #[error("retrieval transport error: {0}")]
    Transport(String),

    /// The backend answered with a non-zero result code.
    #[error("retrieval backend returned code {code}: {message}")]
    Backend {
        /// The result code reported in the response envelope.
        code: i64,
        /// The accompanying message, empty when the backend sent none.
        message: String,
    },

    /// The response body was not a valid retrieval envelope.
    #[error("unparsable retrieval response (HTTP {status}): {reason}")]
    Decode {
        /// HTTP status of the response.
        status: u16,
        /// The decoder's complaint.
        reason: String,
    },

    /// The retrieval task ended without delivering a completion.
    #[error("retrieval task ended without completing")]
    Dropped,
}

/// A convenience result type for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;
