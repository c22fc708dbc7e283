//! Asynchronous client for the retrieval service.
//!
//! [`RetrievalClient::send`] returns immediately with a [`PendingRetrieval`]
//! while the POST runs on a spawned task. The pending value resolves exactly
//! once, to the received response or to a synthetic failure when the call
//! errors, exceeds its budget, or the task dies.
//!
//! ```rust,ignore
//! let client = RetrievalClient::http(&config)?;
//! let pending = client.send(&query);
//! // ... the caller is free to park the request here ...
//! match pending.await.into_result() {
//!     Ok(result) => { /* merge */ }
//!     Err(failure) => { /* fail open */ }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::{ApiKey, RetrievalConfig, ServiceEndpoint};
use crate::error::RetrievalFailure;
use crate::retrieval::{RetrievalQuery, RetrievalResult};

/// An outbound HTTP request to the retrieval service.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    /// Request path, e.g. `/api/v1/retrieval`.
    pub path: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Bytes,
}

/// A raw HTTP response from the retrieval service.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Carries retrieval requests to the service.
///
/// Implementations only move bytes; interpreting the response is left to
/// [`RetrievalResult::from_reply`].
#[async_trait]
pub trait RetrievalTransport: Send + Sync {
    /// POST `request` and return whatever the service answered.
    async fn post(&self, request: TransportRequest) -> Result<TransportResponse, RetrievalFailure>;
}

/// [`RetrievalTransport`] over plain HTTP using `reqwest`.
///
/// Connects to `fqdn:port` of the configured [`ServiceEndpoint`] and sends
/// its `host` as the `Host` header.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    host: String,
}

impl HttpTransport {
    /// Create a transport with a default `reqwest` client.
    pub fn new(service: &ServiceEndpoint) -> Self {
        Self::with_client(reqwest::Client::new(), service)
    }

    /// Create a transport around an existing client, e.g. to share its pool.
    pub fn with_client(client: reqwest::Client, service: &ServiceEndpoint) -> Self {
        Self { client, base_url: service.base_url(), host: service.host.clone() }
    }
}

#[async_trait]
impl RetrievalTransport for HttpTransport {
    async fn post(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, RetrievalFailure> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder =
            self.client.post(&url).header(reqwest::header::HOST, &self.host).body(request.body);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(url = %url, error = %e, "retrieval request failed");
            RetrievalFailure::Transport(e.to_string())
        })?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| {
            warn!(url = %url, %status, error = %e, "failed to read retrieval response");
            RetrievalFailure::Transport(e.to_string())
        })?;

        Ok(TransportResponse { status, body })
    }
}

/// How a retrieval call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The service answered; the body has not been interpreted yet.
    Response { status: u16, body: Bytes },
    /// No answer is coming.
    Failed(RetrievalFailure),
}

impl Completion {
    /// Decode the completion into a usable result.
    ///
    /// # Errors
    ///
    /// Returns the synthetic failure, or the decoding failure of a response
    /// that is unparsable or reports a non-zero code.
    pub fn into_result(self) -> Result<RetrievalResult, RetrievalFailure> {
        match self {
            Completion::Response { status, body } => RetrievalResult::from_reply(status, &body),
            Completion::Failed(failure) => Err(failure),
        }
    }
}

/// A retrieval call in flight. Resolves to its [`Completion`] exactly once.
#[derive(Debug)]
#[must_use = "a pending retrieval does nothing useful unless awaited"]
pub struct PendingRetrieval {
    rx: oneshot::Receiver<Completion>,
}

impl PendingRetrieval {
    fn ready(completion: Completion) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(completion);
        Self { rx }
    }
}

impl Future for PendingRetrieval {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Completion> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Completion::Failed(RetrievalFailure::Dropped)))
    }
}

/// Issues retrieval calls with the configured credentials and budget.
///
/// Cheap to clone; every request handler can hold its own copy.
#[derive(Clone)]
pub struct RetrievalClient {
    transport: Arc<dyn RetrievalTransport>,
    endpoint: String,
    api_key: ApiKey,
    timeout: Duration,
}

impl std::fmt::Debug for RetrievalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalClient")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RetrievalClient {
    /// Create a client that sends through `transport`.
    pub fn new(config: &RetrievalConfig, transport: Arc<dyn RetrievalTransport>) -> Self {
        Self {
            transport,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            timeout: config.timeout,
        }
    }

    /// Create a client backed by [`HttpTransport`].
    pub fn http(config: &RetrievalConfig) -> Self {
        Self::new(config, Arc::new(HttpTransport::new(&config.service)))
    }

    /// The budget applied to every call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start one retrieval call for `query` without waiting for it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn send(&self, query: &RetrievalQuery) -> PendingRetrieval {
        let body = match serde_json::to_vec(query) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                warn!(error = %e, "failed to encode retrieval query");
                return PendingRetrieval::ready(Completion::Failed(RetrievalFailure::Transport(
                    format!("failed to encode query: {e}"),
                )));
            }
        };

        let request = TransportRequest {
            path: self.endpoint.clone(),
            headers: vec![
                ("content-type", "application/json".to_string()),
                ("authorization", format!("Bearer {}", self.api_key.expose())),
            ],
            body,
        };

        let (tx, rx) = oneshot::channel();
        let transport = Arc::clone(&self.transport);
        let timeout = self.timeout;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        debug!(endpoint = %self.endpoint, timeout_ms, "sending retrieval request");

        tokio::spawn(async move {
            let completion = match tokio::time::timeout(timeout, transport.post(request)).await {
                Ok(Ok(response)) => {
                    Completion::Response { status: response.status, body: response.body }
                }
                Ok(Err(failure)) => Completion::Failed(failure),
                Err(_) => {
                    warn!(timeout_ms, "retrieval timed out");
                    Completion::Failed(RetrievalFailure::Timeout(timeout_ms))
                }
            };
            // The receiver is gone only if the request itself was dropped.
            let _ = tx.send(completion);
        });

        PendingRetrieval { rx }
    }
}
