//! Per-request pipeline controller.
//!
//! [`RagFilter`] is built once from the configuration and shared by all
//! requests. Each request gets its own [`RequestFilter`], which the host
//! drives through the request stages:
//!
//! ```text
//! Start ─headers─▶ AwaitingBody ─body─▶ RetrievalInFlight ─completion─▶ Merged ─┐
//!                       │                       ├──────────────────────▶ PassThrough ─┼─▶ Done
//!                       └──────────▶ PassThrough └──────────────────────▶ Failed ─────┘
//! ```
//!
//! The only suspension point is `RetrievalInFlight`. Every request that
//! suspends is resumed exactly once, whatever the retrieval outcome.
//!
//! ```rust,ignore
//! let filter = RagFilter::from_config(config);
//! let mut request = filter.new_request();
//! request.on_request_headers(&mut host);
//! request.run_request_body(&mut host, &body).await;
//! // ... forward upstream ...
//! request.on_response_headers(&mut host);
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::client::{Completion, PendingRetrieval, RetrievalClient};
use crate::config::RetrievalConfig;
use crate::error::RetrievalFailure;
use crate::host::{FilterHost, RAG_DOCS_TAG, RECALL_HEADER};
use crate::message::ChatRequest;
use crate::transform::{build_retrieval_query, extract_query, merge_result};

/// Where a request is in the filter's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    AwaitingBody,
    RetrievalInFlight,
    /// Retrieved context was injected into the body.
    Merged,
    /// The request proceeds with its original body.
    PassThrough,
    /// Retrieval failed; the request proceeds with its original body.
    Failed,
    Done,
}

/// What the host should do after handing over the request body.
#[derive(Debug)]
pub enum BodyAction {
    /// Forward the request now.
    Continue,
    /// The request is suspended. Await the retrieval and pass its
    /// completion to [`RequestFilter::on_retrieval_complete`].
    Pause(PendingRetrieval),
}

/// Per-request state read by the response stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Whether retrieved context was injected.
    pub recalled: bool,
    /// Documents the injected chunks came from, in injection order.
    pub document_ids: Vec<String>,
}

/// The filter shared by every request: configuration plus retrieval client.
#[derive(Debug, Clone)]
pub struct RagFilter {
    config: Arc<RetrievalConfig>,
    client: RetrievalClient,
}

impl RagFilter {
    /// Create a filter that retrieves through `client`.
    pub fn new(config: Arc<RetrievalConfig>, client: RetrievalClient) -> Self {
        Self { config, client }
    }

    /// Create a filter that talks to the configured service over HTTP.
    pub fn from_config(config: RetrievalConfig) -> Self {
        let client = RetrievalClient::http(&config);
        Self::new(Arc::new(config), client)
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Start handling a new request.
    pub fn new_request(&self) -> RequestFilter {
        RequestFilter {
            config: Arc::clone(&self.config),
            client: self.client.clone(),
            phase: Phase::Start,
            outcome: None,
            suspended: false,
            context: RequestContext::default(),
            in_flight: None,
        }
    }
}

/// State the request keeps while its retrieval is outstanding.
#[derive(Debug)]
struct InFlight {
    /// The parsed request, holding the conversation without its last message.
    request: ChatRequest,
    query: String,
}

/// The filter instance attached to one request.
#[derive(Debug)]
pub struct RequestFilter {
    config: Arc<RetrievalConfig>,
    client: RetrievalClient,
    phase: Phase,
    outcome: Option<Phase>,
    suspended: bool,
    context: RequestContext,
    in_flight: Option<InFlight>,
}

impl RequestFilter {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The terminal state (`Merged`, `PassThrough` or `Failed`) this request
    /// went through, once it has reached `Done`.
    pub fn outcome(&self) -> Option<Phase> {
        self.outcome
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Request-headers stage.
    ///
    /// The body is going to be rewritten, so its length must not be declared
    /// up front.
    pub fn on_request_headers<H: FilterHost + ?Sized>(&mut self, host: &mut H) {
        if self.phase != Phase::Start {
            warn!(phase = ?self.phase, "request headers seen twice; ignoring");
            return;
        }
        host.remove_request_header("content-length");
        self.phase = Phase::AwaitingBody;
    }

    /// Request-body stage, called with the fully buffered body.
    ///
    /// Bodies that are not chat requests, or that carry no messages, pass
    /// through without a retrieval. Otherwise the host is suspended and the
    /// retrieval is started.
    pub fn on_request_body<H: FilterHost + ?Sized>(
        &mut self,
        host: &mut H,
        body: &[u8],
    ) -> BodyAction {
        if self.phase != Phase::AwaitingBody {
            warn!(phase = ?self.phase, "unexpected request body; ignoring");
            return BodyAction::Continue;
        }

        let mut request = match ChatRequest::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "failed to parse request body");
                self.finish(host, Phase::PassThrough);
                return BodyAction::Continue;
            }
        };

        let (query, remainder) = match extract_query(std::mem::take(&mut request.messages)) {
            Ok(split) => split,
            Err(e) => {
                warn!(error = %e, "nothing to retrieve for");
                self.finish(host, Phase::PassThrough);
                return BodyAction::Continue;
            }
        };
        request.messages = remainder;

        info!(query = %query, "retrieving context for user query");
        let retrieval = build_retrieval_query(&query, &self.config);

        host.suspend();
        self.suspended = true;
        self.phase = Phase::RetrievalInFlight;
        self.in_flight = Some(InFlight { request, query });

        BodyAction::Pause(self.client.send(&retrieval))
    }

    /// Retrieval completion stage.
    ///
    /// Injects matching context when there is any, then resumes the request.
    /// Failures leave the body untouched.
    pub fn on_retrieval_complete<H: FilterHost + ?Sized>(
        &mut self,
        host: &mut H,
        completion: Completion,
    ) {
        let Some(InFlight { mut request, query }) = self.in_flight.take() else {
            warn!(phase = ?self.phase, "retrieval completion with nothing pending; ignoring");
            return;
        };

        let result = match completion.into_result() {
            Ok(result) => result,
            Err(failure) => {
                log_failure(&failure);
                self.finish(host, Phase::Failed);
                return;
            }
        };
        debug!(chunks = result.chunks.len(), total = result.total, "retrieval response received");

        let outcome = merge_result(request.messages, &query, &result, &self.config);
        if !outcome.matched {
            info!("no chunk met the similarity threshold");
            self.finish(host, Phase::PassThrough);
            return;
        }

        request.messages = outcome.conversation;
        let body = match request.to_vec() {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "failed to encode augmented request");
                self.finish(host, Phase::Failed);
                return;
            }
        };

        info!(chunk_count = outcome.document_ids.len(), "injecting retrieved context");
        host.replace_request_body(Bytes::from(body));
        host.set_trace_tag(RAG_DOCS_TAG, &outcome.document_ids.join(", "));
        self.context.recalled = true;
        self.context.document_ids = outcome.document_ids;
        self.finish(host, Phase::Merged);
    }

    /// Run the body stage and, if it suspends, wait for the retrieval and
    /// complete it.
    pub async fn run_request_body<H: FilterHost + ?Sized>(&mut self, host: &mut H, body: &[u8]) {
        if let BodyAction::Pause(pending) = self.on_request_body(host, body) {
            let completion = pending.await;
            self.on_retrieval_complete(host, completion);
        }
    }

    /// Response-headers stage: report whether context was injected.
    pub fn on_response_headers<H: FilterHost + ?Sized>(&self, host: &mut H) {
        let value = if self.context.recalled { "true" } else { "false" };
        debug!(header = RECALL_HEADER, value, "annotating response");
        host.add_response_header(RECALL_HEADER, value);
    }

    fn finish<H: FilterHost + ?Sized>(&mut self, host: &mut H, outcome: Phase) {
        self.phase = outcome;
        self.outcome = Some(outcome);
        if std::mem::take(&mut self.suspended) {
            host.resume();
        }
        self.phase = Phase::Done;
    }
}

fn log_failure(failure: &RetrievalFailure) {
    match failure {
        RetrievalFailure::Timeout(ms) => {
            error!(timeout_ms = *ms, "retrieval timed out; forwarding original request")
        }
        other => error!(error = %other, "failed to retrieve context; forwarding original request"),
    }
}
