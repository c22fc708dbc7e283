//! The services a host runtime provides to the filter.

use bytes::Bytes;

/// Response header reporting whether retrieved context was injected.
pub const RECALL_HEADER: &str = "x-envoy-rag-recall";

/// Trace tag carrying the ids of the documents that were injected.
pub const RAG_DOCS_TAG: &str = "rag_docs";

/// Operations the filter performs on the request it is attached to.
///
/// A host implements this once per request. Calls arrive on the task that
/// drives that request, never concurrently.
pub trait FilterHost {
    /// Drop a request header before the request is forwarded.
    fn remove_request_header(&mut self, name: &str);

    /// Replace the buffered request body.
    fn replace_request_body(&mut self, body: Bytes);

    /// Add a header to the response returned to the client.
    fn add_response_header(&mut self, name: &str, value: &str);

    /// Park the request; later stages must not run until [`resume`](Self::resume).
    fn suspend(&mut self);

    /// Continue a request parked by [`suspend`](Self::suspend).
    fn resume(&mut self);

    /// Attach a tag to the request's trace span.
    fn set_trace_tag(&mut self, key: &str, value: &str);
}
