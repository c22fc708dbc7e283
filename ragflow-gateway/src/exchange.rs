//! [`FilterHost`] implementation over one proxied HTTP exchange.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use ragflow_filter::FilterHost;
use tracing::{Span, debug, warn};

/// The request being proxied and the headers of its response.
///
/// Trace tags are recorded on `span`, which must declare them as fields.
#[derive(Debug)]
pub struct Exchange {
    request_headers: HeaderMap,
    body: Bytes,
    response_headers: HeaderMap,
    span: Span,
    suspended: bool,
}

impl Exchange {
    pub fn new(request_headers: HeaderMap, body: Bytes, span: Span) -> Self {
        Self { request_headers, body, response_headers: HeaderMap::new(), span, suspended: false }
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    /// The body to forward upstream: the original or the filter's rewrite.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Headers the filter added to the response.
    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }
}

impl FilterHost for Exchange {
    fn remove_request_header(&mut self, name: &str) {
        self.request_headers.remove(name);
    }

    fn replace_request_body(&mut self, body: Bytes) {
        debug!(old_len = self.body.len(), new_len = body.len(), "request body replaced");
        self.body = body;
    }

    fn add_response_header(&mut self, name: &str, value: &str) {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.response_headers.append(name, value);
            }
            _ => warn!(header = name, "dropping invalid response header"),
        }
    }

    fn suspend(&mut self) {
        self.suspended = true;
    }

    fn resume(&mut self) {
        if !self.suspended {
            warn!("resume without a matching suspend");
        }
        self.suspended = false;
    }

    fn set_trace_tag(&mut self, key: &str, value: &str) {
        self.span.record(key, value);
    }
}
