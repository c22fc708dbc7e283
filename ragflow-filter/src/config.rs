//! Configuration for the retrieval filter.
//!
//! The filter is configured once, when the plugin is loaded, from a JSON
//! document whose `rag` object names the retrieval service and the search
//! parameters. The resulting [`RetrievalConfig`] is immutable and is shared
//! read-only by every request the filter handles.
//!
//! ```rust,ignore
//! use ragflow_filter::RetrievalConfig;
//!
//! let raw = serde_json::json!({
//!     "rag": {
//!         "api_key": "ragflow-xxxx",
//!         "endpoint": "/api/v1/retrieval",
//!         "serviceHost": "ragflow.example.com",
//!         "serviceFQDN": "ragflow.dns",
//!         "servicePort": 80,
//!         "dataset_ids": ["ds1"]
//!     }
//! });
//! let config = RetrievalConfig::load(&raw)?;
//! ```

use std::fmt;
use std::time::Duration;

use serde_json::Value;

use crate::error::{ConfigError, Result};

/// Default result page.
pub const DEFAULT_PAGE: u32 = 1;
/// Default number of chunks per page.
pub const DEFAULT_PAGE_SIZE: u32 = 30;
/// Default minimum similarity for a chunk to be injected.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.2;
/// Default weight of vector similarity in the hybrid score.
pub const DEFAULT_VECTOR_SIMILARITY_WEIGHT: f64 = 0.3;
/// Default number of candidate chunks considered by the backend.
pub const DEFAULT_TOP_K: u32 = 1024;
/// Default retrieval budget in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
/// Placeholder replaced by the user's question in the answer prompt.
pub const QUERY_PLACEHOLDER: &str = "{query}";
/// Default template of the instruction message appended after the context.
pub const DEFAULT_ANSWER_PROMPT: &str = "Now, please answer the following question:\n{query}";

/// Required keys, checked in this order.
const REQUIRED_FIELDS: [(&str, &str); 5] = [
    ("api_key", "rag.api_key"),
    ("endpoint", "rag.endpoint"),
    ("serviceHost", "rag.serviceHost"),
    ("serviceFQDN", "rag.serviceFQDN"),
    ("servicePort", "rag.servicePort"),
];

/// The API key used to authenticate against the retrieval service.
///
/// Its `Debug` output is redacted so the key never reaches the logs.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a raw key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Return the raw key, for building the `Authorization` header.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Where the retrieval service lives.
///
/// Requests are addressed to `fqdn:port` and carry `host` as their
/// `Host` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Value of the `Host` header sent to the service.
    pub host: String,
    /// Resolvable name of the service.
    pub fqdn: String,
    /// Service port.
    pub port: u16,
}

impl ServiceEndpoint {
    /// The `scheme://authority` prefix of every retrieval URL.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.fqdn, self.port)
    }
}

/// Validated retrieval parameters and connection details.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalConfig {
    /// Datasets to search.
    pub dataset_ids: Vec<String>,
    /// Documents to search.
    pub document_ids: Vec<String>,
    /// Result page, starting at 1.
    pub page: u32,
    /// Chunks per page.
    pub page_size: u32,
    /// Chunks scoring below this are never injected.
    pub similarity_threshold: f64,
    /// Weight of vector similarity in the backend's hybrid score.
    pub vector_similarity_weight: f64,
    /// Candidate chunks considered by the backend.
    pub top_k: u32,
    /// Rerank model, if any.
    pub rerank_id: Option<String>,
    /// Enable keyword matching in the backend.
    pub keyword: bool,
    /// Ask the backend to highlight matched terms.
    pub highlight: bool,
    /// Credential for the retrieval service.
    pub api_key: ApiKey,
    /// Path of the retrieval API, e.g. `/api/v1/retrieval`.
    pub endpoint: String,
    /// Retrieval service location.
    pub service: ServiceEndpoint,
    /// Template of the final instruction message; contains [`QUERY_PLACEHOLDER`].
    pub answer_prompt: String,
    /// Upper bound on how long a request stays suspended.
    pub timeout: Duration,
}

impl RetrievalConfig {
    /// Create a new builder for constructing a [`RetrievalConfig`].
    pub fn builder() -> RetrievalConfigBuilder {
        RetrievalConfigBuilder::default()
    }

    /// Load the configuration from the plugin's raw JSON document.
    ///
    /// Required keys are checked first, in a fixed order, and the first one
    /// missing is reported. Optional keys fall back to their defaults.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::MissingField`] naming the first absent required key.
    /// - [`ConfigError::MissingSelector`] when no dataset or document ids are given.
    /// - [`ConfigError::InvalidValue`] for wrongly typed or out-of-range values.
    pub fn load(raw: &Value) -> Result<Self> {
        let rag = RawSection(raw.get("rag").filter(|v| !v.is_null()));

        for (key, field) in REQUIRED_FIELDS {
            if rag.get(key).is_none() {
                tracing::warn!(field, "configuration missing");
                return Err(ConfigError::MissingField(field));
            }
        }

        let mut builder = Self::builder()
            .api_key(rag.string("api_key", "rag.api_key")?)
            .endpoint(rag.string("endpoint", "rag.endpoint")?)
            .service(ServiceEndpoint {
                host: rag.string("serviceHost", "rag.serviceHost")?,
                fqdn: rag.string("serviceFQDN", "rag.serviceFQDN")?,
                port: rag.port("servicePort", "rag.servicePort")?,
            });

        if let Some(ids) = rag.string_list("dataset_ids", "rag.dataset_ids")? {
            builder = builder.dataset_ids(ids);
        }
        if let Some(ids) = rag.string_list("document_ids", "rag.document_ids")? {
            builder = builder.document_ids(ids);
        }
        if let Some(page) = rag.unsigned("page", "rag.page")? {
            builder = builder.page(page);
        }
        if let Some(size) = rag.unsigned("page_size", "rag.page_size")? {
            builder = builder.page_size(size);
        }
        if let Some(threshold) = rag.float("similarity_threshold", "rag.similarity_threshold")? {
            builder = builder.similarity_threshold(threshold);
        }
        if let Some(weight) =
            rag.float("vector_similarity_weight", "rag.vector_similarity_weight")?
        {
            builder = builder.vector_similarity_weight(weight);
        }
        if let Some(top_k) = rag.unsigned("top_k", "rag.top_k")? {
            builder = builder.top_k(top_k);
        }
        if rag.get("rerank_id").is_some() {
            builder = builder.rerank_id(rag.string("rerank_id", "rag.rerank_id")?);
        }
        if let Some(keyword) = rag.flag("keyword", "rag.keyword")? {
            builder = builder.keyword(keyword);
        }
        if let Some(highlight) = rag.flag("highlight", "rag.highlight")? {
            builder = builder.highlight(highlight);
        }
        if rag.get("answer_prompt").is_some() {
            builder = builder.answer_prompt(rag.string("answer_prompt", "rag.answer_prompt")?);
        }
        if let Some(ms) = rag.unsigned::<u64>("timeout_ms", "rag.timeout_ms")? {
            builder = builder.timeout(Duration::from_millis(ms));
        }

        builder.build()
    }

    /// The instruction message that closes an augmented conversation.
    pub fn render_answer_prompt(&self, query: &str) -> String {
        self.answer_prompt.replace(QUERY_PLACEHOLDER, query)
    }

    /// Timeout in whole milliseconds, for logs and failure reports.
    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Builder for constructing a validated [`RetrievalConfig`].
///
/// Optional parameters start at their documented defaults.
#[derive(Debug, Clone)]
pub struct RetrievalConfigBuilder {
    api_key: Option<ApiKey>,
    endpoint: Option<String>,
    service: Option<ServiceEndpoint>,
    dataset_ids: Vec<String>,
    document_ids: Vec<String>,
    page: u32,
    page_size: u32,
    similarity_threshold: f64,
    vector_similarity_weight: f64,
    top_k: u32,
    rerank_id: Option<String>,
    keyword: bool,
    highlight: bool,
    answer_prompt: String,
    timeout: Duration,
}

impl Default for RetrievalConfigBuilder {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: None,
            service: None,
            dataset_ids: Vec::new(),
            document_ids: Vec::new(),
            page: DEFAULT_PAGE,
            page_size: DEFAULT_PAGE_SIZE,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            vector_similarity_weight: DEFAULT_VECTOR_SIMILARITY_WEIGHT,
            top_k: DEFAULT_TOP_K,
            rerank_id: None,
            keyword: false,
            highlight: false,
            answer_prompt: DEFAULT_ANSWER_PROMPT.to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl RetrievalConfigBuilder {
    /// Set the API key.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(ApiKey::new(key));
        self
    }

    /// Set the retrieval API path.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the retrieval service location.
    pub fn service(mut self, service: ServiceEndpoint) -> Self {
        self.service = Some(service);
        self
    }

    /// Set the datasets to search.
    pub fn dataset_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dataset_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Set the documents to search.
    pub fn document_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.document_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    /// Set the minimum similarity for a chunk to be injected.
    pub fn similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn vector_similarity_weight(mut self, weight: f64) -> Self {
        self.vector_similarity_weight = weight;
        self
    }

    pub fn top_k(mut self, k: u32) -> Self {
        self.top_k = k;
        self
    }

    /// Set the rerank model.
    pub fn rerank_id(mut self, id: impl Into<String>) -> Self {
        self.rerank_id = Some(id.into());
        self
    }

    pub fn keyword(mut self, enabled: bool) -> Self {
        self.keyword = enabled;
        self
    }

    pub fn highlight(mut self, enabled: bool) -> Self {
        self.highlight = enabled;
        self
    }

    /// Set the instruction template; it must contain [`QUERY_PLACEHOLDER`].
    pub fn answer_prompt(mut self, template: impl Into<String>) -> Self {
        self.answer_prompt = template.into();
        self
    }

    /// Set the retrieval budget.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the [`RetrievalConfig`], validating that parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for an unset api key, endpoint or
    /// service, [`ConfigError::MissingSelector`] when both id lists are empty,
    /// and [`ConfigError::InvalidValue`] when a parameter is out of range.
    pub fn build(self) -> Result<RetrievalConfig> {
        let api_key = self.api_key.ok_or(ConfigError::MissingField("rag.api_key"))?;
        let endpoint = self.endpoint.ok_or(ConfigError::MissingField("rag.endpoint"))?;
        let service = self.service.ok_or(ConfigError::MissingField("rag.serviceHost"))?;

        if self.dataset_ids.is_empty() && self.document_ids.is_empty() {
            tracing::warn!("either 'rag.dataset_ids' or 'rag.document_ids' must be provided");
            return Err(ConfigError::MissingSelector);
        }

        if service.port == 0 {
            return Err(invalid("rag.servicePort", "must be between 1 and 65535"));
        }
        if self.page == 0 {
            return Err(invalid("rag.page", "must be at least 1"));
        }
        if self.page_size == 0 {
            return Err(invalid("rag.page_size", "must be at least 1"));
        }
        if self.top_k == 0 {
            return Err(invalid("rag.top_k", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(invalid("rag.similarity_threshold", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.vector_similarity_weight) {
            return Err(invalid("rag.vector_similarity_weight", "must be within [0, 1]"));
        }
        if !self.answer_prompt.contains(QUERY_PLACEHOLDER) {
            return Err(invalid("rag.answer_prompt", "must contain the {query} placeholder"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("rag.timeout_ms", "must be at least 1"));
        }

        Ok(RetrievalConfig {
            dataset_ids: self.dataset_ids,
            document_ids: self.document_ids,
            page: self.page,
            page_size: self.page_size,
            similarity_threshold: self.similarity_threshold,
            vector_similarity_weight: self.vector_similarity_weight,
            top_k: self.top_k,
            rerank_id: self.rerank_id,
            keyword: self.keyword,
            highlight: self.highlight,
            api_key,
            endpoint,
            service,
            answer_prompt: self.answer_prompt,
            timeout: self.timeout,
        })
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue { field, reason: reason.into() }
}

/// Typed accessors over the `rag` object. `null` counts as absent.
struct RawSection<'a>(Option<&'a Value>);

impl<'a> RawSection<'a> {
    fn get(&self, key: &str) -> Option<&'a Value> {
        self.0.and_then(|section| section.get(key)).filter(|v| !v.is_null())
    }

    fn string(&self, key: &str, field: &'static str) -> Result<String> {
        match self.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(invalid(field, format!("expected a string, got {other}"))),
            None => Err(ConfigError::MissingField(field)),
        }
    }

    fn string_list(&self, key: &str, field: &'static str) -> Result<Option<Vec<String>>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let items = value
            .as_array()
            .ok_or_else(|| invalid(field, "expected an array of strings"))?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(field, format!("expected a string, got {item}")))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    fn unsigned<T: TryFrom<u64>>(&self, key: &str, field: &'static str) -> Result<Option<T>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        value
            .as_u64()
            .and_then(|n| T::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| invalid(field, format!("expected a non-negative integer, got {value}")))
    }

    fn port(&self, key: &str, field: &'static str) -> Result<u16> {
        let value = self.get(key).ok_or(ConfigError::MissingField(field))?;
        let port = match value {
            Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Value::String(s) => s.trim().parse::<u16>().ok(),
            _ => None,
        };
        port.ok_or_else(|| invalid(field, format!("expected a port number, got {value}")))
    }

    fn float(&self, key: &str, field: &'static str) -> Result<Option<f64>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        value
            .as_f64()
            .map(Some)
            .ok_or_else(|| invalid(field, format!("expected a number, got {value}")))
    }

    fn flag(&self, key: &str, field: &'static str) -> Result<Option<bool>> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        value
            .as_bool()
            .map(Some)
            .ok_or_else(|| invalid(field, format!("expected a boolean, got {value}")))
    }
}
