use std::net::SocketAddr;

use anyhow::Context;
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use ragflow_filter::RagFilter;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, error, field, info, info_span};

use crate::exchange::Exchange;

/// Headers that describe a single hop and are not copied across the proxy.
static HOP_BY_HOP: [header::HeaderName; 6] = [
    header::CONNECTION,
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::TE,
    header::UPGRADE,
];

#[derive(Clone, Debug)]
pub struct AppState {
    pub filter: RagFilter,
    pub upstream: String,
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(filter: RagFilter, upstream: impl Into<String>) -> Self {
        let upstream = upstream.into().trim_end_matches('/').to_string();
        Self { filter, upstream, client: reqwest::Client::new() }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Base URL of the model endpoint requests are forwarded to.
    pub upstream: String,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(proxy)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn run_server(config: ServerConfig, filter: RagFilter) -> anyhow::Result<()> {
    let app = app_router(AppState::new(filter, config.upstream.clone()));
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(upstream = %config.upstream, "ragflow-gateway listening on http://{}", config.listen);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({"status":"ok","service":"ragflow-gateway"}))
}

async fn proxy(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let span = info_span!("rag_request", %method, path = %uri.path(), rag_docs = field::Empty);
    handle(state, method, uri, headers, body).instrument(span).await
}

async fn handle(
    state: AppState,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut exchange = Exchange::new(headers, body.clone(), tracing::Span::current());

    // Only POST bodies are augmented; every response is annotated.
    let mut request = state.filter.new_request();
    if method == Method::POST {
        request.on_request_headers(&mut exchange);
        request.run_request_body(&mut exchange, &body).await;
    }

    let mut response = match forward(&state, method, &uri, &exchange).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "upstream request failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": {"message": format!("upstream request failed: {e}")}})),
            )
                .into_response()
        }
    };

    request.on_response_headers(&mut exchange);
    for (name, value) in exchange.response_headers() {
        response.headers_mut().append(name, value.clone());
    }
    response
}

async fn forward(
    state: &AppState,
    method: Method,
    uri: &Uri,
    exchange: &Exchange,
) -> Result<Response, reqwest::Error> {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let mut outbound = state
        .client
        .request(method, format!("{}{}", state.upstream, path))
        .body(exchange.body().clone());
    for (name, value) in exchange.request_headers() {
        if !HOP_BY_HOP.contains(name) {
            outbound = outbound.header(name, value);
        }
    }

    let upstream = outbound.send().await?;
    let mut builder = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if !HOP_BY_HOP.contains(name) {
            builder = builder.header(name, value);
        }
    }

    // Streamed so server-sent completions reach the client as they arrive.
    let body = Body::from_stream(upstream.bytes_stream());
    Ok(builder.body(body).unwrap_or_else(|e| {
        error!(error = %e, "failed to assemble upstream response");
        StatusCode::BAD_GATEWAY.into_response()
    }))
}
