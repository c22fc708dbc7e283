use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use ragflow_filter::{RagFilter, RetrievalConfig};
use ragflow_gateway::{ServerConfig, run_server};
use tracing_subscriber::EnvFilter;

/// Reverse proxy that injects RAGFlow retrieval context into chat completions.
#[derive(Debug, Parser)]
#[command(name = "ragflow-gateway", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "RAGFLOW_GATEWAY_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Base URL of the upstream model endpoint.
    #[arg(long, env = "RAGFLOW_GATEWAY_UPSTREAM")]
    upstream: String,

    /// Plugin configuration file (JSON with a top-level `rag` object).
    #[arg(long, env = "RAGFLOW_GATEWAY_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read {}", args.config.display()))?;
    let raw: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", args.config.display()))?;
    let config = RetrievalConfig::load(&raw).context("invalid plugin configuration")?;

    let server = ServerConfig { listen: args.listen, upstream: args.upstream };
    run_server(server, RagFilter::from_config(config)).await
}
