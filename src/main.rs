use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewarden::config::ServiceConfig;
use ratewarden::ratelimit::{Janitor, MemoryStore, PolicyRegistry, RateLimiter};
use ratewarden::web::HttpServer;

/// Fixed-window rate limiting in front of the checkout site endpoints.
#[derive(Parser, Debug)]
#[command(name = "ratewarden", version, about)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// YAML policy table replacing the built-in one
    #[arg(short, long)]
    policies: Option<PathBuf>,

    /// Address for the HTTP server, overriding the configuration
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Ratewarden");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ServiceConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    let policies_path = args
        .policies
        .or_else(|| config.server.policies_path.as_ref().map(PathBuf::from));
    let policies = match policies_path {
        Some(path) => PolicyRegistry::from_file(path)?,
        None => PolicyRegistry::builtin(),
    };
    info!(
        endpoints = policies.len(),
        default_max = policies.default_policy().max_requests,
        "Rate limit policies loaded"
    );

    let fallback = Arc::new(MemoryStore::new());
    let rate_limiter = Arc::new(RateLimiter::from_config(
        &config.store,
        policies,
        Arc::clone(&fallback),
    ));
    let janitor = Janitor::spawn(fallback, config.janitor.interval());

    let server = HttpServer::new(config.server.http_addr, Arc::clone(&rate_limiter));

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    janitor.stop().await;
    rate_limiter.close().await;

    info!(stats = ?rate_limiter.stats(), "Ratewarden stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
