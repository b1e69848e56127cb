//! HTTP server wiring the rate limit middleware in front of the site endpoints.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::RateLimitLayer;
use crate::error::Result;
use crate::ratelimit::RateLimiter;

/// HTTP server for the rate limited endpoints.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>) -> Self {
        Self { addr, rate_limiter }
    }

    /// Build the router. Everything except `/health` is rate limited.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/upload-photo", post(upload))
            .route("/api/upload", post(upload))
            .route("/api/webhooks/{provider}", post(webhook))
            .layer(RateLimitLayer::new(Arc::clone(&self.rate_limiter)))
            .route("/health", get(health))
            .with_state(Arc::clone(&self.rate_limiter))
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}

async fn health(State(limiter): State<Arc<RateLimiter>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "shared_store": limiter.has_shared_store(),
        "local_counters": limiter.fallback().len(),
        "stats": limiter.stats(),
    }))
}

// Upload processing lives in the site; this acknowledges what got past the limiter.
async fn upload(body: Bytes) -> Json<Value> {
    info!(bytes = body.len(), "Upload accepted");
    Json(json!({ "received": true }))
}

async fn webhook(Path(provider): Path<String>, body: Bytes) -> Json<Value> {
    info!(provider = %provider, bytes = body.len(), "Webhook accepted");
    Json(json!({ "received": true }))
}
