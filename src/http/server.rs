//! HTTP server wiring the limiter in front of a catch-all handler.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::from_fn_with_state,
    routing::{any, get},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::rate_limit_middleware;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{RateLimiter, StatsSnapshot};

/// HTTP server for the admission-controlled service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The limiter shared with every request
    limiter: Arc<RateLimiter>,
}

impl HttpServer {
    /// Create a server for `addr` sharing `limiter`.
    pub fn new(addr: SocketAddr, limiter: Arc<RateLimiter>) -> Self {
        Self { addr, limiter }
    }

    /// Build the router.
    ///
    /// Everything except `/stats` passes through the limiter.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", any(echo))
            .route("/{*path}", any(echo))
            .layer(from_fn_with_state(self.limiter.clone(), rate_limit_middleware))
            .route("/stats", get(stats))
            .with_state(self.limiter.clone())
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener, signal).await
    }

    /// Serve on an already-bound listener until `signal` resolves.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            storage = %self.limiter.storage_kind(),
            "Starting HTTP server with graceful shutdown"
        );

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                TurnstileError::Io(e)
            })
    }
}

async fn echo(request: Request<Body>) -> Json<Value> {
    Json(json!({
        "method": request.method().as_str(),
        "path": request.uri().path(),
    }))
}

async fn stats(State(limiter): State<Arc<RateLimiter>>) -> Json<StatsSnapshot> {
    Json(limiter.stats())
}
