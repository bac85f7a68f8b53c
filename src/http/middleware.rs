//! Axum middleware that runs every request through the limiter.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::debug;

use crate::ratelimit::{Decision, RateLimiter, RequestInfo};

/// Header consulted for the caller address when no socket address is attached.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Authenticated caller identity, inserted by an upstream auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

/// Snapshot the parts of `request` the limiter looks at.
pub fn request_info(request: &Request<Body>) -> RequestInfo {
    let mut info = RequestInfo::new(request.method().as_str(), request.uri().path());

    if let Some(ip) = remote_ip(request) {
        info = info.with_remote_ip(ip);
    }
    if let Some(Principal(identity)) = request.extensions().get::<Principal>() {
        info = info.with_identity(identity.clone());
    }
    info
}

fn remote_ip(request: &Request<Body>) -> Option<IpAddr> {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip());
    }

    // First hop is the original client.
    request
        .headers()
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|hop| hop.trim().parse().ok())
}

/// Admit the request to `next` or answer with the configured deny response.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let info = request_info(&request);

    match limiter.check(&info).await {
        Decision::Admitted { .. } => next.run(request).await,
        Decision::Rejected => {
            debug!(method = %info.method, path = %info.path, "Request denied");
            deny_response(&limiter)
        }
    }
}

fn deny_response(limiter: &RateLimiter) -> Response {
    let status =
        StatusCode::from_u16(limiter.deny_status()).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
    (status, Json(limiter.deny_body())).into_response()
}
