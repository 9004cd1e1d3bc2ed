//! HTTP routes

pub mod billing;
pub mod chat;
pub mod webhooks;


use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, HeaderMap},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/subscriptions", post(billing::create_subscription))
        .route("/api/coupons/{code}", get(billing::validate_coupon))
        .route("/api/entitlement", get(billing::check_entitlement))
        .route("/api/chat", post(chat::chat))
        .route("/api/webhooks/stripe", post(webhooks::stripe_webhook))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Best-effort client address: proxy headers first when trusted, then the socket peer
pub struct ClientIp(pub String);

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(ClientIp(extract_client_ip(
            &parts.headers,
            peer,
            state.config.trust_proxy_headers,
        )))
    }
}

/// Proxy headers are client-controlled unless a known proxy rewrites them,
/// so they are only read when `trust_proxy_headers` is set.
pub(crate) fn extract_client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> String {
    let from_header = |name: &str| {
        headers
            .get(name)
            .and_then(|h| h.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(String::from)
    };

    let forwarded = if trust_proxy_headers {
        from_header("x-forwarded-for").or_else(|| from_header("x-real-ip"))
    } else {
        None
    };

    forwarded
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| {
            tracing::warn!("Could not determine client IP");
            "unknown".to_string()
        })
}
