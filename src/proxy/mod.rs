//! HTTP ingress — turns inbound requests into tunnel frames.
//!
//! Mounted as the router fallback so every path that isn't the WebSocket
//! upgrade or a monitoring endpoint is proxied. The flow for one request:
//!
//! 1. Authenticate and attribute the caller to a user id
//! 2. Register a response sink under a fresh request id (removed on every
//!    exit path by its guard)
//! 3. Read and rewrite the body, build the `http_request` frame
//! 4. Pick one of the user's tunnels round-robin and write the frame
//! 5. Hand the sink to the response assembler

pub mod assembler;
pub mod rewrite;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::error::ProxyError;
use crate::frame::Frame;
use crate::logbuf::LogLevel;
use crate::state::AppState;

use assembler::AssembleContext;

/// Hop-by-hop headers never forwarded in the request frame. Hyper presents
/// inbound header names lowercased, so the match set is lowercase.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Proxy one inbound HTTP request over a tunnel.
pub async fn handle(State(state): State<AppState>, request: Request) -> Response {
    let user_id =
        match auth::authenticate_proxy_request(&state.config, request.headers(), request.uri()) {
            Ok(user_id) => user_id,
            Err(e) => return e.into_response(),
        };

    let request_id = Uuid::new_v4().to_string();
    let method = request.method().as_str().to_string();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), |pq| pq.as_str().to_string());
    let headers = forwarded_headers(request.headers());

    let Some((guard, rx)) = state.pending.register(&request_id) else {
        // UUIDs don't collide; reaching this means the table is corrupted.
        error!(request_id = %request_id, "Request id already pending");
        return (StatusCode::INTERNAL_SERVER_ERROR, "duplicate request id").into_response();
    };

    let raw_body =
        match axum::body::to_bytes(request.into_body(), state.config.proxy.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(request_id = %request_id, "Failed to read request body: {e}");
                return ProxyError::BodyRead.into_response();
            }
        };

    let body = match rewrite::rewrite_request_body(&raw_body, &state.log).await {
        Some(fixed) => String::from_utf8_lossy(&fixed).into_owned(),
        None => String::from_utf8_lossy(&raw_body).into_owned(),
    };

    let url = format!("{}{}", state.config.proxy.upstream_base, path_and_query);
    let frame = Frame::http_request(&request_id, &method, &url, headers.clone(), body.clone());

    info!(
        request_id = %request_id,
        method = %method,
        path = %path_and_query,
        bytes = body.len(),
        "Proxying request"
    );
    state
        .log
        .append(
            LogLevel::Info,
            format!("Request {request_id}: {method} {path_and_query}"),
            Some(json!({
                "request_id": request_id,
                "method": method,
                "url": path_and_query,
                "headers": headers,
                "body": body,
            })),
        )
        .await;

    let tunnel = match state.registry.get(&user_id).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            warn!(request_id = %request_id, user = %user_id, "No active tunnel");
            state
                .log
                .append(
                    LogLevel::Error,
                    format!("No active client for request {request_id}"),
                    Some(json!({"request_id": request_id, "user_id": user_id})),
                )
                .await;
            return e.into_response();
        }
    };

    if let Err(e) = tunnel.write(&frame).await {
        error!(request_id = %request_id, tunnel = %tunnel.id(), "Tunnel write failed: {e}");
        state
            .log
            .append(
                LogLevel::Error,
                format!("Failed to forward request {request_id}"),
                Some(json!({"request_id": request_id, "error": e.to_string()})),
            )
            .await;
        return e.into_response();
    }

    let ctx = AssembleContext {
        request_id,
        timeout: Duration::from_secs(state.config.proxy.request_timeout_secs),
        log: Arc::clone(&state.log),
    };
    assembler::assemble(rx, guard, ctx).await
}

/// Headers forwarded to the tunneled fetcher: everything except hop-by-hop,
/// as ordered multi-value lists.
fn forwarded_headers(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for key in headers.keys() {
        if HOP_BY_HOP_HEADERS.contains(&key.as_str()) {
            continue;
        }
        let values: Vec<Value> = headers
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|s| json!(s))
            .collect();
        map.insert(key.as_str().to_string(), Value::Array(values));
    }
    Value::Object(map)
}
