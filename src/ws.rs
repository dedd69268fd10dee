//! Tunnel WebSocket endpoint and per-tunnel read pump.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /v1/ws?auth_token=<token>` — the token is
//!    resolved to a user id before the upgrade completes (browsers can't set
//!    headers on WebSocket upgrades).
//! 2. The tunnel is registered and two tasks run for its lifetime: a writer
//!    task draining the outbound queue into the socket, and the read pump.
//! 3. The pump enforces a 60 s read deadline re-armed by any inbound message;
//!    app-level `ping` frames keep an idle tunnel alive and get a `pong` with
//!    the echoed id.
//! 4. Response frames are routed to the pending-request table by envelope id.
//!    A frame for an id that is absent (request finished or timed out) or
//!    whose sink is full is dropped with a log — slow consumers never stall
//!    the tunnel.
//! 5. On read error, deadline, or close the tunnel is removed from the
//!    registry and closed.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::auth;
use crate::frame::{Frame, FrameType};
use crate::logbuf::LogLevel;
use crate::pending::DispatchOutcome;
use crate::state::AppState;
use crate::tunnel::{Tunnel, OUTBOUND_QUEUE};

/// Query params for the tunnel upgrade.
#[derive(Deserialize)]
pub struct WsQuery {
    auth_token: String,
}

/// `GET /v1/ws?auth_token=<token>` — authenticate and upgrade to a tunnel.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(user_id) = auth::validate_tunnel_token(&state.config, &query.auth_token) else {
        warn!("Tunnel authentication failed");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    info!(user = %user_id, "Tunnel connecting");
    ws.on_upgrade(move |socket| {
        let span = info_span!("tunnel", user = %user_id);
        handle_socket(socket, state, user_id).instrument(span)
    })
}

/// Run one tunnel: register it, pump frames until the connection dies, clean up.
async fn handle_socket(socket: WebSocket, state: AppState, user_id: String) {
    let (mut ws_sink, ws_stream) = socket.split();
    let (tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let tunnel = Arc::new(Tunnel::new(user_id.clone(), tx));

    state.registry.add(Arc::clone(&tunnel)).await;
    info!(tunnel = %tunnel.id(), "Tunnel registered");
    state
        .log
        .append(
            LogLevel::Info,
            format!("Tunnel connected for {user_id}"),
            Some(json!({"user_id": user_id, "tunnel_id": tunnel.id()})),
        )
        .await;

    // Writer task: sole owner of the sink, so outbound frames from any request
    // worker are serialized and never interleave.
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if ws_sink.send(message).await.is_err() {
                break;
            }
        }
    });

    read_pump(ws_stream, &state, &tunnel).await;

    state.registry.remove(&tunnel).await;
    tunnel.close();
    send_task.abort();
    let idle = tunnel.idle_for().await;
    info!(tunnel = %tunnel.id(), idle_secs = idle.as_secs(), "Tunnel closed");
    state
        .log
        .append(
            LogLevel::Info,
            format!("Tunnel closed for {user_id}"),
            Some(json!({"user_id": user_id, "tunnel_id": tunnel.id()})),
        )
        .await;
}

/// Read frames until error, close, or deadline. Every received message re-arms
/// the deadline and the tunnel's last-activity timestamp.
async fn read_pump(mut stream: SplitStream<WebSocket>, state: &AppState, tunnel: &Arc<Tunnel>) {
    let read_timeout = Duration::from_secs(state.config.tunnel.read_timeout_secs);

    loop {
        let message = match tokio::time::timeout(read_timeout, stream.next()).await {
            Err(_) => {
                warn!(tunnel = %tunnel.id(), "Read deadline elapsed, closing tunnel");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!(tunnel = %tunnel.id(), "Tunnel read error: {e}");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        tunnel.touch().await;

        match message {
            Message::Text(text) => {
                if !handle_frame(state, tunnel, &text).await {
                    break;
                }
            }
            Message::Close(_) => break,
            // Protocol-level ping/pong is handled by the transport; binary
            // frames are not part of the envelope contract.
            _ => {}
        }
    }
}

/// Process one inbound text message. Returns `false` when the pump should exit.
async fn handle_frame(state: &AppState, tunnel: &Arc<Tunnel>, text: &str) -> bool {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(tunnel = %tunnel.id(), "Failed to parse tunnel frame: {e}");
            return true;
        }
    };

    match frame.kind {
        FrameType::Ping => {
            if let Err(e) = tunnel.write(&Frame::pong(&frame.id)).await {
                warn!(tunnel = %tunnel.id(), "Failed to send pong: {e}");
                return false;
            }
            true
        }
        kind if kind.is_response() => {
            debug!(
                tunnel = %tunnel.id(),
                request_id = %frame.id,
                kind = kind.as_str(),
                "Routing response frame"
            );
            let request_id = frame.id.clone();
            match state.pending.dispatch(&request_id, frame) {
                DispatchOutcome::Delivered => {}
                DispatchOutcome::QueueFull => {
                    warn!(
                        request_id = %request_id,
                        kind = kind.as_str(),
                        "Response queue full, dropping frame"
                    );
                }
                DispatchOutcome::NotFound => {
                    warn!(
                        request_id = %request_id,
                        "Frame for unknown or completed request, dropping"
                    );
                }
            }
            true
        }
        _ => {
            warn!(
                tunnel = %tunnel.id(),
                kind = frame.kind.as_str(),
                "Unknown frame type from client"
            );
            true
        }
    }
}
