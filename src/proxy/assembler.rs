//! Translates the frame sequence of one request into an HTTP response.
//!
//! The assembler consumes a request's response sink until a terminal frame,
//! the deadline, or cancellation. Before headers are committed every failure
//! can still be reported as a proper HTTP status; afterwards the only options
//! are finishing the stream or aborting the connection, so post-commit errors
//! are logged and surfaced as a body-stream error.
//!
//! Streamed bodies are never buffered, with one exception: when a stream
//! opens with an error status (>= 400) the chunk data is also accumulated so
//! the complete upstream error body can be logged once at stream end.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

use crate::error::ProxyError;
use crate::frame::{Frame, FrameType};
use crate::logbuf::{LogBuffer, LogLevel};
use crate::pending::PendingGuard;

/// Per-request assembly parameters.
pub struct AssembleContext {
    pub request_id: String,
    /// Wall-clock bound on the whole assemble phase, headers and body.
    pub timeout: Duration,
    pub log: Arc<LogBuffer>,
}

/// Consume `rx` and materialize the HTTP response. The pending-table `guard`
/// travels with the response body so the entry lives exactly as long as the
/// request, including client disconnects mid-stream.
pub async fn assemble(
    mut rx: mpsc::Receiver<Frame>,
    guard: PendingGuard,
    ctx: AssembleContext,
) -> Response {
    let deadline = Instant::now() + ctx.timeout;

    loop {
        let frame = match timeout_at(deadline, rx.recv()).await {
            Err(_) => {
                warn!(request_id = %ctx.request_id, "No response from client before deadline");
                ctx.log
                    .append(
                        LogLevel::Error,
                        format!("Gateway timeout for request {}", ctx.request_id),
                        Some(json!({"request_id": ctx.request_id})),
                    )
                    .await;
                return ProxyError::GatewayTimeout.into_response();
            }
            Ok(None) => {
                error!(request_id = %ctx.request_id, "Response sink closed before any frame");
                return ProxyError::ChannelClosed.into_response();
            }
            Ok(Some(frame)) => frame,
        };

        match frame.kind {
            FrameType::HttpResponse => return single_shot(&frame, &ctx).await,
            FrameType::StreamStart => {
                let status = status_of(&frame);
                let headers = headers_of(frame.payload.get("headers"));
                let mut state = StreamState::new(rx, guard, deadline, ctx);
                if status.as_u16() >= 400 {
                    state.begin_error_capture(&frame, status).await;
                }
                info!(request_id = %state.ctx.request_id, status = status.as_u16(), "Stream starting");
                return committed_response(status, headers, state);
            }
            FrameType::StreamChunk => {
                // Chunk before stream_start: commit an implicit 200 and carry
                // this chunk as the first body segment.
                warn!(
                    request_id = %ctx.request_id,
                    "stream_chunk before stream_start, committing 200 OK"
                );
                let mut state = StreamState::new(rx, guard, deadline, ctx);
                state.pending_first = frame.payload_str("data").map(ToString::to_string);
                return committed_response(StatusCode::OK, HeaderMap::new(), state);
            }
            FrameType::StreamEnd => {
                return build_response(StatusCode::OK, HeaderMap::new(), Body::empty());
            }
            FrameType::Error => return client_error(&frame, &ctx).await,
            FrameType::Ping | FrameType::Pong | FrameType::HttpRequest | FrameType::Unknown => {
                warn!(
                    request_id = %ctx.request_id,
                    kind = frame.kind.as_str(),
                    "Unexpected frame while waiting for response"
                );
            }
        }
    }
}

/// Full response in a single `http_response` frame.
async fn single_shot(frame: &Frame, ctx: &AssembleContext) -> Response {
    let status = status_of(frame);
    let headers = headers_of(frame.payload.get("headers"));
    let body = frame.payload_str("body").unwrap_or_default().to_string();

    let log_id = frame.payload_str("request_id").unwrap_or(&frame.id);
    info!(request_id = %log_id, status = status.as_u16(), bytes = body.len(), "Response received");
    ctx.log
        .append(
            LogLevel::Info,
            format!("Response for {log_id}: status {}", status.as_u16()),
            Some(json!({
                "request_id": log_id,
                "status": status.as_u16(),
                "headers": frame.payload.get("headers"),
                "body": frame.payload.get("body"),
            })),
        )
        .await;

    build_response(status, headers, Body::from(body))
}

/// The tunneled client reported a failure before headers were committed.
async fn client_error(frame: &Frame, ctx: &AssembleContext) -> Response {
    let status = frame.payload_status();
    let message = frame
        .payload_str("error")
        .unwrap_or("Bad Gateway: Client reported an error")
        .to_string();

    let log_id = frame.payload_str("request_id").unwrap_or(&frame.id);
    error!(request_id = %log_id, status = ?status, "Client reported error: {message}");
    ctx.log
        .append(
            LogLevel::Error,
            format!("Client error for {log_id}: {message}"),
            Some(json!({
                "request_id": log_id,
                "status": status,
                "error": message,
                "headers": frame.payload.get("headers"),
                "body": frame.payload.get("body"),
                "url": frame.payload.get("url"),
                "method": frame.payload.get("method"),
            })),
        )
        .await;

    ProxyError::ClientReported { status, message }.into_response()
}

// ─── Streaming ───────────────────────────────────────────────────────────────

/// State threaded through the body stream after commit.
struct StreamState {
    rx: mpsc::Receiver<Frame>,
    deadline: Instant,
    ctx: AssembleContext,
    /// Chunk received before `stream_start`, emitted as the first segment.
    pending_first: Option<String>,
    error_status: Option<u16>,
    error_request_id: String,
    error_chunks: Vec<String>,
    _guard: PendingGuard,
}

impl StreamState {
    fn new(
        rx: mpsc::Receiver<Frame>,
        guard: PendingGuard,
        deadline: Instant,
        ctx: AssembleContext,
    ) -> Self {
        Self {
            rx,
            deadline,
            ctx,
            pending_first: None,
            error_status: None,
            error_request_id: String::new(),
            error_chunks: Vec::new(),
            _guard: guard,
        }
    }

    /// The stream opened with an error status; start accumulating its body.
    async fn begin_error_capture(&mut self, frame: &Frame, status: StatusCode) {
        self.error_status = Some(status.as_u16());
        self.error_request_id = frame
            .payload_str("request_id")
            .unwrap_or(&frame.id)
            .to_string();
        warn!(
            request_id = %self.error_request_id,
            status = status.as_u16(),
            "Stream opened with error status, capturing body"
        );
        self.ctx
            .log
            .append(
                LogLevel::Warn,
                format!(
                    "Stream error status {} for {}, awaiting body",
                    status.as_u16(),
                    self.error_request_id
                ),
                Some(json!({
                    "request_id": self.error_request_id,
                    "status": status.as_u16(),
                    "headers": frame.payload.get("headers"),
                })),
            )
            .await;
    }

    /// Emit the accumulated upstream error body as one log record.
    async fn flush_error_capture(&mut self) {
        let Some(status) = self.error_status.take() else {
            return;
        };
        if self.error_chunks.is_empty() {
            return;
        }
        let body: String = self.error_chunks.drain(..).collect();
        error!(
            request_id = %self.error_request_id,
            status,
            "Upstream error body: {body}"
        );
        self.ctx
            .log
            .append(
                LogLevel::Error,
                format!("Complete upstream error body for {}", self.error_request_id),
                Some(json!({
                    "request_id": self.error_request_id,
                    "status": status,
                    "error_body": body,
                })),
            )
            .await;
    }
}

/// Build the committed response whose body is driven by the remaining frames.
fn committed_response(status: StatusCode, headers: HeaderMap, state: StreamState) -> Response {
    let stream = futures::stream::unfold(state, |mut st| async move {
        if let Some(first) = st.pending_first.take() {
            if st.error_status.is_some() {
                st.error_chunks.push(first.clone());
            }
            if !first.is_empty() {
                return Some((Ok(first), st));
            }
        }
        loop {
            let frame = match timeout_at(st.deadline, st.rx.recv()).await {
                Err(_) => {
                    warn!(request_id = %st.ctx.request_id, "Stream incomplete: deadline elapsed");
                    return Some((Err(stream_abort("stream deadline elapsed")), st));
                }
                // Sink gone after commit: terminate what we have.
                Ok(None) => {
                    st.flush_error_capture().await;
                    return None;
                }
                Ok(Some(frame)) => frame,
            };

            match frame.kind {
                FrameType::StreamChunk => {
                    let data = frame.payload_str("data").unwrap_or_default().to_string();
                    if st.error_status.is_some() {
                        st.error_chunks.push(data.clone());
                    }
                    if data.is_empty() {
                        continue;
                    }
                    return Some((Ok(data), st));
                }
                FrameType::StreamEnd => {
                    st.flush_error_capture().await;
                    return None;
                }
                FrameType::HttpResponse | FrameType::StreamStart => {
                    warn!(
                        request_id = %st.ctx.request_id,
                        kind = frame.kind.as_str(),
                        "Frame after headers committed, ignoring"
                    );
                    continue;
                }
                FrameType::Error => {
                    let message = frame.payload_str("error").unwrap_or("unspecified");
                    error!(
                        request_id = %st.ctx.request_id,
                        "Client reported error after stream start: {message}"
                    );
                    st.ctx
                        .log
                        .append(
                            LogLevel::Error,
                            format!(
                                "Client error after commit for {}: {message}",
                                st.ctx.request_id
                            ),
                            Some(Value::Object(frame.payload.clone())),
                        )
                        .await;
                    return Some((Err(stream_abort("client error after commit")), st));
                }
                FrameType::Ping | FrameType::Pong | FrameType::HttpRequest | FrameType::Unknown => {
                    warn!(
                        request_id = %st.ctx.request_id,
                        kind = frame.kind.as_str(),
                        "Unexpected frame in stream, ignoring"
                    );
                    continue;
                }
            }
        }
    });

    build_response(status, headers, Body::from_stream(stream))
}

fn stream_abort(reason: &str) -> std::io::Error {
    std::io::Error::other(reason.to_string())
}

// ─── Payload helpers ─────────────────────────────────────────────────────────

/// `payload.status` as an HTTP status, defaulting to 200 when absent or invalid.
fn status_of(frame: &Frame) -> StatusCode {
    frame
        .payload_status()
        .and_then(|s| StatusCode::from_u16(s).ok())
        .unwrap_or(StatusCode::OK)
}

/// Convert a `headers` payload value into a header map. A JSON array value
/// appends each element (multi-value header); a scalar string sets the header.
fn headers_of(value: Option<&Value>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let Some(Value::Object(map)) = value else {
        return headers;
    };
    for (key, value) in map {
        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            warn!(header = %key, "Dropping invalid response header name");
            continue;
        };
        match value {
            Value::Array(values) => {
                for v in values {
                    if let Some(s) = v.as_str() {
                        if let Ok(hv) = HeaderValue::from_str(s) {
                            headers.append(name.clone(), hv);
                        }
                    }
                }
            }
            Value::String(s) => {
                if let Ok(hv) = HeaderValue::from_str(s) {
                    headers.insert(name, hv);
                }
            }
            _ => warn!(header = %key, "Dropping response header with non-string value"),
        }
    }
    headers
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
