//! Proxy error taxonomy and its HTTP mapping.
//!
//! Every pre-commit failure in the request path maps to exactly one of these
//! kinds. Once response headers have been committed no further status can be
//! emitted; those failures are logged and the connection is torn down instead
//! (see `proxy::assembler`).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Ingress or upgrade authentication failed.
    #[error("proxy authentication failed")]
    AuthFailure,

    /// `AUTH_API_KEY` is unset; the server cannot authenticate anyone.
    #[error("server configuration error")]
    ServerConfig,

    /// No live tunnel registered for the user.
    #[error("no active client connected for user {0}")]
    NoActiveClient(String),

    /// Writing the request frame to the tunnel failed.
    #[error("failed to send request to client: {0}")]
    Transport(String),

    /// The inbound request body could not be read.
    #[error("failed to read request body")]
    BodyRead,

    /// The response sink closed before any frame arrived.
    #[error("response channel closed unexpectedly")]
    ChannelClosed,

    /// The tunneled client reported an error before headers were committed.
    #[error("{message}")]
    ClientReported { status: Option<u16>, message: String },

    /// No terminal frame arrived within the assembly deadline.
    #[error("gateway timeout")]
    GatewayTimeout,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthFailure => StatusCode::UNAUTHORIZED,
            Self::ServerConfig | Self::BodyRead | Self::ChannelClosed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NoActiveClient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::ClientReported { status, .. } => status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            Self::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// The plain-text body sent to the upstream HTTP client.
    pub fn message(&self) -> String {
        match self {
            Self::AuthFailure => "Proxy authentication failed".to_string(),
            Self::ServerConfig => "server configuration error".to_string(),
            Self::NoActiveClient(_) => {
                "Service Unavailable: No active client connected".to_string()
            }
            Self::Transport(_) => "Bad Gateway: Failed to send request to client".to_string(),
            Self::BodyRead => "Failed to read request body".to_string(),
            Self::ChannelClosed => {
                "Internal Server Error: Response channel closed unexpectedly".to_string()
            }
            Self::ClientReported { message, .. } => message.clone(),
            Self::GatewayTimeout => "Gateway Timeout".to_string(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), self.message()).into_response()
    }
}
