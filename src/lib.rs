#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]

//! gemini-relay library — exposes core modules for tests and downstream crates.
//!
//! The key building blocks:
//! - `frame` — the `{id, type, payload}` envelope exchanged over tunnels
//! - `registry` — user id → live tunnels, round-robin selection
//! - `tunnel` — one bidirectional framed connection with serialized writes
//! - `pending` — request id → response sink correlation table
//! - `proxy` — ingress handler, response assembler, body rewriter
//! - `ws` — tunnel upgrade endpoint and per-tunnel read pump
//! - `auth` — ingress API key and tunnel token validation
//! - `logbuf` — in-memory log ring buffer behind `/api/logs`
//! - `config` — TOML + env-var configuration
//! - `routes` — monitoring route handlers

pub mod auth;
pub mod config;
pub mod error;
pub mod frame;
pub mod logbuf;
pub mod pending;
pub mod proxy;
pub mod registry;
pub mod routes;
pub mod state;
pub mod tunnel;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::ProxyError;
pub use frame::{Frame, FrameType};
pub use logbuf::LogBuffer;
pub use pending::PendingRequests;
pub use registry::ConnectionRegistry;
pub use state::AppState;
pub use tunnel::Tunnel;
