//! Shared application state passed to every handler via Axum's `State` extractor.
//!
//! The registry, pending table, and log buffer are the only process-wide
//! resources; wrapping them here instead of module-level statics keeps handlers
//! testable with an isolated state per test.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::logbuf::LogBuffer;
use crate::pending::PendingRequests;
use crate::registry::ConnectionRegistry;

/// Shared application state for the relay server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Live tunnels keyed by user id.
    pub registry: Arc<ConnectionRegistry>,
    /// In-flight request correlation table.
    pub pending: Arc<PendingRequests>,
    /// In-memory log ring buffer backing `/api/logs`.
    pub log: Arc<LogBuffer>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let buffer_entries = config.logging.buffer_entries;
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry: Arc::new(ConnectionRegistry::new()),
            pending: Arc::new(PendingRequests::new()),
            log: Arc::new(LogBuffer::new(buffer_entries)),
        }
    }
}
