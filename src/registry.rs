//! Multi-tenant connection registry with per-user round-robin selection.
//!
//! The outer map (`user id -> bucket`) sits behind a reader/writer lock;
//! membership and the round-robin cursor of each bucket are guarded by that
//! bucket's own mutex, so selection for one user never blocks changes for
//! another. The cursor is re-normalized modulo the current bucket size on
//! every access — under membership churn the same tunnel may be picked twice
//! in a row, which is accepted.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::error::ProxyError;
use crate::tunnel::Tunnel;

/// All live tunnels of one user plus the selection cursor.
pub struct UserConnections {
    inner: Mutex<Bucket>,
}

struct Bucket {
    tunnels: Vec<Arc<Tunnel>>,
    cursor: usize,
}

impl UserConnections {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Bucket {
                tunnels: Vec::new(),
                cursor: 0,
            }),
        }
    }
}

/// Registry of live tunnels keyed by user id.
#[derive(Default)]
pub struct ConnectionRegistry {
    users: RwLock<HashMap<String, Arc<UserConnections>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tunnel under its user, creating the bucket if absent.
    pub async fn add(&self, tunnel: Arc<Tunnel>) {
        let mut users = self.users.write().await;
        let bucket = users
            .entry(tunnel.user_id().to_string())
            .or_insert_with(|| Arc::new(UserConnections::new()));
        bucket.inner.lock().await.tunnels.push(tunnel);
    }

    /// Remove a tunnel by identity. Idempotent; empty buckets are dropped.
    pub async fn remove(&self, tunnel: &Tunnel) {
        let mut users = self.users.write().await;
        let Some(bucket) = users.get(tunnel.user_id()).cloned() else {
            return;
        };
        let now_empty = {
            let mut inner = bucket.inner.lock().await;
            inner.tunnels.retain(|t| t.id() != tunnel.id());
            inner.tunnels.is_empty()
        };
        if now_empty {
            users.remove(tunnel.user_id());
        }
    }

    /// Pick the next tunnel for `user_id`, round-robin.
    ///
    /// # Errors
    ///
    /// [`ProxyError::NoActiveClient`] when the user has no live tunnel.
    pub async fn get(&self, user_id: &str) -> Result<Arc<Tunnel>, ProxyError> {
        let bucket = {
            let users = self.users.read().await;
            users
                .get(user_id)
                .ok_or_else(|| ProxyError::NoActiveClient(user_id.to_string()))?
                .clone()
        };

        let mut inner = bucket.inner.lock().await;
        if inner.tunnels.is_empty() {
            return Err(ProxyError::NoActiveClient(user_id.to_string()));
        }
        inner.cursor %= inner.tunnels.len();
        let tunnel = Arc::clone(&inner.tunnels[inner.cursor]);
        inner.cursor = (inner.cursor + 1) % inner.tunnels.len();
        Ok(tunnel)
    }

    /// `(user count, total tunnel count)` for the health endpoint.
    pub async fn stats(&self) -> (usize, usize) {
        let users = self.users.read().await;
        let mut total = 0;
        for bucket in users.values() {
            total += bucket.inner.lock().await.tunnels.len();
        }
        (users.len(), total)
    }
}
