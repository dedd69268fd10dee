//! A single live tunnel connection owned by one user.
//!
//! The tunnel is passive on the write side: frames from any request worker are
//! pushed onto a bounded outbound queue and a dedicated writer task (spawned by
//! the upgrade handler in `ws`) drains the queue into the WebSocket sink, so
//! concurrent writers never interleave partial messages. The read side is owned
//! entirely by the read pump.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::ProxyError;
use crate::frame::Frame;

/// Outbound queue depth per tunnel.
pub const OUTBOUND_QUEUE: usize = 256;

pub struct Tunnel {
    /// Identity used for registry membership (not the user id — one user may
    /// hold several tunnels).
    id: String,
    user_id: String,
    tx: mpsc::Sender<Message>,
    closed: AtomicBool,
    /// Updated by the read pump on every inbound message.
    last_active: Mutex<Instant>,
}

impl Tunnel {
    /// Wrap the outbound half of an upgraded socket. `tx` feeds the tunnel's
    /// writer task.
    pub fn new(user_id: impl Into<String>, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            tx,
            closed: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Serialize `frame` and enqueue it as one text message.
    ///
    /// # Errors
    ///
    /// [`ProxyError::Transport`] if the tunnel is closed or its writer task has
    /// gone away.
    pub async fn write(&self, frame: &Frame) -> Result<(), ProxyError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProxyError::Transport("tunnel closed".to_string()));
        }
        let text = serde_json::to_string(frame).expect("Frame serializes");
        self.tx
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| ProxyError::Transport("tunnel writer gone".to_string()))
    }

    /// Mark the tunnel closed. Idempotent; subsequent [`Tunnel::write`] calls fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record inbound activity (called by the read pump on every message).
    pub async fn touch(&self) {
        *self.last_active.lock().await = Instant::now();
    }

    /// Time since the last inbound message.
    pub async fn idle_for(&self) -> Duration {
        self.last_active.lock().await.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameType;

    #[tokio::test]
    async fn test_write_emits_text_message() {
        let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);
        let tunnel = Tunnel::new("user-1", tx);

        tunnel.write(&Frame::pong("p-1")).await.unwrap();

        let Some(Message::Text(text)) = rx.recv().await else {
            panic!("expected text message");
        };
        let frame: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.kind, FrameType::Pong);
        assert_eq!(frame.id, "p-1");
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE);
        let tunnel = Tunnel::new("user-1", tx);

        tunnel.close();
        tunnel.close(); // idempotent
        assert!(tunnel.is_closed());
        assert!(matches!(
            tunnel.write(&Frame::pong("p")).await,
            Err(ProxyError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_write_fails_when_writer_gone() {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let tunnel = Tunnel::new("user-1", tx);
        drop(rx);

        assert!(matches!(
            tunnel.write(&Frame::pong("p")).await,
            Err(ProxyError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_tunnels_have_distinct_ids() {
        let (tx, _rx) = mpsc::channel::<Message>(1);
        let a = Tunnel::new("user-1", tx.clone());
        let b = Tunnel::new("user-1", tx);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.user_id(), b.user_id());
    }
}
