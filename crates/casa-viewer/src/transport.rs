//! Media-transport capability seam
//!
//! The pool and broker never touch a concrete media stack. They depend on
//! the two traits here: a factory that constructs peer connections and the
//! connection handle itself (offer/answer plus an observable state signal).
//! The embedding application injects the production implementation; the
//! in-process loopback implementation below backs the tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use casa_core::ids::generate_connection_id;

/// Peer connection lifecycle states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// A single peer connection handle.
///
/// State changes are published on a watch channel rather than through
/// callbacks, so observers drive their own state machines from an explicit
/// signal instead of mutating shared state from a callback context.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Produce the local session description
    async fn create_offer(&self) -> Result<String, TransportError>;

    /// Apply the remote session description
    async fn set_remote_description(&self, answer: &str) -> Result<(), TransportError>;

    /// Current connection state
    fn state(&self) -> PeerState;

    /// Subscribe to connection-state changes
    fn subscribe_state(&self) -> watch::Receiver<PeerState>;

    /// Close the underlying transport. Safe to call more than once.
    async fn close(&self);
}

/// Factory for peer connections
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn create_connection(&self) -> Result<Arc<dyn PeerConnection>, TransportError>;
}

/// Transport errors
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Connection construction failed
    Construction(String),
    /// Offer/answer exchange failed
    Negotiation(String),
    /// Operation on a closed connection
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Construction(e) => write!(f, "Construction failed: {}", e),
            TransportError::Negotiation(e) => write!(f, "Negotiation failed: {}", e),
            TransportError::Closed => write!(f, "Connection is closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// In-process transport for tests and local development.
///
/// Connections complete the handshake as soon as a remote description is
/// applied. A failing variant exercises construction-error paths.
pub struct LoopbackTransport {
    fail_construction: bool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            fail_construction: false,
        }
    }

    /// A transport whose every construction attempt fails
    pub fn failing() -> Self {
        Self {
            fail_construction: true,
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    async fn create_connection(&self) -> Result<Arc<dyn PeerConnection>, TransportError> {
        if self.fail_construction {
            return Err(TransportError::Construction(
                "loopback transport configured to fail".into(),
            ));
        }
        Ok(Arc::new(LoopbackConnection::new()))
    }
}

/// Loopback peer connection
pub struct LoopbackConnection {
    id: String,
    state_tx: watch::Sender<PeerState>,
}

impl LoopbackConnection {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(PeerState::New);
        Self {
            id: generate_connection_id(),
            state_tx,
        }
    }
}

impl Default for LoopbackConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_offer(&self) -> Result<String, TransportError> {
        if self.state() == PeerState::Closed {
            return Err(TransportError::Closed);
        }
        self.state_tx.send_replace(PeerState::Connecting);
        Ok(format!("offer:{}", self.id))
    }

    async fn set_remote_description(&self, answer: &str) -> Result<(), TransportError> {
        if self.state() == PeerState::Closed {
            return Err(TransportError::Closed);
        }
        if answer.is_empty() {
            self.state_tx.send_replace(PeerState::Failed);
            return Err(TransportError::Negotiation("empty remote description".into()));
        }
        self.state_tx.send_replace(PeerState::Connected);
        Ok(())
    }

    fn state(&self) -> PeerState {
        *self.state_tx.borrow()
    }

    fn subscribe_state(&self) -> watch::Receiver<PeerState> {
        self.state_tx.subscribe()
    }

    async fn close(&self) {
        self.state_tx.send_replace(PeerState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_handshake() {
        let transport = LoopbackTransport::new();
        let conn = transport.create_connection().await.unwrap();
        assert_eq!(conn.state(), PeerState::New);

        let offer = conn.create_offer().await.unwrap();
        assert!(offer.starts_with("offer:"));
        assert_eq!(conn.state(), PeerState::Connecting);

        conn.set_remote_description("answer:remote").await.unwrap();
        assert_eq!(conn.state(), PeerState::Connected);

        conn.close().await;
        assert_eq!(conn.state(), PeerState::Closed);
    }

    #[tokio::test]
    async fn test_failing_transport() {
        let transport = LoopbackTransport::failing();
        assert!(transport.create_connection().await.is_err());
    }

    #[tokio::test]
    async fn test_state_subscription() {
        let conn = LoopbackConnection::new();
        let mut rx = conn.subscribe_state();

        conn.create_offer().await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), PeerState::Connecting);

        conn.set_remote_description("answer:x").await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), PeerState::Connected);
    }

    #[tokio::test]
    async fn test_empty_answer_fails_connection() {
        let conn = LoopbackConnection::new();
        conn.create_offer().await.unwrap();

        assert!(conn.set_remote_description("").await.is_err());
        assert_eq!(conn.state(), PeerState::Failed);
    }

    #[tokio::test]
    async fn test_operations_after_close() {
        let conn = LoopbackConnection::new();
        conn.close().await;
        conn.close().await;

        assert!(conn.create_offer().await.is_err());
        assert!(conn.set_remote_description("answer:x").await.is_err());
    }
}
