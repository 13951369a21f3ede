//! Casa Viewer - Client-side connection management for live camera streams
//!
//! This crate provides:
//! - A session registry for resuming negotiated media sessions
//! - A peer connection pool that pre-warms transports ahead of demand
//! - A connection broker that drives the negotiation handshake
//!
//! # Architecture
//!
//! ```text
//! viewer request
//!       │
//!       ▼
//! ┌─────────────┐   resumable?   ┌──────────────────┐
//! │   Broker    │───────────────▶│ Session Registry │
//! │ (state      │                └──────────────────┘
//! │  machine)   │   acquire      ┌──────────────────┐
//! │             │───────────────▶│ Connection Pool  │──▶ MediaTransport
//! │             │                └──────────────────┘     (injected)
//! │             │   offer/answer ┌──────────────────┐
//! │             │───────────────▶│ Signaling Client │──▶ relay socket
//! └─────────────┘                └──────────────────┘
//! ```
//!
//! Components are constructed explicitly and injected; there is no
//! process-wide state. The application composes one pool, one registry,
//! and one broker at its entry point and owns their lifecycle
//! (construct -> init -> cleanup).

pub mod broker;
pub mod pool;
pub mod session;
pub mod signaling;
pub mod transport;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerEvent, StreamHandle, StreamPhase};
pub use pool::{
    CameraConnection, ConnectionPool, PoolConfig, PoolError, PoolStatus, RelayChannel,
};
pub use session::{SessionInfo, SessionRegistry};
pub use signaling::{SignalingClient, SignalingError};
pub use transport::{
    LoopbackConnection, LoopbackTransport, MediaTransport, PeerConnection, PeerState,
    TransportError,
};
