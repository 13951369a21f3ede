//! Casa Signaling Relay
//!
//! Server-side half of the live-stream control plane. Viewers and cameras
//! hold a persistent WebSocket to the relay; the relay tracks every live
//! socket in a shared connection table and fans structured commands out to
//! all of them.
//!
//! # Protocol
//!
//! 1. Client opens a WebSocket; the relay assigns a connection id and
//!    persists a connection record
//! 2. Client sends `{ action, data? }` frames
//! 3. The relay validates the action and broadcasts
//!    `{ action, data, timestamp, connection_id }` to every live socket
//! 4. Sockets whose delivery fails permanently are evicted from the table
//! 5. On socket close the record is deleted

pub mod relay;
pub mod server;
pub mod store;

pub use relay::{BroadcastOutcome, Relay, RelayError};
pub use server::RelayServer;
pub use store::{ConnectionRecord, ConnectionStore, StoreError};

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = casa_core::DEFAULT_RELAY_PORT;
