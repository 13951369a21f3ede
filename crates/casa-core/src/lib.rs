//! Casa Core - Shared types, wire envelope, and configuration
//!
//! This crate contains the foundational types used across the Casa
//! streaming components. It has no dependencies on networking code.

pub mod config;
pub mod error;
pub mod ids;
pub mod messages;

pub use config::{Config, NetworkConfig, RelayConfig, ViewerConfig};
pub use error::*;
pub use messages::*;

/// Session registry time-to-live (10 minutes)
pub const SESSION_TTL_SECS: u64 = 600;

/// Default signaling relay port
pub const DEFAULT_RELAY_PORT: u16 = 8080;

/// Default number of pre-warmed peer connections
pub const DEFAULT_PRE_CONNECTIONS: usize = 3;

/// Maximum inbound signaling frame size (64 KB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;
