//! Relay registry and broadcast fan-out
//!
//! Tracks the live signaling sockets (sender handles keyed by connection
//! id, records in the shared [`ConnectionStore`]) and routes validated
//! commands to all of them. Broadcast favors over-delivery: every live
//! socket receives every command, and clients ignore what is not theirs.

use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use casa_core::{InboundCommand, StreamAction, StreamCommand};

use crate::store::{ConnectionStore, StoreError};

/// Result of a broadcast pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Sockets the command was handed to
    pub delivered: usize,
    /// Stale records evicted during the pass
    pub evicted: usize,
}

/// Relay registry: live senders plus the persisted connection table.
///
/// Every record written by this process has a matching sender; a record
/// whose sender is missing or closed means the socket is gone, which is
/// the permanent-gone condition that triggers eviction.
pub struct Relay {
    store: ConnectionStore,
    senders: DashMap<String, UnboundedSender<Message>>,
}

impl Relay {
    pub fn new(store: ConnectionStore) -> Self {
        Self {
            store,
            senders: DashMap::new(),
        }
    }

    /// Register a newly opened socket.
    ///
    /// A store failure leaves the socket usable for its own signaling but
    /// invisible to broadcast; the condition is logged, not surfaced.
    pub fn on_connect(&self, connection_id: &str, sender: UnboundedSender<Message>) {
        self.senders.insert(connection_id.to_string(), sender);

        if let Err(e) = self.store.add_connection(connection_id) {
            warn!(
                "Failed to record connection {}: {} (socket will not receive broadcasts)",
                connection_id, e
            );
        }
    }

    /// Deregister a socket. Idempotent.
    pub fn on_disconnect(&self, connection_id: &str) {
        self.senders.remove(connection_id);

        if let Err(e) = self.store.remove_connection(connection_id) {
            warn!("Failed to delete connection record {}: {}", connection_id, e);
        }
    }

    /// Validate an inbound frame and broadcast it to every live socket.
    ///
    /// Unsupported actions are rejected before any delivery happens.
    pub fn route(&self, from: &str, frame: &InboundCommand) -> Result<BroadcastOutcome, RelayError> {
        let action = StreamAction::parse(&frame.action)
            .ok_or_else(|| RelayError::UnsupportedAction(frame.action.clone()))?;

        let command = StreamCommand::new(action, frame.data.clone(), from);
        self.broadcast(&command, None)
    }

    /// Fan a command out to every recorded connection.
    ///
    /// Per-recipient delivery is independent: one socket failing never
    /// aborts delivery to the rest. A permanent-gone failure (closed or
    /// missing sender) evicts the record as a side effect, so the table
    /// self-heals without a separate sweep.
    pub fn broadcast(
        &self,
        command: &StreamCommand,
        exclude: Option<&str>,
    ) -> Result<BroadcastOutcome, RelayError> {
        let json = command
            .to_json()
            .map_err(|e| RelayError::Serialization(e.to_string()))?;

        let records = self.store.list_connections().map_err(RelayError::Store)?;

        let mut outcome = BroadcastOutcome::default();

        for record in records {
            if exclude == Some(record.connection_id.as_str()) {
                continue;
            }

            let sent = self
                .senders
                .get(&record.connection_id)
                .map(|tx| tx.send(Message::Text(json.clone())).is_ok())
                .unwrap_or(false);

            if sent {
                outcome.delivered += 1;
            } else {
                self.evict(&record.connection_id);
                outcome.evicted += 1;
            }
        }

        debug!(
            "Broadcast {}: delivered {}, evicted {}",
            command.action.as_str(),
            outcome.delivered,
            outcome.evicted
        );

        Ok(outcome)
    }

    /// Number of live sockets on this relay instance
    pub fn live_count(&self) -> usize {
        self.senders.len()
    }

    /// Number of records in the shared connection table
    pub fn record_count(&self) -> usize {
        self.store.connection_count().unwrap_or(0)
    }

    fn evict(&self, connection_id: &str) {
        self.senders.remove(connection_id);

        if let Err(e) = self.store.remove_connection(connection_id) {
            warn!("Failed to evict connection record {}: {}", connection_id, e);
        } else {
            debug!("Evicted stale connection: {}", connection_id);
        }
    }
}

/// Relay errors
#[derive(Debug)]
pub enum RelayError {
    /// Action is not in the supported set
    UnsupportedAction(String),
    /// Shared connection table unreachable
    Store(StoreError),
    /// Envelope could not be serialized
    Serialization(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::UnsupportedAction(a) => write!(f, "Unsupported action: {}", a),
            RelayError::Store(e) => write!(f, "Store error: {}", e),
            RelayError::Serialization(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for RelayError {}
