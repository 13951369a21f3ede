//! Connection broker
//!
//! Orchestrates a viewer's request for a camera stream: consult the
//! session registry for a resumable media session, acquire a pooled peer
//! connection, drive the offer/answer exchange over signaling, and watch
//! the connection-state signal for the outcome. Each (viewer, camera)
//! request runs an explicit state machine:
//!
//! ```text
//! Idle -> Acquiring -> Negotiating -> { Connected | Failed } -> Closed
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use casa_core::ids::generate_connection_id;
use casa_core::{Config, StreamAction, StreamCommand};

use crate::pool::{CameraConnection, ConnectionPool, PoolError, RelayChannel};
use crate::session::SessionRegistry;
use crate::signaling::SignalingError;
use crate::transport::PeerState;

/// Per-request stream phases
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Acquiring,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl StreamPhase {
    /// Legal state-machine transitions
    pub fn can_transition(self, next: StreamPhase) -> bool {
        use StreamPhase::*;
        match (self, next) {
            (Idle, Acquiring) => true,
            (Acquiring, Negotiating) | (Acquiring, Failed) => true,
            (Negotiating, Connected) | (Negotiating, Failed) => true,
            // Any state can close (viewer disconnect or pool cleanup)
            (_, Closed) => true,
            _ => false,
        }
    }
}

/// Broker events, observable by the embedding application
#[derive(Clone, Debug)]
pub enum BrokerEvent {
    /// A stream reached the connected state
    StreamConnected {
        camera_id: String,
        media_session_id: String,
    },
    /// Acquisition or negotiation failed
    StreamFailed { camera_id: String, reason: String },
    /// A stream was closed
    StreamClosed { camera_id: String, clean: bool },
}

/// Broker configuration
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Bounded wait for the offer/answer exchange
    pub negotiation_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(
                Config::default().viewer.negotiation_timeout_secs,
            ),
        }
    }
}

impl BrokerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(config.viewer.negotiation_timeout_secs),
        }
    }
}

/// Handle to a connected stream
pub struct StreamHandle {
    pub camera_id: String,
    pub media_session_id: String,
    pub connection: CameraConnection,
    phase_rx: watch::Receiver<StreamPhase>,
}

impl StreamHandle {
    /// Current phase of this stream's state machine
    pub fn phase(&self) -> StreamPhase {
        *self.phase_rx.borrow()
    }
}

/// Connection broker
pub struct Broker {
    pool: Arc<ConnectionPool>,
    sessions: Arc<SessionRegistry>,
    config: BrokerConfig,
    viewer_id: String,
    /// Per-camera phase machines for requests in flight or connected
    active: DashMap<String, watch::Sender<StreamPhase>>,
    event_tx: broadcast::Sender<BrokerEvent>,
}

impl Broker {
    pub fn new(pool: Arc<ConnectionPool>, sessions: Arc<SessionRegistry>) -> Self {
        Self::with_config(pool, sessions, BrokerConfig::default())
    }

    pub fn with_config(
        pool: Arc<ConnectionPool>,
        sessions: Arc<SessionRegistry>,
        config: BrokerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            pool,
            sessions,
            config,
            viewer_id: generate_connection_id(),
            active: DashMap::new(),
            event_tx,
        }
    }

    /// Subscribe to broker events
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.event_tx.subscribe()
    }

    /// This broker's viewer identity (carried in keepalive replies)
    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    /// Open a stream to a camera, resuming a prior media session when the
    /// registry still holds one.
    pub async fn open_stream(&self, camera_id: &str) -> Result<StreamHandle, BrokerError> {
        let (phase_tx, phase_rx) = watch::channel(StreamPhase::Idle);

        self.advance(&phase_tx, camera_id, StreamPhase::Acquiring);
        self.active.insert(camera_id.to_string(), phase_tx);

        let resumable = self.sessions.get_device_session(camera_id);
        if let Some(ref id) = resumable {
            debug!("Resumable media session for {}: {}", camera_id, id);
        }

        let connection = match self.pool.get_or_create_camera_connection(camera_id).await {
            Ok(c) => c,
            Err(e) => {
                self.fail(camera_id, e.to_string());
                return Err(BrokerError::Pool(e));
            }
        };

        self.set_phase(camera_id, StreamPhase::Negotiating);

        let media_session_id = match self
            .negotiate(camera_id, &connection, resumable.as_deref())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.fail(camera_id, e.to_string());
                return Err(e);
            }
        };

        self.sessions.set_device_session(camera_id, &media_session_id);
        self.set_phase(camera_id, StreamPhase::Connected);

        let _ = self.event_tx.send(BrokerEvent::StreamConnected {
            camera_id: camera_id.to_string(),
            media_session_id: media_session_id.clone(),
        });

        info!("Stream connected: {} ({})", camera_id, media_session_id);
        Ok(StreamHandle {
            camera_id: camera_id.to_string(),
            media_session_id,
            connection,
            phase_rx,
        })
    }

    /// Close a stream. A clean close leaves the session resumable; an
    /// abnormal one clears the registry entry.
    pub async fn close_stream(&self, camera_id: &str, clean: bool) {
        if let Ok(channel) = self.pool.relay_connection().await {
            let _ = channel
                .socket
                .send_command(StreamAction::StopLiveStream, json!({"cameraId": camera_id}))
                .await;
        }

        // Teardown of the transport handle stays with the pool
        self.pool.release_camera_connection(camera_id).await;

        if !clean {
            self.sessions.clear_device_session(camera_id);
        }

        self.set_phase(camera_id, StreamPhase::Closed);
        self.active.remove(camera_id);

        let _ = self.event_tx.send(BrokerEvent::StreamClosed {
            camera_id: camera_id.to_string(),
            clean,
        });

        info!("Stream closed: {} (clean: {})", camera_id, clean);
    }

    /// Current phase for a camera, if a request is active
    pub fn phase(&self, camera_id: &str) -> Option<StreamPhase> {
        self.active.get(camera_id).map(|tx| *tx.borrow())
    }

    /// Drive the offer/answer exchange and wait for the connection-state
    /// signal, bounded by the negotiation timeout.
    async fn negotiate(
        &self,
        camera_id: &str,
        connection: &CameraConnection,
        resumable: Option<&str>,
    ) -> Result<String, BrokerError> {
        let channel = self.pool.relay_connection().await.map_err(BrokerError::Pool)?;

        let offer = connection
            .peer
            .create_offer()
            .await
            .map_err(|e| BrokerError::Negotiation(e.to_string()))?;

        channel
            .socket
            .send_command(
                StreamAction::StartLiveStream,
                json!({
                    "cameraId": camera_id,
                    "offer": offer,
                    "viewerId": self.viewer_id,
                    "mediaSessionId": resumable,
                }),
            )
            .await
            .map_err(BrokerError::Signaling)?;

        let mut state_rx = connection.peer.subscribe_state();

        let result = timeout(
            self.config.negotiation_timeout,
            self.drive_handshake(camera_id, connection, &channel, &mut state_rx, resumable),
        )
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(BrokerError::Timeout),
        }
    }

    /// Apply answer frames as they arrive and resolve on the peer state
    /// signal. Frames for other cameras are over-delivery and ignored.
    async fn drive_handshake(
        &self,
        camera_id: &str,
        connection: &CameraConnection,
        channel: &RelayChannel,
        state_rx: &mut watch::Receiver<PeerState>,
        resumable: Option<&str>,
    ) -> Result<String, BrokerError> {
        let mut media_session_id: Option<String> = resumable.map(str::to_string);

        loop {
            match *state_rx.borrow() {
                PeerState::Connected => {
                    return Ok(media_session_id
                        .unwrap_or_else(casa_core::ids::generate_session_id));
                }
                PeerState::Failed => {
                    return Err(BrokerError::Negotiation("peer connection failed".into()));
                }
                PeerState::Closed => {
                    return Err(BrokerError::Negotiation("peer connection closed".into()));
                }
                _ => {}
            }

            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(BrokerError::Negotiation("state signal lost".into()));
                    }
                }
                frame = channel.socket.recv_command() => {
                    match frame {
                        Ok(cmd) => {
                            if let Some(answer) = answer_for(&cmd, camera_id) {
                                if let Some(id) = cmd.data.get("mediaSessionId").and_then(|v| v.as_str()) {
                                    media_session_id = Some(id.to_string());
                                }
                                if let Err(e) = connection.peer.set_remote_description(answer).await {
                                    return Err(BrokerError::Negotiation(e.to_string()));
                                }
                            } else if cmd.action == StreamAction::Ping {
                                let _ = channel.socket.answer_ping(&self.viewer_id).await;
                            } else {
                                debug!("Ignoring broadcast during negotiation: {:?}", cmd.action);
                            }
                        }
                        Err(e) => return Err(BrokerError::Signaling(e)),
                    }
                }
            }
        }
    }

    fn fail(&self, camera_id: &str, reason: String) {
        warn!("Stream failed: {} ({})", camera_id, reason);
        self.set_phase(camera_id, StreamPhase::Failed);
        self.active.remove(camera_id);

        let _ = self.event_tx.send(BrokerEvent::StreamFailed {
            camera_id: camera_id.to_string(),
            reason,
        });
    }

    fn set_phase(&self, camera_id: &str, next: StreamPhase) {
        if let Some(tx) = self.active.get(camera_id) {
            self.advance(tx.value(), camera_id, next);
        }
    }

    /// Explicit transition function: the only place phases change
    fn advance(&self, tx: &watch::Sender<StreamPhase>, camera_id: &str, next: StreamPhase) {
        let current = *tx.borrow();
        if !current.can_transition(next) {
            warn!(
                "Illegal stream transition for {}: {:?} -> {:?}",
                camera_id, current, next
            );
            return;
        }
        debug!("Stream {}: {:?} -> {:?}", camera_id, current, next);
        tx.send_replace(next);
    }
}

/// Extract the answer for `camera_id` from a broadcast envelope, if that
/// is what the frame carries
fn answer_for<'a>(cmd: &'a StreamCommand, camera_id: &str) -> Option<&'a str> {
    if cmd.action != StreamAction::StartLiveStream
        && cmd.action != StreamAction::StartDoorbellStream
    {
        return None;
    }
    if cmd.data.get("cameraId").and_then(|v| v.as_str()) != Some(camera_id) {
        return None;
    }
    cmd.data.get("answer").and_then(|v| v.as_str())
}

/// Broker errors
#[derive(Debug)]
pub enum BrokerError {
    /// Connection acquisition failed
    Pool(PoolError),
    /// Signaling exchange failed
    Signaling(SignalingError),
    /// Handshake error
    Negotiation(String),
    /// Negotiation did not finish in time
    Timeout,
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Pool(e) => write!(f, "Acquisition failed: {}", e),
            BrokerError::Signaling(e) => write!(f, "Signaling error: {}", e),
            BrokerError::Negotiation(e) => write!(f, "Negotiation failed: {}", e),
            BrokerError::Timeout => write!(f, "Negotiation timed out"),
        }
    }
}

impl std::error::Error for BrokerError {}
