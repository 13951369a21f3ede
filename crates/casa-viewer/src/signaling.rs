//! Signaling socket client
//!
//! This module handles:
//! - WebSocket connection to the signaling relay
//! - Sending commands and receiving broadcast envelopes
//! - Keepalive (transport pings and relay `ping` broadcasts)
//! - Bounded reconnect with exponential backoff

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use casa_core::ids::unix_millis;
use casa_core::{InboundCommand, NetworkConfig, StreamAction, StreamCommand};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Signaling client over a persistent WebSocket.
///
/// Send and receive halves are locked independently so a blocked receive
/// never prevents sending (keepalive replies in particular).
#[derive(Debug)]
pub struct SignalingClient {
    tx: Mutex<SplitSink<WsStream, Message>>,
    rx: Mutex<SplitStream<WsStream>>,
}

impl SignalingClient {
    /// Connect to the signaling relay, bounded by `connect_timeout`
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, SignalingError> {
        let url = url::Url::parse(url)
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        debug!("Connecting to signaling relay: {}", url);

        let connect_result = timeout(connect_timeout, connect_async(url.as_str())).await;

        let ws = match connect_result {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => return Err(SignalingError::ConnectionFailed(e.to_string())),
            Err(_) => return Err(SignalingError::Timeout),
        };

        info!("Connected to signaling relay");

        let (tx, rx) = ws.split();
        Ok(Self {
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        })
    }

    /// Connect with bounded retries and exponential backoff
    pub async fn connect_with_backoff(
        url: &str,
        network: &NetworkConfig,
    ) -> Result<Self, SignalingError> {
        let connect_timeout = Duration::from_secs(network.connect_timeout_secs);
        let max_delay = Duration::from_secs(network.reconnect_max_delay_secs);
        let mut delay = Duration::from_secs(network.reconnect_initial_delay_secs);

        let attempts = network.reconnect_max_attempts.max(1);

        let mut last_err = SignalingError::Timeout;
        for attempt in 1..=attempts {
            match Self::connect(url, connect_timeout).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    warn!(
                        "Signaling connect failed (attempt {}/{}): {}",
                        attempt, attempts, e
                    );
                    last_err = e;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(delay).await;
                // Exponential backoff
                delay = std::cmp::min(delay * 2, max_delay);
            }
        }

        Err(last_err)
    }

    /// Send a command frame to the relay
    pub async fn send_command(
        &self,
        action: StreamAction,
        data: Value,
    ) -> Result<(), SignalingError> {
        let frame = InboundCommand::new(action, data);
        let json = frame
            .to_json()
            .map_err(|e| SignalingError::Protocol(e.to_string()))?;

        self.tx
            .lock()
            .await
            .send(Message::Text(json))
            .await
            .map_err(|e| SignalingError::Socket(e.to_string()))?;

        Ok(())
    }

    /// Receive the next broadcast envelope.
    ///
    /// Transport pings are answered inline; non-envelope frames are
    /// skipped. Resolves with `Closed` once the socket is gone. Callers
    /// bound the wait themselves (`tokio::time::timeout`).
    pub async fn recv_command(&self) -> Result<StreamCommand, SignalingError> {
        loop {
            let msg = self.rx.lock().await.next().await;

            match msg {
                Some(Ok(Message::Text(text))) => {
                    match StreamCommand::from_json(&text) {
                        Ok(cmd) => return Ok(cmd),
                        Err(_) => {
                            // Error replies and foreign frames are not
                            // broadcast envelopes; surface replies, skip
                            // the rest
                            if text.contains("\"error\"") {
                                return Err(SignalingError::Protocol(text));
                            }
                            debug!("Ignoring non-envelope frame: {}", text);
                            continue;
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.tx.lock().await.send(Message::Pong(data)).await;
                    continue;
                }
                Some(Ok(Message::Close(_))) | None => return Err(SignalingError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(SignalingError::Socket(e.to_string())),
            }
        }
    }

    /// Answer a relay `ping` broadcast with a pong payload carrying this
    /// viewer's identity
    pub async fn answer_ping(&self, viewer_id: &str) -> Result<(), SignalingError> {
        self.send_command(
            StreamAction::Ping,
            json!({
                "reply": "pong",
                "viewerId": viewer_id,
                "timestamp": unix_millis(),
            }),
        )
        .await
    }

    /// Close the socket. Safe to call on an already-closed socket.
    pub async fn close(&self) {
        let _ = self.tx.lock().await.send(Message::Close(None)).await;
    }
}

/// Signaling errors
#[derive(Debug)]
pub enum SignalingError {
    /// Failed to reach the relay
    ConnectionFailed(String),
    /// Bounded wait expired
    Timeout,
    /// Socket closed by the remote side
    Closed,
    /// Socket-level error
    Socket(String),
    /// Frame could not be handled
    Protocol(String),
}

impl std::fmt::Display for SignalingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalingError::ConnectionFailed(e) => write!(f, "Connection failed: {}", e),
            SignalingError::Timeout => write!(f, "Timed out"),
            SignalingError::Closed => write!(f, "Socket closed"),
            SignalingError::Socket(e) => write!(f, "Socket error: {}", e),
            SignalingError::Protocol(e) => write!(f, "Protocol error: {}", e),
        }
    }
}

impl std::error::Error for SignalingError {}
