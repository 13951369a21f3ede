//! WebSocket relay server implementation

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use casa_core::ids::generate_connection_id;
use casa_core::{ErrorReply, InboundCommand, WireErrorCode, MAX_FRAME_SIZE};

use crate::relay::{Relay, RelayError};

/// Relay server: accepts signaling sockets and feeds them into the registry
pub struct RelayServer {
    relay: Arc<Relay>,
}

impl RelayServer {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }

    /// Start the relay server
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Relay server listening on {}", addr);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let relay = self.relay.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, relay).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Shared registry handle (for monitoring)
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }
}

/// Handle a single connection (HTTP probe or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    relay: Arc<Relay>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Peek at the request line to tell probe paths from WebSocket
    // upgrades (both arrive as GET)
    let mut peek_buf = [0u8; 16];
    let n = stream.peek(&mut peek_buf).await?;
    let head = &peek_buf[..n];

    if head.starts_with(b"GET /health") || head.starts_with(b"GET /stats") {
        return handle_http_request(&mut stream, &relay).await;
    }

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let connection_id = generate_connection_id();
    debug!("New signaling socket from {} as {}", peer_addr, connection_id);

    // Registration must happen before any frame is processed; broadcast
    // enumerates the store, so an unrecorded socket receives nothing.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    relay.on_connect(&connection_id, tx.clone());

    // Writer task drains broadcast and reply frames into the socket, so a
    // slow socket never blocks the broadcast pass.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(data)) => {
                let _ = tx.send(Message::Pong(data));
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error: {:?}", e);
                break;
            }
        };

        if text.len() > MAX_FRAME_SIZE {
            send_error(
                &tx,
                WireErrorCode::InvalidMessage,
                format!("frame too large: {} bytes", text.len()),
            );
            continue;
        }

        let frame = match InboundCommand::from_json(&text) {
            Ok(f) => f,
            Err(e) => {
                send_error(&tx, WireErrorCode::InvalidMessage, format!("Invalid JSON: {}", e));
                continue;
            }
        };

        match relay.route(&connection_id, &frame) {
            Ok(outcome) => {
                debug!(
                    "Routed {} from {}: delivered {}, evicted {}",
                    frame.action, connection_id, outcome.delivered, outcome.evicted
                );
            }
            Err(RelayError::UnsupportedAction(action)) => {
                send_error(
                    &tx,
                    WireErrorCode::UnsupportedAction,
                    format!("Unsupported action: {}", action),
                );
            }
            Err(e) => {
                warn!("Routing failed for {}: {}", connection_id, e);
                send_error(&tx, WireErrorCode::InternalError, "Routing failed");
            }
        }
    }

    // Cleanup on disconnect
    relay.on_disconnect(&connection_id);
    writer.abort();

    debug!("Signaling socket closed: {}", connection_id);
    Ok(())
}

fn send_error(tx: &mpsc::UnboundedSender<Message>, code: WireErrorCode, message: impl Into<String>) {
    let reply = ErrorReply::new(code, message);
    if let Ok(json) = reply.to_json() {
        let _ = tx.send(Message::Text(json));
    }
}

/// Handle an HTTP request (for health checks)
async fn handle_http_request(
    stream: &mut TcpStream,
    relay: &Relay,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Read the HTTP request
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    // Parse the request path
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let live = relay.live_count();
    let records = relay.record_count();

    let (status, body) = match path {
        "/health" => (
            "200 OK",
            format!(r#"{{"status":"healthy","connections":{}}}"#, live),
        ),
        "/stats" => (
            "200 OK",
            format!(r#"{{"connections":{},"records":{}}}"#, live, records),
        ),
        _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
