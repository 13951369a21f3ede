//! Peer connection pool
//!
//! Keeps a small set of pre-warmed, unbound peer connections so the first
//! viewer interaction never pays connection-setup latency, binds them to
//! cameras on request, and owns every transport handle's teardown. The
//! pool is the only component that mutates bindings; callers request them
//! and never race each other for the same pre-connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use casa_core::ids::generate_connection_id;
use casa_core::Config;

use crate::signaling::SignalingClient;
use crate::transport::{MediaTransport, PeerConnection, TransportError};

/// Pool configuration
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Signaling relay URL
    pub relay_url: String,
    /// Number of unbound connections to warm at init
    pub pre_connections: usize,
    /// Bounded wait for the signaling socket to open
    pub init_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let viewer = Config::default().viewer;
        Self {
            relay_url: viewer.relay_url,
            pre_connections: viewer.pre_connections,
            init_timeout: Duration::from_secs(viewer.init_timeout_secs),
        }
    }
}

impl PoolConfig {
    /// Derive pool settings from the main configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            relay_url: config.viewer.relay_url.clone(),
            pre_connections: config.viewer.pre_connections,
            init_timeout: Duration::from_secs(config.viewer.init_timeout_secs),
        }
    }
}

/// A pooled entry. `camera_id == None` means unbound (pre-warmed).
struct PooledEntry {
    camera_id: Option<String>,
    peer: Arc<dyn PeerConnection>,
    #[allow(dead_code)]
    created_at: Instant,
}

/// Handle to a camera-bound connection.
///
/// The caller owns the *use* of the connection; the pool remains the sole
/// owner of its lifecycle and closes it on release or cleanup.
#[derive(Clone)]
pub struct CameraConnection {
    pub camera_id: String,
    pub peer: Arc<dyn PeerConnection>,
    /// Init-cycle tag; a mismatch against the pool's current run id marks
    /// a handle from a previous init/cleanup cycle as stale
    pub run_id: String,
}

/// The dedicated always-on signaling channel
pub struct RelayChannel {
    pub peer: Arc<dyn PeerConnection>,
    pub socket: Arc<SignalingClient>,
    pub run_id: String,
}

/// Read-only pool introspection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    pub initialized: bool,
    /// Unbound pre-warmed connections
    pub pre_connections: usize,
    /// Camera-bound connections
    pub camera_connections: usize,
    pub relay_connected: bool,
    pub run_id: String,
}

struct PoolInner {
    initialized: bool,
    run_id: String,
    entries: Vec<PooledEntry>,
    relay_peer: Option<Arc<dyn PeerConnection>>,
    socket: Option<Arc<SignalingClient>>,
}

/// Peer connection pool
pub struct ConnectionPool {
    config: PoolConfig,
    transport: Arc<dyn MediaTransport>,
    inner: Mutex<PoolInner>,
    /// Serializes init so concurrent callers observe exactly one
    /// underlying initialization
    init_lock: tokio::sync::Mutex<()>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, transport: Arc<dyn MediaTransport>) -> Self {
        Self {
            config,
            transport,
            inner: Mutex::new(PoolInner {
                initialized: false,
                run_id: generate_connection_id(),
                entries: Vec::new(),
                relay_peer: None,
                socket: None,
            }),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Initialize the pool: open the signaling socket and warm the
    /// pre-connections.
    ///
    /// Single-flight: concurrent callers collapse onto one underlying
    /// initialization and all resolve once it finishes. The socket wait is
    /// bounded by `init_timeout`; on expiry the pool still becomes
    /// initialized (degraded) so dependent operations fail fast instead of
    /// blocking.
    pub async fn init(&self) {
        let _guard = self.init_lock.lock().await;
        if self.inner.lock().initialized {
            return;
        }

        let run_id = generate_connection_id();

        let socket = match SignalingClient::connect(&self.config.relay_url, self.config.init_timeout)
            .await
        {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!("Signaling socket unavailable, pool degraded: {}", e);
                None
            }
        };

        // Warm pre-connections. A failed pre-connection is omitted, not
        // retried.
        let mut warmed = Vec::with_capacity(self.config.pre_connections);
        for _ in 0..self.config.pre_connections {
            match self.transport.create_connection().await {
                Ok(peer) => warmed.push(PooledEntry {
                    camera_id: None,
                    peer,
                    created_at: Instant::now(),
                }),
                Err(e) => warn!("Pre-connection failed: {}", e),
            }
        }

        let warmed_count = warmed.len();
        {
            let mut inner = self.inner.lock();
            inner.entries.extend(warmed);
            inner.socket = socket;
            inner.run_id = run_id.clone();
            inner.initialized = true;
        }

        info!(
            "Pool initialized: {} pre-connections, run {}",
            warmed_count, run_id
        );
    }

    /// Get the connection bound to `camera_id`, binding a pre-warmed one
    /// or constructing a new one as needed.
    ///
    /// Never panics across this boundary: construction errors are caught,
    /// logged, and returned as `Err`, so one failing camera cannot
    /// destabilize callers iterating over several.
    pub async fn get_or_create_camera_connection(
        &self,
        camera_id: &str,
    ) -> Result<CameraConnection, PoolError> {
        if let Some(existing) = self.bind_existing(camera_id) {
            return Ok(existing);
        }

        let peer = match self.transport.create_connection().await {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Camera connection for {} failed: {}", camera_id, e);
                return Err(PoolError::Transport(e));
            }
        };

        // Re-check under the lock: another caller may have bound this
        // camera while we were constructing
        let (connection, surplus) = {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner
                .entries
                .iter()
                .find(|e| e.camera_id.as_deref() == Some(camera_id))
            {
                (
                    CameraConnection {
                        camera_id: camera_id.to_string(),
                        peer: entry.peer.clone(),
                        run_id: inner.run_id.clone(),
                    },
                    Some(peer),
                )
            } else {
                inner.entries.push(PooledEntry {
                    camera_id: Some(camera_id.to_string()),
                    peer: peer.clone(),
                    created_at: Instant::now(),
                });
                (
                    CameraConnection {
                        camera_id: camera_id.to_string(),
                        peer,
                        run_id: inner.run_id.clone(),
                    },
                    None,
                )
            }
        };

        if let Some(surplus) = surplus {
            surplus.close().await;
        }

        debug!("Camera connection ready: {}", camera_id);
        Ok(connection)
    }

    /// Atomic check-and-set over the pool collection: reuse an existing
    /// binding or claim the first unbound pre-connection
    fn bind_existing(&self, camera_id: &str) -> Option<CameraConnection> {
        let mut inner = self.inner.lock();
        let run_id = inner.run_id.clone();

        if let Some(entry) = inner
            .entries
            .iter()
            .find(|e| e.camera_id.as_deref() == Some(camera_id))
        {
            return Some(CameraConnection {
                camera_id: camera_id.to_string(),
                peer: entry.peer.clone(),
                run_id,
            });
        }

        if let Some(entry) = inner.entries.iter_mut().find(|e| e.camera_id.is_none()) {
            entry.camera_id = Some(camera_id.to_string());
            debug!("Bound pre-connection to camera {}", camera_id);
            return Some(CameraConnection {
                camera_id: camera_id.to_string(),
                peer: entry.peer.clone(),
                run_id,
            });
        }

        None
    }

    /// The dedicated always-on relay channel, created on demand and cached
    pub async fn relay_connection(&self) -> Result<RelayChannel, PoolError> {
        let (socket, cached, run_id) = {
            let inner = self.inner.lock();
            (
                inner.socket.clone().ok_or(PoolError::NotConnected)?,
                inner.relay_peer.clone(),
                inner.run_id.clone(),
            )
        };

        if let Some(peer) = cached {
            return Ok(RelayChannel { peer, socket, run_id });
        }

        let peer = self
            .transport
            .create_connection()
            .await
            .map_err(PoolError::Transport)?;

        let (peer, surplus) = {
            let mut inner = self.inner.lock();
            match inner.relay_peer.clone() {
                // Another caller cached one first
                Some(existing) => (existing, Some(peer)),
                None => {
                    inner.relay_peer = Some(peer.clone());
                    (peer, None)
                }
            }
        };

        if let Some(surplus) = surplus {
            surplus.close().await;
        }

        Ok(RelayChannel { peer, socket, run_id })
    }

    /// Release a camera binding; the pool closes the underlying transport
    pub async fn release_camera_connection(&self, camera_id: &str) {
        let removed = {
            let mut inner = self.inner.lock();
            let pos = inner
                .entries
                .iter()
                .position(|e| e.camera_id.as_deref() == Some(camera_id));
            pos.map(|pos| inner.entries.remove(pos))
        };

        if let Some(entry) = removed {
            entry.peer.close().await;
            debug!("Released camera connection: {}", camera_id);
        }
    }

    /// Read-only introspection, no side effects
    pub fn status(&self) -> PoolStatus {
        let inner = self.inner.lock();
        PoolStatus {
            initialized: inner.initialized,
            pre_connections: inner
                .entries
                .iter()
                .filter(|e| e.camera_id.is_none())
                .count(),
            camera_connections: inner
                .entries
                .iter()
                .filter(|e| e.camera_id.is_some())
                .count(),
            relay_connected: inner.socket.is_some(),
            run_id: inner.run_id.clone(),
        }
    }

    /// Close every owned transport handle and the signaling socket, and
    /// reset the pool. Safe to call repeatedly and from any state,
    /// including before `init`.
    pub async fn cleanup(&self) {
        let (entries, relay_peer, socket) = {
            let mut inner = self.inner.lock();
            inner.initialized = false;
            // Fresh run id: handles from the old cycle no longer match
            inner.run_id = generate_connection_id();
            (
                std::mem::take(&mut inner.entries),
                inner.relay_peer.take(),
                inner.socket.take(),
            )
        };

        for entry in entries {
            entry.peer.close().await;
        }
        if let Some(peer) = relay_peer {
            peer.close().await;
        }
        if let Some(socket) = socket {
            socket.close().await;
        }

        info!("Pool cleaned up");
    }
}

/// Pool errors. These are the caller-visible form of failures the pool
/// contains; they are never panics.
#[derive(Debug)]
pub enum PoolError {
    /// Transport construction failed
    Transport(TransportError),
    /// No signaling socket (pool degraded or not initialized)
    NotConnected,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Transport(e) => write!(f, "Transport error: {}", e),
            PoolError::NotConnected => write!(f, "Signaling socket not connected"),
        }
    }
}

impl std::error::Error for PoolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoopbackTransport, PeerState};
    use futures_util::StreamExt;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// In-test relay endpoint that counts accepted sockets and keeps them open
    async fn spawn_counting_relay(counter: Arc<AtomicUsize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    let Ok(ws) = accept_async(stream).await else {
                        return;
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    let (_tx, mut rx) = ws.split();
                    while let Some(Ok(_)) = rx.next().await {}
                });
            }
        });

        addr
    }

    fn pool_config(addr: SocketAddr) -> PoolConfig {
        PoolConfig {
            relay_url: format!("ws://{}", addr),
            pre_connections: 3,
            init_timeout: Duration::from_secs(15),
        }
    }

    #[tokio::test]
    async fn test_single_flight_init() {
        let sockets = Arc::new(AtomicUsize::new(0));
        let addr = spawn_counting_relay(sockets.clone()).await;

        let pool = Arc::new(ConnectionPool::new(
            pool_config(addr),
            Arc::new(LoopbackTransport::new()),
        ));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move { pool.init().await }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Exactly one socket, exactly one warming pass. Give the server
        // task a moment to record the accept.
        for _ in 0..50 {
            if sockets.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sockets.load(Ordering::SeqCst), 1);
        let status = pool.status();
        assert!(status.initialized);
        assert!(status.relay_connected);
        assert_eq!(status.pre_connections, 3);
    }

    #[tokio::test]
    async fn test_binding_uniqueness() {
        let sockets = Arc::new(AtomicUsize::new(0));
        let addr = spawn_counting_relay(sockets).await;

        let pool = ConnectionPool::new(pool_config(addr), Arc::new(LoopbackTransport::new()));
        pool.init().await;

        let a = pool.get_or_create_camera_connection("cam-a").await.unwrap();
        let b = pool.get_or_create_camera_connection("cam-b").await.unwrap();
        let c = pool.get_or_create_camera_connection("cam-c").await.unwrap();
        let d = pool.get_or_create_camera_connection("cam-d").await.unwrap();

        // Distinct cameras never share a transport handle
        let handles = [&a, &b, &c, &d];
        for (i, x) in handles.iter().enumerate() {
            for y in handles.iter().skip(i + 1) {
                assert!(!Arc::ptr_eq(&x.peer, &y.peer));
            }
        }

        // Repeat lookups reuse the same binding
        let a2 = pool.get_or_create_camera_connection("cam-a").await.unwrap();
        assert!(Arc::ptr_eq(&a.peer, &a2.peer));
    }

    #[tokio::test]
    async fn test_binding_consumes_pre_connections_first() {
        let sockets = Arc::new(AtomicUsize::new(0));
        let addr = spawn_counting_relay(sockets).await;

        let pool = ConnectionPool::new(pool_config(addr), Arc::new(LoopbackTransport::new()));
        pool.init().await;

        assert_eq!(pool.status().pre_connections, 3);

        pool.get_or_create_camera_connection("cam-a").await.unwrap();
        let status = pool.status();
        assert_eq!(status.pre_connections, 2);
        assert_eq!(status.camera_connections, 1);

        // Fourth binding outgrows the warm set and constructs a new one
        for cam in ["cam-b", "cam-c", "cam-d"] {
            pool.get_or_create_camera_connection(cam).await.unwrap();
        }
        let status = pool.status();
        assert_eq!(status.pre_connections, 0);
        assert_eq!(status.camera_connections, 4);
    }

    #[tokio::test]
    async fn test_concurrent_binding_same_camera() {
        let sockets = Arc::new(AtomicUsize::new(0));
        let addr = spawn_counting_relay(sockets).await;

        let pool = Arc::new(ConnectionPool::new(
            pool_config(addr),
            Arc::new(LoopbackTransport::new()),
        ));
        pool.init().await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.get_or_create_camera_connection("cam-a").await.unwrap()
            }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }

        // All callers observe the same underlying handle
        for handle in &handles[1..] {
            assert!(Arc::ptr_eq(&handles[0].peer, &handle.peer));
        }
        assert_eq!(pool.status().camera_connections, 1);
    }

    #[tokio::test]
    async fn test_construction_failure_is_contained() {
        let sockets = Arc::new(AtomicUsize::new(0));
        let addr = spawn_counting_relay(sockets).await;

        let pool = ConnectionPool::new(pool_config(addr), Arc::new(LoopbackTransport::failing()));
        pool.init().await;

        // Warming failed per-connection; the pool still initialized
        let status = pool.status();
        assert!(status.initialized);
        assert_eq!(status.pre_connections, 0);

        let result = pool.get_or_create_camera_connection("cam-a").await;
        assert!(matches!(result, Err(PoolError::Transport(_))));
    }

    #[tokio::test]
    async fn test_idempotent_cleanup() {
        let sockets = Arc::new(AtomicUsize::new(0));
        let addr = spawn_counting_relay(sockets).await;

        let pool = ConnectionPool::new(pool_config(addr), Arc::new(LoopbackTransport::new()));

        // Cleanup before init never panics
        pool.cleanup().await;
        pool.cleanup().await;
        assert!(!pool.status().initialized);

        pool.init().await;
        let conn = pool.get_or_create_camera_connection("cam-a").await.unwrap();

        pool.cleanup().await;
        pool.cleanup().await;

        let status = pool.status();
        assert!(!status.initialized);
        assert_eq!(status.pre_connections, 0);
        assert_eq!(status.camera_connections, 0);
        assert!(!status.relay_connected);

        // The pool closed the handle it owned
        assert_eq!(conn.peer.state(), PeerState::Closed);
    }

    #[tokio::test]
    async fn test_run_id_changes_across_cycles() {
        let sockets = Arc::new(AtomicUsize::new(0));
        let addr = spawn_counting_relay(sockets).await;

        let pool = ConnectionPool::new(pool_config(addr), Arc::new(LoopbackTransport::new()));
        pool.init().await;

        let first_run = pool.status().run_id;
        let conn = pool.get_or_create_camera_connection("cam-a").await.unwrap();
        assert_eq!(conn.run_id, first_run);

        pool.cleanup().await;
        pool.init().await;

        // A handle from the previous cycle no longer matches
        assert_ne!(pool.status().run_id, first_run);
        assert_ne!(conn.run_id, pool.status().run_id);
    }

    #[tokio::test]
    async fn test_relay_connection_cached() {
        let sockets = Arc::new(AtomicUsize::new(0));
        let addr = spawn_counting_relay(sockets).await;

        let pool = ConnectionPool::new(pool_config(addr), Arc::new(LoopbackTransport::new()));
        pool.init().await;

        let first = pool.relay_connection().await.unwrap();
        let second = pool.relay_connection().await.unwrap();
        assert!(Arc::ptr_eq(&first.peer, &second.peer));
        assert_eq!(first.run_id, second.run_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_init_resolves_within_timeout() {
        // Listener accepts TCP but never completes the WebSocket handshake
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let _conn = listener.accept().await;
            std::future::pending::<()>().await;
        });

        let pool = ConnectionPool::new(pool_config(addr), Arc::new(LoopbackTransport::new()));

        let start = tokio::time::Instant::now();
        pool.init().await;
        let elapsed = start.elapsed();

        // Bounded by the init timeout, not hanging forever
        assert!(elapsed >= Duration::from_secs(15));
        assert!(elapsed < Duration::from_secs(17));

        let status = pool.status();
        assert!(status.initialized);
        assert!(!status.relay_connected);
        assert_eq!(status.pre_connections, 3);

        // Dependent operations fail fast in the degraded state
        assert!(matches!(
            pool.relay_connection().await,
            Err(PoolError::NotConnected)
        ));
    }
}
