//! Casa Relay Server
//!
//! Signaling relay for live-stream negotiation and control fan-out.
//!
//! # Usage
//!
//! ```bash
//! # In-memory mode (default)
//! casa-relay --port 8080
//!
//! # With SQLite persistence
//! casa-relay --port 8080 --db /var/lib/casa/relay.db
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use casa_relay::{ConnectionStore, Relay, RelayServer, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "casa-relay")]
#[command(about = "Casa signaling relay for live-stream negotiation")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// SQLite database path for the shared connection table (optional, uses in-memory if not specified)
    #[arg(short, long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;

    info!("Starting Casa Relay Server");
    info!("Listening on {}", addr);

    let store = if let Some(db_path) = &args.db {
        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("Using SQLite persistence: {:?}", db_path);
        ConnectionStore::open(db_path)?
    } else {
        info!("Using in-memory connection table (no persistence)");
        ConnectionStore::in_memory()?
    };

    let count = store.connection_count().unwrap_or(0);
    if count > 0 {
        info!("Loaded {} connection records from database", count);
    }

    let relay = Arc::new(Relay::new(store));
    let server = RelayServer::new(relay);
    server.serve(addr).await?;

    Ok(())
}
