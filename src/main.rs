//! Chat sync server - Entry Point
//!
//! Starts the TCP listener and ChatServer actor, accepting connections.

use std::env;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chat_sync::{serve, ChatServer, ServerConfig};

/// Default server address
const DEFAULT_ADDR: &str = "127.0.0.1:8080";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_sync=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_sync=info")),
        )
        .init();

    // Get bind address from command line or use default
    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    let config = ServerConfig::from_env();
    info!(
        "Typing TTL {:?}, typing flush every {:?}",
        config.typing_ttl, config.typing_flush_interval
    );

    // Start TCP listener
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket Chat Server listening on {}", addr);

    // Start the room directory actor
    let server = ChatServer::spawn(config);
    info!("ChatServer actor started");

    // Connection accept loop
    serve(listener, server, config).await;

    Ok(())
}
