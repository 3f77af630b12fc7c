// src/main.rs
use quic::QuicServer;
use std::net::SocketAddr;
use tracing::Level;

pub mod config;
pub mod quic;
pub mod utils;

// Expose the BinaryReader and BinaryWritter traits at the crate root
pub use utils::binary::{BinaryReader, BinaryWritter};

#[derive(thiserror::Error, Debug)]
enum AppError {
    #[error("QUIC server error: {0}")]
    Quic(#[from] quic::QuicError),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, AppError>;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    // Load config.toml, writing the defaults on first run.
    let config = config::handle()?;
    let bind_addr: SocketAddr = config
        .network
        .address
        .parse()
        .expect("Validated address failed to parse");

    tracing::info!("Starting {} QUIC server on {}...", config.server.name, bind_addr);
    let server = QuicServer::bind_with_config(bind_addr, config.endpoint_config()).await?;

    // The server's run loop handles connections and packet processing.
    server.run().await?;

    tracing::info!("Quartz QUIC server stopped.");
    Ok(())
}
