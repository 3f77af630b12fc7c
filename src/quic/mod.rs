// src/quic/mod.rs
//! # Quartz QUIC Implementation
//!
//! Handles the QUIC (draft-18) protocol logic: connection management,
//! packet reliability, acknowledgment aggregation and loss-driven
//! retransmission.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace, warn};

// --- Submodules ---
pub mod clock;
pub mod connection;
pub mod endpoint_config;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod reliability;

// --- Re-exports ---
pub use connection::{Connection, ConnectionState};
pub use endpoint_config::EndpointConfig;
pub use error::{QuicError, Result};

use clock::{MonotonicTicker, Ticker};
use handshake::{HandshakeDriver, StubHandshake};
use protocol::packet::FLAG_LONG_FORM;

// --- Constants ---
const MAX_UDP_PACKET_SIZE: usize = 65535;
/// Cadence of the server tick driving per-connection timers.
const TICK_INTERVAL: Duration = Duration::from_millis(10);
const CONNECTION_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

/// Produces a fresh handshake driver for each accepted connection.
pub type HandshakeFactory = Arc<dyn Fn() -> Box<dyn HandshakeDriver> + Send + Sync>;

// --- Server Structure ---

/// QUIC server endpoint for Quartz.
pub struct QuicServer {
    socket: Arc<UdpSocket>,
    config: EndpointConfig,
    ticker: Arc<dyn Ticker>,
    connections: Arc<Mutex<HashMap<SocketAddr, Arc<Mutex<Connection>>>>>,
    /// Replace this to plug in a real TLS machine.
    handshake_factory: HandshakeFactory,
}

impl QuicServer {
    /// Binds the QUIC server to the specified address with defaults.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self> {
        Self::bind_with_config(bind_addr, EndpointConfig::default()).await
    }

    /// Binds the QUIC server with a specific configuration.
    pub async fn bind_with_config(bind_addr: SocketAddr, config: EndpointConfig) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let socket = Arc::new(socket);
        info!("Quartz QUIC server bound to {}", bind_addr);

        Ok(Self {
            socket,
            config,
            ticker: Arc::new(MonotonicTicker::new()),
            connections: Arc::new(Mutex::new(HashMap::new())),
            handshake_factory: Arc::new(|| Box::new(StubHandshake::new())),
        })
    }

    /// Installs a factory producing the handshake driver for new connections.
    pub fn set_handshake_factory(&mut self, factory: HandshakeFactory) {
        self.handshake_factory = factory;
    }

    /// Runs the main server loop, handling incoming packets and driving
    /// per-connection timers. Runs until an error occurs or the task is
    /// dropped.
    pub async fn run(&self) -> Result<()> {
        let mut buf = [0u8; MAX_UDP_PACKET_SIZE];
        let cleanup_ns = CONNECTION_CLEANUP_INTERVAL.as_nanos() as u64;
        let mut last_cleanup_ns = self.ticker.now_ns();

        loop {
            tokio::select! {
                recv_result = self.socket.recv_from(&mut buf) => {
                    match recv_result {
                        Ok((len, src_addr)) => {
                            trace!("Received {} bytes from {}", len, src_addr);
                            self.handle_incoming_packet(&buf[..len], src_addr).await;
                        }
                        Err(e) => {
                            // UDP receive errors are transient; log and keep
                            // serving.
                            error!("Failed to receive packet: {}", e);
                        }
                    }
                }
                _ = tokio::time::sleep(TICK_INTERVAL) => {
                    self.tick_connections().await;
                    let now = self.ticker.now_ns();
                    if now.saturating_sub(last_cleanup_ns) >= cleanup_ns {
                        self.cleanup_connections().await;
                        last_cleanup_ns = now;
                    }
                }
            }
        }
    }

    /// Handles a single incoming UDP datagram.
    async fn handle_incoming_packet(&self, data: &[u8], src_addr: SocketAddr) {
        if data.is_empty() {
            trace!("Ignoring empty packet from {}", src_addr);
            return;
        }

        let connections = self.connections.lock().await;
        let existing = connections.get(&src_addr).cloned();
        drop(connections); // Release before the potentially long session work

        if let Some(connection) = existing {
            let mut connection = connection.lock().await;
            match connection.handle_incoming(data).await {
                Ok(()) => {}
                Err(QuicError::PeerClosed { error_code, .. }) => {
                    debug!("[{}] Connection closed by peer (code {:#06x})", src_addr, error_code);
                }
                Err(e) => warn!("[{}] Error handling packet: {}", src_addr, e),
            }
            return;
        }

        // Unknown peer: only a long-header Initial may open a connection.
        let first = data[0];
        let is_initial = first & FLAG_LONG_FORM != 0 && (first >> 4) & 0x03 == 0;
        if !is_initial {
            trace!(
                "Ignoring non-Initial packet (first byte {:#04x}) from unknown peer {}",
                first,
                src_addr
            );
            return;
        }

        let mut connections = self.connections.lock().await;
        if connections.len() >= self.config.max_connections {
            warn!(
                "Max connections ({}) reached, rejecting connection from {}",
                self.config.max_connections, src_addr
            );
            return;
        }

        let connection = Arc::new(Mutex::new(Connection::new(
            src_addr,
            self.socket.clone(),
            self.config.clone(),
            self.ticker.clone(),
            (self.handshake_factory)(),
        )));
        connections.insert(src_addr, connection.clone());
        debug!("Created new connection for {}", src_addr);
        drop(connections);

        let mut connection = connection.lock().await;
        if let Err(e) = connection.handle_incoming(data).await {
            warn!("[{}] Error handling first packet: {}", src_addr, e);
        }
    }

    /// Drives per-connection timers (ack flush, loss sweep).
    async fn tick_connections(&self) {
        let connections = self.connections.lock().await;
        // Avoid holding the map lock while ticking individual connections.
        let pairs: Vec<_> = connections
            .iter()
            .map(|(addr, connection)| (*addr, connection.clone()))
            .collect();
        drop(connections);

        for (addr, connection) in pairs {
            let mut connection = connection.lock().await;
            if let Err(e) = connection.on_tick().await {
                warn!("Error ticking connection {}: {}", addr, e);
            }
        }
    }

    /// Removes timed-out and closed connections. Dropping a connection drops
    /// its buffer and cancels its timers.
    async fn cleanup_connections(&self) {
        let mut connections = self.connections.lock().await;
        let now = self.ticker.now_ns();

        let mut stale = Vec::new();
        for (addr, connection) in connections.iter() {
            let connection = connection.lock().await;
            if connection.is_timed_out(now, self.config.idle_timeout) || connection.is_closed() {
                stale.push(*addr);
            }
        }

        for addr in &stale {
            debug!("Cleaning up connection for {}", addr);
            connections.remove(addr);
        }
        if !stale.is_empty() {
            debug!("Cleaned up {} connection(s)", stale.len());
        }
    }

    /// Number of live connections, for observability.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// The address this server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}
