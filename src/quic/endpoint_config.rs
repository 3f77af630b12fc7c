// src/quic/endpoint_config.rs
use std::time::Duration;

/// Configuration options for a QUIC endpoint, read at construction.
///
/// Only `ack_delay_exponent` and `max_ack_delay` materially affect the
/// reliability core; the rest shape the server front-end.
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// Exponent applied to encoded ACK delay values (the real delay in
    /// microseconds is right-shifted by this amount on the wire).
    pub ack_delay_exponent: u8,
    /// Maximum time acknowledgments may be delayed. Also the cadence of the
    /// loss-detection sweep.
    pub max_ack_delay: Duration,
    /// Connections without ingress for this long are reaped.
    pub idle_timeout: Duration,
    /// Largest UDP payload this endpoint emits.
    pub max_packet_size: usize,
    /// Age past which a buffered packet is declared lost and its frames
    /// resent. A fixed constant pending an RTT-aware upgrade.
    pub loss_threshold: Duration,
    /// The maximum number of concurrent connections the server accepts.
    pub max_connections: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(30),
            max_packet_size: 1350,
            loss_threshold: Duration::from_secs(1),
            max_connections: 1000,
        }
    }
}
