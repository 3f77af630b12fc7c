// src/quic/error.rs
use crate::quic::protocol::PacketNumber;
use crate::utils::binary::BinaryError;
use std::io;
use thiserror::Error;

// --- Transport Error Codes (draft-18, 16-bit space) ---
pub const NO_ERROR: u16 = 0x0000;
pub const INTERNAL_ERROR: u16 = 0x0001;
pub const PROTOCOL_VIOLATION: u16 = 0x000A;

/// Errors that can occur within the QUIC endpoint implementation.
#[derive(Error, Debug)]
pub enum QuicError {
    /// An I/O error occurred, likely related to the underlying UDP socket.
    #[error("Network I/O error: {0}")]
    Io(#[from] io::Error),

    /// An error occurred during binary serialization or deserialization.
    #[error("Binary handling error: {0}")]
    Binary(#[from] BinaryError),

    /// Received an ACK block that is structurally invalid or acknowledges
    /// packet numbers far beyond anything this endpoint has sent.
    #[error("Malformed ACK: {0}")]
    MalformedAck(String),

    /// The transport could not dispatch a packet; the buffered entry for it
    /// is discarded.
    #[error("Failed to dispatch packet {0}")]
    SendFailure(PacketNumber),

    /// A frame arrived while the connection state does not admit it.
    #[error("Frame {frame} not admitted in state {state:?}")]
    FatalState {
        state: super::connection::ConnectionState,
        frame: &'static str,
    },

    /// The peer terminated the connection.
    #[error("Connection closed by peer: code {error_code:#06x}, reason: {reason}")]
    PeerClosed { error_code: u16, reason: String },

    /// An operation was attempted on a connection that is already closed.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// An internal error occurred, possibly due to unexpected state.
    #[error("Internal QUIC error: {0}")]
    Internal(String),
}

impl QuicError {
    /// The transport error code reported in a CONNECTION_CLOSE frame when
    /// this error terminates the connection.
    pub fn transport_code(&self) -> u16 {
        match self {
            QuicError::MalformedAck(_) | QuicError::FatalState { .. } => PROTOCOL_VIOLATION,
            QuicError::Binary(_) => PROTOCOL_VIOLATION,
            _ => INTERNAL_ERROR,
        }
    }
}

/// Result type alias for QUIC operations.
pub type Result<T> = std::result::Result<T, QuicError>;
