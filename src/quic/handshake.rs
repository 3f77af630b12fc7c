// src/quic/handshake.rs
//! Handshake orchestration seam.
//!
//! The TLS state machine is an external collaborator: it consumes CRYPTO
//! frame payloads per encryption level and produces response payloads plus a
//! completion signal. [`HandshakeDriver`] is the interface the connection
//! consumes; [`StubHandshake`] is a single-round-trip stand-in used by the
//! server binary and the tests.

use crate::quic::error::Result;
use crate::quic::protocol::EncryptionLevel;
use bytes::Bytes;
use tracing::{debug, warn};

/// Handshake bytes to be sent in a CRYPTO frame at the given level.
#[derive(Debug, Clone)]
pub struct CryptoOutput {
    pub level: EncryptionLevel,
    pub offset: u64,
    pub data: Bytes,
}

/// The handshake state machine consumed by a connection.
pub trait HandshakeDriver: Send {
    /// Feeds a peer CRYPTO payload received at `level`. Returns the response
    /// payloads to transmit.
    fn on_crypto(&mut self, level: EncryptionLevel, offset: u64, data: &[u8])
        -> Result<Vec<CryptoOutput>>;

    /// Whether the handshake has completed.
    fn is_complete(&self) -> bool;
}

// --- Stub Driver ---

const STUB_SERVER_HELLO: &[u8] = b"quartz-server-hello";
const STUB_SERVER_FINISHED: &[u8] = b"quartz-server-finished";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StubState {
    /// Waiting for the client's Initial flight.
    Idle,
    /// Responded; waiting for the client's Handshake-level confirmation.
    Negotiating,
    /// Done.
    Complete,
}

/// A placeholder driver: answers the client's Initial flight with fixed
/// Initial and Handshake payloads and completes on the client's
/// Handshake-level response.
pub struct StubHandshake {
    state: StubState,
}

impl StubHandshake {
    pub fn new() -> Self {
        Self { state: StubState::Idle }
    }
}

impl Default for StubHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeDriver for StubHandshake {
    fn on_crypto(
        &mut self,
        level: EncryptionLevel,
        _offset: u64,
        data: &[u8],
    ) -> Result<Vec<CryptoOutput>> {
        match (self.state, level) {
            (StubState::Idle, EncryptionLevel::Initial) => {
                debug!("Handshake started ({} byte client flight)", data.len());
                self.state = StubState::Negotiating;
                Ok(vec![
                    CryptoOutput {
                        level: EncryptionLevel::Initial,
                        offset: 0,
                        data: Bytes::from_static(STUB_SERVER_HELLO),
                    },
                    CryptoOutput {
                        level: EncryptionLevel::Handshake,
                        offset: 0,
                        data: Bytes::from_static(STUB_SERVER_FINISHED),
                    },
                ])
            }
            (StubState::Negotiating, EncryptionLevel::Handshake) => {
                debug!("Handshake complete");
                self.state = StubState::Complete;
                Ok(Vec::new())
            }
            (state, level) => {
                // Duplicates and retransmissions land here; nothing to emit.
                warn!("Ignoring CRYPTO payload at {:?} in handshake state {:?}", level, state);
                Ok(Vec::new())
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.state == StubState::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_round_trip() {
        let mut hs = StubHandshake::new();
        assert!(!hs.is_complete());

        let outputs = hs.on_crypto(EncryptionLevel::Initial, 0, b"client-hello").unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].level, EncryptionLevel::Initial);
        assert_eq!(outputs[1].level, EncryptionLevel::Handshake);
        assert!(!hs.is_complete());

        let outputs = hs.on_crypto(EncryptionLevel::Handshake, 0, b"client-finished").unwrap();
        assert!(outputs.is_empty());
        assert!(hs.is_complete());
    }

    #[test]
    fn test_stub_tolerates_duplicates() {
        let mut hs = StubHandshake::new();
        hs.on_crypto(EncryptionLevel::Initial, 0, b"ch").unwrap();
        // A retransmitted Initial flight produces nothing new.
        let outputs = hs.on_crypto(EncryptionLevel::Initial, 0, b"ch").unwrap();
        assert!(outputs.is_empty());
        assert!(!hs.is_complete());
    }
}
