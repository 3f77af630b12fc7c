// src/quic/protocol/mod.rs
//! # QUIC Packet and Frame Definitions
//!
//! Contains structures and codecs for QUIC (draft-18) packets, frames and
//! ACK blocks, plus connection ID handling shared by all of them.

use crate::utils::binary::*;
use bytes::Bytes;
use rand::RngCore;
use std::fmt;

// --- Submodules for Wire Structures ---
pub mod ack;
pub mod frame;
pub mod packet;

// Re-export important types
pub use ack::AckBlock;
pub use frame::Frame;
pub use packet::{EncryptionLevel, KeyState, Packet, PacketNumber, PacketType, Payload};

// --- Constants ---

/// The QUIC version this endpoint speaks (draft-18).
pub const QUIC_VERSION: u32 = 0xFF00_0012;

/// Length of the connection IDs this endpoint generates for itself.
pub const LOCAL_CID_LEN: usize = 8;

/// Represents a QUIC connection ID: an opaque byte string of 4 to 18 bytes,
/// or empty when the peer elected a zero-length ID.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(Bytes);

impl ConnectionId {
    /// Smallest non-zero connection ID length permitted on the wire.
    pub const MIN_LEN: usize = 4;
    /// Largest connection ID length permitted on the wire.
    pub const MAX_LEN: usize = 18;

    /// Creates a connection ID from raw bytes, validating the length.
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        let len = bytes.len();
        if len != 0 && !(Self::MIN_LEN..=Self::MAX_LEN).contains(&len) {
            return Err(BinaryError::InvalidData(format!(
                "Invalid connection ID length: {} (expected 0 or {}-{})",
                len,
                Self::MIN_LEN,
                Self::MAX_LEN
            )));
        }
        Ok(Self(bytes))
    }

    /// Generates a random connection ID of the given length.
    pub fn random(len: usize) -> Self {
        debug_assert!((Self::MIN_LEN..=Self::MAX_LEN).contains(&len));
        let mut bytes = vec![0u8; len];
        rand::rng().fill_bytes(&mut bytes);
        Self(Bytes::from(bytes))
    }

    /// Returns the length of the connection ID in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` for a zero-length connection ID.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the raw bytes of the connection ID.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid:{}", hex::encode(&self.0))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Encodes an optional connection ID length as a DCIL/SCIL nibble.
/// Zero means absent; otherwise the nibble carries `len - 3`.
pub(crate) fn cid_len_nibble(cid: Option<&ConnectionId>) -> u8 {
    match cid {
        Some(cid) if !cid.is_empty() => (cid.len() - 3) as u8,
        _ => 0,
    }
}

/// Decodes a DCIL/SCIL nibble back into a connection ID length.
pub(crate) fn cid_len_from_nibble(nibble: u8) -> usize {
    if nibble == 0 { 0 } else { nibble as usize + 3 }
}
