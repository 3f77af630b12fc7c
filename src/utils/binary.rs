//! # Quartz Binary Utilities
//!
//! Provides traits and implementations for reading and writing binary data
//! efficiently and safely, tailored for the QUIC (draft-18) wire format.
//!
//! Uses the `bytes` crate for buffer manipulation.
//!
use bytes::{Buf, BufMut, Bytes};
use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

// --- Error Handling ---

/// Errors that can occur during binary operations.
#[derive(Error, Debug)]
pub enum BinaryError {
    /// Not enough bytes remaining in the buffer for the requested operation.
    #[error("Not enough bytes in buffer: needed {needed}, remaining {remaining}")]
    UnexpectedEof { needed: usize, remaining: usize },

    /// An underlying I/O error occurred (though less common with `bytes`).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A value does not fit the QUIC variable-length integer range (2^62 - 1 max).
    #[error("Value out of range for variable-length integer: {0}")]
    VarIntOutOfRange(u64),

    /// Attempted to read a string that was not valid UTF-8.
    #[error("Invalid UTF-8 string data: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),

    /// An invalid value was encountered (e.g., unknown frame type byte).
    #[error("Invalid data encountered: {0}")]
    InvalidData(String),
}

/// Result type alias for binary operations.
pub type Result<T> = std::result::Result<T, BinaryError>;

/// Largest value representable as a QUIC variable-length integer.
pub const VARINT_MAX: u64 = (1 << 62) - 1;

// --- Helper Macro for Reading ---

/// Checks if the buffer has enough remaining bytes and returns an error if not.
macro_rules! check_remaining {
    ($buf:expr, $len:expr) => {
        let needed = $len;
        let remaining = $buf.remaining();
        if remaining < needed {
            return Err(BinaryError::UnexpectedEof { needed, remaining });
        }
    };
}

// --- Reading Extension Trait ---

/// Extension trait for `bytes::Buf` providing methods to read various data types.
pub trait BinaryReader: Buf {
    // --- Single Bytes ---

    /// Reads a single `u8` byte.
    #[inline]
    fn read_u8(&mut self) -> Result<u8> {
        check_remaining!(self, 1);
        Ok(self.get_u8())
    }

    // --- Multi-byte Integers (Network Order) ---

    /// Reads a `u16` in big-endian format.
    #[inline]
    fn read_u16_be(&mut self) -> Result<u16> {
        check_remaining!(self, 2);
        Ok(self.get_u16())
    }

    /// Reads a `u32` in big-endian format.
    #[inline]
    fn read_u32_be(&mut self) -> Result<u32> {
        check_remaining!(self, 4);
        Ok(self.get_u32())
    }

    /// Reads a `u64` in big-endian format.
    #[inline]
    fn read_u64_be(&mut self) -> Result<u64> {
        check_remaining!(self, 8);
        Ok(self.get_u64())
    }

    // --- QUIC Variable-Length Integers ---

    /// Reads a QUIC variable-length integer.
    ///
    /// The two most significant bits of the first byte select the total
    /// encoded length (1, 2, 4 or 8 bytes); the remaining bits carry the
    /// value in network order.
    fn read_varint(&mut self) -> Result<u64> {
        check_remaining!(self, 1);
        let first = self.get_u8();
        let prefix = first >> 6;
        let mut value = (first & 0x3F) as u64;
        // 1 << prefix is the total length; the first byte is already consumed.
        let extra = (1usize << prefix) - 1;
        check_remaining!(self, extra);
        for _ in 0..extra {
            value = (value << 8) | self.get_u8() as u64;
        }
        Ok(value)
    }

    // --- Slices and Strings ---

    /// Reads a byte slice with a fixed length.
    /// Returns a `Bytes` slice which avoids copying when possible.
    fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        check_remaining!(self, len);
        Ok(self.copy_to_bytes(len))
    }

    /// Reads a byte slice prefixed with a varint length.
    fn read_bytes_varint_len(&mut self) -> Result<Bytes> {
        let len = self.read_varint()? as usize;
        check_remaining!(self, len);
        Ok(self.copy_to_bytes(len))
    }

    /// Reads a UTF-8 string prefixed with a varint length.
    fn read_string_varint_len(&mut self) -> Result<String> {
        let bytes = self.read_bytes_varint_len()?;
        String::from_utf8(bytes.to_vec()).map_err(BinaryError::from)
    }

    /// Reads the remaining bytes in the buffer.
    fn read_remaining_bytes(&mut self) -> Bytes {
        self.copy_to_bytes(self.remaining())
    }
}

// Implement the trait for all types that implement `Buf`.
impl<T: Buf> BinaryReader for T {}

// --- Writing Extension Trait ---

/// Extension trait for `bytes::BufMut` providing methods to write various data types.
pub trait BinaryWritter: BufMut {
    // --- Single Bytes ---

    /// Writes a single `u8` byte.
    #[inline]
    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.put_u8(value);
        Ok(())
    }

    // --- Multi-byte Integers (Network Order) ---

    /// Writes a `u16` in big-endian format.
    #[inline]
    fn write_u16_be(&mut self, value: u16) -> Result<()> {
        self.put_u16(value);
        Ok(())
    }

    /// Writes a `u32` in big-endian format.
    #[inline]
    fn write_u32_be(&mut self, value: u32) -> Result<()> {
        self.put_u32(value);
        Ok(())
    }

    /// Writes a `u64` in big-endian format.
    #[inline]
    fn write_u64_be(&mut self, value: u64) -> Result<()> {
        self.put_u64(value);
        Ok(())
    }

    // --- QUIC Variable-Length Integers ---

    /// Writes a QUIC variable-length integer using the shortest encoding.
    fn write_varint(&mut self, value: u64) -> Result<()> {
        if value < (1 << 6) {
            self.put_u8(value as u8);
        } else if value < (1 << 14) {
            self.put_u16(0x4000 | value as u16);
        } else if value < (1 << 30) {
            self.put_u32(0x8000_0000 | value as u32);
        } else if value <= VARINT_MAX {
            self.put_u64(0xC000_0000_0000_0000 | value);
        } else {
            return Err(BinaryError::VarIntOutOfRange(value));
        }
        Ok(())
    }

    // --- Slices and Strings ---

    /// Writes a raw byte slice (without length prefix).
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.put_slice(bytes);
        Ok(())
    }

    /// Writes a byte slice prefixed with a varint length.
    fn write_bytes_varint_len(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_varint(bytes.len() as u64)?;
        self.put_slice(bytes);
        Ok(())
    }

    /// Writes a UTF-8 string prefixed with a varint length.
    fn write_string_varint_len(&mut self, string: &str) -> Result<()> {
        self.write_bytes_varint_len(string.as_bytes())
    }
}

// Implement the trait for all types that implement `BufMut`.
impl<T: BufMut> BinaryWritter for T {}
