// src/quic/protocol/frame.rs
//! QUIC frame variants and their draft-18 wire codec.

use crate::quic::protocol::ack::{decode_ack_body, encode_ack_body, AckBlock};
use crate::utils::binary::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

// --- Frame Type Bytes ---
pub const FRAME_PADDING: u8 = 0x00;
pub const FRAME_PING: u8 = 0x01;
pub const FRAME_ACK: u8 = 0x02;
pub const FRAME_ACK_ECN: u8 = 0x03;
pub const FRAME_RESET_STREAM: u8 = 0x04;
pub const FRAME_CRYPTO: u8 = 0x06;
/// STREAM frames occupy 0x08-0x0F; the low bits carry OFF/LEN/FIN.
pub const FRAME_STREAM_BASE: u8 = 0x08;
pub const STREAM_FLAG_OFF: u8 = 0x04;
pub const STREAM_FLAG_LEN: u8 = 0x02;
pub const STREAM_FLAG_FIN: u8 = 0x01;
pub const FRAME_CONNECTION_CLOSE: u8 = 0x1C;
pub const FRAME_APPLICATION_CLOSE: u8 = 0x1D;

/// A QUIC frame. The variant set is closed and known; unknown wire types are
/// a decode error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Type `0x00`, no body. A run of padding bytes decodes as one frame.
    Padding,
    /// Type `0x01`, no body.
    Ping,
    /// An acknowledgment: encoded delay plus disjoint ascending blocks.
    Ack { delay: u64, blocks: Vec<AckBlock> },
    /// Abrupt stream termination by the sender.
    ResetStream { stream_id: u64, error_code: u16, final_offset: u64 },
    /// Handshake bytes at a given offset in the crypto stream.
    Crypto { offset: u64, data: Bytes },
    /// Application data on a stream.
    Stream { stream_id: u64, offset: u64, fin: bool, data: Bytes },
    /// Connection termination, in the transport or application error space.
    ConnectionClose {
        is_application: bool,
        error_code: u16,
        /// The frame type that triggered the close (transport closes only).
        frame_type: Option<u64>,
        reason: String,
    },
}

impl Frame {
    /// Returns `true` if this frame obliges the peer to respond with an ACK.
    ///
    /// ACK, PADDING and CONNECTION_CLOSE are the non-eliciting frames.
    #[inline]
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding | Frame::Ack { .. } | Frame::ConnectionClose { .. }
        )
    }

    /// Short name of the frame kind, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Padding => "PADDING",
            Frame::Ping => "PING",
            Frame::Ack { .. } => "ACK",
            Frame::ResetStream { .. } => "RESET_STREAM",
            Frame::Crypto { .. } => "CRYPTO",
            Frame::Stream { .. } => "STREAM",
            Frame::ConnectionClose { .. } => "CONNECTION_CLOSE",
        }
    }

    /// Encodes the frame into a BytesMut buffer.
    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        match self {
            Frame::Padding => {
                writer.put_u8(FRAME_PADDING);
            }
            Frame::Ping => {
                writer.put_u8(FRAME_PING);
            }
            Frame::Ack { delay, blocks } => {
                writer.put_u8(FRAME_ACK);
                encode_ack_body(*delay, blocks, writer)?;
            }
            Frame::ResetStream { stream_id, error_code, final_offset } => {
                writer.put_u8(FRAME_RESET_STREAM);
                writer.write_varint(*stream_id)?;
                writer.write_u16_be(*error_code)?;
                writer.write_varint(*final_offset)?;
            }
            Frame::Crypto { offset, data } => {
                writer.put_u8(FRAME_CRYPTO);
                writer.write_varint(*offset)?;
                writer.write_bytes_varint_len(data)?;
            }
            Frame::Stream { stream_id, offset, fin, data } => {
                // Always encode with explicit offset and length fields.
                let mut type_byte = FRAME_STREAM_BASE | STREAM_FLAG_OFF | STREAM_FLAG_LEN;
                if *fin {
                    type_byte |= STREAM_FLAG_FIN;
                }
                writer.put_u8(type_byte);
                writer.write_varint(*stream_id)?;
                writer.write_varint(*offset)?;
                writer.write_bytes_varint_len(data)?;
            }
            Frame::ConnectionClose { is_application, error_code, frame_type, reason } => {
                if *is_application {
                    writer.put_u8(FRAME_APPLICATION_CLOSE);
                    writer.write_u16_be(*error_code)?;
                } else {
                    writer.put_u8(FRAME_CONNECTION_CLOSE);
                    writer.write_u16_be(*error_code)?;
                    writer.write_varint(frame_type.unwrap_or(0))?;
                }
                writer.write_string_varint_len(reason)?;
            }
        }
        Ok(())
    }

    /// Decodes a single frame from the buffer.
    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        let type_byte = reader.read_u8()?;
        match type_byte {
            FRAME_PADDING => {
                // Collapse the rest of a padding run into this frame.
                while reader.first() == Some(&FRAME_PADDING) {
                    reader.advance(1);
                }
                Ok(Frame::Padding)
            }
            FRAME_PING => Ok(Frame::Ping),
            FRAME_ACK | FRAME_ACK_ECN => {
                let (delay, blocks) = decode_ack_body(reader)?;
                if type_byte == FRAME_ACK_ECN {
                    // ECN counts are parsed and discarded; this endpoint does
                    // not track ECN state.
                    let ect0 = reader.read_varint()?;
                    let ect1 = reader.read_varint()?;
                    let ce = reader.read_varint()?;
                    trace!("Discarding ECN counts ect0={} ect1={} ce={}", ect0, ect1, ce);
                }
                Ok(Frame::Ack { delay, blocks })
            }
            FRAME_RESET_STREAM => {
                let stream_id = reader.read_varint()?;
                let error_code = reader.read_u16_be()?;
                let final_offset = reader.read_varint()?;
                Ok(Frame::ResetStream { stream_id, error_code, final_offset })
            }
            FRAME_CRYPTO => {
                let offset = reader.read_varint()?;
                let data = reader.read_bytes_varint_len()?;
                Ok(Frame::Crypto { offset, data })
            }
            t if (FRAME_STREAM_BASE..=FRAME_STREAM_BASE | 0x07).contains(&t) => {
                let stream_id = reader.read_varint()?;
                let offset = if t & STREAM_FLAG_OFF != 0 { reader.read_varint()? } else { 0 };
                let data = if t & STREAM_FLAG_LEN != 0 {
                    reader.read_bytes_varint_len()?
                } else {
                    // Without a length field the data extends to the end of
                    // the packet.
                    reader.read_remaining_bytes()
                };
                let fin = t & STREAM_FLAG_FIN != 0;
                Ok(Frame::Stream { stream_id, offset, fin, data })
            }
            FRAME_CONNECTION_CLOSE => {
                let error_code = reader.read_u16_be()?;
                let frame_type = reader.read_varint()?;
                let reason = reader.read_string_varint_len()?;
                Ok(Frame::ConnectionClose {
                    is_application: false,
                    error_code,
                    frame_type: Some(frame_type),
                    reason,
                })
            }
            FRAME_APPLICATION_CLOSE => {
                let error_code = reader.read_u16_be()?;
                let reason = reader.read_string_varint_len()?;
                Ok(Frame::ConnectionClose {
                    is_application: true,
                    error_code,
                    frame_type: None,
                    reason,
                })
            }
            _ => Err(BinaryError::InvalidData(format!(
                "Unknown frame type: {:#04x}",
                type_byte
            ))),
        }
    }
}
