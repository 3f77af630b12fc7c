// src/quic/protocol/packet.rs
//! Packet-level structures: packet numbers, packet types, encryption levels
//! and the (simplified) long/short header codec.

use crate::quic::protocol::frame::Frame;
use crate::quic::protocol::{cid_len_from_nibble, cid_len_nibble, ConnectionId, QUIC_VERSION};
use crate::utils::binary::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::trace;

// --- Header Constants ---

/// Set on the first byte of every long-header packet.
pub const FLAG_LONG_FORM: u8 = 0x80;
/// The fixed bit; set on every valid packet of either form.
pub const FLAG_FIXED: u8 = 0x40;

// --- Packet Numbers ---

/// A monotonically non-decreasing 64-bit packet number within a connection's
/// number space. Numbers are never reused; a retransmission carries a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketNumber(u64);

impl PacketNumber {
    /// The designated minimum sentinel. Real packets are numbered starting
    /// at `MIN.next()`.
    pub const MIN: PacketNumber = PacketNumber(0);

    /// Creates a packet number from its integer value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the successor packet number.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the integer value.
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// --- Packet Types ---

/// Long-header packet type bits (draft-18, bits 4-5 of the first byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
#[repr(u8)]
enum LongType {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    Retry = 3,
}

/// QUIC packet types relevant to this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    Short,
}

impl PacketType {
    /// Returns `true` for long-header packet types.
    #[inline]
    pub fn is_long(self) -> bool {
        !matches!(self, PacketType::Short)
    }
}

/// The encryption level a packet is protected under. Determines which keys a
/// buffered packet may be resent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionLevel {
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
}

impl EncryptionLevel {
    const ALL: [EncryptionLevel; 4] = [
        EncryptionLevel::Initial,
        EncryptionLevel::ZeroRtt,
        EncryptionLevel::Handshake,
        EncryptionLevel::OneRtt,
    ];

    #[inline]
    fn index(self) -> usize {
        match self {
            EncryptionLevel::Initial => 0,
            EncryptionLevel::ZeroRtt => 1,
            EncryptionLevel::Handshake => 2,
            EncryptionLevel::OneRtt => 3,
        }
    }

    /// Returns the packet type an egress packet at this level uses.
    pub fn packet_type(self) -> PacketType {
        match self {
            EncryptionLevel::Initial => PacketType::Initial,
            EncryptionLevel::ZeroRtt => PacketType::ZeroRtt,
            EncryptionLevel::Handshake => PacketType::Handshake,
            EncryptionLevel::OneRtt => PacketType::Short,
        }
    }
}

impl From<PacketType> for EncryptionLevel {
    fn from(packet_type: PacketType) -> Self {
        match packet_type {
            // Retry carries no protected payload; it shares Initial keys.
            PacketType::Initial | PacketType::Retry => EncryptionLevel::Initial,
            PacketType::ZeroRtt => EncryptionLevel::ZeroRtt,
            PacketType::Handshake => EncryptionLevel::Handshake,
            PacketType::Short => EncryptionLevel::OneRtt,
        }
    }
}

/// Tracks which encryption levels still have usable keys. A buffered packet
/// whose level has been discarded must not be resent.
#[derive(Debug, Clone)]
pub struct KeyState {
    available: [bool; 4],
}

impl KeyState {
    /// All levels start out usable.
    pub fn new() -> Self {
        Self { available: [true; 4] }
    }

    /// Discards the keys of a level. Irreversible.
    pub fn discard(&mut self, level: EncryptionLevel) {
        trace!("Discarding {:?} keys", level);
        self.available[level.index()] = false;
    }

    /// Returns `true` while the level's keys can still be used.
    pub fn is_available(&self, level: EncryptionLevel) -> bool {
        self.available[level.index()]
    }

    /// Iterates the levels whose keys have been discarded.
    pub fn discarded(&self) -> impl Iterator<Item = EncryptionLevel> + '_ {
        EncryptionLevel::ALL
            .into_iter()
            .filter(|level| !self.available[level.index()])
    }
}

impl Default for KeyState {
    fn default() -> Self {
        Self::new()
    }
}

// --- Payload ---

/// An ordered sequence of frames carried by one packet.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub frames: Vec<Frame>,
}

impl Payload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Creates a payload from a list of frames.
    pub fn from_frames(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    /// Returns `true` if any frame obliges the peer to acknowledge.
    pub fn is_ack_eliciting(&self) -> bool {
        self.frames.iter().any(|f| f.is_ack_eliciting())
    }

    /// Returns `true` if the payload consists solely of ACK and/or PADDING
    /// frames. Such packets neither elicit acks nor get buffered for
    /// retransmission.
    pub fn is_ack_only(&self) -> bool {
        !self.frames.is_empty()
            && self
                .frames
                .iter()
                .all(|f| matches!(f, Frame::Ack { .. } | Frame::Padding))
    }

    /// Encodes all frames in order.
    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        for frame in &self.frames {
            frame.encode(writer)?;
        }
        Ok(())
    }

    /// Decodes frames until the buffer is exhausted.
    pub fn decode(reader: &mut Bytes) -> Result<Self> {
        let mut frames = Vec::new();
        while reader.has_remaining() {
            frames.push(Frame::decode(reader)?);
        }
        Ok(Self { frames })
    }
}

// --- Packet ---

/// An immutable record of one transmitted or received QUIC packet.
///
/// The header codec here is deliberately simplified: the packet number is
/// carried as a fixed 4-byte field and Retry is serialized like the other
/// long-header types. Packet number wire encoding is decoupled from the
/// internal 64-bit representation.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    /// Destination connection ID. Absent only when the peer chose a
    /// zero-length ID; egress synthesis refuses to build a packet without it.
    pub dcid: Option<ConnectionId>,
    /// Source connection ID. Only present on long-header packets.
    pub scid: Option<ConnectionId>,
    pub number: PacketNumber,
    pub payload: Payload,
}

impl Packet {
    /// Creates a packet with the given fields.
    pub fn new(
        packet_type: PacketType,
        dcid: Option<ConnectionId>,
        scid: Option<ConnectionId>,
        number: PacketNumber,
        payload: Payload,
    ) -> Self {
        Self { packet_type, dcid, scid, number, payload }
    }

    /// The encryption level this packet is protected under.
    pub fn level(&self) -> EncryptionLevel {
        EncryptionLevel::from(self.packet_type)
    }

    /// Encodes the packet (header + payload) into a BytesMut buffer.
    pub fn encode(&self, writer: &mut BytesMut) -> Result<()> {
        let number = self.number.value();
        if number > u32::MAX as u64 {
            return Err(BinaryError::InvalidData(format!(
                "Packet number {} exceeds the 4-byte wire encoding",
                number
            )));
        }

        if self.packet_type.is_long() {
            let long_type = match self.packet_type {
                PacketType::Initial => LongType::Initial,
                PacketType::ZeroRtt => LongType::ZeroRtt,
                PacketType::Handshake => LongType::Handshake,
                PacketType::Retry => LongType::Retry,
                PacketType::Short => unreachable!(),
            };
            writer.put_u8(FLAG_LONG_FORM | FLAG_FIXED | ((long_type as u8) << 4));
            writer.write_u32_be(QUIC_VERSION)?;
            writer.put_u8(
                (cid_len_nibble(self.dcid.as_ref()) << 4) | cid_len_nibble(self.scid.as_ref()),
            );
            if let Some(dcid) = &self.dcid {
                writer.write_bytes(dcid.as_bytes())?;
            }
            if let Some(scid) = &self.scid {
                writer.write_bytes(scid.as_bytes())?;
            }
            if self.packet_type == PacketType::Initial {
                // Token length; this endpoint never sends tokens.
                writer.write_varint(0)?;
            }

            // Length field covers the packet number and the payload.
            let mut body = BytesMut::new();
            self.payload.encode(&mut body)?;
            writer.write_varint(4 + body.len() as u64)?;
            writer.write_u32_be(number as u32)?;
            writer.write_bytes(&body)?;
        } else {
            let dcid = self.dcid.as_ref().ok_or_else(|| {
                BinaryError::InvalidData("Short-header packet without destination ID".to_string())
            })?;
            writer.put_u8(FLAG_FIXED);
            writer.write_bytes(dcid.as_bytes())?;
            writer.write_u32_be(number as u32)?;
            self.payload.encode(writer)?;
        }
        Ok(())
    }

    /// Decodes a packet from a byte slice.
    ///
    /// `short_dcid_len` is the length of the connection IDs this endpoint
    /// issues; short headers do not carry the length on the wire.
    pub fn decode(reader: &mut Bytes, short_dcid_len: usize) -> Result<Self> {
        check_first_byte(reader)?;
        let first = reader.read_u8()?;

        if first & FLAG_LONG_FORM != 0 {
            let long_type = LongType::try_from((first >> 4) & 0x03)
                .map_err(|_| BinaryError::InvalidData("Invalid long packet type".to_string()))?;
            let version = reader.read_u32_be()?;
            if version != QUIC_VERSION {
                return Err(BinaryError::InvalidData(format!(
                    "Unsupported QUIC version {:#010x}",
                    version
                )));
            }
            let cil = reader.read_u8()?;
            let dcid_len = cid_len_from_nibble(cil >> 4);
            let scid_len = cid_len_from_nibble(cil & 0x0F);
            let dcid = read_cid(reader, dcid_len)?;
            let scid = read_cid(reader, scid_len)?;

            let packet_type = match long_type {
                LongType::Initial => {
                    let token_len = reader.read_varint()? as usize;
                    if token_len > 0 {
                        trace!("Discarding {}-byte Initial token", token_len);
                        let _ = reader.read_bytes(token_len)?;
                    }
                    PacketType::Initial
                }
                LongType::ZeroRtt => PacketType::ZeroRtt,
                LongType::Handshake => PacketType::Handshake,
                LongType::Retry => PacketType::Retry,
            };

            let length = reader.read_varint()? as usize;
            if length < 4 {
                return Err(BinaryError::InvalidData(format!(
                    "Long-header length field too small: {}",
                    length
                )));
            }
            let number = PacketNumber::new(reader.read_u32_be()? as u64);
            let mut body = reader.read_bytes(length - 4)?;
            let payload = Payload::decode(&mut body)?;

            Ok(Self { packet_type, dcid, scid, number, payload })
        } else {
            let dcid = read_cid(reader, short_dcid_len)?;
            let number = PacketNumber::new(reader.read_u32_be()? as u64);
            let payload = Payload::decode(reader)?;
            Ok(Self { packet_type: PacketType::Short, dcid, scid: None, number, payload })
        }
    }
}

fn check_first_byte(reader: &Bytes) -> Result<()> {
    match reader.first() {
        None => Err(BinaryError::UnexpectedEof { needed: 1, remaining: 0 }),
        Some(first) if first & FLAG_FIXED == 0 => Err(BinaryError::InvalidData(
            "Invalid packet: fixed bit not set".to_string(),
        )),
        Some(_) => Ok(()),
    }
}

fn read_cid(reader: &mut Bytes, len: usize) -> Result<Option<ConnectionId>> {
    if len == 0 {
        return Ok(None);
    }
    let bytes = reader.read_bytes(len)?;
    Ok(Some(ConnectionId::new(bytes)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::protocol::Frame;

    fn cid(bytes: &'static [u8]) -> ConnectionId {
        ConnectionId::new(Bytes::from_static(bytes)).unwrap()
    }

    #[test]
    fn test_packet_number_ordering() {
        let a = PacketNumber::new(5);
        assert_eq!(a.next(), PacketNumber::new(6));
        assert!(PacketNumber::MIN < a);
        assert_eq!(a.max(PacketNumber::new(3)), a);
    }

    #[test]
    fn test_encode_decode_initial() {
        let packet = Packet::new(
            PacketType::Initial,
            Some(cid(&[0x11, 0x22, 0x33, 0x44])),
            Some(cid(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE])),
            PacketNumber::new(7),
            Payload::from_frames(vec![Frame::Ping]),
        );

        let mut writer = BytesMut::new();
        packet.encode(&mut writer).unwrap();

        let expected = Bytes::from_static(&[
            0xC0, // long form | fixed | type Initial
            0xFF, 0x00, 0x00, 0x12, // version draft-18
            0x12, // DCIL = 4 -> 1, SCIL = 5 -> 2
            0x11, 0x22, 0x33, 0x44, // dcid
            0xAA, 0xBB, 0xCC, 0xDD, 0xEE, // scid
            0x00, // token length
            0x05, // length = 4 (pn) + 1 (PING)
            0x00, 0x00, 0x00, 0x07, // packet number
            0x01, // PING
        ]);
        assert_eq!(writer.freeze(), expected);

        let mut reader = expected;
        let decoded = Packet::decode(&mut reader, 0).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Initial);
        assert_eq!(decoded.dcid, Some(cid(&[0x11, 0x22, 0x33, 0x44])));
        assert_eq!(decoded.scid, Some(cid(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE])));
        assert_eq!(decoded.number, PacketNumber::new(7));
        assert_eq!(decoded.payload.frames.len(), 1);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_encode_decode_short() {
        let packet = Packet::new(
            PacketType::Short,
            Some(cid(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08])),
            None,
            PacketNumber::new(42),
            Payload::from_frames(vec![Frame::Ping]),
        );

        let mut writer = BytesMut::new();
        packet.encode(&mut writer).unwrap();

        let expected = Bytes::from_static(&[
            0x40, // fixed bit, short form
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // dcid
            0x00, 0x00, 0x00, 0x2A, // packet number
            0x01, // PING
        ]);
        assert_eq!(writer.freeze(), expected);

        let mut reader = expected;
        let decoded = Packet::decode(&mut reader, 8).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Short);
        assert_eq!(decoded.number, PacketNumber::new(42));
        assert!(decoded.scid.is_none());
        assert!(reader.is_empty());
    }

    #[test]
    fn test_short_requires_dcid() {
        let packet = Packet::new(
            PacketType::Short,
            None,
            None,
            PacketNumber::new(1),
            Payload::from_frames(vec![Frame::Ping]),
        );
        let mut writer = BytesMut::new();
        assert!(matches!(packet.encode(&mut writer), Err(BinaryError::InvalidData(_))));
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut bad = BytesMut::new();
        bad.put_u8(0xC0);
        bad.write_u32_be(0x0000_0001).unwrap(); // not draft-18
        bad.put_u8(0x00);
        let mut reader = bad.freeze();
        assert!(matches!(Packet::decode(&mut reader, 0), Err(BinaryError::InvalidData(_))));
    }

    #[test]
    fn test_decode_rejects_missing_fixed_bit() {
        let mut reader = Bytes::from_static(&[0x00, 0x01, 0x02]);
        assert!(matches!(Packet::decode(&mut reader, 0), Err(BinaryError::InvalidData(_))));
    }

    #[test]
    fn test_payload_classification() {
        let ack = Frame::Ack { delay: 0, blocks: vec![] };
        let only_acks = Payload::from_frames(vec![ack.clone(), Frame::Padding]);
        assert!(only_acks.is_ack_only());
        assert!(!only_acks.is_ack_eliciting());

        let with_ping = Payload::from_frames(vec![ack, Frame::Ping]);
        assert!(!with_ping.is_ack_only());
        assert!(with_ping.is_ack_eliciting());

        assert!(!Payload::new().is_ack_only());
    }

    #[test]
    fn test_key_state() {
        let mut keys = KeyState::new();
        assert!(keys.is_available(EncryptionLevel::Initial));
        keys.discard(EncryptionLevel::Initial);
        assert!(!keys.is_available(EncryptionLevel::Initial));
        assert!(keys.is_available(EncryptionLevel::OneRtt));
        assert_eq!(keys.discarded().collect::<Vec<_>>(), vec![EncryptionLevel::Initial]);
    }
}
