// src/quic/reliability/packet_buffer.rs
use crate::quic::error::{QuicError, Result};
use crate::quic::protocol::{AckBlock, EncryptionLevel, Packet, PacketNumber};
use crate::quic::reliability::AckListener;
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// Acknowledgments reaching further than this past anything we have sent are
/// treated as a protocol violation. The slack keeps speculative or repeated
/// acks (e.g. for retransmissions we already retired) legal.
const MAX_ACK_AHEAD: u64 = 1 << 20;

/// A sent packet awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct BufferedPacket {
    pub packet: Packet,
    /// When the packet was handed to the transport, in ticker nanoseconds.
    pub sent_at_ns: u64,
    /// The keys the packet was protected under. Resends must stay at this
    /// level.
    pub level: EncryptionLevel,
}

/// The sent-packet registry: maps a packet number to the packet transmitted
/// under it until that number appears in a received ACK block or the loss
/// detector retires the entry.
pub struct PacketBuffer {
    /// Packets sent but not yet acknowledged. Key: packet number.
    buffered: BTreeMap<PacketNumber, BufferedPacket>,
    /// The maximum packet number ever seen in any received ACK block,
    /// whether or not it was in the buffer. Only advances.
    largest_acked: PacketNumber,
    /// The highest packet number recorded by `before_send`.
    highest_sent: PacketNumber,
    /// Optional observer notified once per acknowledged buffer entry.
    ack_listener: Option<Box<dyn AckListener>>,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self {
            buffered: BTreeMap::new(),
            largest_acked: PacketNumber::MIN,
            highest_sent: PacketNumber::MIN,
            ack_listener: None,
        }
    }

    /// Registers an observer for acknowledged packet numbers.
    pub fn set_ack_listener(&mut self, listener: Box<dyn AckListener>) {
        self.ack_listener = Some(listener);
    }

    /// Records an outbound packet before it is handed to the transport.
    ///
    /// Only ack-eliciting packets are buffered; a standalone ACK (or pure
    /// padding) is never retransmitted. Callers must invoke this before the
    /// datagram leaves the socket so a near-instant ack cannot race ahead of
    /// the buffer write.
    pub fn before_send(&mut self, packet: &Packet, now_ns: u64) {
        self.highest_sent = self.highest_sent.max(packet.number);
        if !packet.payload.is_ack_eliciting() {
            trace!("Not buffering non-eliciting packet {}", packet.number);
            return;
        }
        trace!("Buffering packet {} at t={}ns", packet.number, now_ns);
        self.buffered.insert(
            packet.number,
            BufferedPacket { packet: packet.clone(), sent_at_ns: now_ns, level: packet.level() },
        );
    }

    /// Retires every buffered packet covered by the given ACK block.
    ///
    /// Numbers not present in the buffer are silently tolerated: the peer may
    /// be acking a retransmission we already retired, or a standalone ACK we
    /// never buffered. The block expansion is deliberately an explicit loop;
    /// QUIC ACK blocks are small in practice.
    pub fn process_ack_block(&mut self, block: &AckBlock) -> Result<()> {
        if block.smallest > block.largest {
            return Err(QuicError::MalformedAck(format!(
                "block smallest {} > largest {}",
                block.smallest, block.largest
            )));
        }
        let watermark = self.highest_sent.max(self.largest_acked);
        if block.largest.value() > watermark.value() + MAX_ACK_AHEAD {
            return Err(QuicError::MalformedAck(format!(
                "block largest {} is far beyond highest sent {}",
                block.largest, watermark
            )));
        }

        let mut number = block.smallest;
        loop {
            if self.buffered.remove(&number).is_some() {
                trace!("Packet {} acknowledged", number);
                if let Some(listener) = self.ack_listener.as_mut() {
                    listener.on_acked(number);
                }
            }
            if number == block.largest {
                break;
            }
            number = number.next();
        }

        self.largest_acked = self.largest_acked.max(block.largest);
        Ok(())
    }

    /// Removes and returns every entry older than `threshold_ns` at time
    /// `now_ns`. Used by the loss detector.
    pub fn drain_expired(&mut self, now_ns: u64, threshold_ns: u64) -> Vec<BufferedPacket> {
        let expired: Vec<PacketNumber> = self
            .buffered
            .iter()
            .filter(|(_, entry)| now_ns.saturating_sub(entry.sent_at_ns) > threshold_ns)
            .map(|(&number, _)| number)
            .collect();

        expired
            .into_iter()
            .filter_map(|number| self.buffered.remove(&number))
            .collect()
    }

    /// Drops a buffered entry after a transport send failure.
    pub fn discard(&mut self, number: PacketNumber) {
        if self.buffered.remove(&number).is_some() {
            warn!("Discarding packet {} after send failure", number);
        }
    }

    /// The maximum packet number seen in any received ACK.
    pub fn largest_acked(&self) -> PacketNumber {
        self.largest_acked
    }

    /// Number of packets currently in flight.
    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }

    /// Returns the current key set for assertions.
    #[cfg(test)]
    pub fn buffer_snapshot(&self) -> Vec<PacketNumber> {
        self.buffered.keys().copied().collect()
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}
