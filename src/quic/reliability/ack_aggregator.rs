// src/quic/reliability/ack_aggregator.rs
use crate::quic::protocol::ack::coalesce_blocks;
use crate::quic::protocol::{Frame, Packet, PacketNumber, PacketType};
use std::collections::BTreeSet;
use tracing::{trace, warn};

/// Maximum received packet numbers held before a flush is forced. Reaching
/// the bound is back-pressure, never a silent drop.
pub const MAX_PENDING_ACKS: usize = 1024;

/// Tracks received packet numbers and emits them as ACK frames, either
/// piggybacked on an outgoing packet or drained for a standalone ACK.
pub struct AckAggregator {
    /// Packet numbers received but not yet acknowledged to the peer.
    pending: BTreeSet<PacketNumber>,
    /// Arrival time of the numerically largest pending number. The ACK delay
    /// field is measured against this packet, not the most recently received
    /// one.
    largest_arrival_ns: u64,
    /// Negotiated exponent scaling the encoded delay field.
    ack_delay_exponent: u8,
}

impl AckAggregator {
    pub fn new(ack_delay_exponent: u8) -> Self {
        Self {
            pending: BTreeSet::new(),
            largest_arrival_ns: 0,
            ack_delay_exponent,
        }
    }

    /// Adds a received packet number to the pending set. Duplicates are
    /// idempotent.
    ///
    /// Returns `true` once the set has reached its bound, in which case the
    /// caller must flush immediately.
    pub fn record(&mut self, number: PacketNumber, now_ns: u64) -> bool {
        let is_new_largest = self.pending.last().is_none_or(|&largest| number > largest);
        if self.pending.insert(number) && is_new_largest {
            self.largest_arrival_ns = now_ns;
        }
        if self.pending.len() >= MAX_PENDING_ACKS {
            warn!("Pending ACK set full ({} entries), forcing flush", self.pending.len());
            return true;
        }
        false
    }

    /// Whether any received numbers await acknowledgment.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Decides whether the given received packet warrants a standalone ACK
    /// now.
    ///
    /// Initial packets defer (their acks ride on the handshake response) and
    /// acks do not elicit acks; everything else ack-eliciting flushes.
    pub fn should_flush(&self, packet: &Packet) -> bool {
        if !self.has_pending() {
            return false;
        }
        if packet.packet_type == PacketType::Initial {
            trace!("Deferring ACK for Initial packet {}", packet.number);
            return false;
        }
        packet.payload.is_ack_eliciting()
    }

    /// Drains the pending set into a single ACK frame with coalesced blocks
    /// and the computed delay field, or `None` if nothing is pending.
    pub fn drain(&mut self, now_ns: u64) -> Option<Frame> {
        if self.pending.is_empty() {
            return None;
        }

        let numbers: Vec<PacketNumber> = std::mem::take(&mut self.pending).into_iter().collect();
        let blocks = coalesce_blocks(numbers);

        let delay_us = now_ns.saturating_sub(self.largest_arrival_ns) / 1_000;
        let delay = delay_us >> self.ack_delay_exponent;

        trace!("Draining {} ACK block(s), encoded delay {}", blocks.len(), delay);
        Some(Frame::Ack { delay, blocks })
    }
}
