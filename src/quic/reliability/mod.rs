// src/quic/reliability/mod.rs
//! # Reliability Core
//!
//! The middleware between decrypted-packet ingress and frame-serialization
//! egress. Composes three cooperating components:
//!
//! * [`PacketBuffer`] — the sent-packet registry, retired on acknowledgment.
//! * [`AckAggregator`] — the received-packet-number set, drained into ACK
//!   frames.
//! * [`LossDetector`] — the timer-driven sweep resending timed-out frames.
//!
//! All three are owned by a [`ReliabilityLayer`] and mutated only by the
//! per-connection event handlers; the connection's mutex serializes ingress,
//! egress and the tick.

use crate::quic::clock::Ticker;
use crate::quic::connection::ConnectionState;
use crate::quic::endpoint_config::EndpointConfig;
use crate::quic::error::{QuicError, Result};
use crate::quic::protocol::{EncryptionLevel, Frame, KeyState, Packet, PacketNumber, Payload};
use std::sync::Arc;

// --- Submodules ---
pub mod ack_aggregator;
pub mod loss_detector;
pub mod packet_buffer;

// --- Re-exports ---
pub use ack_aggregator::AckAggregator;
pub use loss_detector::LossDetector;
pub use packet_buffer::{BufferedPacket, PacketBuffer};

/// Observer notified once per packet number retired from the buffer by an
/// acknowledgment.
pub trait AckListener: Send {
    fn on_acked(&mut self, number: PacketNumber);
}

/// Egress hook used by the loss detector: triggers synthesis of a new
/// outbound packet containing the frame under a fresh packet number, at the
/// given encryption level.
pub trait FrameSender {
    fn send_frame(&mut self, frame: Frame, level: EncryptionLevel) -> Result<()>;
}

/// The ingress-side pipeline the core consumes.
pub trait PipelineContext {
    /// Current connection state, gating which frames may flow.
    fn state(&self) -> ConnectionState;
    /// Enqueues a frame for inclusion in the next outbound packet. Used for
    /// standalone ACKs.
    fn send_frame(&mut self, frame: Frame) -> Result<()>;
    /// Forwards an ingress packet to the stage beyond reliability.
    fn forward(&mut self, packet: Packet) -> Result<()>;
}

/// The reliability core of one connection.
pub struct ReliabilityLayer {
    buffer: PacketBuffer,
    aggregator: AckAggregator,
    detector: LossDetector,
    ticker: Arc<dyn Ticker>,
}

impl ReliabilityLayer {
    pub fn new(config: &EndpointConfig, ticker: Arc<dyn Ticker>) -> Self {
        Self {
            buffer: PacketBuffer::new(),
            aggregator: AckAggregator::new(config.ack_delay_exponent),
            detector: LossDetector::new(config.loss_threshold),
            ticker,
        }
    }

    /// Registers an observer for acknowledged packet numbers.
    pub fn set_ack_listener(&mut self, listener: Box<dyn AckListener>) {
        self.buffer.set_ack_listener(listener);
    }

    /// Records an outbound packet in the buffer (if it is ack-eliciting)
    /// before it is forwarded to the transport.
    pub fn before_send(&mut self, packet: &Packet) {
        self.buffer.before_send(packet, self.ticker.now_ns());
    }

    /// Processes one ingress packet.
    ///
    /// Order matters: data frames are gated against the connection state,
    /// embedded ACK frames retire buffer entries, the packet number is
    /// absorbed into the aggregator, a standalone ACK is emitted if the
    /// flush policy (or back-pressure) says so, and finally the packet is
    /// forwarded upstream. A malformed ACK aborts processing of the packet.
    pub fn on_receive<C: PipelineContext>(&mut self, packet: Packet, ctx: &mut C) -> Result<()> {
        let state = ctx.state();
        if state != ConnectionState::Connected {
            if let Some(frame) = packet
                .payload
                .frames
                .iter()
                .find(|f| matches!(f, Frame::Stream { .. } | Frame::ResetStream { .. }))
            {
                return Err(QuicError::FatalState { state, frame: frame.kind() });
            }
        }

        for frame in &packet.payload.frames {
            if let Frame::Ack { blocks, .. } = frame {
                for block in blocks {
                    self.buffer.process_ack_block(block)?;
                }
            }
        }

        let force_flush = self.aggregator.record(packet.number, self.ticker.now_ns());
        if force_flush || self.aggregator.should_flush(&packet) {
            if let Some(ack) = self.aggregator.drain(self.ticker.now_ns()) {
                ctx.send_frame(ack)?;
            }
        }

        ctx.forward(packet)
    }

    /// Appends the pending ACK frame to a payload about to be sent for
    /// another reason, avoiding a dedicated ACK packet.
    pub fn piggyback(&mut self, payload: &mut Payload) {
        if let Some(ack) = self.aggregator.drain(self.ticker.now_ns()) {
            payload.frames.push(ack);
        }
    }

    /// Runs one loss-detection sweep. Invoked by the host timer at
    /// `max_ack_delay` cadence.
    pub fn on_tick<S: FrameSender>(&mut self, keys: &KeyState, sender: &mut S) {
        self.detector.on_tick(self.ticker.now_ns(), &mut self.buffer, keys, sender);
    }

    /// Drops a buffered entry after a transport send failure.
    pub fn discard(&mut self, number: PacketNumber) {
        self.buffer.discard(number);
    }

    /// The maximum packet number seen in any received ACK.
    pub fn largest_acked(&self) -> PacketNumber {
        self.buffer.largest_acked()
    }

    /// Number of packets currently awaiting acknowledgment.
    pub fn in_flight(&self) -> usize {
        self.buffer.len()
    }

    /// Whether received packet numbers await acknowledgment to the peer.
    pub fn has_pending_acks(&self) -> bool {
        self.aggregator.has_pending()
    }

    #[cfg(test)]
    pub fn buffer_snapshot(&self) -> Vec<PacketNumber> {
        self.buffer.buffer_snapshot()
    }
}
