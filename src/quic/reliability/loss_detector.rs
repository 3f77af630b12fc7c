// src/quic/reliability/loss_detector.rs
use crate::quic::protocol::{Frame, KeyState};
use crate::quic::reliability::{FrameSender, PacketBuffer};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Declares buffered packets lost after a fixed timeout and resubmits their
/// frames for repackaging under a fresh packet number.
///
/// The sweep is a named method invoked by the host timer at `max_ack_delay`
/// cadence. The threshold is a configurable constant pending an RTT-aware
/// upgrade.
pub struct LossDetector {
    threshold_ns: u64,
}

impl LossDetector {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold_ns: threshold.as_nanos() as u64 }
    }

    /// Runs one sweep at monotonic time `now_ns`.
    ///
    /// Every expired entry is removed from the buffer. Its ack-eliciting
    /// frames are handed to `sender` one by one; ACK and PADDING frames are
    /// discarded (acks are state, not payload). Entries whose encryption
    /// level has lost its keys are dropped without resend. Frames resent
    /// this way re-enter `before_send` under their new packet number.
    pub fn on_tick<S: FrameSender>(
        &self,
        now_ns: u64,
        buffer: &mut PacketBuffer,
        keys: &KeyState,
        sender: &mut S,
    ) {
        let lost = buffer.drain_expired(now_ns, self.threshold_ns);
        if lost.is_empty() {
            return;
        }
        debug!("Loss sweep at t={}ns declared {} packet(s) lost", now_ns, lost.len());

        for entry in lost {
            if !keys.is_available(entry.level) {
                debug!(
                    "Dropping lost packet {} without resend: {:?} keys discarded",
                    entry.packet.number, entry.level
                );
                continue;
            }

            for frame in entry.packet.payload.frames {
                if matches!(frame, Frame::Ack { .. } | Frame::Padding) {
                    continue;
                }
                trace!("Resending {} frame from lost packet {}", frame.kind(), entry.packet.number);
                if let Err(e) = sender.send_frame(frame, entry.level) {
                    // Fatal for this packet only; the entry is already gone.
                    warn!("Resend of lost packet {} failed: {}", entry.packet.number, e);
                    break;
                }
            }
        }
    }
}
