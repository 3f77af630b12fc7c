// src/quic/connection.rs
//! Handles the state and logic for a single QUIC connection on the server.

use crate::quic::clock::Ticker;
use crate::quic::endpoint_config::EndpointConfig;
use crate::quic::error::{QuicError, Result, NO_ERROR};
use crate::quic::handshake::HandshakeDriver;
use crate::quic::protocol::frame::FRAME_ACK;
use crate::quic::protocol::{
    ConnectionId, EncryptionLevel, Frame, KeyState, Packet, PacketNumber, Payload, LOCAL_CID_LEN,
};
use crate::quic::reliability::{FrameSender, PipelineContext, ReliabilityLayer};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

/// Represents the current state of a QUIC connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created on the client's first Initial, handshake not yet answered.
    Connecting,
    /// Handshake response sent, waiting for the client's confirmation.
    Handshaking,
    /// Connection fully established; application frames may flow.
    Connected,
    /// We sent CONNECTION_CLOSE, waiting to be reaped.
    Closing,
    /// Terminal. No packets are processed or emitted.
    Closed,
}

/// A single QUIC connection and its reliability core.
pub struct Connection {
    /// Remote address of the peer.
    address: SocketAddr,
    /// Current state of the connection.
    state: ConnectionState,
    /// Shared UDP socket for sending packets.
    socket: Arc<UdpSocket>,
    /// Injected monotonic clock.
    ticker: Arc<dyn Ticker>,
    config: EndpointConfig,
    /// The reliability core: packet buffer, ack aggregator, loss detector.
    reliability: ReliabilityLayer,
    /// Which encryption levels still have usable keys.
    keys: KeyState,
    /// External TLS machine consuming and producing CRYPTO payloads.
    handshake: Box<dyn HandshakeDriver>,
    /// The connection ID this endpoint issued for itself.
    local_cid: ConnectionId,
    /// The peer's source connection ID, learned from its first long header.
    peer_cid: Option<ConnectionId>,
    /// The most recently allocated outbound packet number.
    last_packet_number: PacketNumber,
    /// Frames queued for the next outbound packet at each level.
    pending_frames: Vec<(Frame, EncryptionLevel)>,
    /// Next write offset per outbound stream.
    stream_offsets: HashMap<u64, u64>,
    /// Timestamp of the last received datagram.
    last_activity_ns: u64,
    /// Timestamp of the last loss-detection sweep.
    last_sweep_ns: u64,
}

/// Ingress-side pipeline context handed to the reliability layer.
struct IngressContext<'a> {
    state: ConnectionState,
    queued_acks: &'a mut Vec<Frame>,
    forwarded: &'a mut Vec<Packet>,
}

impl PipelineContext for IngressContext<'_> {
    fn state(&self) -> ConnectionState {
        self.state
    }

    fn send_frame(&mut self, frame: Frame) -> Result<()> {
        self.queued_acks.push(frame);
        Ok(())
    }

    fn forward(&mut self, packet: Packet) -> Result<()> {
        self.forwarded.push(packet);
        Ok(())
    }
}

/// Egress hook used by the loss detector to queue resent frames.
struct QueueSender<'a>(&'a mut Vec<(Frame, EncryptionLevel)>);

impl FrameSender for QueueSender<'_> {
    fn send_frame(&mut self, frame: Frame, level: EncryptionLevel) -> Result<()> {
        self.0.push((frame, level));
        Ok(())
    }
}

impl Connection {
    /// Creates a new connection for a peer.
    pub fn new(
        address: SocketAddr,
        socket: Arc<UdpSocket>,
        config: EndpointConfig,
        ticker: Arc<dyn Ticker>,
        handshake: Box<dyn HandshakeDriver>,
    ) -> Self {
        let local_cid = ConnectionId::random(LOCAL_CID_LEN);
        let now = ticker.now_ns();
        debug!("Creating connection for {} ({:?})", address, local_cid);
        Self {
            address,
            state: ConnectionState::Connecting,
            socket,
            reliability: ReliabilityLayer::new(&config, ticker.clone()),
            ticker,
            config,
            keys: KeyState::new(),
            handshake,
            local_cid,
            peer_cid: None,
            last_packet_number: PacketNumber::MIN,
            pending_frames: Vec::new(),
            stream_offsets: HashMap::new(),
            last_activity_ns: now,
            last_sweep_ns: now,
        }
    }

    /// Handles one incoming datagram for this connection.
    pub async fn handle_incoming(&mut self, data: &[u8]) -> Result<()> {
        if self.state == ConnectionState::Closed {
            trace!("[{}] Dropping datagram for closed connection", self.address);
            return Ok(());
        }
        self.last_activity_ns = self.ticker.now_ns();

        let mut reader = Bytes::copy_from_slice(data);
        let packet = match Packet::decode(&mut reader, self.local_cid.len()) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("[{}] Failed to decode packet: {}", self.address, e);
                let e = QuicError::from(e);
                self.close_on_violation(&e).await?;
                return Err(e);
            }
        };
        trace!("[{}] Handling {:?} packet {}", self.address, packet.packet_type, packet.number);

        // Learn the peer's connection ID from its first long header.
        if self.peer_cid.is_none() {
            if let Some(scid) = &packet.scid {
                self.peer_cid = Some(scid.clone());
            }
        }

        let mut queued_acks = Vec::new();
        let mut forwarded = Vec::new();
        let outcome = {
            let mut ctx = IngressContext {
                state: self.state,
                queued_acks: &mut queued_acks,
                forwarded: &mut forwarded,
            };
            self.reliability.on_receive(packet, &mut ctx)
        };

        if let Err(e) = outcome {
            match &e {
                QuicError::MalformedAck(_)
                | QuicError::FatalState { .. }
                | QuicError::Binary(_) => {
                    self.close_on_violation(&e).await?;
                }
                _ => {}
            }
            return Err(e);
        }

        // Standalone ACKs are sent in a short-header packet of their own.
        for ack in queued_acks {
            self.pending_frames.push((ack, EncryptionLevel::OneRtt));
        }
        for packet in forwarded {
            self.dispatch(packet)?;
        }

        self.flush_egress().await
    }

    /// Processes the frames of a packet that passed the reliability stage.
    fn dispatch(&mut self, packet: Packet) -> Result<()> {
        let level = packet.level();
        for frame in packet.payload.frames {
            match frame {
                Frame::Crypto { offset, data } => self.on_crypto(level, offset, data)?,
                Frame::Stream { stream_id, offset, fin, data } => {
                    // Stream demux and flow control live beyond this stage;
                    // the payload is surfaced to the application here.
                    debug!(
                        "[{}] Received {} byte(s) on stream {} at offset {}{}",
                        self.address,
                        data.len(),
                        stream_id,
                        offset,
                        if fin { " (fin)" } else { "" }
                    );
                }
                Frame::ResetStream { stream_id, error_code, .. } => {
                    debug!(
                        "[{}] Peer reset stream {} (code {:#06x})",
                        self.address, stream_id, error_code
                    );
                }
                Frame::ConnectionClose { error_code, reason, .. } => {
                    info!(
                        "[{}] Peer closed the connection: code {:#06x}, reason: {:?}",
                        self.address, error_code, reason
                    );
                    self.state = ConnectionState::Closed;
                    return Err(QuicError::PeerClosed { error_code, reason });
                }
                // ACK frames were consumed by the reliability layer; PING
                // exists only to elicit the ack already queued.
                Frame::Ack { .. } | Frame::Ping | Frame::Padding => {}
            }
        }
        Ok(())
    }

    /// Feeds a CRYPTO payload to the handshake driver and queues its output.
    fn on_crypto(&mut self, level: EncryptionLevel, offset: u64, data: Bytes) -> Result<()> {
        let outputs = self.handshake.on_crypto(level, offset, &data)?;
        let responded = !outputs.is_empty();
        for out in outputs {
            self.pending_frames
                .push((Frame::Crypto { offset: out.offset, data: out.data }, out.level));
        }

        if self.handshake.is_complete() && self.state != ConnectionState::Connected {
            self.state = ConnectionState::Connected;
            // Initial keys are gone once the handshake settles; buffered
            // Initial packets can no longer be resent.
            self.keys.discard(EncryptionLevel::Initial);
            debug!("[{}] Handshake complete, state -> Connected", self.address);
        } else if responded && self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Handshaking;
            debug!("[{}] Handshake response queued, state -> Handshaking", self.address);
        }
        Ok(())
    }

    /// Performs periodic work: the loss-detection sweep at `max_ack_delay`
    /// cadence, then egress of whatever the sweep queued.
    pub async fn on_tick(&mut self) -> Result<()> {
        if matches!(self.state, ConnectionState::Closed) {
            return Ok(());
        }

        let now = self.ticker.now_ns();
        let cadence_ns = self.config.max_ack_delay.as_nanos() as u64;
        if now.saturating_sub(self.last_sweep_ns) >= cadence_ns {
            self.last_sweep_ns = now;
            let mut resends = Vec::new();
            self.reliability.on_tick(&self.keys, &mut QueueSender(&mut resends));
            // Resent frames re-enter the egress path and are buffered anew
            // under their fresh packet numbers.
            self.pending_frames.extend(resends);
        }

        self.flush_egress().await
    }

    /// Queues application data on a stream. Only legal once connected; a
    /// closed connection accepts no new sends.
    pub async fn send_stream(&mut self, stream_id: u64, data: Bytes, fin: bool) -> Result<()> {
        if self.is_closed() {
            return Err(QuicError::ConnectionClosed);
        }
        if self.state != ConnectionState::Connected {
            return Err(QuicError::FatalState { state: self.state, frame: "STREAM" });
        }
        let offset_ref = self.stream_offsets.entry(stream_id).or_insert(0);
        let offset = *offset_ref;
        *offset_ref += data.len() as u64;
        self.pending_frames.push((
            Frame::Stream { stream_id, offset, fin, data },
            EncryptionLevel::OneRtt,
        ));
        self.flush_egress().await
    }

    /// Closes the connection with an application error, or NO_ERROR for a
    /// graceful shutdown.
    pub async fn close(&mut self, error_code: Option<u16>, reason: &str) -> Result<()> {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return Ok(());
        }
        let frame = Frame::ConnectionClose {
            is_application: true,
            error_code: error_code.unwrap_or(NO_ERROR),
            frame_type: None,
            reason: reason.to_string(),
        };
        self.pending_frames.push((frame, self.current_level()));
        self.flush_egress().await?;
        self.state = ConnectionState::Closing;
        Ok(())
    }

    /// Closes the connection after malformed peer input, reporting the
    /// transport error code the error maps to.
    async fn close_on_violation(&mut self, error: &QuicError) -> Result<()> {
        warn!("[{}] Protocol violation: {}", self.address, error);
        let frame_type = match error {
            QuicError::MalformedAck(_) => Some(FRAME_ACK as u64),
            _ => None,
        };
        let frame = Frame::ConnectionClose {
            is_application: false,
            error_code: error.transport_code(),
            frame_type,
            reason: error.to_string(),
        };
        self.pending_frames.push((frame, self.current_level()));
        self.flush_egress().await?;
        self.state = ConnectionState::Closing;
        Ok(())
    }

    /// Builds and transmits packets for all queued frames, grouped per
    /// encryption level. Pending acks ride along on the first packet that
    /// does not already carry one.
    async fn flush_egress(&mut self) -> Result<()> {
        if self.pending_frames.is_empty() {
            return Ok(());
        }
        if matches!(self.state, ConnectionState::Closed) {
            trace!("[{}] Discarding egress for closed connection", self.address);
            self.pending_frames.clear();
            return Ok(());
        }
        if self.peer_cid.is_none() {
            // Never synthesize a packet without a destination ID.
            warn!("[{}] No peer connection ID yet, holding {} frame(s)", self.address, self.pending_frames.len());
            return Ok(());
        }

        for level in [
            EncryptionLevel::Initial,
            EncryptionLevel::Handshake,
            EncryptionLevel::OneRtt,
        ] {
            let mut frames = Vec::new();
            let mut rest = Vec::new();
            for (frame, frame_level) in self.pending_frames.drain(..) {
                if frame_level == level {
                    frames.push(frame);
                } else {
                    rest.push((frame, frame_level));
                }
            }
            self.pending_frames = rest;

            if frames.is_empty() {
                continue;
            }
            let mut payload = Payload::from_frames(frames);
            if !payload.frames.iter().any(|f| matches!(f, Frame::Ack { .. })) {
                self.reliability.piggyback(&mut payload);
            }
            self.send_payload(level, payload).await?;
        }
        Ok(())
    }

    /// Assembles one packet around a payload, records it in the buffer, and
    /// hands it to the transport. The buffer insert happens before the
    /// socket write so a near-instant ack cannot race ahead of it.
    async fn send_payload(&mut self, level: EncryptionLevel, payload: Payload) -> Result<()> {
        let dcid = self
            .peer_cid
            .clone()
            .ok_or_else(|| QuicError::Internal("egress without destination ID".to_string()))?;
        let packet_type = level.packet_type();
        let scid = packet_type.is_long().then(|| self.local_cid.clone());

        self.last_packet_number = self.last_packet_number.next();
        let number = self.last_packet_number;
        let packet = Packet::new(packet_type, Some(dcid), scid, number, payload);

        self.reliability.before_send(&packet);

        let mut buffer = BytesMut::new();
        packet.encode(&mut buffer)?;
        if buffer.len() > self.config.max_packet_size {
            warn!(
                "[{}] Packet {} exceeds max_packet_size ({} > {})",
                self.address,
                number,
                buffer.len(),
                self.config.max_packet_size
            );
        }

        trace!("[{}] Sending {:?} packet {} ({} bytes)", self.address, packet_type, number, buffer.len());
        if let Err(e) = self.socket.send_to(&buffer, self.address).await {
            // Fatal for the packet: the buffered entry is dropped unacked.
            warn!("[{}] Send failure for packet {}: {}", self.address, number, e);
            self.reliability.discard(number);
            return Err(QuicError::SendFailure(number));
        }
        Ok(())
    }

    /// The highest encryption level currently usable for egress.
    fn current_level(&self) -> EncryptionLevel {
        if self.state == ConnectionState::Connected {
            EncryptionLevel::OneRtt
        } else {
            EncryptionLevel::Initial
        }
    }

    // --- Accessors ---

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn local_cid(&self) -> &ConnectionId {
        &self.local_cid
    }

    /// Checks if the connection has been idle past the timeout.
    pub fn is_timed_out(&self, now_ns: u64, timeout: Duration) -> bool {
        self.state != ConnectionState::Closed
            && now_ns.saturating_sub(self.last_activity_ns) > timeout.as_nanos() as u64
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnectionState::Closing | ConnectionState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quic::clock::ManualTicker;
    use crate::quic::error::PROTOCOL_VIOLATION;
    use crate::quic::handshake::StubHandshake;
    use crate::quic::protocol::{AckBlock, PacketType};

    fn pn(v: u64) -> PacketNumber {
        PacketNumber::new(v)
    }

    async fn test_pair() -> (Connection, UdpSocket, ConnectionId, Arc<ManualTicker>) {
        let server_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_socket.local_addr().unwrap();
        client_socket.connect(server_socket.local_addr().unwrap()).await.unwrap();

        let ticker = Arc::new(ManualTicker::new(0));
        let connection = Connection::new(
            client_addr,
            server_socket,
            EndpointConfig::default(),
            ticker.clone(),
            Box::new(StubHandshake::new()),
        );
        let client_cid = ConnectionId::random(8);
        (connection, client_socket, client_cid, ticker)
    }

    fn encode(packet: &Packet) -> Vec<u8> {
        let mut writer = BytesMut::new();
        packet.encode(&mut writer).unwrap();
        writer.to_vec()
    }

    async fn recv_packet(socket: &UdpSocket, dcid_len: usize) -> Packet {
        let mut buf = [0u8; 2048];
        let len = socket.recv(&mut buf).await.unwrap();
        let mut reader = Bytes::copy_from_slice(&buf[..len]);
        let packet = Packet::decode(&mut reader, dcid_len).unwrap();
        assert!(reader.is_empty());
        packet
    }

    #[tokio::test]
    async fn test_handshake_then_ack() {
        let (mut connection, client, client_cid, _ticker) = test_pair().await;
        let server_cid = connection.local_cid().clone();

        // Flight 1: client Initial with CRYPTO at pn=1.
        let initial = Packet::new(
            PacketType::Initial,
            Some(server_cid.clone()),
            Some(client_cid.clone()),
            pn(1),
            Payload::from_frames(vec![Frame::Crypto {
                offset: 0,
                data: Bytes::from_static(b"client-hello"),
            }]),
        );
        connection.handle_incoming(&encode(&initial)).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Handshaking);

        // The Initial response carries the deferred ack piggybacked.
        let response = recv_packet(&client, client_cid.len()).await;
        assert_eq!(response.packet_type, PacketType::Initial);
        assert_eq!(response.number, pn(1));
        assert!(response.payload.frames.iter().any(|f| matches!(f, Frame::Crypto { .. })));
        let Some(Frame::Ack { blocks, .. }) =
            response.payload.frames.iter().find(|f| matches!(f, Frame::Ack { .. }))
        else {
            panic!("Expected a piggybacked ACK on the Initial response");
        };
        assert_eq!(blocks, &vec![AckBlock::new(pn(1), pn(1)).unwrap()]);

        // Followed by the Handshake-level flight.
        let response = recv_packet(&client, client_cid.len()).await;
        assert_eq!(response.packet_type, PacketType::Handshake);
        assert_eq!(response.number, pn(2));

        // Flight 2: client Handshake confirmation at pn=2.
        let confirm = Packet::new(
            PacketType::Handshake,
            Some(server_cid.clone()),
            Some(client_cid.clone()),
            pn(2),
            Payload::from_frames(vec![Frame::Crypto {
                offset: 0,
                data: Bytes::from_static(b"client-finished"),
            }]),
        );
        connection.handle_incoming(&encode(&confirm)).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Connected);

        // The confirmation elicits a standalone short-header ACK.
        let ack = recv_packet(&client, client_cid.len()).await;
        assert_eq!(ack.packet_type, PacketType::Short);
        assert_eq!(ack.number, pn(3));
        assert!(ack.payload.is_ack_only());

        // A STREAM frame at pn=3 is acked in a short-header packet at the
        // next outbound packet number with blocks [[3,3]].
        let stream = Packet::new(
            PacketType::Short,
            Some(server_cid),
            None,
            pn(3),
            Payload::from_frames(vec![Frame::Stream {
                stream_id: 4,
                offset: 0,
                fin: false,
                data: Bytes::from_static(b"hello quartz"),
            }]),
        );
        connection.handle_incoming(&encode(&stream)).await.unwrap();

        let ack = recv_packet(&client, client_cid.len()).await;
        assert_eq!(ack.packet_type, PacketType::Short);
        assert_eq!(ack.number, pn(4));
        assert!(ack.payload.is_ack_only());
        let Some(Frame::Ack { blocks, .. }) =
            ack.payload.frames.iter().find(|f| matches!(f, Frame::Ack { .. }))
        else {
            panic!("Expected an ACK frame");
        };
        assert_eq!(blocks, &vec![AckBlock::new(pn(3), pn(3)).unwrap()]);
    }

    #[tokio::test]
    async fn test_application_close() {
        let (mut connection, client, client_cid, _ticker) = test_pair().await;
        let server_cid = connection.local_cid().clone();

        // One Initial so the connection learns the peer's ID.
        let initial = Packet::new(
            PacketType::Initial,
            Some(server_cid),
            Some(client_cid.clone()),
            pn(1),
            Payload::from_frames(vec![Frame::Crypto {
                offset: 0,
                data: Bytes::from_static(b"ch"),
            }]),
        );
        connection.handle_incoming(&encode(&initial)).await.unwrap();
        let _ = recv_packet(&client, client_cid.len()).await;
        let _ = recv_packet(&client, client_cid.len()).await;

        connection.close(Some(0x0001), "shutting down").await.unwrap();
        assert!(connection.is_closed());

        let close = recv_packet(&client, client_cid.len()).await;
        let Some(Frame::ConnectionClose { is_application, error_code, reason, .. }) = close
            .payload
            .frames
            .iter()
            .find(|f| matches!(f, Frame::ConnectionClose { .. }))
        else {
            panic!("Expected a CONNECTION_CLOSE frame");
        };
        assert!(is_application);
        assert_eq!(*error_code, 0x0001);
        assert_eq!(reason, "shutting down");

        // A second close is a no-op, and a closed connection accepts no
        // new sends.
        connection.close(None, "again").await.unwrap();
        let result = connection.send_stream(1, Bytes::from_static(b"late"), false).await;
        assert!(matches!(result, Err(QuicError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_graceful_close_defaults_to_no_error() {
        let (mut connection, client, client_cid, _ticker) = test_pair().await;
        let server_cid = connection.local_cid().clone();

        let initial = Packet::new(
            PacketType::Initial,
            Some(server_cid),
            Some(client_cid.clone()),
            pn(1),
            Payload::from_frames(vec![Frame::Crypto {
                offset: 0,
                data: Bytes::from_static(b"ch"),
            }]),
        );
        connection.handle_incoming(&encode(&initial)).await.unwrap();
        let _ = recv_packet(&client, client_cid.len()).await;
        let _ = recv_packet(&client, client_cid.len()).await;

        connection.close(None, "done").await.unwrap();

        let close = recv_packet(&client, client_cid.len()).await;
        let Some(Frame::ConnectionClose { error_code, .. }) = close
            .payload
            .frames
            .iter()
            .find(|f| matches!(f, Frame::ConnectionClose { .. }))
        else {
            panic!("Expected a CONNECTION_CLOSE frame");
        };
        assert_eq!(*error_code, NO_ERROR);
    }

    #[tokio::test]
    async fn test_peer_close_surfaces_and_terminates() {
        let (mut connection, _client, client_cid, _ticker) = test_pair().await;
        let server_cid = connection.local_cid().clone();

        let close = Packet::new(
            PacketType::Initial,
            Some(server_cid),
            Some(client_cid),
            pn(1),
            Payload::from_frames(vec![Frame::ConnectionClose {
                is_application: true,
                error_code: 0x0007,
                frame_type: None,
                reason: "going away".to_string(),
            }]),
        );
        let result = connection.handle_incoming(&encode(&close)).await;

        assert!(matches!(
            result,
            Err(QuicError::PeerClosed { error_code: 0x0007, .. })
        ));
        assert_eq!(connection.state(), ConnectionState::Closed);

        // Subsequent datagrams for the dead connection are dropped quietly.
        connection.handle_incoming(&[0x40, 0x00]).await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_packet_closes_connection() {
        let (mut connection, _client, _client_cid, _ticker) = test_pair().await;

        // Long header with an unsupported version.
        let garbage = [0xC0u8, 0x00, 0x00, 0x00, 0x01, 0x00];
        let result = connection.handle_incoming(&garbage).await;

        assert!(matches!(result, Err(QuicError::Binary(_))));
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_stream_before_handshake_is_violation() {
        let (mut connection, client, client_cid, _ticker) = test_pair().await;
        let server_cid = connection.local_cid().clone();

        // A long-header 0-RTT packet smuggling a STREAM frame before any
        // handshake progress.
        let early = Packet::new(
            PacketType::ZeroRtt,
            Some(server_cid),
            Some(client_cid.clone()),
            pn(1),
            Payload::from_frames(vec![Frame::Stream {
                stream_id: 0,
                offset: 0,
                fin: false,
                data: Bytes::from_static(b"too early"),
            }]),
        );
        let result = connection.handle_incoming(&encode(&early)).await;
        assert!(matches!(result, Err(QuicError::FatalState { .. })));
        assert!(connection.is_closed());

        // The peer is told why: a transport-level PROTOCOL_VIOLATION close.
        let close = recv_packet(&client, client_cid.len()).await;
        let Some(Frame::ConnectionClose { is_application, error_code, .. }) = close
            .payload
            .frames
            .iter()
            .find(|f| matches!(f, Frame::ConnectionClose { .. }))
        else {
            panic!("Expected a CONNECTION_CLOSE frame");
        };
        assert!(!is_application);
        assert_eq!(*error_code, PROTOCOL_VIOLATION);
    }

    #[tokio::test]
    async fn test_loss_sweep_resends_via_fresh_number() {
        let (mut connection, client, client_cid, ticker) = test_pair().await;
        let server_cid = connection.local_cid().clone();

        // Complete the handshake quickly.
        let initial = Packet::new(
            PacketType::Initial,
            Some(server_cid.clone()),
            Some(client_cid.clone()),
            pn(1),
            Payload::from_frames(vec![Frame::Crypto {
                offset: 0,
                data: Bytes::from_static(b"ch"),
            }]),
        );
        connection.handle_incoming(&encode(&initial)).await.unwrap();
        let _ = recv_packet(&client, client_cid.len()).await; // Initial response (pn 1)
        let _ = recv_packet(&client, client_cid.len()).await; // Handshake response (pn 2)
        // The confirmation also acks the server's two handshake packets so
        // only later data stays in flight.
        let confirm = Packet::new(
            PacketType::Handshake,
            Some(server_cid.clone()),
            Some(client_cid.clone()),
            pn(2),
            Payload::from_frames(vec![
                Frame::Crypto { offset: 0, data: Bytes::from_static(b"fin") },
                Frame::Ack {
                    delay: 0,
                    blocks: vec![AckBlock::new(pn(1), pn(2)).unwrap()],
                },
            ]),
        );
        connection.handle_incoming(&encode(&confirm)).await.unwrap();
        let _ = recv_packet(&client, client_cid.len()).await; // standalone ACK (pn 3)
        assert_eq!(connection.state(), ConnectionState::Connected);

        // Send application data at pn 4; the peer never acks it.
        connection
            .send_stream(4, Bytes::from_static(b"lost payload"), false)
            .await
            .unwrap();
        let sent = recv_packet(&client, client_cid.len()).await;
        assert_eq!(sent.number, pn(4));

        // Advance past the loss threshold and run the sweep.
        ticker.advance(2_000_000_000);
        connection.on_tick().await.unwrap();

        // The STREAM frame comes back under a fresh packet number.
        let resent = recv_packet(&client, client_cid.len()).await;
        assert_eq!(resent.number, pn(5));
        assert!(
            resent
                .payload
                .frames
                .iter()
                .any(|f| matches!(f, Frame::Stream { stream_id: 4, .. }))
        );
    }
}
