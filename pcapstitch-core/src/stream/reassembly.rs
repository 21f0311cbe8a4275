use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use super::{Direction, Endpoint};
use crate::packet::{TcpFlags, TcpSegment};
use crate::tls::{TlsContext, TlsDirection, TlsSession};

/// A segment that could not yet be placed in the stream.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload: Bytes,
}

impl Fragment {
    fn from_segment(segment: &TcpSegment<'_>) -> Self {
        Self {
            seq: segment.seq,
            ack: segment.ack,
            flags: segment.flags,
            payload: Bytes::copy_from_slice(segment.payload),
        }
    }

    /// SYN+ACK of a new stream reusing the connection.
    fn is_syn_ack(&self) -> bool {
        self.flags.syn && self.flags.ack
    }
}

/// Outcome of feeding one segment to a [`TcpReconstructor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reassembly {
    /// Both directions have closed; the stream can be taken.
    Complete,
    /// More segments are needed.
    InProgress,
}

/// Lifecycle of a reconstructed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconstructorState {
    /// No SYN seen yet.
    AwaitingHandshake,
    /// One side of the handshake seen.
    Establishing,
    Established,
    /// One direction has sent its FIN.
    HalfClosed,
    /// Both directions closed, reassembly state released.
    Closed,
}

impl ReconstructorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconstructorState::AwaitingHandshake => "awaiting_handshake",
            ReconstructorState::Establishing => "establishing",
            ReconstructorState::Established => "established",
            ReconstructorState::HalfClosed => "half_closed",
            ReconstructorState::Closed => "closed",
        }
    }
}

impl fmt::Display for ReconstructorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One direction of the connection.
#[derive(Debug, Clone, Copy, Default)]
struct Side {
    endpoint: Option<Endpoint>,
    /// Sequence number carried by this side's SYN.
    isn: u32,
    /// Next expected sequence number.
    next_seq: u32,
    closed: bool,
}

impl Side {
    fn bind(&mut self, endpoint: Endpoint, isn: u32, next_seq: u32) {
        self.endpoint = Some(endpoint);
        self.isn = isn;
        self.next_seq = next_seq;
    }
}

/// Bytes written by one direction, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub direction: Direction,
    pub data: Bytes,
}

/// Endpoints of a reconstructed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMetadata {
    pub initiator: Endpoint,
    pub responder: Endpoint,
}

impl StreamMetadata {
    /// Header line written before the stream content.
    pub fn header(&self) -> String {
        format!(
            "\"source_ip\" : \"{}\", \"source_port\" : \"{}\", \
             \"destination_ip\" : \"{}\", \"destination_port\" : \"{}\"\r\n",
            self.initiator.ip, self.initiator.port, self.responder.ip, self.responder.port
        )
    }
}

/// Content of a finished connection, handed out exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructedStream {
    metadata: StreamMetadata,
    chunks: Vec<StreamChunk>,
}

impl ReconstructedStream {
    pub fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    /// Chunks in the order they were written.
    pub fn chunks(&self) -> &[StreamChunk] {
        &self.chunks
    }

    /// Bytes sent by the initiator.
    pub fn initiator_bytes(&self) -> Vec<u8> {
        self.direction_bytes(Direction::Initiator)
    }

    /// Bytes sent by the responder.
    pub fn responder_bytes(&self) -> Vec<u8> {
        self.direction_bytes(Direction::Responder)
    }

    /// Total payload length, excluding the header.
    pub fn payload_len(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }

    /// Header line followed by every chunk in write order.
    pub fn to_bytes(&self) -> Bytes {
        let header = self.metadata.header();
        let mut out = BytesMut::with_capacity(header.len() + self.payload_len());
        out.put_slice(header.as_bytes());
        for chunk in &self.chunks {
            out.put_slice(&chunk.data);
        }
        out.freeze()
    }

    fn direction_bytes(&self, direction: Direction) -> Vec<u8> {
        self.chunks
            .iter()
            .filter(|c| c.direction == direction)
            .flat_map(|c| c.data.iter().copied())
            .collect()
    }
}

/// Reassembles both directions of one TCP connection from segments that may
/// arrive in any order.
///
/// A segment is placed when its sequence number is the one expected for its
/// direction and its acknowledgment number is the one expected for the peer.
/// Anything else is kept as a [`Fragment`] and retried after every change.
/// Payload on the configured TLS port is routed through a [`TlsSession`].
pub struct TcpReconstructor {
    tls_port: u16,
    tls: Option<Arc<TlsContext>>,
    tls_session: Option<TlsSession>,
    sides: [Side; 2],
    fragments: SmallVec<[Fragment; 8]>,
    chunks: Vec<StreamChunk>,
    released: bool,
}

impl fmt::Debug for TcpReconstructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpReconstructor")
            .field("state", &self.state())
            .field("tls_port", &self.tls_port)
            .field("fragments", &self.fragments.len())
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

impl TcpReconstructor {
    /// Create a reconstructor. With a TLS context, streams whose responder
    /// listens on `tls_port` are decrypted when a key is available.
    pub fn new(tls_port: u16, tls: Option<Arc<TlsContext>>) -> Self {
        Self {
            tls_port,
            tls,
            tls_session: None,
            sides: [Side::default(); 2],
            fragments: SmallVec::new(),
            chunks: Vec::new(),
            released: false,
        }
    }

    pub fn state(&self) -> ReconstructorState {
        if self.released {
            return ReconstructorState::Closed;
        }
        let [initiator, responder] = &self.sides;
        match (initiator.endpoint, responder.endpoint) {
            (None, None) => ReconstructorState::AwaitingHandshake,
            (Some(_), None) | (None, Some(_)) => ReconstructorState::Establishing,
            _ if initiator.closed || responder.closed => ReconstructorState::HalfClosed,
            _ => ReconstructorState::Established,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.released
    }

    /// Segments held back waiting for their turn.
    pub fn pending_fragments(&self) -> usize {
        self.fragments.len()
    }

    /// Bound endpoint of a direction.
    pub fn endpoint(&self, direction: Direction) -> Option<Endpoint> {
        self.sides[direction.index()].endpoint
    }

    /// Whether payload is routed through the TLS engine.
    pub fn is_tls(&self) -> bool {
        self.sides[Direction::Responder.index()]
            .endpoint
            .is_some_and(|e| e.port == self.tls_port)
    }

    /// Feed one segment.
    ///
    /// Segments arriving after the stream has closed are ignored.
    pub fn process(&mut self, segment: &TcpSegment<'_>) -> Reassembly {
        if self.released {
            tracing::trace!(seq = segment.seq, "Segment after close ignored");
            return Reassembly::InProgress;
        }

        let src = Endpoint::new(segment.src_ip, segment.src_port);
        let dst = Endpoint::new(segment.dst_ip, segment.dst_port);

        if segment.flags.syn {
            self.process_syn(segment, src, dst);
            return self.check_complete();
        }

        let [initiator, responder] = &self.sides;
        let (Some(initiator_ep), Some(_)) = (initiator.endpoint, responder.endpoint) else {
            // Handshake not seen yet
            self.add_fragment(segment);
            return Reassembly::InProgress;
        };

        self.drain_fragments();

        let direction = if src == initiator_ep {
            Direction::Initiator
        } else {
            Direction::Responder
        };
        let (next, peer_next) = self.expected(direction);

        if segment.seq == next && segment.ack == peer_next {
            tracing::trace!(
                direction = direction.as_str(),
                seq = segment.seq,
                len = segment.payload.len(),
                "In order"
            );
            self.accept(direction, segment.payload, segment.flags.fin);
            self.drain_fragments();
        } else {
            tracing::trace!(
                direction = direction.as_str(),
                seq = segment.seq,
                expected = next,
                %dst,
                "Out of order"
            );
            self.add_fragment(segment);
            return Reassembly::InProgress;
        }

        self.check_complete()
    }

    fn process_syn(&mut self, segment: &TcpSegment<'_>, src: Endpoint, dst: Endpoint) {
        let direction = if segment.flags.ack {
            Direction::Responder
        } else {
            Direction::Initiator
        };
        let side = &mut self.sides[direction.index()];

        if side.endpoint.is_none() {
            side.bind(src, segment.seq, seq_add(segment.seq, 1));
            tracing::debug!(
                direction = direction.as_str(),
                endpoint = %src,
                seq = segment.seq,
                "SYN"
            );
            self.drain_fragments();

            // SYN-ACK seen first: the initiator is its destination
            let initiator = &mut self.sides[Direction::Initiator.index()];
            if direction == Direction::Responder && initiator.endpoint.is_none() {
                initiator.bind(dst, segment.ack.wrapping_sub(1), segment.ack);
                tracing::debug!(endpoint = %dst, seq = segment.ack, "Derived initiator from SYN-ACK");
                self.drain_fragments();
            }
        } else if direction == Direction::Responder
            && !(side.endpoint == Some(src) && side.isn == segment.seq)
        {
            tracing::debug!(endpoint = %src, seq = segment.seq, "Additional stream");
            self.add_fragment(segment);
        }
    }

    /// Expected sequence numbers for a direction and its peer.
    fn expected(&self, direction: Direction) -> (u32, u32) {
        (
            self.sides[direction.index()].next_seq,
            self.sides[direction.peer().index()].next_seq,
        )
    }

    fn accept(&mut self, direction: Direction, payload: &[u8], fin: bool) {
        self.write(direction, payload);
        let side = &mut self.sides[direction.index()];
        side.next_seq = seq_add(side.next_seq, payload.len());
        if fin {
            tracing::debug!(direction = direction.as_str(), "FIN");
            side.closed = true;
            side.next_seq = seq_add(side.next_seq, 1);
        }
    }

    fn add_fragment(&mut self, segment: &TcpSegment<'_>) {
        let flags = segment.flags;
        if flags.syn || flags.fin || !segment.payload.is_empty() {
            self.fragments.push(Fragment::from_segment(segment));
        }
    }

    /// Place buffered fragments until none fits.
    fn drain_fragments(&mut self) {
        if self.sides.iter().any(|s| s.endpoint.is_none()) {
            return;
        }
        while self.place_one_fragment() {}
    }

    fn place_one_fragment(&mut self) -> bool {
        let found = self.fragments.iter().enumerate().find_map(|(i, fragment)| {
            if fragment.flags.syn {
                return None;
            }
            [Direction::Initiator, Direction::Responder]
                .into_iter()
                .find(|&d| self.expected(d) == (fragment.seq, fragment.ack))
                .map(|d| (i, d))
        });
        let Some((i, direction)) = found else {
            return false;
        };

        let fragment = self.fragments.remove(i);
        tracing::trace!(
            direction = direction.as_str(),
            seq = fragment.seq,
            "Placed fragment"
        );
        self.accept(direction, &fragment.payload, fragment.flags.fin);
        true
    }

    /// Re-arm both directions from a buffered SYN-ACK of a new stream.
    fn find_new_stream(&mut self) -> bool {
        let Some(i) = self.fragments.iter().position(Fragment::is_syn_ack) else {
            return false;
        };
        let fragment = self.fragments.remove(i);
        let [initiator, responder] = &mut self.sides;
        initiator.next_seq = fragment.ack;
        initiator.closed = false;
        responder.isn = fragment.seq;
        responder.next_seq = seq_add(fragment.seq, 1);
        responder.closed = false;
        // The new connection negotiates its own TLS session
        self.tls_session = None;
        tracing::debug!(seq = fragment.seq, "Found new stream on closed connection");
        true
    }

    fn both_closed(&self) -> bool {
        self.sides.iter().all(|s| s.closed)
    }

    fn check_complete(&mut self) -> Reassembly {
        while self.both_closed() && self.find_new_stream() {
            self.drain_fragments();
        }
        if self.both_closed() {
            self.release();
            Reassembly::Complete
        } else {
            Reassembly::InProgress
        }
    }

    /// Force termination, flushing whatever has been reassembled.
    pub fn close(&mut self) {
        if self.released {
            return;
        }
        for side in &mut self.sides {
            side.closed = true;
        }
        while self.find_new_stream() {
            self.drain_fragments();
            for side in &mut self.sides {
                side.closed = true;
            }
        }
        self.release();
    }

    fn release(&mut self) {
        if !self.fragments.is_empty() {
            tracing::debug!(
                fragments = self.fragments.len(),
                "Discarding unplaced fragments"
            );
        }
        self.fragments = SmallVec::new();
        self.tls_session = None;
        self.released = true;
    }

    fn write(&mut self, direction: Direction, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let data = if self.is_tls() {
            match self.tls_session() {
                Some(session) => session.process(tls_direction(direction), payload),
                None => payload.to_vec(),
            }
        } else {
            payload.to_vec()
        };
        if !data.is_empty() {
            self.chunks.push(StreamChunk {
                direction,
                data: Bytes::from(data),
            });
        }
    }

    fn tls_session(&mut self) -> Option<&mut TlsSession> {
        if self.tls_session.is_none() {
            let ctx = Arc::clone(self.tls.as_ref()?);
            let server = self.sides[Direction::Responder.index()].endpoint?;
            self.tls_session = Some(TlsSession::new(server.ip, ctx));
        }
        self.tls_session.as_mut()
    }

    /// Take the reconstructed stream once closed.
    ///
    /// Returns `None` before close, after the stream was already taken, or
    /// when no payload was reassembled.
    pub fn take_output(&mut self) -> Option<ReconstructedStream> {
        if !self.released || self.chunks.is_empty() {
            return None;
        }
        let [initiator, responder] = &self.sides;
        let metadata = StreamMetadata {
            initiator: initiator.endpoint?,
            responder: responder.endpoint?,
        };
        Some(ReconstructedStream {
            metadata,
            chunks: std::mem::take(&mut self.chunks),
        })
    }
}

fn tls_direction(direction: Direction) -> TlsDirection {
    match direction {
        Direction::Initiator => TlsDirection::ClientToServer,
        Direction::Responder => TlsDirection::ServerToClient,
    }
}

fn seq_add(a: u32, n: usize) -> u32 {
    a.wrapping_add(n as u32)
}
