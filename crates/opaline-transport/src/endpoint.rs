//! The transport endpoint state machine.

use std::collections::HashMap;

use tracing::{debug, warn};

use opaline_storage::records::{decode_records, encode_record};
use opaline_storage::Storage;
use opaline_types::NodeId;
use opaline_wire::{TransportFrame, TransportTag};

use crate::channel::{
    ChannelTable, InFlight, PendingSend, RecvChannel, RecvRecord, SendChannel, SeqNum, SessionId,
};
use crate::{TransportConfig, TransportError, CHANNEL_TABLE};

// ============================================================================
// Outputs
// ============================================================================

/// A raw datagram to hand to the network primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Destination node.
    pub to: NodeId,
    /// Encoded transport frame.
    pub bytes: Vec<u8>,
}

/// An application payload delivered exactly once, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Originating node.
    pub from: NodeId,
    /// The payload as submitted to the peer's `send`.
    pub payload: Vec<u8>,
}

/// Timers the endpoint asks its driver to arm.
///
/// Timers are never cancelled; a fired timer whose condition no longer
/// holds is ignored by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportTimer {
    /// Retransmit one unacknowledged data frame.
    Retransmit {
        /// Peer the frame was sent to.
        peer: NodeId,
        /// Sequence number of the frame.
        seq: SeqNum,
    },
    /// Retry an unanswered session handshake.
    Handshake {
        /// Peer being handshaken.
        peer: NodeId,
    },
}

/// Everything one endpoint step produced.
#[derive(Debug, Default)]
pub struct EndpointOutput {
    /// Datagrams to transmit (fire-and-forget).
    pub datagrams: Vec<Datagram>,
    /// Payloads to deliver to the application, in order.
    pub deliveries: Vec<Delivery>,
    /// Timers to arm, with their logical delays.
    pub timers: Vec<(TransportTimer, u64)>,
}

impl EndpointOutput {
    /// Creates an empty output.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if nothing was produced.
    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty() && self.deliveries.is_empty() && self.timers.is_empty()
    }

    /// Merges another output into this one.
    pub fn merge(&mut self, other: EndpointOutput) {
        self.datagrams.extend(other.datagrams);
        self.deliveries.extend(other.deliveries);
        self.timers.extend(other.timers);
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// Per-node transport endpoint.
///
/// Owns every channel this node has with its peers, in both directions,
/// plus the durable channel table. See the crate docs for the contract.
#[derive(Debug, Clone)]
pub struct Endpoint {
    local: NodeId,
    config: TransportConfig,
    send: HashMap<NodeId, SendChannel>,
    recv: HashMap<NodeId, RecvChannel>,
    /// Monotonic session allocation counter, persisted.
    next_session: u32,
}

impl Endpoint {
    /// Creates an endpoint with no channel history.
    pub fn new(local: NodeId, config: TransportConfig) -> Self {
        Self {
            local,
            config,
            send: HashMap::new(),
            recv: HashMap::new(),
            next_session: 1,
        }
    }

    /// Rebuilds an endpoint from the persisted channel table.
    ///
    /// Receive channels come back exactly as persisted, so a sender with a
    /// surviving session can continue without duplicates. Send channels
    /// start empty: the first send to each peer re-handshakes, and the
    /// peer's reported last-delivered number re-bases the numbering.
    pub fn restore<S: Storage>(
        local: NodeId,
        config: TransportConfig,
        storage: &S,
    ) -> Result<Self, TransportError> {
        let mut endpoint = Self::new(local, config);
        let Some(bytes) = storage.read_all(CHANNEL_TABLE)? else {
            return Ok(endpoint);
        };
        let table: ChannelTable = decode_records(&bytes)
            .map_err(|e| TransportError::CorruptTable(e.to_string()))?
            .into_iter()
            .next()
            .unwrap_or_default();

        endpoint.next_session = table.next_session.max(1);
        for record in table.recv {
            let mut channel = RecvChannel::new(record.session);
            channel.last_delivered = record.last_delivered;
            endpoint.recv.insert(record.peer, channel);
        }
        Ok(endpoint)
    }

    /// Returns this endpoint's node ID.
    pub fn local(&self) -> NodeId {
        self.local
    }

    /// True while payloads submitted earlier for `to` are still queued or
    /// awaiting acknowledgement.
    ///
    /// Callers that periodically re-submit the same logical message can
    /// check this first: a copy the channel still holds will be delivered
    /// without help, and queueing another behind it only grows the backlog
    /// while the peer is unreachable.
    pub fn is_draining(&self, to: NodeId) -> bool {
        self.send
            .get(&to)
            .is_some_and(|channel| !channel.pending.is_empty() || !channel.in_flight.is_empty())
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Submits a payload for reliable, ordered delivery to `to`.
    ///
    /// Non-blocking. If no session exists the payload is queued and a
    /// handshake started transparently. Oversized payloads are rejected
    /// here and never transmitted.
    pub fn send(&mut self, to: NodeId, payload: Vec<u8>) -> Result<EndpointOutput, TransportError> {
        if payload.len() > self.config.max_payload {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                max: self.config.max_payload,
            });
        }

        let mut output = EndpointOutput::empty();
        let channel = self.send.entry(to).or_default();

        let Some(session) = channel.session else {
            channel.pending.push_back(PendingSend {
                old_seq: None,
                payload,
            });
            if !channel.handshake_inflight {
                channel.handshake_inflight = true;
                debug!(local = %self.local, peer = %to, "no session, starting handshake");
                push_handshake(&self.config, to, &mut output);
            }
            return Ok(output);
        };

        let seq = channel.last_assigned.next();
        channel.last_assigned = seq;
        channel.in_flight.insert(
            seq,
            InFlight {
                payload: payload.clone(),
                retries: 0,
            },
        );
        push_data(&self.config, to, session, seq, payload, &mut output);
        Ok(output)
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// Processes one raw datagram from the network.
    ///
    /// Malformed datagrams are dropped silently (debug-logged); the network
    /// is allowed to corrupt anything.
    pub fn on_datagram<S: Storage>(
        &mut self,
        storage: &mut S,
        from: NodeId,
        bytes: &[u8],
    ) -> Result<EndpointOutput, TransportError> {
        let frame = match TransportFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(local = %self.local, peer = %from, error = %e, "dropping malformed datagram");
                return Ok(EndpointOutput::empty());
            }
        };

        let seq = SeqNum::new(frame.seq);
        let session = SessionId::new(frame.session);
        match frame.tag {
            TransportTag::Data => self.on_data(storage, from, session, seq, frame.payload),
            TransportTag::Ack => Ok(self.on_ack(from, session, seq)),
            TransportTag::SessionEstablish => self.on_session_establish(storage, from),
            TransportTag::SessionAck => Ok(self.on_session_ack(from, session, seq)),
            TransportTag::SessionExpired => Ok(self.on_session_expired(from)),
        }
    }

    fn on_data<S: Storage>(
        &mut self,
        storage: &mut S,
        from: NodeId,
        session: SessionId,
        seq: SeqNum,
        payload: Vec<u8>,
    ) -> Result<EndpointOutput, TransportError> {
        let mut output = EndpointOutput::empty();

        match self.recv.get_mut(&from) {
            Some(channel) if channel.session == session => {
                if seq <= channel.last_delivered {
                    // Duplicate of something already delivered: re-acknowledge
                    // so the sender can clear its window, then drop.
                    debug!(local = %self.local, peer = %from, %seq, "duplicate data frame");
                    let ack_to = channel.last_delivered;
                    push_ack(from, session, ack_to, &mut output);
                } else if seq == channel.last_delivered.next() {
                    output.deliveries.push(Delivery { from, payload });
                    channel.last_delivered = seq;
                    // Close the gap: release buffered successors in bulk.
                    while let Some(next) = channel.buffered.remove(&channel.last_delivered.next()) {
                        channel.last_delivered = channel.last_delivered.next();
                        output.deliveries.push(Delivery {
                            from,
                            payload: next,
                        });
                    }
                    let ack_to = channel.last_delivered;
                    self.persist(storage)?;
                    push_ack(from, session, ack_to, &mut output);
                } else {
                    // Ahead of the gap: hold it, restate our cumulative
                    // position so the sender knows what is still missing.
                    channel.buffered.insert(seq, payload);
                    let ack_to = channel.last_delivered;
                    push_ack(from, session, ack_to, &mut output);
                }
            }
            Some(channel) if session < channel.session => {
                // Stale frame from a session we already replaced. Dropping it
                // is safe: the sender either moved on or is mid-handshake.
                debug!(local = %self.local, peer = %from, stale = %session, "dropping stale-session frame");
            }
            _ => {
                // No record of this session: the peer believes in a channel
                // we have lost (or never had). Allocate a replacement and
                // tell it to start over.
                let fresh = self.allocate_session();
                let last_delivered = match self.recv.get_mut(&from) {
                    Some(channel) => {
                        channel.session = fresh;
                        channel.buffered.clear();
                        channel.last_delivered
                    }
                    None => {
                        self.recv.insert(from, RecvChannel::new(fresh));
                        SeqNum::ZERO
                    }
                };
                self.persist(storage)?;
                warn!(local = %self.local, peer = %from, announced = %session, granted = %fresh,
                    "expired session, granting replacement");
                output.datagrams.push(frame_to(
                    from,
                    TransportTag::SessionExpired,
                    last_delivered.as_u32(),
                    fresh.as_u32(),
                    Vec::new(),
                ));
            }
        }

        Ok(output)
    }

    fn on_ack(&mut self, from: NodeId, session: SessionId, cumulative: SeqNum) -> EndpointOutput {
        if let Some(channel) = self.send.get_mut(&from) {
            if channel.session == Some(session) {
                // Cumulative: everything at or below is delivered.
                channel.in_flight = channel.in_flight.split_off(&cumulative.next());
            }
        }
        EndpointOutput::empty()
    }

    fn on_session_establish<S: Storage>(
        &mut self,
        storage: &mut S,
        from: NodeId,
    ) -> Result<EndpointOutput, TransportError> {
        let fresh = self.allocate_session();
        let last_delivered = match self.recv.get_mut(&from) {
            Some(channel) => {
                // Same peer, new sender incarnation: keep the delivery
                // position, discard frames buffered under the old session
                // (their numbering may be reused for different payloads).
                channel.session = fresh;
                channel.buffered.clear();
                channel.last_delivered
            }
            None => {
                self.recv.insert(from, RecvChannel::new(fresh));
                SeqNum::ZERO
            }
        };
        self.persist(storage)?;
        debug!(local = %self.local, peer = %from, session = %fresh, %last_delivered,
            "granted session");

        let mut output = EndpointOutput::empty();
        output.datagrams.push(frame_to(
            from,
            TransportTag::SessionAck,
            last_delivered.as_u32(),
            fresh.as_u32(),
            Vec::new(),
        ));
        Ok(output)
    }

    fn on_session_ack(
        &mut self,
        from: NodeId,
        session: SessionId,
        last_delivered: SeqNum,
    ) -> EndpointOutput {
        let mut output = EndpointOutput::empty();
        let Some(channel) = self.send.get_mut(&from) else {
            return output;
        };
        if !channel.handshake_inflight {
            // A duplicated establish makes the peer grant twice and keep
            // only the later session. An ack naming something newer than
            // what we adopted means everything sent meanwhile went to the
            // dead grant: pull it back and renumber under the live one.
            match channel.session {
                Some(current) if session > current => channel.demote_to_pending(),
                _ => return output,
            }
        }

        channel.handshake_inflight = false;
        channel.session = Some(session);
        channel.last_assigned = last_delivered;
        debug!(local = %self.local, peer = %from, %session, %last_delivered, "session established");

        // Replay the queue, skipping anything the peer already delivered
        // under the previous session.
        let pending = std::mem::take(&mut channel.pending);
        for entry in pending {
            if let Some(old_seq) = entry.old_seq {
                if old_seq <= last_delivered {
                    continue;
                }
            }
            let seq = channel.last_assigned.next();
            channel.last_assigned = seq;
            channel.in_flight.insert(
                seq,
                InFlight {
                    payload: entry.payload.clone(),
                    retries: 0,
                },
            );
            push_data(&self.config, from, session, seq, entry.payload, &mut output);
        }
        output
    }

    fn on_session_expired(&mut self, from: NodeId) -> EndpointOutput {
        let mut output = EndpointOutput::empty();
        let Some(channel) = self.send.get_mut(&from) else {
            return output;
        };
        if channel.handshake_inflight {
            // Already tearing down; one expiry notice is enough.
            return output;
        }

        warn!(local = %self.local, peer = %from, "peer expired our session, re-establishing");
        channel.demote_to_pending();
        channel.handshake_inflight = true;
        push_handshake(&self.config, from, &mut output);
        output
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Processes a fired timer.
    ///
    /// Timers fire unconditionally; this handler checks whether the state
    /// the timer refers to still exists before acting.
    pub fn on_timer(&mut self, timer: TransportTimer) -> EndpointOutput {
        let mut output = EndpointOutput::empty();
        match timer {
            TransportTimer::Retransmit { peer, seq } => {
                let Some(channel) = self.send.get_mut(&peer) else {
                    return output;
                };
                let Some(session) = channel.session else {
                    return output;
                };
                let Some(frame) = channel.in_flight.get_mut(&seq) else {
                    // Acknowledged between arming and firing.
                    return output;
                };

                if frame.retries < self.config.max_retries {
                    frame.retries += 1;
                    debug!(local = %self.local, %peer, %seq, retries = frame.retries, "retransmitting");
                    let payload = frame.payload.clone();
                    push_data(&self.config, peer, session, seq, payload, &mut output);
                } else {
                    // The peer has had every chance to acknowledge; assume it
                    // lost its channel state and start over.
                    warn!(local = %self.local, %peer, %seq, "retries exhausted, forcing handshake");
                    channel.demote_to_pending();
                    channel.handshake_inflight = true;
                    push_handshake(&self.config, peer, &mut output);
                }
            }
            TransportTimer::Handshake { peer } => {
                let Some(channel) = self.send.get_mut(&peer) else {
                    return output;
                };
                if channel.handshake_inflight {
                    debug!(local = %self.local, %peer, "handshake unanswered, retrying");
                    push_handshake(&self.config, peer, &mut output);
                }
            }
        }
        output
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn allocate_session(&mut self) -> SessionId {
        let session = SessionId::new(self.next_session);
        self.next_session += 1;
        session
    }

    /// Rewrites the channel table. Full-rewrite file, called before any
    /// frame that depends on the recorded state is emitted.
    fn persist<S: Storage>(&self, storage: &mut S) -> Result<(), TransportError> {
        let table = ChannelTable {
            next_session: self.next_session,
            recv: self
                .recv
                .iter()
                .map(|(peer, channel)| RecvRecord {
                    peer: *peer,
                    session: channel.session,
                    last_delivered: channel.last_delivered,
                })
                .collect(),
        };
        let bytes = encode_record(&table)
            .map_err(|e| TransportError::CorruptTable(e.to_string()))?;
        storage.write_all(CHANNEL_TABLE, &bytes)?;
        Ok(())
    }
}

// ============================================================================
// Frame Builders
// ============================================================================

fn frame_to(to: NodeId, tag: TransportTag, seq: u32, session: u32, payload: Vec<u8>) -> Datagram {
    Datagram {
        to,
        bytes: TransportFrame {
            tag,
            seq,
            session,
            payload,
        }
        .encode(),
    }
}

fn push_data(
    config: &TransportConfig,
    to: NodeId,
    session: SessionId,
    seq: SeqNum,
    payload: Vec<u8>,
    output: &mut EndpointOutput,
) {
    output.datagrams.push(frame_to(
        to,
        TransportTag::Data,
        seq.as_u32(),
        session.as_u32(),
        payload,
    ));
    output.timers.push((
        TransportTimer::Retransmit { peer: to, seq },
        config.retransmit_delay,
    ));
}

fn push_ack(to: NodeId, session: SessionId, cumulative: SeqNum, output: &mut EndpointOutput) {
    output.datagrams.push(frame_to(
        to,
        TransportTag::Ack,
        cumulative.as_u32(),
        session.as_u32(),
        Vec::new(),
    ));
}

fn push_handshake(config: &TransportConfig, to: NodeId, output: &mut EndpointOutput) {
    output
        .datagrams
        .push(frame_to(to, TransportTag::SessionEstablish, 0, 0, Vec::new()));
    output.timers.push((
        TransportTimer::Handshake { peer: to },
        config.handshake_retry_delay,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use opaline_storage::{MemoryStorage, StorageError};

    const A: NodeId = NodeId::new(0);
    const B: NodeId = NodeId::new(1);

    struct Pair {
        a: Endpoint,
        a_storage: MemoryStorage,
        b: Endpoint,
        b_storage: MemoryStorage,
    }

    impl Pair {
        fn new() -> Self {
            Self {
                a: Endpoint::new(A, TransportConfig::default()),
                a_storage: MemoryStorage::new(),
                b: Endpoint::new(B, TransportConfig::default()),
                b_storage: MemoryStorage::new(),
            }
        }

        /// Feeds every datagram in `output` into the opposite endpoint,
        /// repeatedly, until the exchange quiesces. Returns everything B
        /// delivered to its application.
        fn exchange(&mut self, mut output: EndpointOutput, from_a: bool) -> Vec<Delivery> {
            let mut delivered = Vec::new();
            let mut toward_b = from_a;
            loop {
                let mut next = EndpointOutput::empty();
                for datagram in &output.datagrams {
                    let step = if toward_b {
                        self.b
                            .on_datagram(&mut self.b_storage, A, &datagram.bytes)
                            .expect("b datagram")
                    } else {
                        self.a
                            .on_datagram(&mut self.a_storage, B, &datagram.bytes)
                            .expect("a datagram")
                    };
                    if toward_b {
                        delivered.extend(step.deliveries.iter().cloned());
                    }
                    next.merge(step);
                }
                if next.datagrams.is_empty() {
                    return delivered;
                }
                output = next;
                toward_b = !toward_b;
            }
        }
    }

    fn send(pair: &mut Pair, payload: &[u8]) -> EndpointOutput {
        pair.a.send(B, payload.to_vec()).expect("send")
    }

    #[test]
    fn first_send_triggers_handshake_then_delivers() {
        let mut pair = Pair::new();

        let out = send(&mut pair, b"hello");
        // No session yet: the only datagram is the handshake.
        assert_eq!(out.datagrams.len(), 1);
        let frame = TransportFrame::decode(&out.datagrams[0].bytes).expect("frame");
        assert_eq!(frame.tag, TransportTag::SessionEstablish);

        let delivered = pair.exchange(out, true);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, b"hello");
        assert_eq!(delivered[0].from, A);
    }

    #[test]
    fn payload_order_is_preserved() {
        let mut pair = Pair::new();
        let mut out = send(&mut pair, b"one");
        out.merge(send(&mut pair, b"two"));
        out.merge(send(&mut pair, b"three"));

        let delivered = pair.exchange(out, true);
        let payloads: Vec<_> = delivered.iter().map(|d| d.payload.clone()).collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn oversized_payload_is_rejected_locally() {
        let mut pair = Pair::new();
        let huge = vec![0u8; pair.a.config.max_payload + 1];
        let err = pair.a.send(B, huge).unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge { .. }));
        // Nothing was queued or sent.
        assert!(pair.a.send.get(&B).is_none());
    }

    /// Establishes a session and returns the data frames for `payloads`,
    /// without delivering them yet.
    fn establish_and_collect(pair: &mut Pair, payloads: &[&[u8]]) -> Vec<Datagram> {
        let out = send(pair, payloads[0]);
        pair.exchange(out, true);
        let mut frames = Vec::new();
        for payload in &payloads[1..] {
            let out = send(pair, payload);
            frames.extend(out.datagrams);
        }
        frames
    }

    #[test]
    fn out_of_order_frames_are_buffered_and_released_in_bulk() {
        let mut pair = Pair::new();
        let frames = establish_and_collect(&mut pair, &[b"zero", b"one", b"two", b"three"]);
        assert_eq!(frames.len(), 3);

        // Deliver seq 3, 4 before seq 2.
        let late = &frames[0];
        let out1 = pair
            .b
            .on_datagram(&mut pair.b_storage, A, &frames[1].bytes)
            .expect("ooo 1");
        assert!(out1.deliveries.is_empty());
        let out2 = pair
            .b
            .on_datagram(&mut pair.b_storage, A, &frames[2].bytes)
            .expect("ooo 2");
        assert!(out2.deliveries.is_empty());

        let out3 = pair
            .b
            .on_datagram(&mut pair.b_storage, A, &late.bytes)
            .expect("gap close");
        let payloads: Vec<_> = out3.deliveries.iter().map(|d| d.payload.clone()).collect();
        assert_eq!(
            payloads,
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()],
            "gap close releases the whole buffered run"
        );
    }

    #[test]
    fn duplicates_are_dropped_but_reacknowledged() {
        let mut pair = Pair::new();
        let frames = establish_and_collect(&mut pair, &[b"zero", b"one"]);

        let first = pair
            .b
            .on_datagram(&mut pair.b_storage, A, &frames[0].bytes)
            .expect("first");
        assert_eq!(first.deliveries.len(), 1);

        let dup = pair
            .b
            .on_datagram(&mut pair.b_storage, A, &frames[0].bytes)
            .expect("dup");
        assert!(dup.deliveries.is_empty(), "no second delivery");
        assert_eq!(dup.datagrams.len(), 1, "duplicate still acknowledged");
        let ack = TransportFrame::decode(&dup.datagrams[0].bytes).expect("ack");
        assert_eq!(ack.tag, TransportTag::Ack);
    }

    #[test]
    fn ack_clears_the_in_flight_window() {
        let mut pair = Pair::new();
        let frames = establish_and_collect(&mut pair, &[b"zero", b"one", b"two"]);
        assert_eq!(pair.a.send[&B].in_flight.len(), 2);

        // Deliver both; the cumulative ack from the second clears both.
        let mut last_ack = None;
        for frame in &frames {
            let out = pair
                .b
                .on_datagram(&mut pair.b_storage, A, &frame.bytes)
                .expect("deliver");
            last_ack = out.datagrams.into_iter().next_back();
        }
        let ack = last_ack.expect("ack present");
        pair.a
            .on_datagram(&mut pair.a_storage, B, &ack.bytes)
            .expect("ack");
        assert!(pair.a.send[&B].in_flight.is_empty());
    }

    #[test]
    fn retry_exhaustion_forces_fresh_handshake_without_losing_payloads() {
        let mut pair = Pair::new();
        let frames = establish_and_collect(&mut pair, &[b"zero", b"lost"]);
        assert_eq!(frames.len(), 1);
        let seq = SeqNum::new(TransportFrame::decode(&frames[0].bytes).expect("frame").seq);

        // Fire the retransmit timer past the bound without ever acking.
        let timer = TransportTimer::Retransmit { peer: B, seq };
        for _ in 0..pair.a.config.max_retries {
            let out = pair.a.on_timer(timer);
            assert_eq!(out.datagrams.len(), 1, "retransmission");
        }
        let out = pair.a.on_timer(timer);
        let frame = TransportFrame::decode(&out.datagrams[0].bytes).expect("frame");
        assert_eq!(frame.tag, TransportTag::SessionEstablish, "gave up, re-handshaking");

        // Completing the handshake replays the undelivered payload once.
        let delivered = pair.exchange(out, true);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, b"lost");
    }

    #[test]
    fn receiver_that_lost_everything_expires_the_session() {
        let mut pair = Pair::new();
        let frames = establish_and_collect(&mut pair, &[b"zero", b"one"]);

        // B restarts with all state gone, durable table included.
        pair.b = Endpoint::new(B, TransportConfig::default());
        pair.b_storage = MemoryStorage::new();

        let out = pair
            .b
            .on_datagram(&mut pair.b_storage, A, &frames[0].bytes)
            .expect("expired");
        assert!(out.deliveries.is_empty());
        let frame = TransportFrame::decode(&out.datagrams[0].bytes).expect("frame");
        assert_eq!(frame.tag, TransportTag::SessionExpired);

        // A restarts the handshake; the undelivered payload arrives exactly
        // once. ("zero" was delivered before the crash and is gone with the
        // receiver's application state; the channel must not replay it.)
        let delivered = pair.exchange(out, false);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, b"one");
    }

    #[test]
    fn duplicated_handshake_settles_on_the_newer_session() {
        let mut pair = Pair::new();
        let out = send(&mut pair, b"payload");
        let establish = out.datagrams[0].bytes.clone();

        // The network duplicates the establish: B grants twice and only
        // the later session stays live.
        let first = pair
            .b
            .on_datagram(&mut pair.b_storage, A, &establish)
            .expect("establish");
        let second = pair
            .b
            .on_datagram(&mut pair.b_storage, A, &establish)
            .expect("duplicate establish");

        // A sees both grants in order and must end up on the later one,
        // not wedge its data under the superseded grant.
        let mut resend = EndpointOutput::empty();
        for ack in first.datagrams.iter().chain(&second.datagrams) {
            resend.merge(
                pair.a
                    .on_datagram(&mut pair.a_storage, B, &ack.bytes)
                    .expect("session ack"),
            );
        }

        let delivered = pair.exchange(resend, true);
        let payloads: Vec<_> = delivered.iter().map(|d| d.payload.clone()).collect();
        assert_eq!(payloads, vec![b"payload".to_vec()]);
    }

    #[test]
    fn restored_receiver_keeps_session_and_position() {
        let mut pair = Pair::new();
        let frames = establish_and_collect(&mut pair, &[b"zero", b"one"]);

        // B's process restarts, durable table intact.
        pair.b = Endpoint::restore(B, TransportConfig::default(), &pair.b_storage)
            .expect("restore");

        // The surviving session is still honored: no handshake, just delivery.
        let out = pair
            .b
            .on_datagram(&mut pair.b_storage, A, &frames[0].bytes)
            .expect("deliver");
        assert_eq!(out.deliveries.len(), 1);
        assert_eq!(out.deliveries[0].payload, b"one");
    }

    #[test]
    fn restored_receiver_rejects_already_delivered_frames() {
        let mut pair = Pair::new();
        let frames = establish_and_collect(&mut pair, &[b"zero", b"one"]);
        pair.b
            .on_datagram(&mut pair.b_storage, A, &frames[0].bytes)
            .expect("deliver");

        pair.b = Endpoint::restore(B, TransportConfig::default(), &pair.b_storage)
            .expect("restore");

        // The delivery position was persisted before the ack went out, so
        // the restarted receiver still treats the frame as a duplicate.
        let out = pair
            .b
            .on_datagram(&mut pair.b_storage, A, &frames[0].bytes)
            .expect("dup");
        assert!(out.deliveries.is_empty());
    }

    #[test]
    fn storage_failure_during_delivery_is_fatal() {
        let mut pair = Pair::new();
        let frames = establish_and_collect(&mut pair, &[b"zero", b"one"]);

        pair.b_storage.set_fail_writes(true);
        let err = pair
            .b
            .on_datagram(&mut pair.b_storage, A, &frames[0].bytes)
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Storage(StorageError::WriteFailed { .. })
        ));
    }

    #[test]
    fn malformed_datagram_is_ignored() {
        let mut pair = Pair::new();
        let out = pair
            .b
            .on_datagram(&mut pair.b_storage, A, &[0xFF, 0x01])
            .expect("malformed");
        assert!(out.is_empty());
    }

    #[test]
    fn stale_session_frames_are_dropped_silently() {
        let mut pair = Pair::new();
        let frames = establish_and_collect(&mut pair, &[b"zero", b"one"]);

        // Force a second session on the same channel.
        let out = pair
            .b
            .on_session_establish(&mut pair.b_storage, A)
            .expect("re-establish");
        pair.exchange(out, false);

        // A frame from the first session arrives late.
        let out = pair
            .b
            .on_datagram(&mut pair.b_storage, A, &frames[0].bytes)
            .expect("stale");
        assert!(out.is_empty(), "no expiry churn for stale sessions");
    }
}
