//! Byte-exact wire framing for Opaline.
//!
//! Two flat headers, one per protocol layer, composed by nesting the inner
//! frame in the outer frame's payload. All integers are big-endian and
//! fixed-width:
//!
//! ```text
//! Transport envelope:  tag:1B | seq:4B | session:4B | payload...
//! Consensus envelope:  tag:1B | proposal:4B | instance:4B | round:4B | value...
//! ```
//!
//! The consensus envelope rides inside the payload of a transport `Data`
//! frame. Decoding is total: any malformed input yields a [`WireError`],
//! never a panic, because the network is allowed to hand us garbage.

/// Largest datagram the (simulated) network will carry.
pub const MAX_DATAGRAM: usize = 1024;

/// Size of the transport envelope header.
pub const TRANSPORT_HEADER: usize = 9;

/// Size of the consensus envelope header.
pub const CONSENSUS_HEADER: usize = 13;

/// Largest payload a single transport frame can carry.
///
/// Larger payloads are rejected at send time; the transport never fragments.
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - TRANSPORT_HEADER;

/// Error raised while parsing a frame.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    /// The buffer is shorter than the fixed header.
    #[error("frame truncated: {have} bytes, need at least {need}")]
    Truncated {
        /// Bytes required for the header.
        need: usize,
        /// Bytes actually present.
        have: usize,
    },

    /// The transport tag byte is not a known protocol tag.
    #[error("unknown transport tag {0}")]
    UnknownTransportTag(u8),

    /// The consensus tag byte is not a known protocol tag.
    #[error("unknown consensus tag {0}")]
    UnknownConsensusTag(u8),
}

// ============================================================================
// Transport Envelope
// ============================================================================

/// Transport-level protocol tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransportTag {
    /// Application payload carried under a session.
    Data = 1,
    /// Cumulative acknowledgement of delivered sequence numbers.
    Ack = 2,
    /// Request to open a fresh session.
    SessionEstablish = 3,
    /// Grants a session and reports the last delivered sequence number.
    SessionAck = 4,
    /// The announced session is unknown here; carries a replacement.
    SessionExpired = 5,
}

impl TransportTag {
    fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            1 => Ok(Self::Data),
            2 => Ok(Self::Ack),
            3 => Ok(Self::SessionEstablish),
            4 => Ok(Self::SessionAck),
            5 => Ok(Self::SessionExpired),
            other => Err(WireError::UnknownTransportTag(other)),
        }
    }
}

/// A decoded transport envelope.
///
/// Field meaning varies slightly by tag: for `Data` the `seq`/`session`
/// identify the message; for `Ack` the `seq` is the receiver's cumulative
/// last-delivered number; for `SessionAck`/`SessionExpired` the `session`
/// is the (newly) granted session and `seq` the last-delivered number under
/// the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFrame {
    /// Protocol tag.
    pub tag: TransportTag,
    /// Sequence number field.
    pub seq: u32,
    /// Session identifier field.
    pub session: u32,
    /// Nested payload (a consensus envelope for `Data` frames).
    pub payload: Vec<u8>,
}

impl TransportFrame {
    /// Encodes the frame into raw datagram bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TRANSPORT_HEADER + self.payload.len());
        out.push(self.tag as u8);
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.session.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decodes one frame from raw datagram bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < TRANSPORT_HEADER {
            return Err(WireError::Truncated {
                need: TRANSPORT_HEADER,
                have: bytes.len(),
            });
        }
        let tag = TransportTag::from_byte(bytes[0])?;
        let seq = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let session = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        Ok(Self {
            tag,
            seq,
            session,
            payload: bytes[TRANSPORT_HEADER..].to_vec(),
        })
    }
}

// ============================================================================
// Consensus Envelope
// ============================================================================

/// Consensus-level protocol tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConsensusTag {
    /// Proposer → Acceptor: phase 1 request.
    Prepare = 1,
    /// Acceptor → Proposer: phase 1 grant, carrying any prior accepted pair.
    Promise = 2,
    /// Proposer → Acceptor: phase 2 request.
    Propose = 3,
    /// Acceptor → Proposer/Learner: phase 2 vote.
    Accept = 4,
    /// Learner → Learner: a value is chosen for an instance.
    Learn = 5,
    /// Acceptor → Proposer: prepare or propose refused.
    Reject = 6,
    /// Proposer → Acceptor: what do you know about this instance?
    Recovery = 7,
    /// Acceptor → Proposer: locally accepted pair for the instance.
    RecoveryAccepted = 8,
    /// Acceptor → Proposer: the instance already has a chosen value.
    RecoveryChosen = 9,
    /// Acceptor → Proposer: nothing known about the instance.
    RecoveryReject = 10,
    /// Candidate → All: leader election request.
    Elect = 11,
    /// Voter → Candidate: election vote with the voter's highest instance.
    ElectReply = 12,
}

impl ConsensusTag {
    fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            1 => Ok(Self::Prepare),
            2 => Ok(Self::Promise),
            3 => Ok(Self::Propose),
            4 => Ok(Self::Accept),
            5 => Ok(Self::Learn),
            6 => Ok(Self::Reject),
            7 => Ok(Self::Recovery),
            8 => Ok(Self::RecoveryAccepted),
            9 => Ok(Self::RecoveryChosen),
            10 => Ok(Self::RecoveryReject),
            11 => Ok(Self::Elect),
            12 => Ok(Self::ElectReply),
            other => Err(WireError::UnknownConsensusTag(other)),
        }
    }
}

/// A decoded consensus envelope.
///
/// The `proposal` field carries the message's proposal number where one
/// applies; replies reporting a previously accepted pair place the accepted
/// proposal number there, with zero meaning "none".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusFrame {
    /// Protocol tag.
    pub tag: ConsensusTag,
    /// Proposal number field (zero = none).
    pub proposal: u32,
    /// Instance number field.
    pub instance: u32,
    /// Sender's round/version counter, echoed in replies.
    pub round: u32,
    /// Opaque value bytes.
    pub value: Vec<u8>,
}

impl ConsensusFrame {
    /// Encodes the frame into a transport payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CONSENSUS_HEADER + self.value.len());
        out.push(self.tag as u8);
        out.extend_from_slice(&self.proposal.to_be_bytes());
        out.extend_from_slice(&self.instance.to_be_bytes());
        out.extend_from_slice(&self.round.to_be_bytes());
        out.extend_from_slice(&self.value);
        out
    }

    /// Decodes one frame from a transport payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < CONSENSUS_HEADER {
            return Err(WireError::Truncated {
                need: CONSENSUS_HEADER,
                have: bytes.len(),
            });
        }
        let tag = ConsensusTag::from_byte(bytes[0])?;
        let proposal = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let instance = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        let round = u32::from_be_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);
        Ok(Self {
            tag,
            proposal,
            instance,
            round,
            value: bytes[CONSENSUS_HEADER..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn transport_frame_layout_is_big_endian() {
        let frame = TransportFrame {
            tag: TransportTag::Data,
            seq: 0x0102_0304,
            session: 0x0A0B_0C0D,
            payload: vec![0xFF, 0xEE],
        };
        let bytes = frame.encode();

        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[5..9], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&bytes[9..], &[0xFF, 0xEE]);

        assert_eq!(TransportFrame::decode(&bytes).expect("decode"), frame);
    }

    #[test]
    fn consensus_frame_nests_in_data_payload() {
        let inner = ConsensusFrame {
            tag: ConsensusTag::Propose,
            proposal: 0x0100 | 2,
            instance: 7,
            round: 3,
            value: b"TXN42".to_vec(),
        };
        let outer = TransportFrame {
            tag: TransportTag::Data,
            seq: 12,
            session: 4,
            payload: inner.encode(),
        };

        let decoded_outer = TransportFrame::decode(&outer.encode()).expect("outer");
        let decoded_inner = ConsensusFrame::decode(&decoded_outer.payload).expect("inner");
        assert_eq!(decoded_inner, inner);
        assert_eq!(decoded_inner.value, b"TXN42");
    }

    #[test]
    fn truncated_header_is_rejected() {
        let err = TransportFrame::decode(&[1, 0, 0]).unwrap_err();
        assert_eq!(err, WireError::Truncated { need: 9, have: 3 });

        let err = ConsensusFrame::decode(&[1; 12]).unwrap_err();
        assert_eq!(err, WireError::Truncated { need: 13, have: 12 });
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let mut bytes = TransportFrame {
            tag: TransportTag::Ack,
            seq: 0,
            session: 0,
            payload: vec![],
        }
        .encode();
        bytes[0] = 200;
        assert_eq!(
            TransportFrame::decode(&bytes).unwrap_err(),
            WireError::UnknownTransportTag(200)
        );

        let mut bytes = ConsensusFrame {
            tag: ConsensusTag::Learn,
            proposal: 0,
            instance: 0,
            round: 0,
            value: vec![],
        }
        .encode();
        bytes[0] = 0;
        assert_eq!(
            ConsensusFrame::decode(&bytes).unwrap_err(),
            WireError::UnknownConsensusTag(0)
        );
    }

    #[test]
    fn empty_value_roundtrips() {
        let frame = ConsensusFrame {
            tag: ConsensusTag::Recovery,
            proposal: 0,
            instance: 9,
            round: 1,
            value: vec![],
        };
        let decoded = ConsensusFrame::decode(&frame.encode()).expect("decode");
        assert!(decoded.value.is_empty());
    }

    proptest! {
        /// Random bytes must decode to an error or a frame, never panic.
        #[test]
        fn prop_decode_never_panics(bytes: Vec<u8>) {
            let _ = TransportFrame::decode(&bytes);
            let _ = ConsensusFrame::decode(&bytes);
        }
    }
}
