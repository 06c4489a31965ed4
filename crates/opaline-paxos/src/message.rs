//! Consensus protocol messages and their wire mapping.
//!
//! Each message rides inside a transport `Data` payload as a consensus
//! frame. Header fields the message does not use carry zero. Messages with
//! structured payloads beyond the opaque value bytes (promise and reject
//! carry the acceptor's previously accepted state) postcard-encode that
//! structure into the value field.

use serde::{Deserialize, Serialize};

use opaline_types::NodeId;
use opaline_wire::{ConsensusFrame, ConsensusTag, WireError};

use crate::types::{Instance, ProposalNumber, RoundVersion};

/// Failure to map between a message and its frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame itself was malformed.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The structured payload inside the frame was malformed.
    #[error("malformed message payload: {0}")]
    Payload(postcard::Error),
}

/// A previously accepted (proposal, value) pair reported by an acceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedValue {
    pub proposal: ProposalNumber,
    pub value: Vec<u8>,
}

/// Every message the consensus layer exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusMessage {
    /// Proposer asks acceptors to promise `proposal` for `instance`.
    Prepare {
        instance: Instance,
        proposal: ProposalNumber,
        round: RoundVersion,
    },
    /// Acceptor promises, reporting anything it accepted earlier.
    Promise {
        instance: Instance,
        proposal: ProposalNumber,
        round: RoundVersion,
        accepted: Option<AcceptedValue>,
    },
    /// Proposer asks acceptors to accept a value.
    Propose {
        instance: Instance,
        proposal: ProposalNumber,
        round: RoundVersion,
        value: Vec<u8>,
    },
    /// Acceptor's accept vote, broadcast to every learner.
    Accept {
        instance: Instance,
        proposal: ProposalNumber,
        round: RoundVersion,
        value: Vec<u8>,
    },
    /// Acceptor refuses a prepare or propose, reporting its promise and
    /// anything it already accepted so the proposer can adopt it.
    Reject {
        instance: Instance,
        promised: ProposalNumber,
        round: RoundVersion,
        accepted: Option<AcceptedValue>,
    },
    /// A learner that observed a quorum announces the chosen value.
    Learn { instance: Instance, value: Vec<u8> },
    /// Recovering proposer asks what an acceptor knows about `instance`.
    Recovery {
        instance: Instance,
        round: RoundVersion,
    },
    /// Recovery reply: locally accepted but not known chosen.
    RecoveryAccepted {
        instance: Instance,
        proposal: ProposalNumber,
        round: RoundVersion,
        value: Vec<u8>,
    },
    /// Recovery reply: the value is already chosen (authoritative).
    RecoveryChosen { instance: Instance, value: Vec<u8> },
    /// Recovery reply: nothing known for the instance.
    RecoveryReject {
        instance: Instance,
        round: RoundVersion,
    },
    /// Election request.
    Elect { round: RoundVersion },
    /// Election reply: the sender nominates itself with the highest
    /// instance it knows to be chosen.
    ElectReply {
        round: RoundVersion,
        highest: Instance,
    },
}

impl ConsensusMessage {
    /// Encodes the message as consensus-frame bytes ready to ride in a
    /// transport payload.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let frame = match self {
            Self::Prepare {
                instance,
                proposal,
                round,
            } => frame(ConsensusTag::Prepare, *proposal, *instance, *round, Vec::new()),
            Self::Promise {
                instance,
                proposal,
                round,
                accepted,
            } => frame(
                ConsensusTag::Promise,
                *proposal,
                *instance,
                *round,
                encode_accepted(accepted)?,
            ),
            Self::Propose {
                instance,
                proposal,
                round,
                value,
            } => frame(ConsensusTag::Propose, *proposal, *instance, *round, value.clone()),
            Self::Accept {
                instance,
                proposal,
                round,
                value,
            } => frame(ConsensusTag::Accept, *proposal, *instance, *round, value.clone()),
            Self::Reject {
                instance,
                promised,
                round,
                accepted,
            } => frame(
                ConsensusTag::Reject,
                *promised,
                *instance,
                *round,
                encode_accepted(accepted)?,
            ),
            Self::Learn { instance, value } => frame(
                ConsensusTag::Learn,
                ProposalNumber::NONE,
                *instance,
                RoundVersion::default(),
                value.clone(),
            ),
            Self::Recovery { instance, round } => frame(
                ConsensusTag::Recovery,
                ProposalNumber::NONE,
                *instance,
                *round,
                Vec::new(),
            ),
            Self::RecoveryAccepted {
                instance,
                proposal,
                round,
                value,
            } => frame(
                ConsensusTag::RecoveryAccepted,
                *proposal,
                *instance,
                *round,
                value.clone(),
            ),
            Self::RecoveryChosen { instance, value } => frame(
                ConsensusTag::RecoveryChosen,
                ProposalNumber::NONE,
                *instance,
                RoundVersion::default(),
                value.clone(),
            ),
            Self::RecoveryReject { instance, round } => frame(
                ConsensusTag::RecoveryReject,
                ProposalNumber::NONE,
                *instance,
                *round,
                Vec::new(),
            ),
            Self::Elect { round } => frame(
                ConsensusTag::Elect,
                ProposalNumber::NONE,
                Instance::ZERO,
                *round,
                Vec::new(),
            ),
            Self::ElectReply { round, highest } => frame(
                ConsensusTag::ElectReply,
                ProposalNumber::NONE,
                *highest,
                *round,
                Vec::new(),
            ),
        };
        Ok(frame.encode())
    }

    /// Decodes consensus-frame bytes back into a message.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let frame = ConsensusFrame::decode(bytes)?;
        let instance = Instance::new(frame.instance);
        let proposal = ProposalNumber::from_u32(frame.proposal);
        let round = RoundVersion::from_u32(frame.round);
        Ok(match frame.tag {
            ConsensusTag::Prepare => Self::Prepare {
                instance,
                proposal,
                round,
            },
            ConsensusTag::Promise => Self::Promise {
                instance,
                proposal,
                round,
                accepted: decode_accepted(&frame.value)?,
            },
            ConsensusTag::Propose => Self::Propose {
                instance,
                proposal,
                round,
                value: frame.value,
            },
            ConsensusTag::Accept => Self::Accept {
                instance,
                proposal,
                round,
                value: frame.value,
            },
            ConsensusTag::Reject => Self::Reject {
                instance,
                promised: proposal,
                round,
                accepted: decode_accepted(&frame.value)?,
            },
            ConsensusTag::Learn => Self::Learn {
                instance,
                value: frame.value,
            },
            ConsensusTag::Recovery => Self::Recovery { instance, round },
            ConsensusTag::RecoveryAccepted => Self::RecoveryAccepted {
                instance,
                proposal,
                round,
                value: frame.value,
            },
            ConsensusTag::RecoveryChosen => Self::RecoveryChosen {
                instance,
                value: frame.value,
            },
            ConsensusTag::RecoveryReject => Self::RecoveryReject { instance, round },
            ConsensusTag::Elect => Self::Elect { round },
            ConsensusTag::ElectReply => Self::ElectReply {
                round,
                highest: instance,
            },
        })
    }
}

/// Where a handler wants a message to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// To a single member (which may be the local node).
    To(NodeId, ConsensusMessage),
    /// To every cluster member, the local node included.
    Broadcast(ConsensusMessage),
}

fn frame(
    tag: ConsensusTag,
    proposal: ProposalNumber,
    instance: Instance,
    round: RoundVersion,
    value: Vec<u8>,
) -> ConsensusFrame {
    ConsensusFrame {
        tag,
        proposal: proposal.as_u32(),
        instance: instance.as_u32(),
        round: round.as_u32(),
        value,
    }
}

fn encode_accepted(accepted: &Option<AcceptedValue>) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(accepted).map_err(CodecError::Payload)
}

fn decode_accepted(bytes: &[u8]) -> Result<Option<AcceptedValue>, CodecError> {
    postcard::from_bytes(bytes).map_err(CodecError::Payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn promise_carries_previously_accepted_state() {
        let message = ConsensusMessage::Promise {
            instance: Instance::new(7),
            proposal: ProposalNumber::initial(NodeId::new(2)),
            round: RoundVersion::from_u32(3),
            accepted: Some(AcceptedValue {
                proposal: ProposalNumber::initial(NodeId::new(1)),
                value: b"TXN42".to_vec(),
            }),
        };
        let bytes = message.encode().expect("encode");
        assert_eq!(ConsensusMessage::decode(&bytes).expect("decode"), message);
    }

    #[test]
    fn reject_without_accepted_value_is_compact() {
        let message = ConsensusMessage::Reject {
            instance: Instance::new(1),
            promised: ProposalNumber::initial(NodeId::new(4)),
            round: RoundVersion::from_u32(1),
            accepted: None,
        };
        let bytes = message.encode().expect("encode");
        assert_eq!(ConsensusMessage::decode(&bytes).expect("decode"), message);
    }

    #[test]
    fn elect_reply_places_highest_instance_in_the_instance_field() {
        let message = ConsensusMessage::ElectReply {
            round: RoundVersion::from_u32(9),
            highest: Instance::new(41),
        };
        let bytes = message.encode().expect("encode");
        let frame = ConsensusFrame::decode(&bytes).expect("frame");
        assert_eq!(frame.instance, 41);
        assert_eq!(ConsensusMessage::decode(&bytes).expect("decode"), message);
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(bytes: Vec<u8>) {
            let _ = ConsensusMessage::decode(&bytes);
        }
    }
}
