//! The acceptor: durable per-instance promise and accept bookkeeping.
//!
//! Safety lives here. An acceptor never promises a proposal number at or
//! below its stored promise, and once it has accepted a value for an
//! instance it only ever re-accepts that identical value. Both tables are
//! written before the reply that depends on them is returned, so a crash
//! between persist and reply reads as "no reply sent".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use opaline_storage::records::{decode_records, encode_record};
use opaline_storage::Storage;
use opaline_types::ValueId;

use crate::error::FatalError;
use crate::message::{AcceptedValue, ConsensusMessage};
use crate::types::{Instance, ProposalNumber, RoundVersion};

/// Promise table, full-rewrite snapshot.
pub const PROMISE_TABLE: &str = "paxos/promises";
/// Accepted log, append-only; the last record per instance wins on replay.
pub const ACCEPTED_TABLE: &str = "paxos/accepted";

#[derive(Debug, Default, Serialize, Deserialize)]
struct PromiseSnapshot {
    entries: Vec<(Instance, ProposalNumber)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AcceptedRecord {
    instance: Instance,
    proposal: ProposalNumber,
    value: Vec<u8>,
}

/// Per-instance promise/accept state machine.
#[derive(Debug, Clone, Default)]
pub struct Acceptor {
    promises: BTreeMap<Instance, ProposalNumber>,
    accepted: BTreeMap<Instance, AcceptedValue>,
}

impl Acceptor {
    /// Creates an acceptor with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replays both durable tables.
    ///
    /// Produces an acceptor whose promise/accept behavior is identical to
    /// the one that wrote them.
    pub fn restore<S: Storage>(storage: &S) -> Result<Self, FatalError> {
        let mut acceptor = Self::new();

        if let Some(bytes) = storage.read_all(PROMISE_TABLE)? {
            let snapshot: PromiseSnapshot = decode_records(&bytes)
                .map_err(|e| corrupt(PROMISE_TABLE, &e))?
                .into_iter()
                .next()
                .unwrap_or_default();
            acceptor.promises = snapshot.entries.into_iter().collect();
        }

        if let Some(bytes) = storage.read_all(ACCEPTED_TABLE)? {
            let records: Vec<AcceptedRecord> =
                decode_records(&bytes).map_err(|e| corrupt(ACCEPTED_TABLE, &e))?;
            for record in records {
                acceptor.accepted.insert(
                    record.instance,
                    AcceptedValue {
                        proposal: record.proposal,
                        value: record.value,
                    },
                );
            }
        }

        Ok(acceptor)
    }

    /// Highest instance this acceptor has accepted a value for.
    pub fn highest_accepted(&self) -> Option<Instance> {
        self.accepted.keys().next_back().copied()
    }

    /// Handles a prepare request; replies Promise or Reject.
    pub fn on_prepare<S: Storage>(
        &mut self,
        storage: &mut S,
        instance: Instance,
        proposal: ProposalNumber,
        round: RoundVersion,
    ) -> Result<ConsensusMessage, FatalError> {
        let promised = self.current_promise(instance);
        if proposal <= promised {
            debug!(%instance, %proposal, %promised, "rejecting prepare");
            return Ok(ConsensusMessage::Reject {
                instance,
                promised,
                round,
                accepted: self.accepted.get(&instance).cloned(),
            });
        }

        let snapshot = PromiseSnapshot {
            entries: self
                .promises
                .iter()
                .map(|(i, p)| (*i, *p))
                .filter(|(i, _)| *i != instance)
                .chain(std::iter::once((instance, proposal)))
                .collect(),
        };
        let bytes = encode_record(&snapshot).map_err(|e| corrupt(PROMISE_TABLE, &e))?;
        storage.write_all(PROMISE_TABLE, &bytes)?;
        self.promises.insert(instance, proposal);
        debug!(%instance, %proposal, "promised");
        Ok(ConsensusMessage::Promise {
            instance,
            proposal,
            round,
            accepted: self.accepted.get(&instance).cloned(),
        })
    }

    /// Handles a propose request; replies with an Accept vote or Reject.
    ///
    /// A value is accepted if nothing was accepted yet and the proposal
    /// clears the stored promise, or if the identical value (by content
    /// identity) is re-proposed under any proposal number.
    pub fn on_propose<S: Storage>(
        &mut self,
        storage: &mut S,
        instance: Instance,
        proposal: ProposalNumber,
        round: RoundVersion,
        value: Vec<u8>,
    ) -> Result<ConsensusMessage, FatalError> {
        let promised = self.current_promise(instance);
        let acceptable = match self.accepted.get(&instance) {
            None => proposal >= promised,
            Some(existing) => ValueId::of(&existing.value) == ValueId::of(&value),
        };
        if !acceptable {
            debug!(%instance, %proposal, %promised, "rejecting propose");
            return Ok(ConsensusMessage::Reject {
                instance,
                promised,
                round,
                accepted: self.accepted.get(&instance).cloned(),
            });
        }

        storage.append(
            ACCEPTED_TABLE,
            &encode_record(&AcceptedRecord {
                instance,
                proposal,
                value: value.clone(),
            })
            .map_err(|e| corrupt(ACCEPTED_TABLE, &e))?,
        )?;
        self.accepted.insert(
            instance,
            AcceptedValue {
                proposal,
                value: value.clone(),
            },
        );
        debug!(%instance, %proposal, value = %ValueId::of(&value), "accepted");
        Ok(ConsensusMessage::Accept {
            instance,
            proposal,
            round,
            value,
        })
    }

    /// Handles a recovery query.
    ///
    /// The learner's verdict is authoritative, so the caller passes in its
    /// chosen value for the instance, if any.
    pub fn on_recovery(
        &self,
        instance: Instance,
        round: RoundVersion,
        chosen: Option<&[u8]>,
    ) -> ConsensusMessage {
        if let Some(value) = chosen {
            return ConsensusMessage::RecoveryChosen {
                instance,
                value: value.to_vec(),
            };
        }
        match self.accepted.get(&instance) {
            Some(existing) => ConsensusMessage::RecoveryAccepted {
                instance,
                proposal: existing.proposal,
                round,
                value: existing.value.clone(),
            },
            None => ConsensusMessage::RecoveryReject { instance, round },
        }
    }

    fn current_promise(&self, instance: Instance) -> ProposalNumber {
        self.promises
            .get(&instance)
            .copied()
            .unwrap_or(ProposalNumber::NONE)
    }

}

fn corrupt(table: &str, reason: &dyn std::fmt::Display) -> FatalError {
    FatalError::CorruptState {
        table: table.to_string(),
        reason: reason.to_string(),
    }
}
