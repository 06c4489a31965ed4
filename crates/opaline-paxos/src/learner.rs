//! The learner: turns accept votes into a durable, gap-free chosen log.
//!
//! Accept evidence is tallied per (instance, value identity) with one vote
//! per acceptor; a later vote from the same acceptor replaces its earlier
//! one. Chosen values are appended durably before anything downstream sees
//! them, and application delivery is strictly contiguous ascending no
//! matter what order the network produced the evidence in.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use opaline_storage::records::{decode_records, encode_record};
use opaline_storage::Storage;
use opaline_types::{NodeId, ValueId};

use crate::error::FatalError;
use crate::types::Instance;

/// Chosen log, append-only and idempotent.
pub const CHOSEN_TABLE: &str = "paxos/chosen";

#[derive(Debug, Serialize, Deserialize)]
struct ChosenRecord {
    instance: Instance,
    value: Vec<u8>,
}

/// What one learner step produced.
#[derive(Debug, Default)]
pub struct LearnerOutput {
    /// Values that just became contiguously deliverable, ascending.
    pub delivered: Vec<(Instance, Vec<u8>)>,
    /// The instance this step decided, which may sit above a gap and not
    /// be deliverable yet. The proposer watches this to finish rounds.
    pub newly_chosen: Option<(Instance, Vec<u8>)>,
    /// Set when this learner itself observed the quorum; the node
    /// broadcasts Learn so non-observing peers converge.
    pub announce: Option<(Instance, Vec<u8>)>,
}

/// Aggregates accept evidence into the chosen log.
#[derive(Debug, Clone)]
pub struct Learner {
    quorum: usize,
    chosen: BTreeMap<Instance, Vec<u8>>,
    /// First instance with no chosen value.
    contiguous: Instance,
    /// Next instance to hand to the application.
    next_delivery: Instance,
    /// Vote tallies for undecided instances, evicted once decided.
    votes: BTreeMap<Instance, HashMap<NodeId, (ValueId, Vec<u8>)>>,
}

impl Learner {
    /// Creates a learner with an empty log.
    pub fn new(quorum: usize) -> Self {
        Self {
            quorum,
            chosen: BTreeMap::new(),
            contiguous: Instance::ZERO,
            next_delivery: Instance::ZERO,
            votes: BTreeMap::new(),
        }
    }

    /// Replays the chosen log.
    ///
    /// Values chosen before the restart are not re-delivered; the
    /// application rehydrates from [`Learner::chosen_value`] if it needs
    /// history, and delivery continues from the contiguous frontier.
    pub fn restore<S: Storage>(storage: &S, quorum: usize) -> Result<Self, FatalError> {
        let mut learner = Self::new(quorum);
        if let Some(bytes) = storage.read_all(CHOSEN_TABLE)? {
            let records: Vec<ChosenRecord> =
                decode_records(&bytes).map_err(|e| FatalError::CorruptState {
                    table: CHOSEN_TABLE.to_string(),
                    reason: e.to_string(),
                })?;
            for record in records {
                learner.chosen.insert(record.instance, record.value);
            }
        }
        while learner.chosen.contains_key(&learner.contiguous) {
            learner.contiguous = learner.contiguous.next();
        }
        learner.next_delivery = learner.contiguous;
        Ok(learner)
    }

    /// First instance with no chosen value.
    pub fn frontier(&self) -> Instance {
        self.contiguous
    }

    /// Highest instance with a chosen value, if any.
    pub fn highest_chosen(&self) -> Option<Instance> {
        self.chosen.keys().next_back().copied()
    }

    /// The chosen value for an instance, if decided.
    pub fn chosen_value(&self, instance: Instance) -> Option<&[u8]> {
        self.chosen.get(&instance).map(Vec::as_slice)
    }

    /// Instances up to and including `highest` that have no chosen value.
    pub fn gaps_up_to(&self, highest: Instance) -> Vec<Instance> {
        let mut gaps = Vec::new();
        let mut instance = self.contiguous;
        while instance <= highest {
            if !self.chosen.contains_key(&instance) {
                gaps.push(instance);
            }
            instance = instance.next();
        }
        gaps
    }

    /// Tallies one acceptor's accept vote.
    pub fn on_accept<S: Storage>(
        &mut self,
        storage: &mut S,
        from: NodeId,
        instance: Instance,
        value: Vec<u8>,
    ) -> Result<LearnerOutput, FatalError> {
        if self.chosen.contains_key(&instance) {
            return Ok(LearnerOutput::default());
        }

        let tally = self.votes.entry(instance).or_default();
        let id = ValueId::of(&value);
        tally.insert(from, (id, value.clone()));

        let support = tally.values().filter(|(vid, _)| *vid == id).count();
        if support < self.quorum {
            return Ok(LearnerOutput::default());
        }

        debug!(%instance, value = %id, support, "quorum observed");
        let mut output = self.record_chosen(storage, instance, value.clone())?;
        output.announce = Some((instance, value));
        Ok(output)
    }

    /// Records an externally learned chosen value (Learn broadcast or
    /// recovery verdict). Idempotent.
    pub fn on_learned<S: Storage>(
        &mut self,
        storage: &mut S,
        instance: Instance,
        value: Vec<u8>,
    ) -> Result<LearnerOutput, FatalError> {
        if self.chosen.contains_key(&instance) {
            return Ok(LearnerOutput::default());
        }
        self.record_chosen(storage, instance, value)
    }

    fn record_chosen<S: Storage>(
        &mut self,
        storage: &mut S,
        instance: Instance,
        value: Vec<u8>,
    ) -> Result<LearnerOutput, FatalError> {
        let record = ChosenRecord {
            instance,
            value: value.clone(),
        };
        let bytes = encode_record(&record).map_err(|e| FatalError::CorruptState {
            table: CHOSEN_TABLE.to_string(),
            reason: e.to_string(),
        })?;
        storage.append(CHOSEN_TABLE, &bytes)?;

        self.chosen.insert(instance, value.clone());
        self.votes.remove(&instance);
        while self.chosen.contains_key(&self.contiguous) {
            self.contiguous = self.contiguous.next();
        }

        let mut output = LearnerOutput {
            newly_chosen: Some((instance, value)),
            ..LearnerOutput::default()
        };
        while let Some(value) = self.chosen.get(&self.next_delivery) {
            output.delivered.push((self.next_delivery, value.clone()));
            self.next_delivery = self.next_delivery.next();
        }
        Ok(output)
    }
}
