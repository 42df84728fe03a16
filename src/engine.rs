// Contract for the FBA protocol engine. The engine itself (ballot rounds,
// federated voting, quorum-slice evaluation) lives outside this crate; the
// node only assumes the surface defined here. Engine calls run on the node
// thread and report through an out-queue the node drains after each call,
// which keeps subscriber dispatch off the engine's callstack.

use crate::ballot::Ballot;
use crate::types::{PublicKey, SlotId};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use thiserror::Error;

/// What the engine exposes about a slot when invoking the ballot hooks.
pub struct SlotView<'a> {
    pub id: &'a SlotId,
    /// When this engine first saw the slot; the verifier's rate gate is
    /// measured from here.
    pub created: Instant,
    /// The slot's current ballot, if any round has started.
    pub ballot: Option<&'a Ballot>,
}

/// The three callbacks that give the engine's opaque ballots cast
/// semantics. Validity (`verify`) must be judged identically by every
/// correct node; acceptance (`accept`) may consult local state.
pub trait BallotHooks {
    fn generate(&self, slot: &SlotView<'_>, x: String) -> Ballot;
    fn verify(&self, slot: &SlotView<'_>, ballot: &Ballot, node: &PublicKey) -> bool;
    fn accept(&self, slot: &SlotView<'_>, ballot: &Ballot, node: &PublicKey) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// Events the engine pushes to the node.
#[derive(Debug)]
pub enum EngineEvent {
    /// Protocol frame to fan out to every connected peer and client.
    Message(serde_json::Value),
    /// Terminal agreed value for a slot.
    Externalized { slot: SlotId, value: String },
    /// Resolution of a locally issued `request` (at most one per slot).
    Resolved {
        slot: SlotId,
        result: Result<String, EngineError>,
    },
}

pub trait ProtocolEngine: Send {
    /// Feed one inbound protocol frame.
    fn process(
        &mut self,
        frame: serde_json::Value,
        hooks: &dyn BallotHooks,
        out: &mut Vec<EngineEvent>,
    );

    /// Propose `value` for `slot`; resolution arrives as
    /// `EngineEvent::Resolved` within `timeout`.
    fn request(
        &mut self,
        slot: SlotId,
        value: String,
        timeout: Duration,
        hooks: &dyn BallotHooks,
        out: &mut Vec<EngineEvent>,
    );

    /// Release consensus state for a terminal slot.
    fn reclaim(&mut self, slot: &SlotId);

    /// The engine's node set and quorum slices.
    fn quorums(&mut self) -> &mut Quorums;

    /// Drive timers: ballot retries and request deadlines.
    fn tick(&mut self, hooks: &dyn BallotHooks, out: &mut Vec<EngineEvent>);
}

/// The engine's view of the network: the known node set plus explicit
/// quorum slices. With no explicit slices the whole node set is the single
/// quorum.
#[derive(Default, Clone, Debug)]
pub struct Quorums {
    nodes: Vec<PublicKey>,
    quorums: Vec<Vec<PublicKey>>,
}

impl Quorums {
    pub fn new() -> Self {
        Quorums::default()
    }

    pub fn add_node(&mut self, pk: PublicKey) {
        if !self.nodes.contains(&pk) {
            self.nodes.push(pk);
        }
    }

    pub fn remove_node(&mut self, pk: &PublicKey) {
        self.nodes.retain(|n| n != pk);
    }

    pub fn nodes(&self) -> &[PublicKey] {
        &self.nodes
    }

    pub fn add_quorum(&mut self, quorum: Vec<PublicKey>) {
        self.quorums.push(quorum);
    }

    pub fn remove_quorum(&mut self, quorum: &[PublicKey]) {
        self.quorums.retain(|q| q != quorum);
    }

    pub fn for_each(&self, mut f: impl FnMut(&[PublicKey])) {
        for q in &self.quorums {
            f(q);
        }
    }

    /// True when some quorum's members all appear in `votes`.
    pub fn is_satisfied(&self, votes: &HashSet<PublicKey>) -> bool {
        if self.quorums.is_empty() {
            return !self.nodes.is_empty() && self.nodes.iter().all(|n| votes.contains(n));
        }
        self.quorums
            .iter()
            .any(|q| !q.is_empty() && q.iter().all(|n| votes.contains(n)))
    }
}
