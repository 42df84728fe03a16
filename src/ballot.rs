// Ballot semantics: the generator/verifier/acceptor trio plugged into the
// protocol engine. This is where generic ballots learn what a cast is.

use crate::cast::{verify_cast, Cast};
use crate::engine::{BallotHooks, SlotView};
use crate::store::SharedCastStore;
use crate::types::{Channel, PublicKey};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An engine ballot: retry counter `n` and opaque value `x` (a serialized
/// cast, as far as this crate is concerned).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub n: u64,
    pub x: String,
}

/// Application hook over payloads. `verify` participates in global ballot
/// validity and must be deterministic across correct nodes; `accept` is a
/// local pledge and may consult anything.
pub trait PayloadPolicy: Send + Sync {
    fn verify(&self, _sender: &PublicKey, _channel: &Channel, _pay: &str) -> bool {
        true
    }

    fn accept(&self, _sender: &PublicKey, _channel: &Channel, _pay: &str) -> bool {
        true
    }
}

/// Policy that admits every payload.
pub struct OpenPolicy;

impl PayloadPolicy for OpenPolicy {}

/// The cast-aware ballot callbacks. Holds a read handle on the cast store
/// (for chain-continuity pledges) and the payload policy.
pub struct CastBallots {
    store: SharedCastStore,
    policy: Arc<dyn PayloadPolicy>,
    retry_interval_ms: u64,
}

impl CastBallots {
    pub fn new(
        store: SharedCastStore,
        policy: Arc<dyn PayloadPolicy>,
        retry_interval_ms: u64,
    ) -> Self {
        Self {
            store,
            policy,
            retry_interval_ms,
        }
    }

    fn parse(&self, slot: &SlotView<'_>, ballot: &Ballot) -> Option<Cast> {
        let cast = Cast::from_json(&ballot.x);
        if cast.is_none() {
            debug!("slot {}: ballot value is not a cast", slot.id);
        }
        cast
    }
}

impl BallotHooks for CastBallots {
    fn generate(&self, slot: &SlotView<'_>, x: String) -> Ballot {
        match slot.ballot {
            Some(cur) => Ballot {
                n: cur.n.saturating_add(1),
                x,
            },
            None => Ballot { n: 0, x },
        }
    }

    fn verify(&self, slot: &SlotView<'_>, ballot: &Ballot, _node: &PublicKey) -> bool {
        let Some(cast) = self.parse(slot, ballot) else {
            return false;
        };
        if !verify_cast(&slot.id.sender, &slot.id.channel, &cast) {
            debug!("slot {}: cast failed signature/hash check", slot.id);
            return false;
        }
        if !self
            .policy
            .verify(&slot.id.sender, &slot.id.channel, &cast.pay)
        {
            return false;
        }
        // Rate gate: ballot n may not appear before n retry intervals have
        // elapsed on this slot.
        let gap = Duration::from_millis(self.retry_interval_ms.saturating_mul(ballot.n));
        match slot.created.checked_add(gap) {
            Some(due) => Instant::now() >= due,
            None => false,
        }
    }

    fn accept(&self, slot: &SlotView<'_>, ballot: &Ballot, _node: &PublicKey) -> bool {
        let Some(cast) = self.parse(slot, ballot) else {
            return false;
        };
        if !cast.prv.is_empty() {
            // A chained cast needs local context: the store's head for this
            // pair must be exactly the claimed predecessor. No entry means
            // no pledge; externalization can still adopt the value later.
            let Ok(store) = self.store.read() else {
                return false;
            };
            match store.latest(&slot.id.channel, &slot.id.sender) {
                Some(cur) if cur.sha == cast.prv => {}
                _ => return false,
            }
        }
        self.policy
            .accept(&slot.id.sender, &slot.id.channel, &cast.pay)
    }
}
