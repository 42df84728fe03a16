// Shared harness for the cluster tests: seeded identities, ephemeral
// ports, and a minimal protocol engine (unanimous federated voting over
// the configured node set) that honors the ballot-hooks contract.

#![allow(dead_code)]

use castnet::ballot::{Ballot, OpenPolicy};
use castnet::config::NodeConfig;
use castnet::crypto::Identity;
use castnet::engine::{BallotHooks, EngineError, EngineEvent, ProtocolEngine, Quorums, SlotView};
use castnet::node::{Node, NodeEvent, NodeHandle};
use castnet::types::{PublicKey, SlotId};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn pick_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind ephem")
        .local_addr()
        .expect("local addr")
        .port()
}

struct SlotState {
    created: Instant,
    ballot: Option<Ballot>,
    votes: HashSet<PublicKey>,
    voted: bool,
    externalized: bool,
    deadline: Option<Instant>,
}

impl SlotState {
    fn new() -> Self {
        Self {
            created: Instant::now(),
            ballot: None,
            votes: HashSet::new(),
            voted: false,
            externalized: false,
            deadline: None,
        }
    }
}

/// Flooding engine: every node broadcasts its proposal and its vote; a slot
/// externalizes once a quorum (by default the whole node set) has voted for
/// it. Enough machinery to drive the node core end to end.
pub struct FloodEngine {
    me: PublicKey,
    quorums: Quorums,
    slots: HashMap<SlotId, SlotState>,
    retry_ms: u64,
}

impl FloodEngine {
    pub fn new(me: PublicKey) -> Self {
        let mut quorums = Quorums::new();
        quorums.add_node(me);
        Self {
            me,
            quorums,
            slots: HashMap::new(),
            retry_ms: 1_000,
        }
    }

    fn frame(
        kind: &str,
        slot: &SlotId,
        ballot: &Ballot,
        from: Option<&PublicKey>,
    ) -> serde_json::Value {
        let mut v = json!({ "k": kind, "slot": slot.to_string(), "b": ballot });
        if let Some(pk) = from {
            v["from"] = json!(pk.to_base64());
        }
        v
    }

    fn try_vote(&mut self, slot: &SlotId, hooks: &dyn BallotHooks, out: &mut Vec<EngineEvent>) {
        let ballot = {
            let Some(st) = self.slots.get(slot) else { return };
            if st.voted || st.externalized {
                return;
            }
            let Some(ballot) = st.ballot.clone() else { return };
            let view = SlotView {
                id: slot,
                created: st.created,
                ballot: st.ballot.as_ref(),
            };
            if !hooks.verify(&view, &ballot, &self.me) || !hooks.accept(&view, &ballot, &self.me) {
                return;
            }
            ballot
        };
        let st = self.slots.get_mut(slot).expect("slot state");
        st.voted = true;
        st.votes.insert(self.me);
        out.push(EngineEvent::Message(Self::frame(
            "vot",
            slot,
            &ballot,
            Some(&self.me),
        )));
    }

    fn check_quorum(&mut self, slot: &SlotId, out: &mut Vec<EngineEvent>) {
        let ballot = {
            let Some(st) = self.slots.get(slot) else { return };
            if st.externalized || !self.quorums.is_satisfied(&st.votes) {
                return;
            }
            let Some(ballot) = st.ballot.clone() else { return };
            ballot
        };
        out.push(EngineEvent::Message(Self::frame("ext", slot, &ballot, None)));
        self.finalize(slot, out);
    }

    fn finalize(&mut self, slot: &SlotId, out: &mut Vec<EngineEvent>) {
        let (value, had_request) = {
            let Some(st) = self.slots.get_mut(slot) else { return };
            if st.externalized {
                return;
            }
            let Some(ballot) = st.ballot.clone() else { return };
            st.externalized = true;
            (ballot.x, st.deadline.take().is_some())
        };
        out.push(EngineEvent::Externalized {
            slot: slot.clone(),
            value: value.clone(),
        });
        if had_request {
            out.push(EngineEvent::Resolved {
                slot: slot.clone(),
                result: Ok(value),
            });
        }
    }
}

impl ProtocolEngine for FloodEngine {
    fn process(
        &mut self,
        frame: serde_json::Value,
        hooks: &dyn BallotHooks,
        out: &mut Vec<EngineEvent>,
    ) {
        let Some(kind) = frame.get("k").and_then(|v| v.as_str()) else {
            return;
        };
        let Some(slot) = frame
            .get("slot")
            .and_then(|v| v.as_str())
            .and_then(SlotId::parse)
        else {
            return;
        };
        let Some(ballot) = frame
            .get("b")
            .cloned()
            .and_then(|b| serde_json::from_value::<Ballot>(b).ok())
        else {
            return;
        };
        self.slots
            .entry(slot.clone())
            .or_insert_with(SlotState::new);

        match kind {
            "pps" => {
                {
                    let st = self.slots.get_mut(&slot).expect("slot state");
                    if st.externalized {
                        return;
                    }
                    if st.ballot.as_ref().map_or(true, |cur| ballot.n >= cur.n) {
                        st.ballot = Some(ballot);
                    }
                }
                self.try_vote(&slot, hooks, out);
                self.check_quorum(&slot, out);
            }
            "vot" => {
                let Some(from) = frame
                    .get("from")
                    .and_then(|v| v.as_str())
                    .and_then(PublicKey::from_base64)
                else {
                    return;
                };
                {
                    let st = self.slots.get_mut(&slot).expect("slot state");
                    if st.externalized {
                        return;
                    }
                    if st.ballot.is_none() {
                        st.ballot = Some(ballot.clone());
                    }
                }
                let ok = {
                    let st = self.slots.get(&slot).expect("slot state");
                    let view = SlotView {
                        id: &slot,
                        created: st.created,
                        ballot: st.ballot.as_ref(),
                    };
                    hooks.verify(&view, &ballot, &from)
                };
                if ok {
                    self.slots
                        .get_mut(&slot)
                        .expect("slot state")
                        .votes
                        .insert(from);
                    self.try_vote(&slot, hooks, out);
                    self.check_quorum(&slot, out);
                }
            }
            "ext" => {
                {
                    let st = self.slots.get_mut(&slot).expect("slot state");
                    if st.externalized {
                        return;
                    }
                    st.ballot = Some(ballot);
                }
                self.finalize(&slot, out);
            }
            _ => {}
        }
    }

    fn request(
        &mut self,
        slot: SlotId,
        value: String,
        timeout: Duration,
        hooks: &dyn BallotHooks,
        out: &mut Vec<EngineEvent>,
    ) {
        let ballot = {
            let st = self.slots.entry(slot.clone()).or_insert_with(SlotState::new);
            st.deadline = Some(Instant::now() + timeout);
            let view = SlotView {
                id: &slot,
                created: st.created,
                ballot: st.ballot.as_ref(),
            };
            let ballot = hooks.generate(&view, value);
            st.ballot = Some(ballot.clone());
            ballot
        };
        out.push(EngineEvent::Message(Self::frame(
            "pps",
            &slot,
            &ballot,
            Some(&self.me),
        )));
        self.try_vote(&slot, hooks, out);
        self.check_quorum(&slot, out);
    }

    fn reclaim(&mut self, slot: &SlotId) {
        self.slots.remove(slot);
    }

    fn quorums(&mut self) -> &mut Quorums {
        &mut self.quorums
    }

    fn tick(&mut self, hooks: &dyn BallotHooks, out: &mut Vec<EngineEvent>) {
        enum Action {
            Nothing,
            Timeout,
            Retry(Ballot),
        }
        let now = Instant::now();
        let ids: Vec<SlotId> = self.slots.keys().cloned().collect();
        for slot in ids {
            let action = {
                let Some(st) = self.slots.get(&slot) else { continue };
                if st.externalized || st.deadline.is_none() {
                    Action::Nothing
                } else if now >= st.deadline.expect("deadline") {
                    Action::Timeout
                } else if let Some(cur) = &st.ballot {
                    // Requester re-proposes at the next counter once the
                    // rate gate for it has opened.
                    let due = st.created
                        + Duration::from_millis(self.retry_ms.saturating_mul(cur.n + 1));
                    if now >= due {
                        let view = SlotView {
                            id: &slot,
                            created: st.created,
                            ballot: st.ballot.as_ref(),
                        };
                        Action::Retry(hooks.generate(&view, cur.x.clone()))
                    } else {
                        Action::Nothing
                    }
                } else {
                    Action::Nothing
                }
            };
            match action {
                Action::Nothing => {}
                Action::Timeout => {
                    if let Some(st) = self.slots.get_mut(&slot) {
                        st.deadline = None;
                    }
                    out.push(EngineEvent::Resolved {
                        slot: slot.clone(),
                        result: Err(EngineError::Timeout),
                    });
                }
                Action::Retry(ballot) => {
                    if let Some(st) = self.slots.get_mut(&slot) {
                        st.ballot = Some(ballot.clone());
                    }
                    out.push(EngineEvent::Message(Self::frame(
                        "pps",
                        &slot,
                        &ballot,
                        Some(&self.me),
                    )));
                }
            }
        }
    }
}

pub struct TestNode {
    pub handle: NodeHandle,
    pub events: mpsc::Receiver<NodeEvent>,
    pub pk: PublicKey,
    pub port: u16,
}

pub fn fast_config() -> NodeConfig {
    NodeConfig {
        tick_ms: 2,
        ..NodeConfig::default()
    }
}

pub fn start_node(seed: u8) -> TestNode {
    start_node_with(seed, fast_config())
}

pub fn start_node_with(seed: u8, cfg: NodeConfig) -> TestNode {
    let identity = Identity::generate(Some([seed; 32]));
    let pk = identity.public_key();
    let engine = FloodEngine::new(pk);
    let (handle, events, _join) =
        Node::spawn(identity, Box::new(engine), Arc::new(OpenPolicy), cfg);
    let port = pick_port();
    handle.listen(port);
    TestNode {
        handle,
        events,
        pk,
        port,
    }
}

/// Fully mesh the nodes with `peer_connect` and wait for every dial to
/// report open.
pub fn mesh(nodes: &[TestNode]) {
    let (tx, rx) = mpsc::channel();
    let mut expected = 0;
    for a in nodes {
        for b in nodes {
            if a.pk == b.pk {
                continue;
            }
            expected += 1;
            let tx = tx.clone();
            a.handle
                .peer_connect(&format!("127.0.0.1:{}", b.port), b.pk, move |r| {
                    let _ = tx.send(r);
                });
        }
    }
    for _ in 0..expected {
        rx.recv_timeout(Duration::from_secs(10))
            .expect("peer connect result")
            .expect("peer open");
    }
}

pub fn shutdown(nodes: &[TestNode]) {
    for node in nodes {
        node.handle.shutdown();
    }
}
