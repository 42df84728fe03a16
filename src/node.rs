// The node core: one thread owns every consensus-facing structure and
// drains, in turn, facade commands, transport events, and engine timers.
// Subscriber dispatch is deferred to the next scheduling turn so a
// subscriber can re-enter `send` without the engine still on the stack.

use crate::ballot::{CastBallots, PayloadPolicy};
use crate::cast::{generate_cast, verify_cast, Cast};
use crate::config::NodeConfig;
use crate::crypto::Identity;
use crate::engine::{EngineError, EngineEvent, ProtocolEngine};
use crate::error::SendError;
use crate::store::{CastStore, SharedCastStore};
use crate::transport::{self, ConnId, Listener, Wire, WireEvent, WireEventKind};
use crate::types::{Channel, PublicKey, Sha, SlotId};
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{mpsc, Arc, RwLock};
use std::thread;

pub type SendCallback = Box<dyn FnOnce(Result<Sha, SendError>) + Send>;
pub type CastSubscriber = Box<dyn FnMut(&PublicKey, &Sha, &str) + Send>;
pub type ConnectCallback = Box<dyn FnOnce(Result<(), String>) + Send>;

/// Lifecycle notifications for the embedder, one typed event per kind.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerOpen { public_key: PublicKey, url: String },
    PeerClose { public_key: PublicKey, url: String },
    PeerError {
        public_key: PublicKey,
        url: String,
        error: String,
    },
    ClientOpen { conn: ConnId },
    ClientClose { conn: ConnId },
    ClientError { conn: ConnId, error: String },
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub public_key: PublicKey,
    pub url: String,
    pub connected: bool,
}

enum Command {
    Send {
        channel: String,
        payload: Vec<u8>,
        cb: SendCallback,
    },
    Receive {
        channel: String,
        cb: CastSubscriber,
    },
    PeerConnect {
        url: String,
        public_key: PublicKey,
        cb: ConnectCallback,
    },
    PeerDisconnect { public_key: PublicKey },
    Listen { port: u16 },
    Shutdown,
}

struct PeerEntry {
    url: String,
    conn: ConnId,
    wire: Wire,
    open: bool,
    cb: Option<ConnectCallback>,
}

#[derive(Clone, Copy)]
enum ConnRole {
    Peer(PublicKey),
    Client,
}

struct Dispatch {
    channel: Channel,
    sender: PublicKey,
    sha: Sha,
    pay: String,
}

pub struct Node {
    cfg: NodeConfig,
    identity: Arc<RwLock<Identity>>,
    engine: Box<dyn ProtocolEngine>,
    hooks: CastBallots,
    store: SharedCastStore,
    subscribers: HashMap<Channel, Vec<CastSubscriber>>,
    pending: HashMap<SlotId, SendCallback>,
    peers: HashMap<PublicKey, PeerEntry>,
    peers_snapshot: Arc<RwLock<HashMap<PublicKey, PeerInfo>>>,
    clients: Vec<(ConnId, Wire)>,
    conns: HashMap<ConnId, ConnRole>,
    deferred: VecDeque<Dispatch>,
    listener: Option<Listener>,
    tx_net: mpsc::Sender<WireEvent>,
    events: mpsc::Sender<NodeEvent>,
}

impl Node {
    /// Build the node around a caller-constructed engine and start its
    /// thread. Quorum slices are the caller's business: configure them on
    /// the engine before handing it over.
    pub fn spawn(
        identity: Identity,
        engine: Box<dyn ProtocolEngine>,
        policy: Arc<dyn PayloadPolicy>,
        cfg: NodeConfig,
    ) -> (
        NodeHandle,
        mpsc::Receiver<NodeEvent>,
        thread::JoinHandle<()>,
    ) {
        let (tx_cmd, rx_cmd) = mpsc::channel();
        let (tx_net, rx_net) = mpsc::channel();
        let (tx_event, rx_event) = mpsc::channel();

        let store = CastStore::shared();
        let hooks = CastBallots::new(store.clone(), policy, cfg.retry_interval_ms);
        let identity = Arc::new(RwLock::new(identity));
        let peers_snapshot = Arc::new(RwLock::new(HashMap::new()));

        let handle = NodeHandle {
            tx_cmd,
            identity: Arc::clone(&identity),
            store: store.clone(),
            peers: Arc::clone(&peers_snapshot),
        };

        let node = Node {
            cfg,
            identity,
            engine,
            hooks,
            store,
            subscribers: HashMap::new(),
            pending: HashMap::new(),
            peers: HashMap::new(),
            peers_snapshot,
            clients: Vec::new(),
            conns: HashMap::new(),
            deferred: VecDeque::new(),
            listener: None,
            tx_net,
            events: tx_event,
        };

        let join = thread::spawn(move || node.run(rx_cmd, rx_net));
        (handle, rx_event, join)
    }

    fn run(mut self, rx_cmd: mpsc::Receiver<Command>, rx_net: mpsc::Receiver<WireEvent>) {
        let mut shutdown = false;
        loop {
            // Dispatches queued last turn run first, on a fresh turn with
            // the engine's callstack long unwound.
            self.flush_dispatches();

            while let Ok(cmd) = rx_cmd.try_recv() {
                match cmd {
                    Command::Shutdown => shutdown = true,
                    other => self.handle_command(other),
                }
            }
            while let Ok(ev) = rx_net.try_recv() {
                self.handle_wire_event(ev);
            }

            let mut out = Vec::new();
            self.engine.tick(&self.hooks, &mut out);
            self.drain_engine(out);

            if shutdown {
                self.close_all();
                break;
            }
            thread::sleep(self.cfg.tick());
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send {
                channel,
                payload,
                cb,
            } => self.handle_send(channel, payload, cb),
            Command::Receive { channel, cb } => self.handle_receive(channel, cb),
            Command::PeerConnect {
                url,
                public_key,
                cb,
            } => self.handle_peer_connect(url, public_key, cb),
            Command::PeerDisconnect { public_key } => self.handle_peer_disconnect(public_key),
            Command::Listen { port } => self.handle_listen(port),
            Command::Shutdown => {}
        }
    }

    // ---- slot orchestrator ----

    fn handle_send(&mut self, channel: String, payload: Vec<u8>, cb: SendCallback) {
        let Some(channel) = Channel::new(channel) else {
            cb(Err(SendError::InvalidChannel));
            return;
        };
        let Ok(pay) = String::from_utf8(payload) else {
            cb(Err(SendError::InvalidPayload));
            return;
        };
        let identity = match self.identity.read() {
            Ok(guard) => guard.clone(),
            Err(_) => {
                cb(Err(SendError::Engine("identity lock poisoned".into())));
                return;
            }
        };
        let me = identity.public_key();
        let prv = self
            .store
            .read()
            .ok()
            .and_then(|s| s.latest(&channel, &me).map(|c| c.sha.clone()))
            .unwrap_or_else(Sha::empty);

        let cast = generate_cast(&identity, &channel, prv, pay);
        let slot = SlotId::new(channel, me, cast.sha.clone());
        let value = cast.to_json();

        self.pending.insert(slot.clone(), cb);
        let mut out = Vec::new();
        self.engine
            .request(slot, value, self.cfg.request_timeout(), &self.hooks, &mut out);
        self.drain_engine(out);
    }

    fn resolve(&mut self, slot: SlotId, result: Result<String, EngineError>) {
        // A second resolution for the same slot finds no entry and is
        // ignored.
        let Some(cb) = self.pending.remove(&slot) else {
            return;
        };
        match result {
            Ok(value) => match Cast::from_json(&value) {
                Some(cast) => cb(Ok(cast.sha)),
                None => cb(Err(SendError::Engine(
                    "externalized value is not a cast".into(),
                ))),
            },
            Err(EngineError::Timeout) => cb(Err(SendError::RequestTimeout)),
            Err(err) => cb(Err(SendError::Engine(err.to_string()))),
        }
    }

    // ---- dispatcher and externalization ----

    fn drain_engine(&mut self, events: Vec<EngineEvent>) {
        for event in events {
            match event {
                EngineEvent::Message(frame) => {
                    let text = serde_json::json!({ "t": "fba", "m": frame }).to_string();
                    self.fan_out(text);
                }
                EngineEvent::Externalized { slot, value } => self.externalize(slot, value),
                EngineEvent::Resolved { slot, result } => self.resolve(slot, result),
            }
        }
    }

    fn externalize(&mut self, slot: SlotId, value: String) {
        let Some(cast) = Cast::from_json(&value) else {
            warn!("slot {}: externalized value is not a cast, dropping", slot);
            return;
        };
        if !verify_cast(&slot.sender, &slot.channel, &cast) {
            warn!("slot {}: invalid cast at externalization, dropping", slot);
            return;
        }

        let prior = self
            .store
            .read()
            .ok()
            .and_then(|s| s.latest(&slot.channel, &slot.sender).map(|c| c.sha.clone()));
        if prior.as_ref() == Some(&cast.sha) {
            return;
        }
        if let Some(prev) = prior {
            let superseded = SlotId::new(slot.channel.clone(), slot.sender, prev);
            self.engine.reclaim(&superseded);
        }

        if let Ok(mut store) = self.store.write() {
            store.record(slot.channel.clone(), slot.sender, cast.clone());
        }
        self.deferred.push_back(Dispatch {
            channel: slot.channel,
            sender: slot.sender,
            sha: cast.sha,
            pay: cast.pay,
        });
    }

    fn flush_dispatches(&mut self) {
        while let Some(d) = self.deferred.pop_front() {
            if let Some(subs) = self.subscribers.get_mut(&d.channel) {
                for sub in subs.iter_mut() {
                    sub(&d.sender, &d.sha, &d.pay);
                }
            }
        }
    }

    fn handle_receive(&mut self, channel: String, cb: CastSubscriber) {
        let Some(channel) = Channel::new(channel) else {
            warn!("subscribe ignored: channel contains ':'");
            return;
        };
        self.subscribers.entry(channel).or_default().push(cb);
    }

    fn fan_out(&self, text: String) {
        for entry in self.peers.values() {
            entry.wire.send(text.clone());
        }
        for (_, wire) in &self.clients {
            wire.send(text.clone());
        }
    }

    fn handle_frame(&mut self, text: String) {
        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(err) => {
                debug!("dropping unparseable frame: {}", err);
                return;
            }
        };
        let Some(tag) = value.get("t").and_then(|t| t.as_str()) else {
            debug!("dropping frame without tag");
            return;
        };
        if tag != "fba" {
            // Unknown tags are tolerated silently; `flags` and friends are
            // reserved for add-ons.
            return;
        }
        let Some(frame) = value.get("m") else {
            debug!("dropping fba frame without body");
            return;
        };
        let mut out = Vec::new();
        self.engine.process(frame.clone(), &self.hooks, &mut out);
        self.drain_engine(out);
    }

    // ---- peer/client registry ----

    fn handle_peer_connect(&mut self, url: String, pk: PublicKey, cb: ConnectCallback) {
        // A repeat connect supersedes the previous entry.
        if let Some(old) = self.peers.remove(&pk) {
            old.wire.close();
            self.conns.remove(&old.conn);
        }
        let (conn, wire) = transport::dial(&url, self.tx_net.clone(), self.cfg.max_frame_bytes);
        self.conns.insert(conn, ConnRole::Peer(pk));
        self.peers.insert(
            pk,
            PeerEntry {
                url,
                conn,
                wire,
                open: false,
                cb: Some(cb),
            },
        );
        self.engine.quorums().add_node(pk);
        self.sync_peer_snapshot();
    }

    fn handle_peer_disconnect(&mut self, pk: PublicKey) {
        let Some(entry) = self.peers.remove(&pk) else {
            return;
        };
        entry.wire.close();
        self.conns.remove(&entry.conn);
        self.engine.quorums().remove_node(&pk);
        self.sync_peer_snapshot();
        self.emit(NodeEvent::PeerClose {
            public_key: pk,
            url: entry.url,
        });
    }

    fn handle_listen(&mut self, port: u16) {
        if let Some(old) = self.listener.take() {
            old.stop();
        }
        match Listener::spawn(port, self.tx_net.clone(), self.cfg.max_frame_bytes) {
            Ok(listener) => {
                info!("listening on port {}", listener.port());
                self.listener = Some(listener);
            }
            Err(err) => warn!("listen failed: {}", err),
        }
    }

    fn handle_wire_event(&mut self, ev: WireEvent) {
        if let WireEventKind::Accepted(wire) = ev.kind {
            self.conns.insert(ev.conn, ConnRole::Client);
            self.clients.push((ev.conn, wire));
            self.emit(NodeEvent::ClientOpen { conn: ev.conn });
            return;
        }
        match self.conns.get(&ev.conn).copied() {
            Some(ConnRole::Peer(pk)) => self.handle_peer_event(pk, ev),
            Some(ConnRole::Client) => self.handle_client_event(ev),
            None => {}
        }
    }

    fn handle_peer_event(&mut self, pk: PublicKey, ev: WireEvent) {
        let conn = ev.conn;
        let url = match self.peers.get(&pk) {
            Some(entry) if entry.conn == conn => entry.url.clone(),
            _ => {
                // Superseded wire still winding down.
                self.conns.remove(&conn);
                return;
            }
        };
        match ev.kind {
            WireEventKind::Open => {
                let cb = self.peers.get_mut(&pk).and_then(|entry| {
                    entry.open = true;
                    entry.cb.take()
                });
                self.sync_peer_snapshot();
                if let Some(cb) = cb {
                    cb(Ok(()));
                }
                self.emit(NodeEvent::PeerOpen {
                    public_key: pk,
                    url,
                });
            }
            WireEventKind::Frame(text) => self.handle_frame(text),
            WireEventKind::Error(error) => {
                if let Some(cb) = self.peers.get_mut(&pk).and_then(|entry| entry.cb.take()) {
                    cb(Err(error.clone()));
                }
                self.emit(NodeEvent::PeerError {
                    public_key: pk,
                    url,
                    error,
                });
            }
            WireEventKind::Closed => {
                if let Some(entry) = self.peers.get_mut(&pk) {
                    entry.open = false;
                }
                self.conns.remove(&conn);
                self.sync_peer_snapshot();
                self.emit(NodeEvent::PeerClose {
                    public_key: pk,
                    url,
                });
            }
            WireEventKind::Accepted(_) => {}
        }
    }

    fn handle_client_event(&mut self, ev: WireEvent) {
        match ev.kind {
            WireEventKind::Frame(text) => self.handle_frame(text),
            WireEventKind::Error(error) => {
                self.emit(NodeEvent::ClientError {
                    conn: ev.conn,
                    error,
                });
            }
            WireEventKind::Closed => {
                self.clients.retain(|(id, _)| *id != ev.conn);
                self.conns.remove(&ev.conn);
                self.emit(NodeEvent::ClientClose { conn: ev.conn });
            }
            WireEventKind::Open | WireEventKind::Accepted(_) => {}
        }
    }

    fn sync_peer_snapshot(&self) {
        if let Ok(mut snap) = self.peers_snapshot.write() {
            snap.clear();
            for (pk, entry) in &self.peers {
                snap.insert(
                    *pk,
                    PeerInfo {
                        public_key: *pk,
                        url: entry.url.clone(),
                        connected: entry.open,
                    },
                );
            }
        }
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    fn close_all(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop();
        }
        for entry in self.peers.values() {
            entry.wire.close();
        }
        for (_, wire) in &self.clients {
            wire.close();
        }
    }
}

/// Clonable facade onto a running node. All mutation goes through the
/// command channel; reads come from shared snapshots.
#[derive(Clone)]
pub struct NodeHandle {
    tx_cmd: mpsc::Sender<Command>,
    identity: Arc<RwLock<Identity>>,
    store: SharedCastStore,
    peers: Arc<RwLock<HashMap<PublicKey, PeerInfo>>>,
}

impl NodeHandle {
    pub fn public_key(&self) -> PublicKey {
        self.identity.read().expect("identity lock").public_key()
    }

    pub fn private_key(&self) -> [u8; 32] {
        self.identity.read().expect("identity lock").secret_bytes()
    }

    /// Replace the node identity. Only safe before any connection exists;
    /// the engine keeps whatever node key it was constructed with.
    pub fn generate_keypair(&self, seed: Option<[u8; 32]>) -> PublicKey {
        let fresh = Identity::generate(seed);
        let pk = fresh.public_key();
        *self.identity.write().expect("identity lock") = fresh;
        pk
    }

    /// Propose `payload` on `channel`; `cb` fires once with the
    /// externalized cast's sha, or with the error.
    pub fn send(
        &self,
        channel: &str,
        payload: impl Into<Vec<u8>>,
        cb: impl FnOnce(Result<Sha, SendError>) + Send + 'static,
    ) {
        let _ = self.tx_cmd.send(Command::Send {
            channel: channel.to_string(),
            payload: payload.into(),
            cb: Box::new(cb),
        });
    }

    /// Append a subscriber; it sees every externalized cast on `channel`
    /// as `(sender, sha, payload)`, in registration order.
    pub fn receive(
        &self,
        channel: &str,
        cb: impl FnMut(&PublicKey, &Sha, &str) + Send + 'static,
    ) {
        let _ = self.tx_cmd.send(Command::Receive {
            channel: channel.to_string(),
            cb: Box::new(cb),
        });
    }

    pub fn peer_connect(
        &self,
        url: &str,
        public_key: PublicKey,
        cb: impl FnOnce(Result<(), String>) + Send + 'static,
    ) {
        let _ = self.tx_cmd.send(Command::PeerConnect {
            url: url.to_string(),
            public_key,
            cb: Box::new(cb),
        });
    }

    pub fn peer_disconnect(&self, public_key: PublicKey) {
        let _ = self.tx_cmd.send(Command::PeerDisconnect { public_key });
    }

    pub fn peer_list(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn listen(&self, port: u16) {
        let _ = self.tx_cmd.send(Command::Listen { port });
    }

    /// The latest externalized cast for `(channel, sender)`, if any.
    pub fn latest_cast(&self, channel: &str, sender: &PublicKey) -> Option<Cast> {
        let channel = Channel::new(channel)?;
        self.store.read().ok()?.latest(&channel, sender).cloned()
    }

    pub fn shutdown(&self) {
        let _ = self.tx_cmd.send(Command::Shutdown);
    }
}
