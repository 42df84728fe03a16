// In-memory cast store: the latest externalized cast per (channel, sender).
// The externalization handler is the only writer; `send` and the ballot
// acceptor read it to resolve chain heads.

use crate::cast::Cast;
use crate::types::{Channel, PublicKey};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Shared read handle; the node thread holds the writing side.
pub type SharedCastStore = Arc<RwLock<CastStore>>;

#[derive(Default)]
pub struct CastStore {
    latest: HashMap<Channel, HashMap<PublicKey, Cast>>,
}

impl CastStore {
    pub fn new() -> Self {
        CastStore::default()
    }

    pub fn latest(&self, channel: &Channel, sender: &PublicKey) -> Option<&Cast> {
        self.latest.get(channel)?.get(sender)
    }

    /// Record the newest externalized cast, returning the one it replaced.
    pub fn record(&mut self, channel: Channel, sender: PublicKey, cast: Cast) -> Option<Cast> {
        self.latest.entry(channel).or_default().insert(sender, cast)
    }

    pub fn shared() -> SharedCastStore {
        Arc::new(RwLock::new(CastStore::new()))
    }
}
