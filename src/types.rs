// Key types used across the node. Every map in the core is keyed by one of
// these; keeping them distinct newtypes prevents a channel name, a hash, and
// a slot id from ever being confused for one another.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A node's Ed25519 public key; also its address on the wire (base64).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Option<Self> {
        let bytes = BASE64.decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(PublicKey(arr))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

/// Hex digest identifying a cast. The empty digest marks the start of a
/// sender's chain (no previous cast).
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sha(String);

impl Sha {
    pub fn from_hex(hex: String) -> Self {
        Sha(hex)
    }

    pub fn empty() -> Self {
        Sha(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named bus for casts. `':'` is reserved by the slot identifier grammar.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        if name.contains(':') {
            return None;
        }
        Some(Channel(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One consensus instance: `channel ':' sender_base64 ':' cast_sha_hex`.
/// Scoping the slot to a concrete proposed cast is what lets the node
/// reclaim the previous slot once a newer cast externalizes.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct SlotId {
    pub channel: Channel,
    pub sender: PublicKey,
    pub sha: Sha,
}

impl SlotId {
    pub fn new(channel: Channel, sender: PublicKey, sha: Sha) -> Self {
        SlotId {
            channel,
            sender,
            sha,
        }
    }

    pub fn parse(s: &str) -> Option<SlotId> {
        let mut parts = s.split(':');
        let channel = Channel::new(parts.next()?)?;
        let sender = PublicKey::from_base64(parts.next()?)?;
        let sha = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        if sha.is_empty() || !sha.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(SlotId::new(channel, sender, Sha::from_hex(sha.to_string())))
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.channel, self.sender.to_base64(), self.sha)
    }
}
