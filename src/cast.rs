// The cast record: the unit the network agrees on. A cast binds a payload
// to a channel and to the sender's previous cast on that channel, forming a
// per-(channel, sender) hash chain; the whole record is signed.

use crate::crypto::{hash_parts, verify, Identity};
use crate::types::{Channel, PublicKey, Sha};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// A signed, hash-chained message on a channel.
///
/// Wire form: `{"sha": hex, "sig": base64, "prv": hex, "pay": string}`.
/// `sha` is `hash_parts([prv, channel, pay])`; `sig` is the sender's
/// Ed25519 signature over the ASCII bytes of `sha`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Cast {
    pub sha: Sha,
    pub sig: String,
    pub prv: Sha,
    pub pay: String,
}

impl Cast {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("cast to json")
    }

    /// Strict parse: all four fields must be present as strings, nothing
    /// extra. Anything else fails closed.
    pub fn from_json(s: &str) -> Option<Cast> {
        serde_json::from_str(s).ok()
    }
}

/// Build and sign a cast. Pure with respect to node state: the caller
/// supplies `prv` (the store is read elsewhere).
pub fn generate_cast(identity: &Identity, channel: &Channel, prv: Sha, pay: String) -> Cast {
    let sha = hash_parts(&[prv.as_str(), channel.as_str(), &pay]);
    let sig = identity.sign(sha.as_str().as_bytes());
    Cast {
        sha,
        sig: BASE64.encode(sig),
        prv,
        pay,
    }
}

/// Check a cast's integrity: recomputed `sha` must match and `sig` must
/// verify under `sender`. Malformed base64 or a wrong-length signature
/// verifies false; chain continuity is deliberately not checked here.
pub fn verify_cast(sender: &PublicKey, channel: &Channel, cast: &Cast) -> bool {
    let expected = hash_parts(&[cast.prv.as_str(), channel.as_str(), &cast.pay]);
    if expected != cast.sha {
        return false;
    }
    let Ok(raw) = BASE64.decode(&cast.sig) else {
        return false;
    };
    let Ok(sig) = <[u8; 64]>::try_from(raw) else {
        return false;
    };
    verify(sender, cast.sha.as_str().as_bytes(), &sig)
}
