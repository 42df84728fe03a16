// Crypto primitives: the node identity (Ed25519 keypair), detached
// signature verification, and the canonical string-array hash every cast
// identity is derived from.

use crate::types::{PublicKey, Sha};
use ed25519_dalek::{Keypair, PublicKey as DalekPublicKey, SecretKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

/// The local Ed25519 keypair. The public key doubles as the node's address.
pub struct Identity {
    keypair: Keypair,
}

impl Identity {
    /// Deterministic when a seed is supplied (the seed is the secret key),
    /// random otherwise.
    pub fn generate(seed: Option<[u8; 32]>) -> Identity {
        match seed {
            Some(seed) => Identity::from_secret(&seed),
            None => Identity {
                keypair: Keypair::generate(&mut OsRng),
            },
        }
    }

    pub fn from_secret(secret: &[u8; 32]) -> Identity {
        let secret = SecretKey::from_bytes(secret).expect("secret key must be 32 bytes");
        let public: DalekPublicKey = (&secret).into();
        Identity {
            keypair: Keypair { secret, public },
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_bytes(self.keypair.public.to_bytes())
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.keypair.secret.to_bytes()
    }

    /// Detached signature over `msg`.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        self.keypair.sign(msg).to_bytes()
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Identity::from_secret(&self.secret_bytes())
    }
}

/// Detached Ed25519 verification; malformed keys or signatures verify false.
pub fn verify(pk: &PublicKey, msg: &[u8], sig: &[u8; 64]) -> bool {
    let Ok(pk) = DalekPublicKey::from_bytes(pk.as_bytes()) else {
        return false;
    };
    let Ok(sig) = Signature::from_bytes(sig) else {
        return false;
    };
    pk.verify(msg, &sig).is_ok()
}

/// Canonical hash of a string array: SHA-256 over each part's byte length
/// (little-endian u64) followed by its bytes, as a lowercase hex digest.
/// Length prefixes are the separator; payload parts are arbitrary, so no
/// delimiter byte could be unambiguous.
pub fn hash_parts(parts: &[&str]) -> Sha {
    let mut h = Sha256::new();
    for part in parts {
        h.update((part.len() as u64).to_le_bytes());
        h.update(part.as_bytes());
    }
    Sha::from_hex(hex::encode(h.finalize()))
}
