//! Signed router descriptors.
use std::fmt::{self, Debug, Formatter};

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::common::{Key, RouterId, TableEntry};

/// How long a router contact stays servable after it was signed.
pub const RC_LIFETIME_MS: u64 = 60 * 60 * 1000;

#[derive(Clone, PartialEq)]
/// A signed descriptor of a router's identity and reachability.
///
/// `address_info` is an opaque blob owned by the transport layer; the DHT
/// only moves it around and checks the signature over it.
pub struct RouterContact {
    /// ed25519 identity key, doubling as the router's DHT key.
    pub id: RouterId,
    /// Opaque reachability information.
    pub address_info: Bytes,
    /// When this descriptor was signed, in milliseconds.
    pub timestamp_ms: u64,
    /// ed25519 signature by `id` over the other fields.
    pub signature: [u8; 64],
}

impl RouterContact {
    /// Create and sign a new contact for the router owning `signer`.
    pub fn new(signer: &SigningKey, address_info: Bytes, timestamp_ms: u64) -> Self {
        let id = Key(signer.verifying_key().to_bytes());
        let signable = encode_signable(&id, &address_info, timestamp_ms);
        let signature = signer.sign(&signable);

        Self {
            id,
            address_info,
            timestamp_ms,
            signature: signature.to_bytes(),
        }
    }

    /// Check the contact's self-signature.
    pub fn verify(&self) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(self.id.as_bytes()) else {
            return false;
        };
        let signature = Signature::from_bytes(&self.signature);
        let signable = encode_signable(&self.id, &self.address_info, self.timestamp_ms);

        key.verify_strict(&signable, &signature).is_ok()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now > self.timestamp_ms.saturating_add(RC_LIFETIME_MS)
    }
}

impl Debug for RouterContact {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("RouterContact")
            .field("id", &self.id)
            .field("timestamp_ms", &self.timestamp_ms)
            .finish()
    }
}

fn encode_signable(id: &RouterId, address_info: &Bytes, timestamp_ms: u64) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(32 + 8 + address_info.len());

    encoded.extend(id.as_bytes());
    encoded.extend(timestamp_ms.to_be_bytes());
    encoded.extend_from_slice(address_info);

    encoded
}

#[derive(Clone, Debug)]
/// Router table entry.
pub struct RcNode {
    pub contact: RouterContact,
}

impl RcNode {
    pub fn new(contact: RouterContact) -> Self {
        Self { contact }
    }
}

impl TableEntry for RcNode {
    fn table_key(&self) -> Key {
        self.contact.id
    }

    fn is_expired(&self, now: u64) -> bool {
        self.contact.is_expired(now)
    }
}
