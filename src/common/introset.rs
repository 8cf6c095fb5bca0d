//! Signed rendezvous descriptors for hidden services.
use std::fmt::{self, Debug, Formatter};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::common::{Key, LookupTarget, PathId, RouterId, TableEntry};
use crate::{Error, Result};

/// The fixed width of a service tag label.
pub const TAG_SIZE: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// A hidden service's address: the SHA-256 of its ed25519 service key.
pub struct ServiceAddress(pub [u8; 32]);

impl ServiceAddress {
    /// Derive the address of the service owning `service_key`.
    pub fn from_service_key(service_key: &[u8; 32]) -> ServiceAddress {
        let digest = Sha256::digest(service_key);

        ServiceAddress(digest.into())
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<ServiceAddress> {
        Ok(ServiceAddress(Key::from_bytes(bytes)?.0))
    }
}

impl LookupTarget for ServiceAddress {
    fn dht_key(&self) -> Key {
        Key(self.0)
    }
}

impl Debug for ServiceAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceAddress(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
/// A topic label services may advertise, zero-padded to [TAG_SIZE] bytes.
pub struct Tag(pub [u8; TAG_SIZE]);

impl Tag {
    pub fn new(label: &str) -> Result<Tag> {
        let bytes = label.as_bytes();
        if bytes.len() > TAG_SIZE {
            return Err(Error::TagTooLong(bytes.len()));
        }

        let mut tmp = [0; TAG_SIZE];
        tmp[..bytes.len()].copy_from_slice(bytes);

        Ok(Tag(tmp))
    }

    pub fn label(&self) -> String {
        String::from_utf8_lossy(&self.0)
            .trim_end_matches('\0')
            .to_string()
    }
}

impl LookupTarget for Tag {
    fn dht_key(&self) -> Key {
        let digest = Sha256::digest(self.0);

        Key(digest.into())
    }
}

impl Debug for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self.label())
    }
}

#[derive(Clone, PartialEq, Debug)]
/// One rendezvous introduction point of a hidden service.
pub struct Introduction {
    /// The router hosting the introduction path.
    pub router: RouterId,
    /// The path endpoint on that router.
    pub path_id: PathId,
    /// Advertised latency of the path, in milliseconds.
    pub latency_ms: u64,
    /// When this introduction stops being usable, in milliseconds.
    pub expires_at_ms: u64,
}

#[derive(Clone, PartialEq)]
/// A signed descriptor listing the rendezvous introduction points of a
/// hidden service, optionally advertising a topic tag.
pub struct IntroSet {
    /// Hashed location of this descriptor in the keyspace.
    pub address: ServiceAddress,
    /// ed25519 service key the descriptor is signed with.
    pub service_key: [u8; 32],
    pub intros: Vec<Introduction>,
    pub topic: Option<Tag>,
    /// When this descriptor was signed, in milliseconds.
    pub timestamp_ms: u64,
    /// ed25519 signature by `service_key` over the other fields.
    pub signature: [u8; 64],
}

impl IntroSet {
    /// Create and sign a new descriptor for the service owning `signer`.
    pub fn new(
        signer: &SigningKey,
        intros: Vec<Introduction>,
        topic: Option<Tag>,
        timestamp_ms: u64,
    ) -> Self {
        let service_key = signer.verifying_key().to_bytes();
        let address = ServiceAddress::from_service_key(&service_key);
        let signable = encode_signable(&service_key, &intros, &topic, timestamp_ms);
        let signature = signer.sign(&signable);

        Self {
            address,
            service_key,
            intros,
            topic,
            timestamp_ms,
            signature: signature.to_bytes(),
        }
    }

    /// Check that the address matches the service key and that the
    /// signature holds.
    pub fn verify(&self) -> bool {
        if self.address != ServiceAddress::from_service_key(&self.service_key) {
            return false;
        }
        let Ok(key) = VerifyingKey::from_bytes(&self.service_key) else {
            return false;
        };
        let signature = Signature::from_bytes(&self.signature);
        let signable = encode_signable(
            &self.service_key,
            &self.intros,
            &self.topic,
            self.timestamp_ms,
        );

        key.verify_strict(&signable, &signature).is_ok()
    }

    /// The latest expiry among the introductions; 0 when there are none.
    pub fn newest_intro_expiration(&self) -> u64 {
        self.intros
            .iter()
            .map(|intro| intro.expires_at_ms)
            .max()
            .unwrap_or(0)
    }

    /// A descriptor with no live introduction left is unusable.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.newest_intro_expiration()
    }

    pub fn advertises(&self, tag: &Tag) -> bool {
        self.topic.as_ref() == Some(tag)
    }
}

impl Debug for IntroSet {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("IntroSet")
            .field("address", &self.address)
            .field("intros", &self.intros.len())
            .field("topic", &self.topic)
            .field("timestamp_ms", &self.timestamp_ms)
            .finish()
    }
}

fn encode_signable(
    service_key: &[u8; 32],
    intros: &[Introduction],
    topic: &Option<Tag>,
    timestamp_ms: u64,
) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(32 + 8 + TAG_SIZE + intros.len() * 64);

    encoded.extend(service_key);
    encoded.extend(timestamp_ms.to_be_bytes());
    encoded.extend(topic.map(|tag| tag.0).unwrap_or([0; TAG_SIZE]));
    for intro in intros {
        encoded.extend(intro.router.as_bytes());
        encoded.extend(intro.path_id.0);
        encoded.extend(intro.latency_ms.to_be_bytes());
        encoded.extend(intro.expires_at_ms.to_be_bytes());
    }

    encoded
}

#[derive(Clone, Debug)]
/// Service table entry.
pub struct IsNode {
    pub introset: IntroSet,
}

impl IsNode {
    pub fn new(introset: IntroSet) -> Self {
        Self { introset }
    }
}

impl TableEntry for IsNode {
    fn table_key(&self) -> Key {
        self.introset.address.dht_key()
    }

    fn is_expired(&self, now: u64) -> bool {
        self.introset.is_expired(now)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn intro(expires_at_ms: u64) -> Introduction {
        Introduction {
            router: Key::random(),
            path_id: PathId::random(),
            latency_ms: 40,
            expires_at_ms,
        }
    }

    fn signer() -> SigningKey {
        SigningKey::from_bytes(&rand::random())
    }

    #[test]
    fn sign_and_verify() {
        let introset = IntroSet::new(&signer(), vec![intro(10_000)], None, 1_000);

        assert!(introset.verify());
    }

    #[test]
    fn tampering_breaks_verification() {
        let mut introset = IntroSet::new(&signer(), vec![intro(10_000)], None, 1_000);
        introset.intros[0].latency_ms += 1;

        assert!(!introset.verify());

        // an introset re-signed by another key must not keep the old address
        let honest = IntroSet::new(&signer(), vec![intro(10_000)], None, 1_000);
        let mut forged = IntroSet::new(&signer(), vec![intro(10_000)], None, 1_000);
        forged.address = honest.address;

        assert!(!forged.verify());
    }

    #[test]
    fn expiry_follows_newest_intro() {
        let introset = IntroSet::new(&signer(), vec![intro(5_000), intro(9_000)], None, 1_000);

        assert_eq!(introset.newest_intro_expiration(), 9_000);
        assert!(!introset.is_expired(8_999));
        assert!(introset.is_expired(9_000));

        let empty = IntroSet::new(&signer(), vec![], None, 1_000);
        assert!(empty.is_expired(0));
    }

    #[test]
    fn advertises_topic() {
        let tag = Tag::new("exit").unwrap();
        let introset = IntroSet::new(&signer(), vec![intro(10_000)], Some(tag), 1_000);

        assert!(introset.advertises(&tag));
        assert!(!introset.advertises(&Tag::new("other").unwrap()));
        assert_eq!(tag.label(), "exit");
    }

    #[test]
    fn tag_rejects_long_labels() {
        assert!(Tag::new("a-label-way-past-sixteen-bytes").is_err());
    }
}
