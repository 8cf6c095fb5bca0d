//! DHT keyspace identifiers and the XOR metric.
use std::fmt::{self, Debug, Formatter};
use std::ops::BitXor;

use rand::Rng;

use crate::{Error, Result};

/// The size of DHT keys in bytes.
pub const KEY_SIZE: usize = 32;
/// Bucket depth of the furthest possible key.
pub const MAX_DISTANCE: u16 = KEY_SIZE as u16 * 8;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
/// A 256-bit key: a node identity or the hashed location of a record.
///
/// Keys order by big-endian magnitude, so comparing two XOR results
/// compares their distances.
pub struct Key(pub [u8; KEY_SIZE]);

/// A router's identity key.
pub type RouterId = Key;

impl Key {
    pub fn random() -> Key {
        let mut rng = rand::thread_rng();

        Key(rng.gen())
    }

    /// A random key sharing the upper half of `near`, landing it in (or
    /// close to) the same bucket. Used to seed exploration around a peer.
    pub fn random_near(near: &Key) -> Key {
        let mut rng = rand::thread_rng();

        let mut bytes = near.0;
        let suffix: [u8; KEY_SIZE / 2] = rng.gen();
        bytes[KEY_SIZE / 2..].copy_from_slice(&suffix);

        Key(bytes)
    }

    /// Create a new Key from some bytes. Returns Err if `bytes` is not of
    /// length [KEY_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Key> {
        let bytes = bytes.as_ref();
        if bytes.len() != KEY_SIZE {
            return Err(Error::InvalidKeySize(bytes.len()));
        }

        let mut tmp = [0; KEY_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Key(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Bucket depth of `other` relative to this key.
    ///
    /// Distance to self is 0, distance to the furthest key is 256, distance
    /// to a key with 5 leading matching bits is 251.
    pub fn distance(&self, other: &Key) -> u16 {
        for i in 0..KEY_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                let leading_zeros = i as u16 * 8 + (a ^ b).leading_zeros() as u16;

                return MAX_DISTANCE - leading_zeros;
            }
        }

        0
    }
}

impl BitXor for Key {
    type Output = Key;

    fn bitxor(self, rhs: Key) -> Key {
        let mut out = [0; KEY_SIZE];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ rhs.0[i];
        }

        Key(out)
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Key(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Identifies one of our local onion paths.
pub struct PathId(pub [u8; 16]);

impl PathId {
    pub fn random() -> PathId {
        let mut rng = rand::thread_rng();

        PathId(rng.gen())
    }
}

impl Debug for PathId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PathId(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Anything a lookup can resolve maps into the keyspace through this trait;
/// the iterative traversal measures progress against `dht_key`.
pub trait LookupTarget: Clone + Eq + std::hash::Hash + Debug {
    fn dht_key(&self) -> Key;
}

impl LookupTarget for Key {
    fn dht_key(&self) -> Key {
        *self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(prefix: u8) -> Key {
        let mut bytes = [0; KEY_SIZE];
        bytes[0] = prefix;
        Key(bytes)
    }

    #[test]
    fn xor_orders_by_magnitude() {
        let target = key(0x00);
        let near = key(0x10);
        let far = key(0xf0);

        assert!((near ^ target) < (far ^ target));
        assert!((far ^ target) > (near ^ target));
        assert_eq!(near ^ near, key(0x00));
    }

    #[test]
    fn distance_is_bucket_depth() {
        let zero = key(0x00);

        assert_eq!(zero.distance(&zero), 0);
        assert_eq!(zero.distance(&key(0x80)), MAX_DISTANCE);
        assert_eq!(zero.distance(&key(0x01)), MAX_DISTANCE - 7);

        let mut lowest = [0; KEY_SIZE];
        lowest[KEY_SIZE - 1] = 1;
        assert_eq!(zero.distance(&Key(lowest)), 1);
    }

    #[test]
    fn random_near_shares_prefix() {
        let peer = Key::random();
        let target = Key::random_near(&peer);

        assert_eq!(target.0[..KEY_SIZE / 2], peer.0[..KEY_SIZE / 2]);
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        assert!(Key::from_bytes([0u8; 31]).is_err());
        assert!(Key::from_bytes([0u8; KEY_SIZE]).is_ok());
    }
}
