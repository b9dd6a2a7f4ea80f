//! Key identifiers and the name transform.
//!
//! A key id is a fixed 64-byte opaque value compared byte-lexicographically.
//! Ids derived from names are SHA-512 digests; the session namespace is fed
//! into the digest ahead of the name so the same name maps to different ids
//! under different namespaces.

use std::fmt;

use serde::de::{Error as DeError, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};

/// Size of a key id in bytes.
pub const KEY_SIZE: usize = 64;

/// 64-byte opaque key identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyId(pub [u8; KEY_SIZE]);

impl KeyId {
    pub const ZERO: KeyId = KeyId([0u8; KEY_SIZE]);

    /// Transform a name into a key id under the given namespace.
    pub fn from_name(namespace: &[u8], name: &[u8]) -> Self {
        let mut hasher = Sha512::new();
        if !namespace.is_empty() {
            hasher.update(namespace);
            hasher.update([0u8]);
        }
        hasher.update(name);
        KeyId(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Short hex prefix used in log lines.
    pub fn short_hex(&self) -> String {
        self.0[..6].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl Default for KeyId {
    fn default() -> Self {
        KeyId::ZERO
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({}..)", self.short_hex())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..", self.short_hex())
    }
}

impl Serialize for KeyId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyIdVisitor;

        impl<'de> Visitor<'de> for KeyIdVisitor {
            type Value = KeyId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{KEY_SIZE} raw key bytes")
            }

            fn visit_bytes<E: DeError>(self, v: &[u8]) -> Result<KeyId, E> {
                let arr: [u8; KEY_SIZE] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(KeyId(arr))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<KeyId, A::Error> {
                let mut arr = [0u8; KEY_SIZE];
                for (i, slot) in arr.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| A::Error::invalid_length(i, &self))?;
                }
                Ok(KeyId(arr))
            }
        }

        deserializer.deserialize_bytes(KeyIdVisitor)
    }
}

/// A key routed to a concrete replica group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id {
    pub key: KeyId,
    pub group: u32,
}

impl Id {
    pub fn new(key: KeyId, group: u32) -> Self {
        Self { key, group }
    }
}
