//! Content hash identifying a base VM and every artifact derived from it.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::{IdError, VmId};

/// Lowercase hex sha256 identifying a base VM.
///
/// Overlays and handoff requests carry the hash of the base they were computed
/// against; both ends of a transfer must resolve the same value locally.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BaseHash(String);

impl BaseHash {
    /// Length of the hex representation.
    pub const HEX_LEN: usize = 64;

    /// Derives the base hash from the identity of the originating instance.
    #[must_use]
    pub fn for_instance(vm_id: &VmId) -> Self {
        Self::digest(vm_id.to_string().as_bytes())
    }

    /// Hashes arbitrary bytes.
    #[must_use]
    pub fn digest(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Parses a 64 character hex string. Uppercase input is normalized.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() != Self::HEX_LEN || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IdError::InvalidHash(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Returns the hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BaseHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BaseHash {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for BaseHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for BaseHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for BaseHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
