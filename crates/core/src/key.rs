//! Vault identifiers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Namespace mixed into discovery key derivation so the discovery key never
/// reveals the vault key it was derived from.
const DISCOVERY_NAMESPACE: &[u8] = b"pinfold/discovery/v1";

fn decode_hex32(s: &str) -> crate::Result<[u8; 32]> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(s, &mut bytes).map_err(|e| crate::Error::InvalidKey(e.to_string()))?;
    Ok(bytes)
}

/// The 32-byte public key identifying a vault, rendered as 64 lowercase hex chars.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VaultKey([u8; 32]);

impl VaultKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a hex string. Upper-case input is accepted.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        decode_hex32(s).map(Self)
    }

    /// Encode as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Derive the key peers rendezvous on.
    pub fn discovery_key(&self) -> DiscoveryKey {
        let mut hasher = Sha256::new();
        hasher.update(DISCOVERY_NAMESPACE);
        hasher.update(self.0);
        DiscoveryKey(hasher.finalize().into())
    }
}

impl FromStr for VaultKey {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::from_hex(s.trim())
    }
}

impl TryFrom<String> for VaultKey {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        value.parse()
    }
}

impl From<VaultKey> for String {
    fn from(key: VaultKey) -> Self {
        key.to_hex()
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VaultKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Identifier derived from a [`VaultKey`], used to match swarm connections
/// to a vault without disclosing the vault key itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscoveryKey([u8; 32]);

impl DiscoveryKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> crate::Result<Self> {
        decode_hex32(s).map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines.
        f.write_str(&self.to_hex()[..12])
    }
}
