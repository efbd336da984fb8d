use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Deref;

// TxId uniquely identifies a ledger transaction.
// It is the 32 byte SHA-256 digest of the transaction's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId([u8; 32]);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Format as a hex string with a prefix of the first 6 bytes
        let prefix = hex::encode(&self.0[0..6]);
        write!(f, "tx:{}", prefix)
    }
}

impl Ord for TxId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for TxId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Default for TxId {
    fn default() -> Self {
        TxId([0; 32])
    }
}

impl Deref for TxId {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TxId {
    pub fn new(bytes: [u8; 32]) -> Self {
        TxId(bytes)
    }

    /// Get a reference to the internal bytes
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Full lowercase hex encoding of the id
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse an id from its full hex encoding
    pub fn from_hex(encoded: &str) -> Option<Self> {
        let bytes = hex::decode(encoded).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(TxId(bytes))
    }

    /// Derive a transaction id from a list of seeds
    ///
    /// # Parameters
    /// * `seeds` - Byte slices hashed in order, each prefixed by its length
    ///
    /// # Returns
    /// The SHA-256 digest of the domain separator followed by the seeds
    pub fn derive(seeds: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();

        // Domain separator
        hasher.update(b"VAULTFLOW_Tx");

        for seed in seeds {
            hasher.update((seed.len() as u64).to_le_bytes());
            hasher.update(seed);
        }

        TxId(hasher.finalize().into())
    }
}

/// Identity of a state object: the producing transaction and the output index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateRef {
    pub txid: TxId,
    pub index: u32,
}

impl StateRef {
    pub fn new(txid: TxId, index: u32) -> Self {
        Self { txid, index }
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.txid, self.index)
    }
}

/// A named participant on the network
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Party(String);

impl Party {
    pub fn new(name: impl Into<String>) -> Self {
        Party(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Party {
    fn from(name: &str) -> Self {
        Party(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let a = TxId::derive(&[b"issue", &[1, 2, 3]]);
        let b = TxId::derive(&[b"issue", &[1, 2, 3]]);
        assert_eq!(a, b);

        // Seed boundaries are part of the digest
        let c = TxId::derive(&[b"issu", b"e", &[1, 2, 3]]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hex_round_trip_and_display() {
        let id = TxId::new([0xab; 32]);
        assert_eq!(TxId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(id.to_string(), "tx:abababababab");
        assert_eq!(TxId::from_hex("abcd"), None);

        let state_ref = StateRef::new(id, 3);
        assert_eq!(state_ref.to_string(), "tx:abababababab#3");
    }

    #[test]
    fn test_state_ref_ordering() {
        let low = StateRef::new(TxId::new([1; 32]), 5);
        let high = StateRef::new(TxId::new([2; 32]), 0);
        assert!(low < high);
        assert!(StateRef::new(TxId::new([1; 32]), 0) < low);
    }
}
