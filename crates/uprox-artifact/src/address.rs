//! Ledger addresses and function selectors

use crate::hash::{ContentHash, HashError};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A 20-byte ledger account or contract address
///
/// Rendered as `0x`-prefixed lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address([u8; 20]);

impl Address {
    /// The zero address
    pub const ZERO: Self = Self([0; 20]);

    /// Create from raw bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Address derived from a content hash (its first 20 bytes)
    #[must_use]
    pub fn from_hash(hash: &ContentHash) -> Self {
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&hash.as_bytes()[..20]);
        Self(bytes)
    }

    /// Account address controlled by an ed25519 public key
    #[must_use]
    pub fn of_public_key(public_key: &[u8; 32]) -> Self {
        Self::from_hash(&ContentHash::compute_parts(&[b"uprox.account", public_key]))
    }

    /// Parse from a byte slice
    ///
    /// # Errors
    /// Returns error if the slice is not exactly 20 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, HashError> {
        let arr: [u8; 20] = bytes.try_into().map_err(|_| HashError::InvalidLength {
            expected: 20,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        Self::from_slice(&hex::decode(s)?)
    }
}

impl serde::Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 4-byte function selector
///
/// Derived from the function name; the ledger dispatches calls on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Selector([u8; 4]);

impl Selector {
    /// Selector for a function name
    #[must_use]
    pub fn of(name: &str) -> Self {
        let digest = ContentHash::compute_parts(&[b"uprox.selector", name.as_bytes()]);
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&digest.as_bytes()[..4]);
        Self(bytes)
    }

    /// Raw bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse() {
        let addr = Address::from_hash(&ContentHash::compute(b"proxy"));
        let s = addr.to_string();
        assert!(s.starts_with("0x"));
        assert_eq!(s.len(), 42);
        assert_eq!(s.parse::<Address>().unwrap(), addr);
    }

    #[test]
    fn parse_rejects_short_input() {
        assert!("0x1234".parse::<Address>().is_err());
    }

    #[test]
    fn serde_round_trips_as_string() {
        let addr = Address::new([7u8; 20]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{addr}\""));
        assert_eq!(serde_json::from_str::<Address>(&json).unwrap(), addr);
    }

    #[test]
    fn selectors_differ_by_name() {
        assert_eq!(Selector::of("initialize"), Selector::of("initialize"));
        assert_ne!(Selector::of("initialize"), Selector::of("initializeV2"));
    }

    #[test]
    fn account_address_depends_on_key() {
        assert_ne!(
            Address::of_public_key(&[1u8; 32]),
            Address::of_public_key(&[2u8; 32])
        );
    }
}
