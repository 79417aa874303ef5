//! Transaction signing

use crate::config::ConfigError;
use crate::error::TransportError;
use crate::ledger::{SignedTransaction, Transaction};
use ed25519_dalek::{Signer as _, SigningKey};
use std::fmt;
use uprox_artifact::Address;

/// Signs transactions for one account
pub trait Signer: Send + Sync + fmt::Debug {
    /// Account the signatures belong to
    fn address(&self) -> Address;

    /// Sign a transaction
    ///
    /// # Errors
    /// Returns [`TransportError::Signing`] if the transaction cannot be
    /// encoded or was built for another account.
    fn sign(&self, transaction: Transaction) -> Result<SignedTransaction, TransportError>;
}

/// ed25519 key signer
pub struct KeySigner {
    key: SigningKey,
}

impl KeySigner {
    /// Create from a 32-byte seed
    #[inline]
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    /// Create from a hex-encoded seed (optional `0x` prefix)
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] unless the input is 32 hex bytes.
    pub fn from_hex(hex_seed: &str) -> Result<Self, ConfigError> {
        let trimmed = hex_seed.trim();
        let bytes = hex::decode(trimmed.strip_prefix("0x").unwrap_or(trimmed)).map_err(|e| {
            ConfigError::Invalid {
                field: "signing_key",
                reason: e.to_string(),
            }
        })?;
        let seed: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| ConfigError::Invalid {
            field: "signing_key",
            reason: format!("expected 32 bytes, got {}", b.len()),
        })?;
        Ok(Self::from_seed(&seed))
    }

    /// Public key bytes
    #[inline]
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }
}

impl fmt::Debug for KeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySigner")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

impl Signer for KeySigner {
    fn address(&self) -> Address {
        Address::of_public_key(&self.public_key())
    }

    fn sign(&self, transaction: Transaction) -> Result<SignedTransaction, TransportError> {
        if transaction.from != self.address() {
            return Err(TransportError::Signing(format!(
                "transaction is from {}, signer is {}",
                transaction.from,
                self.address()
            )));
        }
        let hash = transaction
            .hash()
            .map_err(|e| TransportError::Signing(e.to_string()))?;
        let signature = self.key.sign(hash.as_bytes());
        Ok(SignedTransaction {
            transaction,
            public_key: self.public_key(),
            signature: signature.to_bytes().to_vec(),
        })
    }
}
