//! Ledger interface
//!
//! The ledger runs deployed code and stores its state. Transactions are
//! lists of [`TxStep`]s executed atomically: either every step applies or
//! none does, so a proxy is never observed pointing at half-deployed code.

mod local;

pub use local::LocalLedger;

use crate::error::LedgerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use uprox_artifact::{Address, ContentHash, HashError, Implementation, Selector};
use uprox_registry::ProxyKind;

/// Read-only proxy getter returning the implementation address
pub const IMPLEMENTATION_GETTER: &str = "implementation";
/// Read-only proxy getter returning the admin address
pub const ADMIN_GETTER: &str = "admin";
/// Read-only proxy getter returning 1 once initialized
pub const INITIALIZED_GETTER: &str = "initialized";

/// Base gas charged per transaction
pub const TX_BASE_GAS: u64 = 21_000;

/// Deployable code as the ledger sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCode {
    /// Content-addressed deployment address
    pub address: Address,
    pub bytecode: Vec<u8>,
    /// Selector of the one-time initializer, if any
    pub initializer: Option<Selector>,
    /// Whether the code can perform UUPS upgrades
    pub upgrade_entrypoint: bool,
}

impl ContractCode {
    /// Code for an implementation artifact
    #[must_use]
    pub fn of(implementation: &Implementation) -> Self {
        Self {
            address: implementation.address(),
            bytecode: implementation.bytecode().to_vec(),
            initializer: implementation.initializer(),
            upgrade_entrypoint: implementation.source().upgrade_entrypoint,
        }
    }
}

/// One step of an atomic transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TxStep {
    /// Deploy implementation code; a no-op if identical code is present
    DeployCode { code: ContractCode },
    /// Deploy a proxy at [`proxy_address`]`(sender, salt)`
    DeployProxy {
        implementation: Address,
        admin: Address,
        kind: ProxyKind,
        salt: ContentHash,
    },
    /// Run the implementation's initializer in the proxy's storage
    Initialize {
        proxy: Address,
        selector: Selector,
        args: Vec<u8>,
    },
    /// Repoint a proxy; only its admin may do this
    SetImplementation {
        proxy: Address,
        implementation: Address,
    },
}

impl TxStep {
    /// Gas this step consumes
    #[must_use]
    pub fn gas_cost(&self) -> u64 {
        match self {
            Self::DeployCode { code } => 32_000 + 200 * code.bytecode.len() as u64,
            Self::DeployProxy { .. } => 60_000,
            Self::Initialize { args, .. } => 25_000 + 16 * args.len() as u64,
            Self::SetImplementation { .. } => 12_000,
        }
    }
}

/// Gas needed for a list of steps
#[must_use]
pub fn estimate_gas(steps: &[TxStep]) -> u64 {
    steps
        .iter()
        .map(TxStep::gas_cost)
        .fold(TX_BASE_GAS, u64::saturating_add)
}

/// Address a proxy deployed by `deployer` with `salt` will occupy
#[must_use]
pub fn proxy_address(deployer: &Address, salt: &ContentHash) -> Address {
    Address::from_hash(&ContentHash::compute_parts(&[
        b"uprox.proxy",
        deployer.as_bytes(),
        salt.as_bytes(),
    ]))
}

/// Unsigned transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    pub nonce: u64,
    pub gas_limit: u64,
    pub steps: Vec<TxStep>,
}

impl Transaction {
    /// Transaction hash (what gets signed)
    ///
    /// # Errors
    /// Returns error if the transaction cannot be encoded
    pub fn hash(&self) -> Result<ContentHash, HashError> {
        ContentHash::compute_serializable(self)
    }
}

/// Transaction with its sender's signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub transaction: Transaction,
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
}

impl SignedTransaction {
    /// Check the signature and that the key controls the sender account
    ///
    /// Returns the transaction hash.
    ///
    /// # Errors
    /// Returns [`LedgerError::Rejected`] for any mismatch.
    pub fn verify(&self) -> Result<ContentHash, LedgerError> {
        use ed25519_dalek::{Signature, Verifier, VerifyingKey};

        let reject = |reason: String| LedgerError::Rejected { reason };
        if Address::of_public_key(&self.public_key) != self.transaction.from {
            return Err(reject("key does not control sender account".to_string()));
        }
        let hash = self.transaction.hash().map_err(|e| reject(e.to_string()))?;
        let key = VerifyingKey::from_bytes(&self.public_key).map_err(|e| reject(e.to_string()))?;
        let signature = Signature::from_slice(&self.signature).map_err(|e| reject(e.to_string()))?;
        key.verify(hash.as_bytes(), &signature)
            .map_err(|_| reject("bad signature".to_string()))?;
        Ok(hash)
    }
}

/// Execution status of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TxStatus {
    /// Every step applied
    Success,
    /// Step `step` failed; nothing applied
    Reverted { step: usize, reason: String },
}

/// Receipt of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: ContentHash,
    pub block: u64,
    pub gas_used: u64,
    pub status: TxStatus,
}

impl Receipt {
    /// Whether every step applied
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == TxStatus::Success
    }
}

/// External ledger
#[async_trait]
pub trait Ledger: Send + Sync + Debug {
    /// Next nonce expected from `account`
    async fn nonce(&self, account: &Address) -> Result<u64, LedgerError>;

    /// Hash of the code deployed at `address`, if any
    async fn code_at(&self, address: &Address) -> Result<Option<ContentHash>, LedgerError>;

    /// Read-only call
    async fn call(
        &self,
        address: &Address,
        selector: Selector,
        args: &[u8],
    ) -> Result<Vec<u8>, LedgerError>;

    /// Submit a signed transaction, returning its hash once accepted
    async fn send_transaction(
        &self,
        transaction: SignedTransaction,
    ) -> Result<ContentHash, LedgerError>;

    /// Receipt of an accepted transaction, `None` while unconfirmed
    async fn receipt(&self, tx_hash: &ContentHash) -> Result<Option<Receipt>, LedgerError>;

    /// Implementation a proxy currently delegates to
    async fn implementation_of(&self, proxy: &Address) -> Result<Address, LedgerError> {
        let raw = self
            .call(proxy, Selector::of(IMPLEMENTATION_GETTER), &[])
            .await?;
        Address::from_slice(&raw).map_err(|e| LedgerError::CallFailed {
            address: *proxy,
            reason: e.to_string(),
        })
    }

    /// Admin of a proxy
    async fn admin_of(&self, proxy: &Address) -> Result<Address, LedgerError> {
        let raw = self.call(proxy, Selector::of(ADMIN_GETTER), &[]).await?;
        Address::from_slice(&raw).map_err(|e| LedgerError::CallFailed {
            address: *proxy,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_address_depends_on_deployer_and_salt() {
        let a = Address::new([1; 20]);
        let b = Address::new([2; 20]);
        let salt = ContentHash::compute(b"salt");
        assert_eq!(proxy_address(&a, &salt), proxy_address(&a, &salt));
        assert_ne!(proxy_address(&a, &salt), proxy_address(&b, &salt));
        assert_ne!(
            proxy_address(&a, &salt),
            proxy_address(&a, &ContentHash::default())
        );
    }

    #[test]
    fn gas_estimate_includes_base() {
        assert_eq!(estimate_gas(&[]), TX_BASE_GAS);
        let step = TxStep::SetImplementation {
            proxy: Address::ZERO,
            implementation: Address::ZERO,
        };
        assert_eq!(estimate_gas(&[step.clone()]), TX_BASE_GAS + step.gas_cost());
    }

    #[test]
    fn steps_serialize_tagged() {
        let step = TxStep::SetImplementation {
            proxy: Address::ZERO,
            implementation: Address::ZERO,
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["op"], "set_implementation");
    }
}
