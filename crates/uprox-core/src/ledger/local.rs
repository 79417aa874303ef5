//! In-process ledger
//!
//! Executes transactions immediately and atomically: steps run against a
//! copy of the state that replaces the live state only if every step
//! succeeds. A reverted transaction still consumes its nonce and leaves a
//! receipt, as on a public chain.
//!
//! With a state file the ledger survives restarts, which is what the CLI
//! uses for `file://` endpoints.

use super::{
    estimate_gas, proxy_address, ContractCode, Ledger, Receipt, SignedTransaction, TxStatus,
    TxStep, ADMIN_GETTER, IMPLEMENTATION_GETTER, INITIALIZED_GETTER,
};
use crate::config::Endpoint;
use crate::error::LedgerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uprox_artifact::{Address, ContentHash, Selector};
use uprox_registry::ProxyKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerState {
    block: u64,
    nonces: BTreeMap<Address, u64>,
    code: BTreeMap<Address, ContractCode>,
    proxies: BTreeMap<Address, ProxyState>,
    receipts: BTreeMap<ContentHash, Receipt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProxyState {
    implementation: Address,
    admin: Address,
    kind: ProxyKind,
    initialized: bool,
    /// Storage written by the initializer
    #[serde(default)]
    init_args: Vec<u8>,
}

/// In-process ledger with optional file persistence
#[derive(Debug, Default)]
pub struct LocalLedger {
    state: Mutex<LedgerState>,
    path: Option<PathBuf>,
}

impl LocalLedger {
    /// Create empty in-memory ledger
    #[inline]
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a persisted ledger, starting empty if the file does not exist
    ///
    /// # Errors
    /// Returns [`LedgerError::Persistence`] if the file cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let state = if path.exists() {
            let bytes = std::fs::read(&path)
                .map_err(|e| LedgerError::Persistence(format!("{}: {e}", path.display())))?;
            serde_json::from_slice(&bytes)
                .map_err(|e| LedgerError::Persistence(format!("{}: {e}", path.display())))?
        } else {
            LedgerState::default()
        };
        debug!(path = %path.display(), block = state.block, "Local ledger opened");
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    /// Ledger for a configured endpoint
    ///
    /// # Errors
    /// Returns [`LedgerError::Persistence`] if a state file cannot be read.
    pub fn connect(endpoint: &Endpoint) -> Result<Self, LedgerError> {
        match endpoint {
            Endpoint::Memory => Ok(Self::in_memory()),
            Endpoint::File(path) => Self::open(path),
        }
    }

    /// Number of mined blocks (one transaction per block)
    #[must_use]
    pub fn block_height(&self) -> u64 {
        self.state.lock().block
    }

    fn persist(&self, state: &LedgerState) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let fail = |e: &dyn std::fmt::Display| {
            LedgerError::Persistence(format!("{}: {e}", path.display()))
        };
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| fail(&e))?;
        let json = serde_json::to_vec_pretty(state).map_err(|e| fail(&e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| fail(&e))?;
        tmp.write_all(&json).map_err(|e| fail(&e))?;
        tmp.persist(path).map_err(|e| fail(&e.error))?;
        Ok(())
    }
}

fn apply(state: &mut LedgerState, from: Address, step: &TxStep) -> Result<(), String> {
    match step {
        TxStep::DeployCode { code } => match state.code.get(&code.address) {
            Some(existing) if existing == code => Ok(()),
            Some(_) => Err(format!("{} already holds different code", code.address)),
            None if state.proxies.contains_key(&code.address) => {
                Err(format!("{} is a proxy", code.address))
            }
            None => {
                state.code.insert(code.address, code.clone());
                Ok(())
            }
        },
        TxStep::DeployProxy {
            implementation,
            admin,
            kind,
            salt,
        } => {
            let proxy = proxy_address(&from, salt);
            if state.proxies.contains_key(&proxy) || state.code.contains_key(&proxy) {
                return Err(format!("{proxy} is already occupied"));
            }
            let code = state
                .code
                .get(implementation)
                .ok_or_else(|| format!("no code at {implementation}"))?;
            if *kind == ProxyKind::Uups && !code.upgrade_entrypoint {
                return Err(format!("{implementation} is not UUPS upgradeable"));
            }
            state.proxies.insert(
                proxy,
                ProxyState {
                    implementation: *implementation,
                    admin: *admin,
                    kind: *kind,
                    initialized: false,
                    init_args: Vec::new(),
                },
            );
            Ok(())
        }
        TxStep::Initialize {
            proxy,
            selector,
            args,
        } => {
            let target = state
                .proxies
                .get(proxy)
                .ok_or_else(|| format!("no proxy at {proxy}"))?;
            let code = state
                .code
                .get(&target.implementation)
                .ok_or_else(|| format!("no code at {}", target.implementation))?;
            if code.initializer != Some(*selector) {
                return Err(format!("{} has no initializer {selector}", target.implementation));
            }
            if target.initialized {
                return Err("already initialized".to_string());
            }
            if let Some(target) = state.proxies.get_mut(proxy) {
                target.initialized = true;
                target.init_args.clone_from(args);
            }
            Ok(())
        }
        TxStep::SetImplementation {
            proxy,
            implementation,
        } => {
            let code = state
                .code
                .get(implementation)
                .ok_or_else(|| format!("no code at {implementation}"))?;
            let upgradeable = code.upgrade_entrypoint;
            let target = state
                .proxies
                .get_mut(proxy)
                .ok_or_else(|| format!("no proxy at {proxy}"))?;
            if target.admin != from {
                return Err(format!("{from} is not the admin of {proxy}"));
            }
            if target.kind == ProxyKind::Uups && !upgradeable {
                return Err(format!(
                    "{implementation} lacks the upgrade entrypoint; proxy would be locked"
                ));
            }
            target.implementation = *implementation;
            Ok(())
        }
    }
}

#[async_trait]
impl Ledger for LocalLedger {
    async fn nonce(&self, account: &Address) -> Result<u64, LedgerError> {
        Ok(self.state.lock().nonces.get(account).copied().unwrap_or(0))
    }

    async fn code_at(&self, address: &Address) -> Result<Option<ContentHash>, LedgerError> {
        Ok(self
            .state
            .lock()
            .code
            .get(address)
            .map(|c| ContentHash::compute(&c.bytecode)))
    }

    async fn call(
        &self,
        address: &Address,
        selector: Selector,
        _args: &[u8],
    ) -> Result<Vec<u8>, LedgerError> {
        let state = self.state.lock();
        let proxy = state.proxies.get(address).ok_or_else(|| LedgerError::CallFailed {
            address: *address,
            reason: "not a proxy".to_string(),
        })?;
        if selector == Selector::of(IMPLEMENTATION_GETTER) {
            Ok(proxy.implementation.as_bytes().to_vec())
        } else if selector == Selector::of(ADMIN_GETTER) {
            Ok(proxy.admin.as_bytes().to_vec())
        } else if selector == Selector::of(INITIALIZED_GETTER) {
            Ok(vec![u8::from(proxy.initialized)])
        } else {
            Err(LedgerError::CallFailed {
                address: *address,
                reason: format!("unknown selector {selector}"),
            })
        }
    }

    async fn send_transaction(
        &self,
        signed: SignedTransaction,
    ) -> Result<ContentHash, LedgerError> {
        let tx_hash = signed.verify()?;
        let tx = &signed.transaction;

        let mut state = self.state.lock();
        if state.receipts.contains_key(&tx_hash) {
            return Ok(tx_hash);
        }
        let expected = state.nonces.get(&tx.from).copied().unwrap_or(0);
        if tx.nonce != expected {
            return Err(LedgerError::Rejected {
                reason: format!("nonce {} (expected {expected})", tx.nonce),
            });
        }
        let gas_used = estimate_gas(&tx.steps);
        if gas_used > tx.gas_limit {
            return Err(LedgerError::Rejected {
                reason: format!("gas limit {} below required {gas_used}", tx.gas_limit),
            });
        }

        let mut next = state.clone();
        let status = tx
            .steps
            .iter()
            .enumerate()
            .try_for_each(|(i, step)| apply(&mut next, tx.from, step).map_err(|e| (i, e)));
        let status = match status {
            Ok(()) => TxStatus::Success,
            Err((step, reason)) => {
                warn!(tx = %tx_hash.short(), step, %reason, "Transaction reverted");
                next = state.clone();
                TxStatus::Reverted { step, reason }
            }
        };

        next.block += 1;
        next.nonces.insert(tx.from, expected + 1);
        next.receipts.insert(
            tx_hash,
            Receipt {
                tx_hash,
                block: next.block,
                gas_used,
                status,
            },
        );
        self.persist(&next)?;
        *state = next;
        debug!(tx = %tx_hash.short(), block = state.block, "Transaction mined");
        Ok(tx_hash)
    }

    async fn receipt(&self, tx_hash: &ContentHash) -> Result<Option<Receipt>, LedgerError> {
        self.state
            .lock()
            .receipts
            .get(tx_hash)
            .cloned()
            .map(Some)
            .ok_or(LedgerError::UnknownTransaction { tx_hash: *tx_hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Transaction;
    use crate::signer::{KeySigner, Signer};

    fn code(tag: u8, upgradeable: bool) -> ContractCode {
        ContractCode {
            address: Address::new([tag; 20]),
            bytecode: vec![tag, 0x60],
            initializer: Some(Selector::of("initialize")),
            upgrade_entrypoint: upgradeable,
        }
    }

    async fn send(ledger: &LocalLedger, signer: &KeySigner, steps: Vec<TxStep>) -> Receipt {
        let nonce = ledger.nonce(&signer.address()).await.unwrap();
        let tx = Transaction {
            from: signer.address(),
            nonce,
            gas_limit: estimate_gas(&steps),
            steps,
        };
        let hash = ledger
            .send_transaction(signer.sign(tx).unwrap())
            .await
            .unwrap();
        ledger.receipt(&hash).await.unwrap().unwrap()
    }

    fn deploy_proxy(implementation: Address, admin: Address) -> TxStep {
        TxStep::DeployProxy {
            implementation,
            admin,
            kind: ProxyKind::Uups,
            salt: ContentHash::default(),
        }
    }

    #[tokio::test]
    async fn deploy_and_initialize_atomically() {
        let ledger = LocalLedger::in_memory();
        let signer = KeySigner::from_seed(&[1; 32]);
        let v1 = code(1, true);
        let proxy = proxy_address(&signer.address(), &ContentHash::default());

        let receipt = send(
            &ledger,
            &signer,
            vec![
                TxStep::DeployCode { code: v1.clone() },
                deploy_proxy(v1.address, signer.address()),
                TxStep::Initialize {
                    proxy,
                    selector: Selector::of("initialize"),
                    args: vec![1, 2, 3],
                },
            ],
        )
        .await;

        assert!(receipt.succeeded());
        assert_eq!(ledger.implementation_of(&proxy).await.unwrap(), v1.address);
        assert_eq!(ledger.admin_of(&proxy).await.unwrap(), signer.address());
    }

    #[tokio::test]
    async fn reverted_step_rolls_back_whole_transaction() {
        let ledger = LocalLedger::in_memory();
        let signer = KeySigner::from_seed(&[1; 32]);
        let v1 = code(1, true);
        let proxy = proxy_address(&signer.address(), &ContentHash::default());

        let receipt = send(
            &ledger,
            &signer,
            vec![
                TxStep::DeployCode { code: v1.clone() },
                deploy_proxy(v1.address, signer.address()),
                TxStep::Initialize {
                    proxy,
                    selector: Selector::of("setup"),
                    args: Vec::new(),
                },
            ],
        )
        .await;

        assert!(matches!(receipt.status, TxStatus::Reverted { step: 2, .. }));
        assert_eq!(ledger.code_at(&v1.address).await.unwrap(), None);
        assert!(ledger.implementation_of(&proxy).await.is_err());
        assert_eq!(ledger.nonce(&signer.address()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn only_admin_can_repoint() {
        let ledger = LocalLedger::in_memory();
        let admin = KeySigner::from_seed(&[1; 32]);
        let stranger = KeySigner::from_seed(&[2; 32]);
        let v1 = code(1, true);
        let v2 = code(2, true);
        let proxy = proxy_address(&admin.address(), &ContentHash::default());
        send(
            &ledger,
            &admin,
            vec![
                TxStep::DeployCode { code: v1.clone() },
                deploy_proxy(v1.address, admin.address()),
            ],
        )
        .await;

        let receipt = send(
            &ledger,
            &stranger,
            vec![
                TxStep::DeployCode { code: v2.clone() },
                TxStep::SetImplementation {
                    proxy,
                    implementation: v2.address,
                },
            ],
        )
        .await;
        assert!(!receipt.succeeded());
        assert_eq!(ledger.implementation_of(&proxy).await.unwrap(), v1.address);
        assert_eq!(ledger.code_at(&v2.address).await.unwrap(), None);
    }

    #[tokio::test]
    async fn uups_proxy_refuses_non_upgradeable_code() {
        let ledger = LocalLedger::in_memory();
        let admin = KeySigner::from_seed(&[1; 32]);
        let v1 = code(1, true);
        let locked = code(2, false);
        let proxy = proxy_address(&admin.address(), &ContentHash::default());
        send(
            &ledger,
            &admin,
            vec![
                TxStep::DeployCode { code: v1.clone() },
                deploy_proxy(v1.address, admin.address()),
            ],
        )
        .await;

        let receipt = send(
            &ledger,
            &admin,
            vec![
                TxStep::DeployCode { code: locked.clone() },
                TxStep::SetImplementation {
                    proxy,
                    implementation: locked.address,
                },
            ],
        )
        .await;
        assert!(matches!(receipt.status, TxStatus::Reverted { step: 1, .. }));
    }

    #[tokio::test]
    async fn rejects_stale_nonce_and_low_gas() {
        let ledger = LocalLedger::in_memory();
        let signer = KeySigner::from_seed(&[1; 32]);
        let steps = vec![TxStep::DeployCode { code: code(1, true) }];

        let stale = Transaction {
            from: signer.address(),
            nonce: 5,
            gas_limit: estimate_gas(&steps),
            steps: steps.clone(),
        };
        assert!(matches!(
            ledger.send_transaction(signer.sign(stale).unwrap()).await,
            Err(LedgerError::Rejected { .. })
        ));

        let cheap = Transaction {
            from: signer.address(),
            nonce: 0,
            gas_limit: 1,
            steps,
        };
        assert!(matches!(
            ledger.send_transaction(signer.sign(cheap).unwrap()).await,
            Err(LedgerError::Rejected { .. })
        ));
        assert_eq!(ledger.block_height(), 0);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let signer = KeySigner::from_seed(&[1; 32]);
        let v1 = code(1, true);

        {
            let ledger = LocalLedger::open(&path).unwrap();
            send(&ledger, &signer, vec![TxStep::DeployCode { code: v1.clone() }]).await;
        }

        let reopened = LocalLedger::open(&path).unwrap();
        assert!(reopened.code_at(&v1.address).await.unwrap().is_some());
        assert_eq!(reopened.nonce(&signer.address()).await.unwrap(), 1);
        assert_eq!(reopened.block_height(), 1);
    }

    #[tokio::test]
    async fn unknown_receipt_is_an_error() {
        let ledger = LocalLedger::in_memory();
        assert!(matches!(
            ledger.receipt(&ContentHash::compute(b"nope")).await,
            Err(LedgerError::UnknownTransaction { .. })
        ));
    }
}
