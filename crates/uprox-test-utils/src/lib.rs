//! Testing utilities for the uprox workspace
//!
//! Artifact fixtures, a fault-injecting ledger and a ready-wired harness.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uprox_artifact::{
    Address, ContentHash, ContractSource, Implementation, LayoutBuilder, Selector,
};
use uprox_core::{
    DeploymentInitializer, ImplementationValidator, KeySigner, LayoutCache, Ledger, LedgerError,
    LocalLedger, Receipt, SignedTransaction, Signer, Transport, TxStatus, UpgradeOrchestrator,
};
use uprox_registry::ProxyRegistry;

/// Compiler version fixtures are built with
pub const TEST_COMPILER: &str = "0.8.11";

/// Seed of the harness signer (the admin of every harness proxy)
pub const ADMIN_SEED: [u8; 32] = [7; 32];

/// Builds contract artifacts for tests
#[derive(Debug, Clone)]
pub struct ArtifactBuilder {
    name: String,
    layout: Option<LayoutBuilder>,
    compiler_version: String,
    initializer: Option<String>,
    has_constructor: bool,
    upgrade_entrypoint: bool,
    revision: String,
}

impl ArtifactBuilder {
    /// Upgradeable contract with an `initialize` function and empty layout
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            layout: Some(LayoutBuilder::new()),
            compiler_version: TEST_COMPILER.to_string(),
            initializer: Some("initialize".to_string()),
            has_constructor: false,
            upgrade_entrypoint: true,
            revision: String::new(),
        }
    }

    pub fn var(mut self, label: &str, type_id: &str) -> Self {
        self.layout = Some(self.layout.unwrap_or_default().var(label, type_id));
        self
    }

    /// Changes the bytecode without touching the layout
    pub fn revision(mut self, revision: &str) -> Self {
        self.revision = revision.to_string();
        self
    }

    pub fn compiler(mut self, version: &str) -> Self {
        self.compiler_version = version.to_string();
        self
    }

    pub fn without_initializer(mut self) -> Self {
        self.initializer = None;
        self
    }

    pub fn with_constructor(mut self) -> Self {
        self.has_constructor = true;
        self
    }

    pub fn without_upgrade_entrypoint(mut self) -> Self {
        self.upgrade_entrypoint = false;
        self
    }

    /// Drop the storage layout section entirely
    pub fn without_layout(mut self) -> Self {
        self.layout = None;
        self
    }

    pub fn source(self) -> ContractSource {
        let bytecode = format!("{}:{}", self.name, self.revision).into_bytes();
        ContractSource {
            contract_name: self.name,
            bytecode,
            compiler_version: self.compiler_version,
            initializer: self.initializer,
            has_constructor: self.has_constructor,
            upgrade_entrypoint: self.upgrade_entrypoint,
            storage_layout: self.layout.map(|l| l.build().unwrap()),
        }
    }

    pub fn build(self) -> Implementation {
        Implementation::new(self.source()).unwrap()
    }
}

/// `Box` v1: `[value uint256]`
pub fn box_v1() -> Implementation {
    ArtifactBuilder::new("Box").var("value", "t_uint256").build()
}

/// `Box` v2: appends `owner address`
pub fn box_v2() -> Implementation {
    ArtifactBuilder::new("Box")
        .revision("v2")
        .var("value", "t_uint256")
        .var("owner", "t_address")
        .build()
}

/// `Box` v2 with slot 0 retyped to `address`
pub fn box_v2_retyped() -> Implementation {
    ArtifactBuilder::new("Box")
        .revision("v2-retyped")
        .var("value", "t_address")
        .build()
}

/// `Box` v3: appends `label string` after v2
pub fn box_v3() -> Implementation {
    ArtifactBuilder::new("Box")
        .revision("v3")
        .var("value", "t_uint256")
        .var("owner", "t_address")
        .var("label", "t_string_storage")
        .build()
}

/// Ledger wrapper that counts calls and injects faults
#[derive(Debug)]
pub struct FaultyLedger {
    inner: Arc<LocalLedger>,
    calls: AtomicUsize,
    sends: AtomicUsize,
    failing_sends: AtomicUsize,
    dropping_sends: AtomicUsize,
    stalled: AtomicBool,
    revert_next: Mutex<Option<(usize, String)>>,
    fabricated: Mutex<HashMap<ContentHash, Receipt>>,
}

impl FaultyLedger {
    pub fn new(inner: Arc<LocalLedger>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
            failing_sends: AtomicUsize::new(0),
            dropping_sends: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
            revert_next: Mutex::new(None),
            fabricated: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &Arc<LocalLedger> {
        &self.inner
    }

    /// Every ledger call, reads included
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Transactions handed to the ledger
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.calls.store(0, Ordering::SeqCst);
        self.sends.store(0, Ordering::SeqCst);
    }

    /// Reject the next `n` sends as unreachable
    pub fn fail_next_sends(&self, n: usize) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    /// Accept the next `n` sends without ever executing them
    pub fn drop_next_sends(&self, n: usize) {
        self.dropping_sends.store(n, Ordering::SeqCst);
    }

    /// While stalled, every receipt query reports "not yet mined"
    pub fn stall_receipts(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Report the next send as reverted at `step` without executing it
    pub fn revert_next_send(&self, step: usize, reason: &str) {
        *self.revert_next.lock() = Some((step, reason.to_string()));
    }

    fn tick(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Ledger for FaultyLedger {
    async fn nonce(&self, account: &Address) -> Result<u64, LedgerError> {
        self.tick();
        self.inner.nonce(account).await
    }

    async fn code_at(&self, address: &Address) -> Result<Option<ContentHash>, LedgerError> {
        self.tick();
        self.inner.code_at(address).await
    }

    async fn call(
        &self,
        address: &Address,
        selector: Selector,
        args: &[u8],
    ) -> Result<Vec<u8>, LedgerError> {
        self.tick();
        self.inner.call(address, selector, args).await
    }

    async fn send_transaction(
        &self,
        transaction: SignedTransaction,
    ) -> Result<ContentHash, LedgerError> {
        self.tick();
        self.sends.fetch_add(1, Ordering::SeqCst);
        if Self::take_one(&self.failing_sends) {
            return Err(LedgerError::Unreachable("injected send failure".to_string()));
        }
        if Self::take_one(&self.dropping_sends) {
            return transaction.verify();
        }
        if let Some((step, reason)) = self.revert_next.lock().take() {
            let tx_hash = transaction.verify()?;
            self.fabricated.lock().insert(
                tx_hash,
                Receipt {
                    tx_hash,
                    block: self.inner.block_height() + 1,
                    gas_used: transaction.transaction.gas_limit,
                    status: TxStatus::Reverted { step, reason },
                },
            );
            return Ok(tx_hash);
        }
        self.inner.send_transaction(transaction).await
    }

    async fn receipt(&self, tx_hash: &ContentHash) -> Result<Option<Receipt>, LedgerError> {
        self.tick();
        if self.stalled.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if let Some(receipt) = self.fabricated.lock().get(tx_hash) {
            return Ok(Some(receipt.clone()));
        }
        self.inner.receipt(tx_hash).await
    }
}

/// Registry, transport, deployer and orchestrator over a [`FaultyLedger`]
#[derive(Debug)]
pub struct Harness {
    pub ledger: Arc<FaultyLedger>,
    pub registry: Arc<ProxyRegistry>,
    pub transport: Arc<Transport>,
    pub layouts: LayoutCache,
    pub deployer: DeploymentInitializer,
    pub orchestrator: UpgradeOrchestrator,
    /// Signer account and admin of deployed proxies
    pub admin: Address,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_gas_ceiling(10_000_000)
    }

    pub fn with_gas_ceiling(gas_ceiling: u64) -> Self {
        let ledger = Arc::new(FaultyLedger::new(Arc::new(LocalLedger::in_memory())));
        let signer = KeySigner::from_seed(&ADMIN_SEED);
        let admin = signer.address();
        let transport = Arc::new(
            Transport::new(
                Arc::clone(&ledger) as Arc<dyn Ledger>,
                Arc::new(signer),
                gas_ceiling,
                Duration::from_millis(150),
            )
            .with_poll_interval(Duration::from_millis(5)),
        );
        let registry = Arc::new(ProxyRegistry::new());
        let layouts = LayoutCache::new(64);
        let validator = ImplementationValidator::new(TEST_COMPILER);
        Self {
            deployer: DeploymentInitializer::new(
                Arc::clone(&transport),
                Arc::clone(&registry),
                layouts.clone(),
                validator.clone(),
            ),
            orchestrator: UpgradeOrchestrator::new(
                Arc::clone(&transport),
                Arc::clone(&registry),
                layouts.clone(),
                validator,
            ),
            ledger,
            registry,
            transport,
            layouts,
            admin,
        }
    }

    /// Account that is not the admin of anything
    pub fn stranger() -> Address {
        KeySigner::from_seed(&[9; 32]).address()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
