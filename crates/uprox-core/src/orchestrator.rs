//! Upgrade orchestration
//!
//! [`UpgradeOrchestrator::upgrade`] repoints a proxy to a new implementation
//! only after the candidate passed every check, and updates the registry
//! only after the ledger confirmed the switch.
//!
//! # Workflow
//! 1. Take the proxy's lease, look it up and check the caller is its admin
//! 2. Reconcile an earlier upgrade whose outcome was never observed
//! 3. Validate and analyze the candidate, then run the compatibility check
//! 4. Deploy (if needed) and repoint in one atomic transaction
//! 5. Commit the registry on confirmation
//!
//! The lease is held from step 1 until the outcome is recorded, so
//! concurrent upgrades of one proxy run one after the other.

use crate::cache::LayoutCache;
use crate::error::{LedgerError, TransportError, UpgradeError};
use crate::ledger::{ContractCode, TxStatus, TxStep};
use crate::transport::{Confirmation, Transport};
use crate::validation::ImplementationValidator;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uprox_artifact::{Address, ContentHash, Implementation};
use uprox_compat::CompatibilityChecker;
use uprox_registry::{
    DeployedImplementation, PendingUpgrade, ProxyLease, ProxyRecord, ProxyRegistry,
};

/// Result of an upgrade attempt that did not fail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeResult {
    pub success: bool,
    pub proxy: Address,
    pub new_implementation_address: Address,
    pub implementation_id: ContentHash,
    /// Transaction that repointed the proxy; `None` for no-ops
    pub tx_hash: Option<ContentHash>,
    /// Candidate was already live; nothing was sent
    pub already_current: bool,
    /// Registry version after the upgrade
    pub version: u64,
}

/// How a reconciliation resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Nothing was pending and the ledger agrees with the registry
    InSync(ProxyRecord),
    /// The pending upgrade applied and is now committed
    Committed(ProxyRecord),
    /// The pending upgrade never applied and was dropped
    Cleared(ProxyRecord),
}

impl Reconciliation {
    /// Record after reconciliation
    #[must_use]
    pub fn record(&self) -> &ProxyRecord {
        match self {
            Self::InSync(r) | Self::Committed(r) | Self::Cleared(r) => r,
        }
    }
}

/// Drives proxy upgrades
#[derive(Debug, Clone)]
pub struct UpgradeOrchestrator {
    transport: Arc<Transport>,
    registry: Arc<ProxyRegistry>,
    layouts: LayoutCache,
    validator: ImplementationValidator,
    checker: CompatibilityChecker,
}

impl UpgradeOrchestrator {
    /// Create orchestrator
    #[must_use]
    pub fn new(
        transport: Arc<Transport>,
        registry: Arc<ProxyRegistry>,
        layouts: LayoutCache,
        validator: ImplementationValidator,
    ) -> Self {
        Self {
            transport,
            registry,
            layouts,
            validator,
            checker: CompatibilityChecker::new(),
        }
    }

    /// Upgrade `proxy` to `candidate` on behalf of `caller`
    ///
    /// Upgrading to the implementation that is already live succeeds
    /// without sending anything.
    ///
    /// # Errors
    /// - [`UpgradeError::NotFound`] / [`UpgradeError::Unauthorized`] /
    ///   [`UpgradeError::Initialization`] before any ledger call
    /// - [`UpgradeError::IncompatibleUpgrade`] and other validation errors
    ///   before any ledger mutation
    /// - [`UpgradeError::Transport`] if the switch did not happen
    /// - [`UpgradeError::UncertainOutcome`] if it may have happened
    pub async fn upgrade(
        &self,
        proxy: &Address,
        candidate: &Implementation,
        caller: &Address,
    ) -> Result<UpgradeResult, UpgradeError> {
        let lease = self.registry.lease(proxy).await?;
        let mut record = self.registry.lookup(proxy)?;
        if &record.admin != caller {
            return Err(UpgradeError::Unauthorized {
                proxy: *proxy,
                caller: *caller,
            });
        }
        if !record.initialized {
            return Err(UpgradeError::Initialization {
                proxy: *proxy,
                reason: "proxy was never initialized".to_string(),
            });
        }

        if record.is_pending() {
            record = self.reconcile_leased(&lease, record).await?.record().clone();
        }

        let id = *candidate.hash();
        if record.is_current(&id) {
            debug!(proxy = %proxy, implementation = %id.short(), "Candidate already current");
            return Ok(UpgradeResult {
                success: true,
                proxy: *proxy,
                new_implementation_address: record.current.address,
                implementation_id: id,
                tx_hash: None,
                already_current: true,
                version: record.version,
            });
        }
        if record.was_superseded(&id) {
            return Err(UpgradeError::Downgrade {
                proxy: *proxy,
                implementation: id,
            });
        }

        self.validator.validate(candidate, record.kind)?;
        let new_schema = self.layouts.schema_of(candidate).await?;
        let verdict = self.checker.check(&record.current.layout, &new_schema);
        if !verdict.is_safe() {
            warn!(
                proxy = %proxy,
                candidate = %id.short(),
                violations = verdict.violations.len(),
                "Upgrade rejected by storage check"
            );
            return Err(UpgradeError::IncompatibleUpgrade {
                proxy: *proxy,
                violations: verdict.violations,
            });
        }

        let deployed = DeployedImplementation::new(candidate, (*new_schema).clone());
        let mut steps = Vec::with_capacity(2);
        if self
            .transport
            .ledger()
            .code_at(&deployed.address)
            .await?
            .is_none()
        {
            steps.push(TxStep::DeployCode {
                code: ContractCode::of(candidate),
            });
        }
        steps.push(TxStep::SetImplementation {
            proxy: *proxy,
            implementation: deployed.address,
        });

        info!(
            proxy = %proxy,
            from = %record.current.id.short(),
            to = %id.short(),
            deploy = steps.len() == 2,
            "Submitting upgrade"
        );
        let tx_hash = self.transport.submit(steps).await?;

        match self.transport.confirm(tx_hash).await {
            Confirmation::Mined(receipt) => match receipt.status {
                TxStatus::Success => {
                    let address = deployed.address;
                    let committed = self.registry.commit_upgrade(&lease, deployed)?;
                    Ok(UpgradeResult {
                        success: true,
                        proxy: *proxy,
                        new_implementation_address: address,
                        implementation_id: id,
                        tx_hash: Some(tx_hash),
                        already_current: false,
                        version: committed.version,
                    })
                }
                TxStatus::Reverted { step, reason } => Err(TransportError::Reverted {
                    tx_hash,
                    step,
                    reason,
                }
                .into()),
            },
            Confirmation::Unobserved { tx_hash } => {
                self.registry.mark_pending(
                    &lease,
                    PendingUpgrade {
                        tx_hash,
                        candidate: deployed,
                        submitted_at: Utc::now(),
                    },
                )?;
                Err(UpgradeError::UncertainOutcome {
                    proxy: *proxy,
                    tx_hash,
                })
            }
        }
    }

    /// Current record, reconciled with the ledger if an upgrade is pending
    ///
    /// An upgrade that is still unresolved stays marked pending.
    ///
    /// # Errors
    /// [`UpgradeError::NotFound`] for unknown proxies,
    /// [`UpgradeError::LedgerDivergence`] if the ledger disagrees.
    pub async fn lookup(&self, proxy: &Address) -> Result<ProxyRecord, UpgradeError> {
        let record = self.registry.lookup(proxy)?;
        if !record.is_pending() {
            return Ok(record);
        }
        match self.reconcile(proxy).await {
            Ok(reconciled) => Ok(reconciled.record().clone()),
            Err(UpgradeError::UncertainOutcome { .. }) => Ok(self.registry.lookup(proxy)?),
            Err(e) => Err(e),
        }
    }

    /// Align the registry with the ledger's view of a proxy
    ///
    /// # Errors
    /// [`UpgradeError::UncertainOutcome`] if a pending upgrade is still
    /// unresolved, [`UpgradeError::LedgerDivergence`] if the ledger points
    /// the proxy at an implementation the registry does not expect.
    pub async fn reconcile(&self, proxy: &Address) -> Result<Reconciliation, UpgradeError> {
        let lease = self.registry.lease(proxy).await?;
        let record = self.registry.lookup(proxy)?;
        self.reconcile_leased(&lease, record).await
    }

    async fn reconcile_leased(
        &self,
        lease: &ProxyLease,
        record: ProxyRecord,
    ) -> Result<Reconciliation, UpgradeError> {
        let ledger = self.transport.ledger();
        let proxy = record.proxy;
        let observed = ledger.implementation_of(&proxy).await?;

        let Some(pending) = record.pending.clone() else {
            if observed == record.current.address {
                return Ok(Reconciliation::InSync(record));
            }
            return Err(UpgradeError::LedgerDivergence {
                proxy,
                expected: record.current.address,
                observed,
            });
        };

        let status = match ledger.receipt(&pending.tx_hash).await {
            Ok(receipt) => receipt.map(|r| r.status),
            Err(LedgerError::UnknownTransaction { .. }) => Some(TxStatus::Reverted {
                step: 0,
                reason: "dropped by the ledger".to_string(),
            }),
            Err(e) => return Err(e.into()),
        };
        let candidate = pending.candidate.address;
        let current = record.current.address;
        debug!(
            proxy = %proxy,
            tx = %pending.tx_hash.short(),
            observed = %observed,
            resolved = status.is_some(),
            "Reconciling pending upgrade"
        );

        match status {
            Some(TxStatus::Success) | None if observed == candidate => {
                let committed = self.registry.commit_upgrade(lease, pending.candidate)?;
                info!(proxy = %proxy, version = committed.version, "Pending upgrade confirmed");
                Ok(Reconciliation::Committed(committed))
            }
            Some(TxStatus::Reverted { .. }) if observed == current => {
                Ok(Reconciliation::Cleared(self.registry.clear_pending(lease)?))
            }
            None if observed == current => Err(UpgradeError::UncertainOutcome {
                proxy,
                tx_hash: pending.tx_hash,
            }),
            Some(TxStatus::Success) => Err(UpgradeError::LedgerDivergence {
                proxy,
                expected: candidate,
                observed,
            }),
            _ => Err(UpgradeError::LedgerDivergence {
                proxy,
                expected: current,
                observed,
            }),
        }
    }
}
