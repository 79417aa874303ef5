//! uprox core - proxy deployment and upgrade orchestration
//!
//! Deploys implementations behind upgradeable proxies and upgrades them
//! safely:
//! - Candidates are validated and their storage layout is checked against
//!   the live one before anything is sent
//! - Deployment and repointing happen in atomic ledger transactions
//! - The registry changes only after the ledger confirmed the switch
//! - Upgrades of the same proxy are serialized
//!
//! # Example
//!
//! ```rust,ignore
//! use uprox_core::prelude::*;
//!
//! # async fn example(v1: Implementation, v2: Implementation) -> Result<(), UpgradeError> {
//! let config = UproxConfig::new().with_signing_key("11".repeat(32));
//! let signer = config.signer()?;
//! let admin = signer.address();
//! let transport = Arc::new(Transport::new(
//!     Arc::new(LocalLedger::in_memory()),
//!     Arc::new(signer),
//!     config.gas_ceiling,
//!     config.confirmation_timeout(),
//! ));
//! let registry = Arc::new(ProxyRegistry::new());
//! let layouts = LayoutCache::new(config.layout_cache_capacity);
//! let validator = ImplementationValidator::new(&config.target_version);
//!
//! let deployer = DeploymentInitializer::new(
//!     Arc::clone(&transport), Arc::clone(&registry), layouts.clone(), validator.clone());
//! let record = deployer.deploy_new(&v1, DeployRequest::new(admin)).await?;
//!
//! let orchestrator = UpgradeOrchestrator::new(transport, registry, layouts, validator);
//! let result = orchestrator.upgrade(&record.proxy, &v2, &admin).await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod cache;
pub mod config;
pub mod deployer;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod signer;
pub mod transport;
pub mod validation;

pub use cache::LayoutCache;
pub use config::{ConfigError, Endpoint, UproxConfig};
pub use deployer::{DeployRequest, DeploymentInitializer};
pub use error::{LedgerError, TransportError, UpgradeError};
pub use ledger::{
    estimate_gas, proxy_address, ContractCode, Ledger, LocalLedger, Receipt, SignedTransaction,
    Transaction, TxStatus, TxStep,
};
pub use orchestrator::{Reconciliation, UpgradeOrchestrator, UpgradeResult};
pub use signer::{KeySigner, Signer};
pub use transport::{Confirmation, Transport, DEFAULT_POLL_INTERVAL};
pub use validation::ImplementationValidator;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for deploying and upgrading proxies
    pub use crate::{
        DeployRequest, DeploymentInitializer, ImplementationValidator, LayoutCache, Ledger,
        LocalLedger, Signer, Transport, UpgradeError, UpgradeOrchestrator, UpgradeResult,
        UproxConfig,
    };
    pub use std::sync::Arc;
    pub use uprox_artifact::{Address, Implementation};
    pub use uprox_registry::{ProxyKind, ProxyRecord, ProxyRegistry};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
