//! uprox Proxy Registry
//!
//! The single source of truth for which implementation each proxy delegates
//! to. Records change only through [`ProxyRegistry::commit_upgrade`], which
//! requires the proxy's [`ProxyLease`].
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = ProxyRegistry::new();
//! registry.register(proxy, deployed, admin, ProxyKind::Uups)?;
//!
//! let lease = registry.lease(&proxy).await?;
//! // ... confirm the switch on the ledger ...
//! registry.commit_upgrade(&lease, next)?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod error;
mod manifest;
mod record;
mod registry;

pub use error::RegistryError;
pub use manifest::{Manifest, MANIFEST_FORMAT_VERSION};
pub use record::{DeployedImplementation, HistoryEntry, PendingUpgrade, ProxyKind, ProxyRecord};
pub use registry::{ProxyLease, ProxyRegistry};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
