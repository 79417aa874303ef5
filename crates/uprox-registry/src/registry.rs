//! Proxy registry
//!
//! [`ProxyRegistry`] maps proxy addresses to their [`ProxyRecord`]s and hands
//! out per-proxy [`ProxyLease`]s. Every mutation of an existing record takes
//! a lease, so two upgrades of the same proxy can never interleave while
//! upgrades of different proxies proceed in parallel.

use crate::error::RegistryError;
use crate::manifest::Manifest;
use crate::record::{DeployedImplementation, PendingUpgrade, ProxyKind, ProxyRecord};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uprox_artifact::Address;

/// Exclusive right to mutate one proxy's record
///
/// Held from before the upgrade transaction is submitted until its outcome
/// is committed. Dropping the lease releases the proxy.
#[derive(Debug)]
pub struct ProxyLease {
    proxy: Address,
    _guard: OwnedMutexGuard<()>,
}

impl ProxyLease {
    /// Proxy this lease covers
    #[inline]
    #[must_use]
    pub fn proxy(&self) -> &Address {
        &self.proxy
    }
}

/// Registry of deployed proxies
#[derive(Debug, Default)]
pub struct ProxyRegistry {
    records: DashMap<Address, ProxyRecord>,
    locks: DashMap<Address, Arc<Mutex<()>>>,
}

impl ProxyRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a registry from a manifest
    ///
    /// # Errors
    /// Returns [`RegistryError::DuplicateProxy`] if the manifest lists a
    /// proxy twice.
    pub fn from_manifest(manifest: Manifest) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for record in manifest.proxies {
            match registry.records.entry(record.proxy) {
                Entry::Occupied(_) => {
                    return Err(RegistryError::DuplicateProxy {
                        proxy: record.proxy,
                    })
                }
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
            }
        }
        debug!(proxies = registry.len(), "Registry restored from manifest");
        Ok(registry)
    }

    /// Snapshot every record into a manifest
    #[must_use]
    pub fn to_manifest(&self, network: &str) -> Manifest {
        Manifest::new(network, self.snapshot())
    }

    /// Register a newly deployed proxy
    ///
    /// # Errors
    /// Returns [`RegistryError::DuplicateProxy`] if the address is taken.
    pub fn register(
        &self,
        proxy: Address,
        implementation: DeployedImplementation,
        admin: Address,
        kind: ProxyKind,
    ) -> Result<ProxyRecord, RegistryError> {
        match self.records.entry(proxy) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateProxy { proxy }),
            Entry::Vacant(slot) => {
                let record = ProxyRecord::new(proxy, implementation, admin, kind);
                slot.insert(record.clone());
                info!(
                    proxy = %proxy,
                    implementation = %record.current.id.short(),
                    admin = %admin,
                    "Proxy registered"
                );
                Ok(record)
            }
        }
    }

    /// Current record of a proxy
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] for unknown proxies.
    pub fn lookup(&self, proxy: &Address) -> Result<ProxyRecord, RegistryError> {
        self.records
            .get(proxy)
            .map(|r| r.value().clone())
            .ok_or(RegistryError::NotFound { proxy: *proxy })
    }

    /// Check whether a proxy is registered
    #[inline]
    #[must_use]
    pub fn contains(&self, proxy: &Address) -> bool {
        self.records.contains_key(proxy)
    }

    /// Acquire the exclusive lease on a proxy, waiting for any holder
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] for unknown proxies; no lock is
    /// created for them.
    pub async fn lease(&self, proxy: &Address) -> Result<ProxyLease, RegistryError> {
        let lock = self.lock_for(proxy)?;
        let guard = lock.lock_owned().await;
        debug!(proxy = %proxy, "Lease acquired");
        Ok(ProxyLease {
            proxy: *proxy,
            _guard: guard,
        })
    }

    /// Repoint a proxy's record to a new implementation
    ///
    /// Callers must only commit an implementation that passed the
    /// compatibility check and whose switch the ledger has confirmed.
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] for unknown proxies.
    pub fn commit_upgrade(
        &self,
        lease: &ProxyLease,
        implementation: DeployedImplementation,
    ) -> Result<ProxyRecord, RegistryError> {
        let mut record = self.record_mut(lease)?;
        let from = record.current.id;
        record.apply_upgrade(implementation);
        info!(
            proxy = %lease.proxy,
            from = %from.short(),
            to = %record.current.id.short(),
            version = record.version,
            "Upgrade committed"
        );
        Ok(record.clone())
    }

    /// Record an upgrade whose confirmation was not observed
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] for unknown proxies.
    pub fn mark_pending(
        &self,
        lease: &ProxyLease,
        pending: PendingUpgrade,
    ) -> Result<ProxyRecord, RegistryError> {
        let mut record = self.record_mut(lease)?;
        warn!(
            proxy = %lease.proxy,
            tx = %pending.tx_hash.short(),
            candidate = %pending.candidate.id.short(),
            "Upgrade outcome unknown; marked pending"
        );
        record.pending = Some(pending);
        Ok(record.clone())
    }

    /// Drop a pending mark after the ledger showed it never applied
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] for unknown proxies.
    pub fn clear_pending(&self, lease: &ProxyLease) -> Result<ProxyRecord, RegistryError> {
        let mut record = self.record_mut(lease)?;
        if let Some(pending) = record.pending.take() {
            info!(
                proxy = %lease.proxy,
                tx = %pending.tx_hash.short(),
                "Pending upgrade cleared"
            );
        }
        Ok(record.clone())
    }

    /// All records, ordered by proxy address
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProxyRecord> {
        let mut records: Vec<ProxyRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.proxy);
        records
    }

    /// Number of registered proxies
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if no proxy is registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records are never removed, so locks exist only for registered proxies
    fn lock_for(&self, proxy: &Address) -> Result<Arc<Mutex<()>>, RegistryError> {
        if !self.records.contains_key(proxy) {
            return Err(RegistryError::NotFound { proxy: *proxy });
        }
        Ok(self.locks.entry(*proxy).or_default().clone())
    }

    fn record_mut(
        &self,
        lease: &ProxyLease,
    ) -> Result<dashmap::mapref::one::RefMut<'_, Address, ProxyRecord>, RegistryError> {
        self.records
            .get_mut(&lease.proxy)
            .ok_or(RegistryError::NotFound { proxy: lease.proxy })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::timeout;
    use uprox_artifact::{ContentHash, StorageSchema};

    fn deployed(tag: &[u8]) -> DeployedImplementation {
        let id = ContentHash::compute(tag);
        DeployedImplementation {
            id,
            address: Address::from_hash(&id),
            name: "Box".to_string(),
            layout: StorageSchema::default(),
        }
    }

    const PROXY: Address = Address::new([0xaa; 20]);
    const ADMIN: Address = Address::new([0x0a; 20]);

    #[test]
    fn register_then_lookup() {
        let registry = ProxyRegistry::new();
        let record = registry
            .register(PROXY, deployed(b"v1"), ADMIN, ProxyKind::Uups)
            .unwrap();

        assert_eq!(registry.lookup(&PROXY).unwrap(), record);
        assert!(registry.contains(&PROXY));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = ProxyRegistry::new();
        registry
            .register(PROXY, deployed(b"v1"), ADMIN, ProxyKind::Uups)
            .unwrap();
        let result = registry.register(PROXY, deployed(b"v2"), ADMIN, ProxyKind::Uups);

        assert!(matches!(result, Err(RegistryError::DuplicateProxy { .. })));
        assert!(registry.lookup(&PROXY).unwrap().is_current(&ContentHash::compute(b"v1")));
    }

    #[test]
    fn lookup_unknown_fails() {
        let registry = ProxyRegistry::new();
        assert!(matches!(
            registry.lookup(&PROXY),
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_proxy_cannot_be_leased() {
        let registry = ProxyRegistry::new();
        assert!(matches!(
            registry.lease(&PROXY).await,
            Err(RegistryError::NotFound { .. })
        ));
        assert!(registry.locks.is_empty());
    }

    #[tokio::test]
    async fn lease_is_exclusive_per_proxy() {
        let registry = ProxyRegistry::new();
        let other = Address::new([0xbb; 20]);
        for proxy in [PROXY, other] {
            registry
                .register(proxy, deployed(b"v1"), ADMIN, ProxyKind::Uups)
                .unwrap();
        }
        let wait = Duration::from_millis(20);

        let held = registry.lease(&PROXY).await.unwrap();
        assert!(timeout(wait, registry.lease(&PROXY)).await.is_err());
        assert!(timeout(wait, registry.lease(&other)).await.is_ok());

        drop(held);
        assert!(timeout(wait, registry.lease(&PROXY)).await.is_ok());
    }

    #[tokio::test]
    async fn pending_mark_round_trip() {
        let registry = ProxyRegistry::new();
        registry
            .register(PROXY, deployed(b"v1"), ADMIN, ProxyKind::Uups)
            .unwrap();
        let lease = registry.lease(&PROXY).await.unwrap();

        let marked = registry
            .mark_pending(
                &lease,
                PendingUpgrade {
                    tx_hash: ContentHash::compute(b"tx"),
                    candidate: deployed(b"v2"),
                    submitted_at: Utc::now(),
                },
            )
            .unwrap();
        assert!(marked.is_pending());

        let cleared = registry.clear_pending(&lease).unwrap();
        assert!(!cleared.is_pending());
        assert_eq!(cleared.version, 1);
    }

    #[tokio::test]
    async fn commit_clears_pending() {
        let registry = ProxyRegistry::new();
        registry
            .register(PROXY, deployed(b"v1"), ADMIN, ProxyKind::Uups)
            .unwrap();
        let lease = registry.lease(&PROXY).await.unwrap();
        registry
            .mark_pending(
                &lease,
                PendingUpgrade {
                    tx_hash: ContentHash::compute(b"tx"),
                    candidate: deployed(b"v2"),
                    submitted_at: Utc::now(),
                },
            )
            .unwrap();

        let record = registry.commit_upgrade(&lease, deployed(b"v2")).unwrap();
        assert!(!record.is_pending());
        assert_eq!(record.version, 2);
        assert_eq!(record.history.len(), 2);
    }
}
