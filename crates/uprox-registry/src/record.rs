//! Proxy records
//!
//! A [`ProxyRecord`] is the registry's view of one upgradeable contract: its
//! permanent address, who may upgrade it, and which implementation it
//! currently delegates to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use uprox_artifact::{Address, ContentHash, Implementation, StorageSchema};

/// Upgrade pattern of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// Upgrade logic lives in the implementation
    #[default]
    Uups,
    /// Upgrade logic lives in the proxy, callable by its admin only
    Transparent,
}

impl Display for ProxyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uups => "uups",
            Self::Transparent => "transparent",
        })
    }
}

impl FromStr for ProxyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uups" => Ok(Self::Uups),
            "transparent" => Ok(Self::Transparent),
            other => Err(format!("unknown proxy kind `{other}`")),
        }
    }
}

/// An implementation as recorded against a proxy
///
/// Keeps the analyzed schema so later upgrades can be checked without the
/// original artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedImplementation {
    /// Content identity of the implementation
    pub id: ContentHash,
    /// Ledger address of the deployed code
    pub address: Address,
    /// Contract name
    pub name: String,
    /// Storage schema the implementation expects
    pub layout: StorageSchema,
}

impl DeployedImplementation {
    /// Record an implementation with its analyzed schema
    #[must_use]
    pub fn new(implementation: &Implementation, layout: StorageSchema) -> Self {
        Self {
            id: *implementation.hash(),
            address: implementation.address(),
            name: implementation.name().to_string(),
            layout,
        }
    }
}

/// One entry in a proxy's implementation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub implementation: ContentHash,
    pub address: Address,
    pub committed_at: DateTime<Utc>,
}

/// An upgrade submitted to the ledger whose outcome was not observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpgrade {
    /// Transaction that may have repointed the proxy
    pub tx_hash: ContentHash,
    /// Implementation the transaction targets
    pub candidate: DeployedImplementation,
    pub submitted_at: DateTime<Utc>,
}

/// Registry record for one proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRecord {
    /// Permanent proxy address
    pub proxy: Address,
    /// Identity authorized to upgrade
    pub admin: Address,
    pub kind: ProxyKind,
    /// Whether the one-time initializer has run
    pub initialized: bool,
    /// Implementation the proxy delegates to
    pub current: DeployedImplementation,
    /// Starts at 1 and increases by one per committed upgrade
    pub version: u64,
    /// Every implementation the proxy has pointed at, oldest first
    pub history: Vec<HistoryEntry>,
    /// Unreconciled upgrade, if a confirmation wait timed out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingUpgrade>,
}

impl ProxyRecord {
    /// Record for a freshly deployed and initialized proxy
    #[must_use]
    pub fn new(
        proxy: Address,
        current: DeployedImplementation,
        admin: Address,
        kind: ProxyKind,
    ) -> Self {
        let history = vec![HistoryEntry {
            implementation: current.id,
            address: current.address,
            committed_at: Utc::now(),
        }];
        Self {
            proxy,
            admin,
            kind,
            initialized: true,
            current,
            version: 1,
            history,
            pending: None,
        }
    }

    /// Whether `id` is the live implementation
    #[inline]
    #[must_use]
    pub fn is_current(&self, id: &ContentHash) -> bool {
        &self.current.id == id
    }

    /// Whether the proxy pointed at `id` before the current implementation
    #[must_use]
    pub fn was_superseded(&self, id: &ContentHash) -> bool {
        !self.is_current(id) && self.history.iter().any(|h| &h.implementation == id)
    }

    /// Whether an upgrade awaits reconciliation
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn apply_upgrade(&mut self, new: DeployedImplementation) {
        self.history.push(HistoryEntry {
            implementation: new.id,
            address: new.address,
            committed_at: Utc::now(),
        });
        self.current = new;
        self.version += 1;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployed(tag: &[u8]) -> DeployedImplementation {
        let id = ContentHash::compute(tag);
        DeployedImplementation {
            id,
            address: Address::from_hash(&id),
            name: "Box".to_string(),
            layout: StorageSchema::default(),
        }
    }

    #[test]
    fn new_record_is_initialized_version_one() {
        let record = ProxyRecord::new(
            Address::new([1; 20]),
            deployed(b"v1"),
            Address::new([2; 20]),
            ProxyKind::Uups,
        );
        assert!(record.initialized);
        assert_eq!(record.version, 1);
        assert_eq!(record.history.len(), 1);
        assert!(record.is_current(&ContentHash::compute(b"v1")));
    }

    #[test]
    fn upgrade_extends_history() {
        let mut record = ProxyRecord::new(
            Address::new([1; 20]),
            deployed(b"v1"),
            Address::new([2; 20]),
            ProxyKind::Transparent,
        );
        record.apply_upgrade(deployed(b"v2"));

        assert_eq!(record.version, 2);
        assert!(record.is_current(&ContentHash::compute(b"v2")));
        assert!(record.was_superseded(&ContentHash::compute(b"v1")));
        assert!(!record.was_superseded(&ContentHash::compute(b"v2")));
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("UUPS".parse::<ProxyKind>().unwrap(), ProxyKind::Uups);
        assert_eq!(
            "transparent".parse::<ProxyKind>().unwrap(),
            ProxyKind::Transparent
        );
        assert!("beacon".parse::<ProxyKind>().is_err());
    }
}
