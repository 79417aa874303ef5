//! Error types for uprox Core
//!
//! [`UpgradeError`] is what deployment and upgrade operations return. Each
//! variant is one failure kind with a stable name and process exit code.
//!
//! Validation failures (schema, authorization, duplicate, unsafe or
//! incompatible implementation) are raised before any ledger mutation.
//! [`UpgradeError::UncertainOutcome`] is the one failure after which the
//! ledger may have changed: callers must reconcile before retrying.

use uprox_artifact::{Address, ArtifactError, ContentHash, LayoutError};
use uprox_compat::SchemaViolation;
use uprox_registry::RegistryError;

/// Ledger-side failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Endpoint cannot be reached
    #[error("ledger unreachable: {0}")]
    Unreachable(String),

    /// Transaction refused before execution (bad nonce, signature or gas)
    #[error("transaction rejected: {reason}")]
    Rejected { reason: String },

    /// Ledger has never seen this transaction
    #[error("unknown transaction {tx_hash}")]
    UnknownTransaction { tx_hash: ContentHash },

    /// Read-only call failed
    #[error("call to {address} failed: {reason}")]
    CallFailed { address: Address, reason: String },

    /// Ledger state could not be persisted or restored
    #[error("ledger persistence failed: {0}")]
    Persistence(String),
}

/// Failures while getting a transaction onto the ledger
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Ledger refused or could not be reached
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Transaction could not be signed
    #[error("signing failed: {0}")]
    Signing(String),

    /// Estimated gas exceeds the configured ceiling
    #[error("transaction needs {required} gas, ceiling is {ceiling}")]
    GasCeilingExceeded { required: u64, ceiling: u64 },

    /// Transaction executed and reverted
    #[error("transaction {tx_hash} reverted at step {step}: {reason}")]
    Reverted {
        tx_hash: ContentHash,
        step: usize,
        reason: String,
    },
}

/// Deployment and upgrade failures
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    /// Storage layout metadata missing or malformed
    #[error("schema extraction failed: {0}")]
    SchemaExtraction(#[from] LayoutError),

    /// Proxy address already registered
    #[error("proxy {proxy} is already registered")]
    DuplicateProxy { proxy: Address },

    /// Proxy address not registered
    #[error("proxy {proxy} is not registered")]
    NotFound { proxy: Address },

    /// Caller is not the proxy's admin
    #[error("{caller} is not the admin of proxy {proxy}")]
    Unauthorized { proxy: Address, caller: Address },

    /// Candidate would corrupt existing storage
    #[error("upgrade of {proxy} is incompatible: {} storage violation(s)", violations.len())]
    IncompatibleUpgrade {
        proxy: Address,
        violations: Vec<SchemaViolation>,
    },

    /// Initializer reverted during first deployment
    #[error("initializer of proxy {proxy} reverted: {reason}")]
    Initialization { proxy: Address, reason: String },

    /// Transaction submitted but its outcome was not observed in time
    #[error("outcome of transaction {tx_hash} for {proxy} is unknown; reconcile before retrying")]
    UncertainOutcome { proxy: Address, tx_hash: ContentHash },

    /// Ledger or signing failure before confirmation
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// Implementation must not sit behind a proxy
    #[error("implementation `{name}` is unsafe: {}", reasons.join("; "))]
    UnsafeImplementation { name: String, reasons: Vec<String> },

    /// Candidate was already superseded on this proxy
    #[error("{implementation} was already replaced on proxy {proxy}; refusing to downgrade")]
    Downgrade {
        proxy: Address,
        implementation: ContentHash,
    },

    /// Ledger points the proxy somewhere the registry does not expect
    #[error("proxy {proxy} points at {observed} on the ledger, registry expects {expected}")]
    LedgerDivergence {
        proxy: Address,
        expected: Address,
        observed: Address,
    },

    /// Artifact could not be loaded
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// Registry persistence failure
    #[error("registry error: {0}")]
    Registry(RegistryError),
}

impl UpgradeError {
    /// Stable name of the failure kind
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SchemaExtraction(_) => "SchemaExtractionError",
            Self::DuplicateProxy { .. } => "DuplicateProxyError",
            Self::NotFound { .. } => "NotFoundError",
            Self::Unauthorized { .. } => "UnauthorizedError",
            Self::IncompatibleUpgrade { .. } => "IncompatibleUpgradeError",
            Self::Initialization { .. } => "InitializationError",
            Self::UncertainOutcome { .. } => "UncertainOutcomeError",
            Self::Transport(_) => "TransportError",
            Self::UnsafeImplementation { .. } => "UnsafeImplementationError",
            Self::Downgrade { .. } => "DowngradeError",
            Self::LedgerDivergence { .. } => "LedgerDivergenceError",
            Self::Artifact(_) => "ArtifactError",
            Self::Registry(_) => "RegistryError",
        }
    }

    /// Process exit code for this failure kind (never 0)
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SchemaExtraction(_) => 10,
            Self::DuplicateProxy { .. } => 11,
            Self::NotFound { .. } => 12,
            Self::Unauthorized { .. } => 13,
            Self::IncompatibleUpgrade { .. } => 14,
            Self::Initialization { .. } => 15,
            Self::UncertainOutcome { .. } => 16,
            Self::Transport(_) => 17,
            Self::UnsafeImplementation { .. } => 18,
            Self::Downgrade { .. } => 19,
            Self::LedgerDivergence { .. } => 20,
            Self::Artifact(_) => 21,
            Self::Registry(_) => 22,
        }
    }

    /// Check if the same call may simply be retried
    ///
    /// Only transport failures qualify. An uncertain outcome must be
    /// reconciled first; validation failures need different input.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Check if the ledger may have changed without the registry knowing
    #[inline]
    #[must_use]
    pub fn needs_reconciliation(&self) -> bool {
        matches!(
            self,
            Self::UncertainOutcome { .. } | Self::LedgerDivergence { .. }
        )
    }

    /// Violations behind an incompatible upgrade
    #[must_use]
    pub fn violations(&self) -> &[SchemaViolation] {
        match self {
            Self::IncompatibleUpgrade { violations, .. } => violations,
            _ => &[],
        }
    }
}

impl From<RegistryError> for UpgradeError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::DuplicateProxy { proxy } => Self::DuplicateProxy { proxy },
            RegistryError::NotFound { proxy } => Self::NotFound { proxy },
            other => Self::Registry(other),
        }
    }
}

impl From<LedgerError> for UpgradeError {
    fn from(error: LedgerError) -> Self {
        Self::Transport(TransportError::Ledger(error))
    }
}
