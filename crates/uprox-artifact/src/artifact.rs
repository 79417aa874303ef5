//! Contract implementation artifacts
//!
//! An [`Implementation`] is a compiled contract wrapped with its content
//! identity. The identity covers the bytecode and the declared storage
//! layout, so two artifacts with the same hash are interchangeable behind
//! a proxy.

use crate::address::{Address, Selector};
use crate::hash::ContentHash;
use crate::layout::RawStorageLayout;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors related to artifact operations
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// Content invariant violation
    #[error("content invariant violated: {0}")]
    InvariantViolation(String),

    /// Artifact file could not be read
    #[error("cannot read artifact {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Artifact JSON is malformed
    #[error("malformed artifact: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Compiled contract as emitted by the build
///
/// Field names follow the artifact JSON format (`contractName`,
/// `storageLayout`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractSource {
    /// Contract name
    pub contract_name: String,

    /// Deployable bytecode
    #[serde(with = "hex_bytes")]
    pub bytecode: Vec<u8>,

    /// Compiler version the artifact was built with
    #[serde(default)]
    pub compiler_version: String,

    /// One-time initializer function, if any
    #[serde(default)]
    pub initializer: Option<String>,

    /// Whether the contract declares a constructor
    #[serde(default)]
    pub has_constructor: bool,

    /// Whether the contract exposes the UUPS upgrade entrypoint
    #[serde(default)]
    pub upgrade_entrypoint: bool,

    /// Compiler storage layout section
    #[serde(default)]
    pub storage_layout: Option<RawStorageLayout>,
}

/// An implementation: immutable, content-addressed contract code
///
/// # Invariants
/// - `hash` is always the identity of `source`
/// - Immutable after construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Implementation {
    hash: ContentHash,
    source: ContractSource,
}

impl Implementation {
    /// Create an implementation (validates and computes the identity)
    ///
    /// # Errors
    /// Returns [`ArtifactError::InvariantViolation`] for a nameless contract
    /// or empty bytecode.
    pub fn new(source: ContractSource) -> Result<Self, ArtifactError> {
        if source.contract_name.trim().is_empty() {
            return Err(ArtifactError::InvariantViolation(
                "contract name is empty".to_string(),
            ));
        }
        if source.bytecode.is_empty() {
            return Err(ArtifactError::InvariantViolation(format!(
                "`{}` has empty bytecode",
                source.contract_name
            )));
        }
        let hash = Self::identity(&source);
        Ok(Self { hash, source })
    }

    /// Identity covers bytecode and declared layout
    fn identity(source: &ContractSource) -> ContentHash {
        let layout = source
            .storage_layout
            .as_ref()
            .and_then(|l| serde_json::to_vec(l).ok())
            .unwrap_or_default();
        ContentHash::compute_parts(&[b"uprox.implementation", &source.bytecode, &layout])
    }

    /// Content identity
    #[inline]
    #[must_use]
    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    /// Compiled contract the implementation was built from
    #[inline]
    #[must_use]
    pub fn source(&self) -> &ContractSource {
        &self.source
    }

    /// Parse an artifact JSON document
    ///
    /// # Errors
    /// Returns error for malformed JSON or invalid content
    pub fn from_json(json: &str) -> Result<Self, ArtifactError> {
        let source: ContractSource = serde_json::from_str(json)?;
        Self::new(source)
    }

    /// Load an artifact JSON file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ArtifactError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Contract name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.source.contract_name
    }

    /// Deployable bytecode
    #[inline]
    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.source.bytecode
    }

    /// Storage layout metadata, if present
    #[inline]
    #[must_use]
    pub fn storage_layout(&self) -> Option<&RawStorageLayout> {
        self.source.storage_layout.as_ref()
    }

    /// Initializer selector, if the contract declares one
    #[must_use]
    pub fn initializer(&self) -> Option<Selector> {
        self.source.initializer.as_deref().map(Selector::of)
    }

    /// Address the implementation is deployed at
    ///
    /// Code is deployed content-addressed, so the address follows from the
    /// identity and a second deployment of the same artifact is a no-op.
    #[must_use]
    pub fn address(&self) -> Address {
        Address::from_hash(self.hash())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}
