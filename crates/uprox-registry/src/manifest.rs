//! Registry manifest persistence
//!
//! A manifest is the JSON snapshot of every proxy deployed on one network.
//! It is rewritten atomically (temp file, then rename) so a crash never
//! leaves a truncated manifest behind.

use crate::error::RegistryError;
use crate::record::ProxyRecord;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Current manifest format
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Persisted registry snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub format_version: u32,
    /// Network the proxies live on
    pub network: String,
    pub proxies: Vec<ProxyRecord>,
}

impl Manifest {
    /// Create manifest at the current format version
    #[must_use]
    pub fn new(network: &str, proxies: Vec<ProxyRecord>) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            network: network.to_string(),
            proxies,
        }
    }

    /// Load a manifest, or an empty one if the file does not exist
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed, or was
    /// written in another format version.
    pub fn load_or_default(path: &Path, network: &str) -> Result<Self, RegistryError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new(network, Vec::new()))
        }
    }

    /// Load a manifest file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed, or was written in
    /// another format version.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let bytes = std::fs::read(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let manifest: Self = serde_json::from_slice(&bytes)?;
        if manifest.format_version != MANIFEST_FORMAT_VERSION {
            return Err(RegistryError::UnsupportedFormat {
                found: manifest.format_version,
                expected: MANIFEST_FORMAT_VERSION,
            });
        }
        debug!(path = %path.display(), proxies = manifest.proxies.len(), "Manifest loaded");
        Ok(manifest)
    }

    /// Atomically write the manifest
    ///
    /// # Errors
    /// Returns error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), RegistryError> {
        let io_err = |source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        };
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(io_err)?;

        let json = serde_json::to_vec_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;

        debug!(path = %path.display(), proxies = self.proxies.len(), "Manifest saved");
        Ok(())
    }
}
