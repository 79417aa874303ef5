//! Registry errors

use uprox_artifact::Address;

/// Errors raised by the proxy registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Proxy address already registered
    #[error("proxy {proxy} is already registered")]
    DuplicateProxy { proxy: Address },

    /// Proxy address not registered
    #[error("proxy {proxy} is not registered")]
    NotFound { proxy: Address },

    /// Manifest file could not be read or written
    #[error("manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Manifest contents are malformed
    #[error("malformed manifest: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Manifest written by an incompatible tool version
    #[error("unsupported manifest format version {found} (expected {expected})")]
    UnsupportedFormat { found: u32, expected: u32 },
}
