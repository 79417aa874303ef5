//! Runtime configuration
//!
//! [`UproxConfig`] is read once at process start, from a TOML file with
//! `UPROX_*` environment overrides, validated, and never changed afterwards.

use crate::signer::KeySigner;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the endpoint
pub const ENV_ENDPOINT: &str = "UPROX_ENDPOINT";
/// Environment variable overriding the signing key
pub const ENV_SIGNING_KEY: &str = "UPROX_SIGNING_KEY";
/// Environment variable overriding the gas ceiling
pub const ENV_GAS_CEILING: &str = "UPROX_GAS_CEILING";
/// Environment variable overriding the target compiler version
pub const ENV_TARGET_VERSION: &str = "UPROX_TARGET_VERSION";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field holds an unusable value
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Ledger endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Ephemeral in-process ledger
    Memory,
    /// In-process ledger persisted to a JSON state file
    File(PathBuf),
}

impl Endpoint {
    /// Parse an endpoint URL
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] for unsupported schemes.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        if url == "memory://" || url == "memory" {
            return Ok(Self::Memory);
        }
        match url.strip_prefix("file://") {
            Some(path) if !path.is_empty() => Ok(Self::File(PathBuf::from(path))),
            _ => Err(ConfigError::Invalid {
                field: "endpoint",
                reason: format!("unsupported endpoint `{url}` (expected memory:// or file://<path>)"),
            }),
        }
    }
}

/// Process-wide configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UproxConfig {
    /// Network name, used as the manifest key
    pub network: String,
    /// Ledger endpoint URL
    pub endpoint: String,
    /// Hex-encoded 32-byte ed25519 seed
    pub signing_key: String,
    /// Upper bound on gas for any single transaction
    pub gas_ceiling: u64,
    /// Compiler version every artifact must have been built with
    pub target_version: String,
    /// How long to wait for a receipt before reporting an uncertain outcome
    pub confirmation_timeout_secs: u64,
    /// Registry manifest location
    pub manifest_path: PathBuf,
    /// Maximum number of cached storage schemas
    pub layout_cache_capacity: u64,
}

impl Default for UproxConfig {
    fn default() -> Self {
        Self {
            network: "local".to_string(),
            endpoint: "memory://".to_string(),
            signing_key: String::new(),
            gas_ceiling: 10_000_000,
            target_version: "0.8.11".to_string(),
            confirmation_timeout_secs: 60,
            manifest_path: PathBuf::from(".uprox/local.json"),
            layout_cache_capacity: 256,
        }
    }
}

// The signing key never reaches logs.
impl fmt::Debug for UproxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UproxConfig")
            .field("network", &self.network)
            .field("endpoint", &self.endpoint)
            .field("signing_key", &"<redacted>")
            .field("gas_ceiling", &self.gas_ceiling)
            .field("target_version", &self.target_version)
            .field("confirmation_timeout_secs", &self.confirmation_timeout_secs)
            .field("manifest_path", &self.manifest_path)
            .field("layout_cache_capacity", &self.layout_cache_capacity)
            .finish()
    }
}

impl UproxConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With signing key (hex seed)
    #[inline]
    #[must_use]
    pub fn with_signing_key(mut self, hex_seed: impl Into<String>) -> Self {
        self.signing_key = hex_seed.into();
        self
    }

    /// With endpoint URL
    #[inline]
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// With gas ceiling
    #[inline]
    #[must_use]
    pub fn with_gas_ceiling(mut self, gas_ceiling: u64) -> Self {
        self.gas_ceiling = gas_ceiling;
        self
    }

    /// With confirmation timeout in seconds
    #[inline]
    #[must_use]
    pub fn with_confirmation_timeout_secs(mut self, secs: u64) -> Self {
        self.confirmation_timeout_secs = secs;
        self
    }

    /// Parse from TOML text
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from an optional file plus the process environment, then validate
    ///
    /// # Errors
    /// Returns error if the file cannot be read or any value is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        let config = config.with_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `UPROX_*` overrides from a variable lookup
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] if a numeric override does not parse.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            self.endpoint = endpoint;
        }
        if let Some(key) = lookup(ENV_SIGNING_KEY) {
            self.signing_key = key;
        }
        if let Some(ceiling) = lookup(ENV_GAS_CEILING) {
            self.gas_ceiling = ceiling.trim().parse().map_err(|e| ConfigError::Invalid {
                field: "gas_ceiling",
                reason: format!("{ENV_GAS_CEILING}: {e}"),
            })?;
        }
        if let Some(version) = lookup(ENV_TARGET_VERSION) {
            self.target_version = version;
        }
        Ok(self)
    }

    /// Check every field
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.trim().is_empty() {
            return Err(invalid("network", "must not be empty"));
        }
        self.endpoint()?;
        self.signer()?;
        if self.gas_ceiling == 0 {
            return Err(invalid("gas_ceiling", "must be positive"));
        }
        if self.target_version.trim().is_empty() {
            return Err(invalid("target_version", "must not be empty"));
        }
        if self.confirmation_timeout_secs == 0 {
            return Err(invalid("confirmation_timeout_secs", "must be positive"));
        }
        if self.layout_cache_capacity == 0 {
            return Err(invalid("layout_cache_capacity", "must be positive"));
        }
        Ok(())
    }

    /// Parsed endpoint
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] for unsupported schemes.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        Endpoint::parse(&self.endpoint)
    }

    /// Signer for the configured key
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] unless the key is 32 hex bytes.
    pub fn signer(&self) -> Result<KeySigner, ConfigError> {
        KeySigner::from_hex(&self.signing_key)
    }

    /// Confirmation timeout
    #[inline]
    #[must_use]
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    #[test]
    fn parses_toml_with_defaults() {
        let config = UproxConfig::from_toml_str(&format!(
            r#"
            network = "staging"
            endpoint = "file:///tmp/ledger.json"
            signing_key = "{KEY}"
            gas_ceiling = 500000
            "#
        ))
        .unwrap();

        assert_eq!(config.network, "staging");
        assert_eq!(config.gas_ceiling, 500_000);
        assert_eq!(config.confirmation_timeout_secs, 60);
        assert_eq!(
            config.endpoint().unwrap(),
            Endpoint::File(PathBuf::from("/tmp/ledger.json"))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(matches!(
            UproxConfig::from_toml_str("gas_limit = 5"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn environment_overrides_file() {
        let config = UproxConfig::new()
            .with_overrides(|key| match key {
                ENV_GAS_CEILING => Some("42".to_string()),
                ENV_SIGNING_KEY => Some(KEY.to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.gas_ceiling, 42);
        assert_eq!(config.signing_key, KEY);

        let bad = UproxConfig::new().with_overrides(|key| {
            (key == ENV_GAS_CEILING).then(|| "lots".to_string())
        });
        assert!(matches!(
            bad,
            Err(ConfigError::Invalid {
                field: "gas_ceiling",
                ..
            })
        ));
    }

    #[test]
    fn rejects_network_endpoints() {
        assert!(Endpoint::parse("https://rpc.example.org").is_err());
        assert!(Endpoint::parse("file://").is_err());
        assert_eq!(Endpoint::parse("memory://").unwrap(), Endpoint::Memory);
    }

    #[test]
    fn validation_requires_signing_key() {
        let err = UproxConfig::new().validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "signing_key",
                ..
            }
        ));
    }

    #[test]
    fn debug_redacts_key() {
        let config = UproxConfig::new().with_signing_key(KEY);
        let rendered = format!("{config:?}");
        assert!(!rendered.contains(KEY));
        assert!(rendered.contains("<redacted>"));
    }
}
