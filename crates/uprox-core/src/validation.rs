//! Implementation safety checks
//!
//! Code behind a proxy runs in the proxy's storage, which rules out
//! constructors and, for UUPS proxies, code that cannot perform the next
//! upgrade itself.

use crate::error::UpgradeError;
use uprox_artifact::Implementation;
use uprox_registry::ProxyKind;

/// Checks an implementation before it is deployed behind a proxy
#[derive(Debug, Clone)]
pub struct ImplementationValidator {
    target_version: String,
}

impl ImplementationValidator {
    /// Create validator requiring the given compiler version
    #[must_use]
    pub fn new(target_version: impl Into<String>) -> Self {
        Self {
            target_version: target_version.into(),
        }
    }

    /// Validate a candidate for an existing proxy
    ///
    /// # Errors
    /// Returns [`UpgradeError::UnsafeImplementation`] listing every problem.
    pub fn validate(
        &self,
        implementation: &Implementation,
        kind: ProxyKind,
    ) -> Result<(), UpgradeError> {
        Self::verdict(implementation, self.problems(implementation, kind))
    }

    /// Validate an implementation for a first deployment
    ///
    /// Additionally requires a one-time initializer.
    ///
    /// # Errors
    /// Returns [`UpgradeError::UnsafeImplementation`] listing every problem.
    pub fn validate_for_deploy(
        &self,
        implementation: &Implementation,
        kind: ProxyKind,
    ) -> Result<(), UpgradeError> {
        let mut problems = self.problems(implementation, kind);
        if implementation.initializer().is_none() {
            problems.push("declares no initializer".to_string());
        }
        Self::verdict(implementation, problems)
    }

    fn problems(&self, implementation: &Implementation, kind: ProxyKind) -> Vec<String> {
        let source = implementation.source();
        let mut problems = Vec::new();
        if source.has_constructor {
            problems.push("declares a constructor, which would run outside proxy storage".to_string());
        }
        if kind == ProxyKind::Uups && !source.upgrade_entrypoint {
            problems.push("lacks the UUPS upgrade entrypoint".to_string());
        }
        if source.compiler_version != self.target_version {
            problems.push(format!(
                "compiled with {}, expected {}",
                if source.compiler_version.is_empty() {
                    "an unknown compiler"
                } else {
                    source.compiler_version.as_str()
                },
                self.target_version
            ));
        }
        problems
    }

    fn verdict(implementation: &Implementation, reasons: Vec<String>) -> Result<(), UpgradeError> {
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(UpgradeError::UnsafeImplementation {
                name: implementation.name().to_string(),
                reasons,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uprox_artifact::ContractSource;

    fn source() -> ContractSource {
        ContractSource {
            contract_name: "Box".to_string(),
            bytecode: vec![1],
            compiler_version: "0.8.11".to_string(),
            initializer: Some("initialize".to_string()),
            has_constructor: false,
            upgrade_entrypoint: true,
            storage_layout: None,
        }
    }

    fn reasons(result: Result<(), UpgradeError>) -> Vec<String> {
        match result {
            Err(UpgradeError::UnsafeImplementation { reasons, .. }) => reasons,
            other => panic!("expected unsafe implementation, got {other:?}"),
        }
    }

    #[test]
    fn accepts_well_formed_implementation() {
        let validator = ImplementationValidator::new("0.8.11");
        let implementation = Implementation::new(source()).unwrap();
        assert!(validator.validate_for_deploy(&implementation, ProxyKind::Uups).is_ok());
    }

    #[test]
    fn collects_every_problem() {
        let validator = ImplementationValidator::new("0.8.11");
        let mut bad = source();
        bad.has_constructor = true;
        bad.upgrade_entrypoint = false;
        bad.compiler_version = "0.7.6".to_string();
        bad.initializer = None;
        let implementation = Implementation::new(bad).unwrap();

        assert_eq!(
            reasons(validator.validate(&implementation, ProxyKind::Uups)).len(),
            3
        );
        assert_eq!(
            reasons(validator.validate_for_deploy(&implementation, ProxyKind::Uups)).len(),
            4
        );
    }

    #[test]
    fn transparent_proxies_need_no_entrypoint() {
        let validator = ImplementationValidator::new("0.8.11");
        let mut plain = source();
        plain.upgrade_entrypoint = false;
        let implementation = Implementation::new(plain).unwrap();

        assert!(validator.validate(&implementation, ProxyKind::Transparent).is_ok());
        assert!(validator.validate(&implementation, ProxyKind::Uups).is_err());
    }
}
