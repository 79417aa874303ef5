//! First-time proxy deployment
//!
//! Proxies share storage with the code they delegate to, so implementation
//! constructors would initialize the wrong storage. Deployment is therefore
//! two-phase: deploy the code, then deploy the proxy and run the one-time
//! initializer in the proxy's storage within the same transaction.

use crate::cache::LayoutCache;
use crate::error::{TransportError, UpgradeError};
use crate::ledger::{proxy_address, ContractCode, TxStep};
use crate::transport::{Confirmation, Transport};
use crate::validation::ImplementationValidator;
use std::sync::Arc;
use tracing::{info, warn};
use uprox_artifact::{Address, ContentHash, Implementation};
use uprox_registry::{DeployedImplementation, ProxyKind, ProxyRecord, ProxyRegistry};

/// Parameters of a first deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    /// Identity allowed to upgrade the proxy
    pub admin: Address,
    /// Arguments passed to the initializer
    pub init_args: Vec<u8>,
    pub kind: ProxyKind,
    /// Distinguishes proxies deployed by the same account
    pub salt: ContentHash,
}

impl DeployRequest {
    /// UUPS deployment with no initializer arguments
    #[must_use]
    pub fn new(admin: Address) -> Self {
        Self {
            admin,
            init_args: Vec::new(),
            kind: ProxyKind::Uups,
            salt: ContentHash::default(),
        }
    }

    /// With initializer arguments
    #[inline]
    #[must_use]
    pub fn with_init_args(mut self, init_args: Vec<u8>) -> Self {
        self.init_args = init_args;
        self
    }

    /// With proxy kind
    #[inline]
    #[must_use]
    pub fn with_kind(mut self, kind: ProxyKind) -> Self {
        self.kind = kind;
        self
    }

    /// With deployment salt
    #[inline]
    #[must_use]
    pub fn with_salt(mut self, salt: ContentHash) -> Self {
        self.salt = salt;
        self
    }
}

/// Deploys and registers new proxies
#[derive(Debug, Clone)]
pub struct DeploymentInitializer {
    transport: Arc<Transport>,
    registry: Arc<ProxyRegistry>,
    layouts: LayoutCache,
    validator: ImplementationValidator,
}

impl DeploymentInitializer {
    /// Create initializer
    #[must_use]
    pub fn new(
        transport: Arc<Transport>,
        registry: Arc<ProxyRegistry>,
        layouts: LayoutCache,
        validator: ImplementationValidator,
    ) -> Self {
        Self {
            transport,
            registry,
            layouts,
            validator,
        }
    }

    /// Address the proxy for `request` will occupy
    #[must_use]
    pub fn predict_proxy(&self, request: &DeployRequest) -> Address {
        proxy_address(&self.transport.sender(), &request.salt)
    }

    /// Deploy an implementation behind a new proxy and register it
    ///
    /// If the initializer reverts no record is created; implementation code
    /// deployed by the first transaction stays on the ledger unreferenced.
    ///
    /// # Errors
    /// Validation errors come before any ledger call.
    /// [`UpgradeError::Initialization`] if the initializer reverts.
    pub async fn deploy_new(
        &self,
        implementation: &Implementation,
        request: DeployRequest,
    ) -> Result<ProxyRecord, UpgradeError> {
        self.validator
            .validate_for_deploy(implementation, request.kind)?;
        let schema = self.layouts.schema_of(implementation).await?;
        let selector = implementation.initializer().ok_or_else(|| {
            UpgradeError::UnsafeImplementation {
                name: implementation.name().to_string(),
                reasons: vec!["declares no initializer".to_string()],
            }
        })?;
        let proxy = self.predict_proxy(&request);
        if self.registry.contains(&proxy) {
            return Err(UpgradeError::DuplicateProxy { proxy });
        }

        info!(
            contract = implementation.name(),
            implementation = %implementation.hash().short(),
            proxy = %proxy,
            kind = %request.kind,
            "Deploying proxy"
        );

        let ledger = self.transport.ledger();
        if ledger.code_at(&implementation.address()).await?.is_none() {
            let deployed = self
                .transport
                .execute(vec![TxStep::DeployCode {
                    code: ContractCode::of(implementation),
                }])
                .await?;
            if let Confirmation::Unobserved { tx_hash } = deployed {
                return Err(UpgradeError::UncertainOutcome { proxy, tx_hash });
            }
        }

        let steps = vec![
            TxStep::DeployProxy {
                implementation: implementation.address(),
                admin: request.admin,
                kind: request.kind,
                salt: request.salt,
            },
            TxStep::Initialize {
                proxy,
                selector,
                args: request.init_args,
            },
        ];
        match self.transport.execute(steps).await {
            Ok(Confirmation::Mined(_)) => {}
            Ok(Confirmation::Unobserved { tx_hash }) => {
                return Err(UpgradeError::UncertainOutcome { proxy, tx_hash });
            }
            Err(TransportError::Reverted { step: 1, reason, .. }) => {
                warn!(
                    proxy = %proxy,
                    orphaned = %implementation.address(),
                    %reason,
                    "Initializer reverted"
                );
                return Err(UpgradeError::Initialization { proxy, reason });
            }
            Err(e) => return Err(e.into()),
        }

        let record = self.registry.register(
            proxy,
            DeployedImplementation::new(implementation, (*schema).clone()),
            request.admin,
            request.kind,
        )?;
        Ok(record)
    }
}
