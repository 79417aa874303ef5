//! Subcommand implementations
//!
//! Every command opens a [`Session`]: configuration, ledger connection and
//! the registry restored from the manifest. Commands that may touch the
//! registry write the manifest back, failed ones included, so a pending
//! upgrade mark survives the process.

use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uprox_artifact::{Address, ContentHash, Implementation, LayoutAnalyzer};
use uprox_compat::{CompatibilityChecker, SchemaViolation};
use uprox_core::{
    DeployRequest, DeploymentInitializer, Endpoint, ImplementationValidator, LayoutCache,
    LocalLedger, Reconciliation, Signer, Transport, UpgradeError, UpgradeOrchestrator,
    UpgradeResult, UproxConfig,
};
use uprox_registry::{Manifest, ProxyKind, ProxyRecord, ProxyRegistry};

/// Offline layout check found violations
#[derive(Debug, thiserror::Error)]
#[error("layouts are incompatible: {} storage violation(s)", violations.len())]
pub(crate) struct IncompatibleLayouts {
    pub(crate) violations: Vec<SchemaViolation>,
}

/// Arguments of `uprox deploy`
#[derive(Debug, Clone)]
pub(crate) struct DeployArgs {
    pub(crate) artifact: PathBuf,
    pub(crate) init_args: Vec<u8>,
    pub(crate) admin: Option<Address>,
    pub(crate) kind: ProxyKind,
    pub(crate) salt: Option<String>,
}

/// Wired-up components for one CLI invocation
pub(crate) struct Session {
    config: Arc<UproxConfig>,
    registry: Arc<ProxyRegistry>,
    deployer: DeploymentInitializer,
    orchestrator: UpgradeOrchestrator,
    sender: Address,
}

impl Session {
    pub(crate) fn open(config: UproxConfig) -> Result<Self> {
        let config = Arc::new(config);
        let endpoint = config.endpoint()?;
        let ledger = LocalLedger::connect(&endpoint).context("cannot open ledger")?;
        let signer = config.signer()?;
        let sender = signer.address();

        let manifest = Manifest::load_or_default(&config.manifest_path, &config.network)
            .with_context(|| format!("cannot load {}", config.manifest_path.display()))?;
        if manifest.network != config.network {
            bail!(
                "manifest {} belongs to network `{}`, not `{}`",
                config.manifest_path.display(),
                manifest.network,
                config.network
            );
        }
        if endpoint == Endpoint::Memory && !manifest.proxies.is_empty() {
            warn!(
                proxies = manifest.proxies.len(),
                "Manifest lists proxies but the in-memory ledger starts empty"
            );
        }
        let registry = Arc::new(ProxyRegistry::from_manifest(manifest)?);

        let transport = Arc::new(Transport::new(
            Arc::new(ledger),
            Arc::new(signer),
            config.gas_ceiling,
            config.confirmation_timeout(),
        ));
        let layouts = LayoutCache::new(config.layout_cache_capacity);
        let validator = ImplementationValidator::new(config.target_version.clone());
        info!(network = %config.network, sender = %sender, "Session opened");

        Ok(Self {
            deployer: DeploymentInitializer::new(
                Arc::clone(&transport),
                Arc::clone(&registry),
                layouts.clone(),
                validator.clone(),
            ),
            orchestrator: UpgradeOrchestrator::new(
                transport,
                Arc::clone(&registry),
                layouts,
                validator,
            ),
            config,
            registry,
            sender,
        })
    }

    fn save(&self) -> Result<()> {
        let path = &self.config.manifest_path;
        self.registry
            .to_manifest(&self.config.network)
            .save(path)
            .with_context(|| format!("cannot write {}", path.display()))
    }

    /// Finish a registry-touching command: persist, then surface its outcome
    fn settle<T>(&self, outcome: Result<T, UpgradeError>) -> Result<T> {
        self.save()?;
        Ok(outcome?)
    }

    pub(crate) async fn deploy(&self, args: DeployArgs) -> Result<ProxyRecord> {
        let implementation = load_artifact(&args.artifact)?;
        let mut request = DeployRequest::new(args.admin.unwrap_or(self.sender))
            .with_kind(args.kind)
            .with_init_args(args.init_args);
        if let Some(salt) = args.salt {
            request = request.with_salt(ContentHash::compute(salt.as_bytes()));
        }
        let outcome = self.deployer.deploy_new(&implementation, request).await;
        self.settle(outcome)
    }

    pub(crate) async fn upgrade(
        &self,
        proxy: &Address,
        artifact: &Path,
    ) -> Result<UpgradeResult> {
        let candidate = load_artifact(artifact)?;
        let outcome = self.orchestrator.upgrade(proxy, &candidate, &self.sender).await;
        self.settle(outcome)
    }

    pub(crate) async fn status(&self, proxy: &Address) -> Result<ProxyRecord> {
        let outcome = self.orchestrator.lookup(proxy).await;
        self.settle(outcome)
    }

    pub(crate) async fn reconcile(&self, proxy: &Address) -> Result<Reconciliation> {
        let outcome = self.orchestrator.reconcile(proxy).await;
        self.settle(outcome)
    }
}

fn load_artifact(path: &Path) -> Result<Implementation> {
    Ok(Implementation::from_file(path).map_err(UpgradeError::from)?)
}

/// Compare the layouts of two artifacts without touching any ledger
pub(crate) fn check(old: &Path, new: &Path) -> Result<usize> {
    let analyzer = LayoutAnalyzer::new();
    let old_schema = analyzer
        .analyze(&load_artifact(old)?)
        .map_err(UpgradeError::from)?;
    let new_schema = analyzer
        .analyze(&load_artifact(new)?)
        .map_err(UpgradeError::from)?;
    let verdict = CompatibilityChecker::new().check(&old_schema, &new_schema);
    if !verdict.is_safe() {
        return Err(IncompatibleLayouts {
            violations: verdict.violations,
        }
        .into());
    }
    Ok(new_schema.len() - old_schema.len().min(new_schema.len()))
}

/// Parse hex with or without a `0x` prefix
pub(crate) fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits = text.strip_prefix("0x").unwrap_or(text);
    hex::decode(digits).with_context(|| format!("`{text}` is not hex"))
}

fn required<'a, T>(args: &'a ArgMatches, id: &str) -> Result<&'a T>
where
    T: Clone + Send + Sync + 'static,
{
    args.get_one::<T>(id)
        .with_context(|| format!("missing argument `{id}`"))
}

/// Dispatch a parsed command line
pub(crate) async fn run(matches: &ArgMatches) -> Result<()> {
    let config_path = matches.get_one::<PathBuf>("config");

    if let Some(("check", args)) = matches.subcommand() {
        let appended = check(
            required::<PathBuf>(args, "old")?,
            required::<PathBuf>(args, "new")?,
        )?;
        println!("Layouts are compatible ({appended} appended variable(s))");
        return Ok(());
    }

    let config = UproxConfig::load(config_path.map(PathBuf::as_path))
        .context("cannot load configuration")?;
    let session = Session::open(config)?;

    match matches.subcommand() {
        Some(("deploy", args)) => {
            let init_args = match args.get_one::<String>("init-args") {
                Some(text) => parse_hex(text)?,
                None => Vec::new(),
            };
            let record = session
                .deploy(DeployArgs {
                    artifact: required::<PathBuf>(args, "artifact")?.clone(),
                    init_args,
                    admin: args.get_one::<Address>("admin").copied(),
                    kind: *required::<ProxyKind>(args, "kind")?,
                    salt: args.get_one::<String>("salt").cloned(),
                })
                .await?;
            println!(
                "Deployed {} behind {} proxy {}",
                record.current.name, record.kind, record.proxy
            );
            println!("  implementation: {}", record.current.address);
            println!("  admin:          {}", record.admin);
        }
        Some(("upgrade", args)) => {
            let proxy = required::<Address>(args, "proxy")?;
            let result = session
                .upgrade(proxy, required::<PathBuf>(args, "artifact")?)
                .await?;
            if result.already_current {
                println!(
                    "Proxy {} already runs {}; nothing to do",
                    result.proxy, result.new_implementation_address
                );
            } else {
                println!(
                    "Upgraded proxy {} to {} (version {})",
                    result.proxy, result.new_implementation_address, result.version
                );
            }
        }
        Some(("status", args)) => {
            let record = session.status(required::<Address>(args, "proxy")?).await?;
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_record(&record);
            }
        }
        Some(("reconcile", args)) => {
            let reconciled = session
                .reconcile(required::<Address>(args, "proxy")?)
                .await?;
            let record = reconciled.record();
            match &reconciled {
                Reconciliation::InSync(_) => println!("Proxy {} is in sync", record.proxy),
                Reconciliation::Committed(_) => println!(
                    "Pending upgrade of {} applied; now at version {}",
                    record.proxy, record.version
                ),
                Reconciliation::Cleared(_) => println!(
                    "Pending upgrade of {} never applied; mark cleared",
                    record.proxy
                ),
            }
        }
        _ => bail!("no command given; see `uprox --help`"),
    }
    Ok(())
}

fn print_record(record: &ProxyRecord) {
    println!("Proxy {} ({})", record.proxy, record.kind);
    println!("  admin:          {}", record.admin);
    println!(
        "  implementation: {} {} ({})",
        record.current.name,
        record.current.address,
        record.current.id.short()
    );
    println!("  version:        {}", record.version);
    println!("  storage slots:  {}", record.current.layout.slots_used());
    if let Some(pending) = &record.pending {
        println!(
            "  pending:        {} via {} (unresolved)",
            pending.candidate.address,
            pending.tx_hash.short()
        );
    }
    for entry in &record.history {
        println!(
            "  - {} {}",
            entry.committed_at.format("%Y-%m-%d %H:%M:%S"),
            entry.address
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uprox_test_utils::ArtifactBuilder;

    const KEY: &str = "0707070707070707070707070707070707070707070707070707070707070707";

    fn write_artifact(dir: &Path, file: &str, builder: ArtifactBuilder) -> PathBuf {
        let path = dir.join(file);
        std::fs::write(&path, serde_json::to_string(&builder.source()).unwrap()).unwrap();
        path
    }

    fn box_builder(revision: &str, vars: &[(&str, &str)]) -> ArtifactBuilder {
        vars.iter().fold(
            ArtifactBuilder::new("Box").revision(revision),
            |builder, (label, type_id)| builder.var(label, type_id),
        )
    }

    fn config(dir: &Path) -> UproxConfig {
        let mut config = UproxConfig::new()
            .with_signing_key(KEY)
            .with_endpoint(format!("file://{}", dir.join("ledger.json").display()))
            .with_confirmation_timeout_secs(1);
        config.manifest_path = dir.join("manifest.json");
        config
    }

    #[test]
    fn parses_prefixed_and_bare_hex() {
        assert_eq!(parse_hex("0x0102").unwrap(), vec![1, 2]);
        assert_eq!(parse_hex("ff").unwrap(), vec![255]);
        assert!(parse_hex("0xzz").is_err());
    }

    #[test]
    fn offline_check_reports_violations() {
        let dir = tempfile::tempdir().unwrap();
        let v1 = write_artifact(dir.path(), "v1.json", box_builder("", &[("value", "t_uint256")]));
        let v2 = write_artifact(
            dir.path(),
            "v2.json",
            box_builder("v2", &[("value", "t_uint256"), ("owner", "t_address")]),
        );
        let bad = write_artifact(
            dir.path(),
            "bad.json",
            box_builder("bad", &[("value", "t_address")]),
        );

        assert_eq!(check(&v1, &v2).unwrap(), 1);
        let err = check(&v1, &bad).unwrap_err();
        let incompatible = err.downcast_ref::<IncompatibleLayouts>().unwrap();
        assert_eq!(incompatible.violations[0].slot, 0);
    }

    #[tokio::test]
    async fn state_carries_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let v1 = write_artifact(dir.path(), "v1.json", box_builder("", &[("value", "t_uint256")]));
        let v2 = write_artifact(
            dir.path(),
            "v2.json",
            box_builder("v2", &[("value", "t_uint256"), ("owner", "t_address")]),
        );

        let proxy = {
            let session = Session::open(config(dir.path())).unwrap();
            let record = session
                .deploy(DeployArgs {
                    artifact: v1,
                    init_args: vec![1],
                    admin: None,
                    kind: ProxyKind::Uups,
                    salt: None,
                })
                .await
                .unwrap();
            record.proxy
        };

        let session = Session::open(config(dir.path())).unwrap();
        let result = session.upgrade(&proxy, &v2).await.unwrap();
        assert_eq!(result.version, 2);

        let session = Session::open(config(dir.path())).unwrap();
        let reconciled = session.reconcile(&proxy).await.unwrap();
        assert!(matches!(reconciled, Reconciliation::InSync(_)));
        assert_eq!(reconciled.record().version, 2);
    }

    #[tokio::test]
    async fn failures_keep_their_kind() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::open(config(dir.path())).unwrap();

        let err = session
            .status(&Address::new([3; 20]))
            .await
            .unwrap_err();
        let upgrade_err = err.downcast_ref::<UpgradeError>().unwrap();
        assert_eq!(upgrade_err.kind(), "NotFoundError");

        let missing = session
            .upgrade(&Address::new([3; 20]), &dir.path().join("absent.json"))
            .await
            .unwrap_err();
        assert_eq!(missing.downcast_ref::<UpgradeError>().unwrap().exit_code(), 21);
    }
}
