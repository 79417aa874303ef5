//! `uprox`: deploy and upgrade contracts behind upgradeable proxies

use clap::{value_parser, Arg, ArgAction, Command};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uprox_artifact::Address;
use uprox_core::UpgradeError;
use uprox_registry::ProxyKind;

mod commands;

use commands::IncompatibleLayouts;

/// Exit code for setup failures (config, files, arguments)
const SETUP_FAILURE: i32 = 2;

fn cli() -> Command {
    let proxy_arg = || {
        Arg::new("proxy")
            .required(true)
            .value_parser(value_parser!(Address))
            .help("Proxy address (0x-prefixed hex)")
    };

    Command::new("uprox")
        .version(uprox_core::VERSION)
        .about("Deploy and upgrade contracts behind upgradeable proxies")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file (UPROX_* variables override it)"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("deploy")
                .about("Deploy an implementation behind a new proxy and initialize it")
                .arg(
                    Arg::new("artifact")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Compiler artifact JSON"),
                )
                .arg(
                    Arg::new("init-args")
                        .long("init-args")
                        .help("Initializer arguments as hex"),
                )
                .arg(
                    Arg::new("admin")
                        .long("admin")
                        .value_parser(value_parser!(Address))
                        .help("Upgrade admin (defaults to the signing account)"),
                )
                .arg(
                    Arg::new("kind")
                        .long("kind")
                        .default_value("uups")
                        .value_parser(value_parser!(ProxyKind))
                        .help("Proxy kind: uups or transparent"),
                )
                .arg(
                    Arg::new("salt")
                        .long("salt")
                        .help("Distinguishes several proxies deployed by one account"),
                ),
        )
        .subcommand(
            Command::new("upgrade")
                .about("Upgrade a proxy after checking storage compatibility")
                .arg(proxy_arg())
                .arg(
                    Arg::new("artifact")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Compiler artifact JSON of the new implementation"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Show a proxy's record, reconciled with the ledger")
                .arg(proxy_arg())
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Compare the storage layouts of two artifacts offline")
                .arg(
                    Arg::new("old")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("new")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("reconcile")
                .about("Resolve a pending upgrade against the ledger")
                .arg(proxy_arg()),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Print a failure and pick the exit code for it
fn report(err: &anyhow::Error) -> i32 {
    if let Some(err) = err.downcast_ref::<UpgradeError>() {
        eprintln!("error[{}]: {err}", err.kind());
        for violation in err.violations() {
            eprintln!("  {violation}");
        }
        if err.needs_reconciliation() {
            eprintln!("  run `uprox reconcile <proxy>` before retrying");
        } else if err.is_retryable() {
            eprintln!("  nothing was changed on the ledger; the command can be retried");
        }
        return err.exit_code();
    }
    if let Some(err) = err.downcast_ref::<IncompatibleLayouts>() {
        eprintln!("error[IncompatibleUpgradeError]: {err}");
        for violation in &err.violations {
            eprintln!("  {violation}");
        }
        return UpgradeError::IncompatibleUpgrade {
            proxy: Address::ZERO,
            violations: Vec::new(),
        }
        .exit_code();
    }
    eprintln!("error: {err:#}");
    SETUP_FAILURE
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    if let Err(err) = commands::run(&matches).await {
        std::process::exit(report(&err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn parses_deploy_options() {
        let matches = cli()
            .try_get_matches_from([
                "uprox",
                "deploy",
                "box.json",
                "--kind",
                "transparent",
                "--init-args",
                "0x01",
            ])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        assert_eq!(args.get_one::<ProxyKind>("kind"), Some(&ProxyKind::Transparent));
        assert_eq!(args.get_one::<String>("init-args").map(String::as_str), Some("0x01"));
    }

    #[test]
    fn rejects_malformed_proxy_address() {
        assert!(cli()
            .try_get_matches_from(["uprox", "status", "not-an-address"])
            .is_err());
    }

    #[test]
    fn incompatible_layouts_exit_like_incompatible_upgrades() {
        let err = anyhow::Error::new(IncompatibleLayouts {
            violations: Vec::new(),
        });
        assert_eq!(report(&err), 14);
    }
}
