//! CAPC e2e runner
//!
//! Drives negative-outcome scenarios against a Cluster API management
//! cluster: submit a cluster that must be rejected, then wait for the
//! CloudStack provider to log the rejection.

#![forbid(unsafe_code)]

mod commands;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use capc_e2e_core::config::HarnessSettings;
use capc_e2e_core::signature::{CAPC_CONTROLLER_MARKER, MANAGER_LOG_MARKER};
use capc_e2e_core::{LogConfig, init_logging};
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "capc-e2e")]
#[command(author, version, about = "CAPC e2e runner - negative-outcome scenarios")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scenario against the management cluster
    Run(RunArgs),

    /// Scan a log tree once for a signature
    Scan {
        /// Root of the collected logs, e.g. `_artifacts/clusters/bootstrap`
        dir: PathBuf,

        /// Text to look for
        #[arg(short, long)]
        signature: String,

        /// Path substrings a log file must contain (all of them)
        #[arg(short, long = "marker", default_values_t = vec![
            CAPC_CONTROLLER_MARKER.to_string(),
            MANAGER_LOG_MARKER.to_string(),
        ])]
        markers: Vec<String>,
    },

    /// Show the wait budget a scenario would use
    Intervals {
        /// Scenario name
        scenario: String,

        /// Interval key (defaults to the scenario's wait key)
        #[arg(short, long)]
        key: Option<String>,

        /// E2E config file
        #[arg(long)]
        e2e_config: Option<PathBuf>,
    },

    /// List known scenarios
    List {
        /// E2E config file declaring extra scenarios
        #[arg(long)]
        e2e_config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Scenario name, e.g. `invalid-worker-offering`
    scenario: String,

    /// E2E config file (variables and intervals)
    #[arg(long)]
    e2e_config: Option<PathBuf>,

    /// clusterctl config pointing at the local provider repository
    #[arg(long)]
    clusterctl_config: Option<PathBuf>,

    /// Management cluster kubeconfig
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Management cluster name; selects the log folder
    #[arg(long)]
    proxy_name: Option<String>,

    /// Artifact root
    #[arg(long)]
    artifacts: Option<PathBuf>,

    /// Keep namespaces and clusters after the run
    #[arg(long)]
    skip_cleanup: bool,

    /// Template flavor (defaults to the scenario's)
    #[arg(long)]
    flavor: Option<String>,

    /// Concurrent instances of the scenario
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..=i64::from(HarnessSettings::MAX_PARALLEL)))]
    parallel: Option<u32>,

    /// kubectl binary
    #[arg(long, default_value = "kubectl")]
    kubectl: PathBuf,

    /// clusterctl binary
    #[arg(long, default_value = "clusterctl")]
    clusterctl: PathBuf,

    /// Limit on each kubectl/clusterctl call, e.g. `90s` or `5m`
    #[arg(long, value_parser = humantime::parse_duration)]
    command_timeout: Option<Duration>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    match cli.command {
        Commands::Run(args) => {
            if !commands::run(args).await? {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Scan { dir, signature, markers } => {
            if !commands::scan(&dir, &signature, markers)? {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Intervals { scenario, key, e2e_config } => {
            commands::intervals(&scenario, key.as_deref(), e2e_config)
        }
        Commands::List { e2e_config, json } => commands::list(e2e_config, json),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "capc-e2e",
            "-v",
            "run",
            "invalid-worker-offering",
            "--e2e-config",
            "test/e2e/config/cloudstack.yaml",
            "--skip-cleanup",
            "--parallel",
            "3",
            "--flavor",
            "invalid-worker-offering",
            "--command-timeout",
            "5m",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.scenario, "invalid-worker-offering");
        assert_eq!(args.e2e_config, Some(PathBuf::from("test/e2e/config/cloudstack.yaml")));
        assert!(args.skip_cleanup);
        assert_eq!(args.parallel, Some(3));
        assert_eq!(args.kubectl, PathBuf::from("kubectl"));
        assert!(args.proxy_name.is_none());
        assert_eq!(args.command_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_parse_run_rejects_bad_command_timeout() {
        assert!(Cli::try_parse_from(["capc-e2e", "run", "x", "--command-timeout", "soon"]).is_err());
    }

    #[test]
    fn test_parse_run_rejects_parallel_out_of_range() {
        assert!(Cli::try_parse_from(["capc-e2e", "run", "x", "--parallel", "0"]).is_err());
        assert!(Cli::try_parse_from(["capc-e2e", "run", "x", "--parallel", "65"]).is_err());
    }

    #[test]
    fn test_parse_scan_default_markers() {
        let cli = Cli::try_parse_from([
            "capc-e2e",
            "scan",
            "_artifacts/clusters/bootstrap",
            "--signature",
            "No match found for bad-offering",
        ])
        .unwrap();
        let Commands::Scan { markers, signature, .. } = cli.command else {
            panic!("expected scan");
        };
        assert_eq!(markers, vec!["capc-controller-manager", "manager.log"]);
        assert_eq!(signature, "No match found for bad-offering");
    }

    #[test]
    fn test_parse_scan_custom_markers() {
        let cli = Cli::try_parse_from([
            "capc-e2e", "scan", "logs", "-s", "boom", "-m", "capi-controller-manager", "-m", "manager.log",
        ])
        .unwrap();
        let Commands::Scan { markers, .. } = cli.command else {
            panic!("expected scan");
        };
        assert_eq!(markers, vec!["capi-controller-manager", "manager.log"]);
    }

    #[test]
    fn test_parse_requires_subcommand() {
        assert!(Cli::try_parse_from(["capc-e2e"]).is_err());
        assert!(Cli::try_parse_from(["capc-e2e", "run"]).is_err());
    }

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
