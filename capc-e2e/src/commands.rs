//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use capc_e2e_core::config::{HarnessSettings, expand_home};
use capc_e2e_core::kubectl::{ClusterctlRenderer, KubectlEndpoint};
use capc_e2e_core::{
    CancelSource, E2EConfig, LogFileFilter, NegativeScenario, PollResult, ScenarioCatalog,
    ScenarioInput, ScenarioReport, scan as scan_tree,
};
use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::RunArgs;

fn settings_from_env() -> Result<HarnessSettings> {
    HarnessSettings::from_env().map_err(|errors| {
        let lines: Vec<String> = errors.iter().map(|e| format!("  - {e}")).collect();
        anyhow!("Invalid CAPC_E2E_* environment:\n{}", lines.join("\n"))
    })
}

fn cli_path(path: Option<PathBuf>) -> Option<PathBuf> {
    path.map(|p| expand_home(&p.to_string_lossy()))
}

fn load_config(path: Option<PathBuf>) -> Result<Option<E2EConfig>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let config = E2EConfig::load(&path).with_context(|| format!("Failed to load E2E config {}", path.display()))?;
    Ok(Some(config))
}

/// Everything `run` needs, after env and CLI layering.
#[derive(Debug)]
struct RunPlan {
    scenario: String,
    e2e_config: PathBuf,
    clusterctl_config: PathBuf,
    kubeconfig: PathBuf,
    proxy_name: String,
    artifacts: PathBuf,
    skip_cleanup: bool,
    parallel: u32,
    flavor: Option<String>,
    command_timeout: Duration,
}

impl RunPlan {
    fn resolve(args: &RunArgs, settings: HarnessSettings) -> Result<Self> {
        let e2e_config = settings
            .e2e_config
            .override_with(cli_path(args.e2e_config.clone()).map(Some))
            .value
            .context("No E2E config: pass --e2e-config or set CAPC_E2E_E2E_CONFIG")?;
        let clusterctl_config = settings
            .clusterctl_config
            .override_with(cli_path(args.clusterctl_config.clone()).map(Some))
            .value
            .context("No clusterctl config: pass --clusterctl-config or set CAPC_E2E_CLUSTERCTL_CONFIG")?;

        Ok(Self {
            scenario: args.scenario.clone(),
            e2e_config,
            clusterctl_config,
            kubeconfig: settings.kubeconfig.override_with(cli_path(args.kubeconfig.clone())).value,
            proxy_name: settings.proxy_name.override_with(args.proxy_name.clone()).value,
            artifacts: settings.artifacts.override_with(cli_path(args.artifacts.clone())).value,
            skip_cleanup: settings.skip_cleanup.override_with(args.skip_cleanup.then_some(true)).value,
            parallel: settings.parallel.override_with(args.parallel).value,
            flavor: settings.flavor.override_with(args.flavor.clone().map(Some)).value,
            command_timeout: settings.command_timeout.override_with(args.command_timeout).value,
        })
    }
}

/// Run `parallel` instances of a scenario. Returns whether all succeeded.
pub async fn run(args: RunArgs) -> Result<bool> {
    let plan = RunPlan::resolve(&args, settings_from_env()?)?;
    info!(
        scenario = %plan.scenario,
        proxy = %plan.proxy_name,
        artifacts = %plan.artifacts.display(),
        parallel = plan.parallel,
        skip_cleanup = plan.skip_cleanup,
        command_timeout = ?plan.command_timeout,
        "Starting run"
    );

    let config = load_config(Some(plan.e2e_config.clone()))?.context("E2E config is required")?;
    let catalog = ScenarioCatalog::with_config(&config)?;
    let definition = catalog.get(&plan.scenario)?.clone();

    let input = ScenarioInput {
        e2e_config: Arc::new(config),
        clusterctl_config_path: plan.clusterctl_config.clone(),
        endpoint: Arc::new(
            KubectlEndpoint::new(&plan.proxy_name, &plan.kubeconfig)
                .with_binary(&args.kubectl)
                .with_command_timeout(plan.command_timeout),
        ),
        renderer: Arc::new(
            ClusterctlRenderer::new()
                .with_binary(&args.clusterctl)
                .with_command_timeout(plan.command_timeout),
        ),
        artifact_folder: plan.artifacts.clone(),
        skip_cleanup: plan.skip_cleanup,
        flavor: plan.flavor.clone(),
    };

    let mut configured = Vec::new();
    for _ in 0..plan.parallel {
        let scenario = NegativeScenario::new(definition.clone())
            .configure(input.clone())
            .with_context(|| format!("Failed to set up {}", plan.scenario))?;
        configured.push(scenario);
    }

    let source = CancelSource::new();
    let token = source.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling scenarios and cleaning up");
            source.cancel();
        }
    });

    let reports = join_all(configured.into_iter().map(|scenario| {
        let token = token.clone();
        async move { scenario.run(&token).await }
    }))
    .await;

    let mut all_succeeded = true;
    for report in &reports {
        all_succeeded &= report.succeeded();
        summarize(report, &plan.artifacts);
    }
    Ok(all_succeeded)
}

fn summarize(report: &ScenarioReport, artifacts: &Path) {
    match report.write_json(artifacts) {
        Ok(path) => info!(report = %path.display(), "Report written"),
        Err(e) => warn!(error = %e, "Failed to write report"),
    }
    if !report.cleanup.is_clean() {
        for e in &report.cleanup.errors {
            warn!(cluster = %report.cluster_name, error = %e, "Cleanup step failed");
        }
    }
    match &report.failure {
        None => println!("PASS {} ({})", report.scenario, report.cluster_name),
        Some(failure) => {
            error!(
                scenario = %report.scenario,
                cluster = %report.cluster_name,
                kind = failure.kind,
                "{}",
                failure.message
            );
            println!("FAIL {} ({}): {}", report.scenario, report.cluster_name, failure.message);
        }
    }
}

/// One synchronous scan. Returns whether the signature was found.
pub fn scan(dir: &Path, signature: &str, markers: Vec<String>) -> Result<bool> {
    let filter = LogFileFilter::all_of(markers);
    match scan_tree(dir, |p| filter.matches(p), signature) {
        PollResult::Found(path) => {
            println!("{path}");
            Ok(true)
        }
        PollResult::NotFound => {
            eprintln!("{signature:?} not found under {}", dir.display());
            Ok(false)
        }
        PollResult::Error(cause) => bail!("Scan failed: {cause}"),
    }
}

fn catalog_for(e2e_config: Option<PathBuf>) -> Result<(ScenarioCatalog, Option<E2EConfig>)> {
    let path = match cli_path(e2e_config) {
        Some(path) => Some(path),
        None => settings_from_env()?.e2e_config.value,
    };
    let config = load_config(path)?;
    let catalog = match &config {
        Some(config) => ScenarioCatalog::with_config(config)?,
        None => ScenarioCatalog::builtin(),
    };
    Ok((catalog, config))
}

pub fn intervals(scenario: &str, key: Option<&str>, e2e_config: Option<PathBuf>) -> Result<()> {
    let (catalog, config) = catalog_for(e2e_config)?;
    let config = config.context("Intervals come from the E2E config: pass --e2e-config or set CAPC_E2E_E2E_CONFIG")?;
    let definition = catalog.get(scenario)?;
    let key = key.unwrap_or(&definition.wait_key);
    let budget = config.get_intervals(&definition.name, key)?;
    println!("{}/{key}: {budget}", definition.name);
    Ok(())
}

#[derive(Serialize)]
struct ScenarioListing<'a> {
    name: &'a str,
    flavor: &'a str,
    signature: String,
    wait_key: &'a str,
}

pub fn list(e2e_config: Option<PathBuf>, json: bool) -> Result<()> {
    let (catalog, _) = catalog_for(e2e_config)?;
    let listings: Vec<ScenarioListing<'_>> = catalog
        .definitions()
        .map(|d| ScenarioListing {
            name: &d.name,
            flavor: d.effective_flavor(None),
            signature: format!("{}${}", d.signature_prefix, d.signature_variable),
            wait_key: &d.wait_key,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(());
    }
    for l in &listings {
        println!("{:<32} flavor={:<28} wait={:<16} {:?}", l.name, l.flavor, l.wait_key, l.signature);
    }
    Ok(())
}
