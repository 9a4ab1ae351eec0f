//! Harness settings assembled from `CAPC_E2E_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use super::env::{EnvError, EnvParser};
use super::source::Sourced;

/// Run-level settings shared by every scenario in a process.
#[derive(Debug, Clone)]
pub struct HarnessSettings {
    /// `CAPC_E2E_E2E_CONFIG`: variables and interval table.
    pub e2e_config: Sourced<Option<PathBuf>>,
    /// `CAPC_E2E_CLUSTERCTL_CONFIG`: clusterctl config pointing at the local repository.
    pub clusterctl_config: Sourced<Option<PathBuf>>,
    /// `CAPC_E2E_KUBECONFIG`: management cluster kubeconfig.
    pub kubeconfig: Sourced<PathBuf>,
    /// `CAPC_E2E_PROXY_NAME`: cluster identity; names the log folder.
    pub proxy_name: Sourced<String>,
    /// `CAPC_E2E_ARTIFACTS`: artifact root.
    pub artifacts: Sourced<PathBuf>,
    /// `CAPC_E2E_SKIP_CLEANUP`: keep namespaces and clusters for post-mortem.
    pub skip_cleanup: Sourced<bool>,
    /// `CAPC_E2E_PARALLEL`: concurrent instances per run.
    pub parallel: Sourced<u32>,
    /// `CAPC_E2E_LOG_LEVEL`.
    pub log_level: Sourced<String>,
    /// `CAPC_E2E_COMMAND_TIMEOUT`: limit on each kubectl/clusterctl call, humantime.
    pub command_timeout: Sourced<Duration>,
    /// `CAPC_E2E_FLAVOR`: template flavor override; empty means the scenario's own.
    pub flavor: Sourced<Option<String>>,
}

impl HarnessSettings {
    pub const DEFAULT_ARTIFACTS: &'static str = "_artifacts";
    pub const DEFAULT_KUBECONFIG: &'static str = "~/.kube/config";
    pub const DEFAULT_PROXY_NAME: &'static str = "bootstrap";
    pub const MAX_PARALLEL: u32 = 64;

    /// Read settings from the environment, reporting every invalid value.
    pub fn from_env() -> Result<Self, Vec<EnvError>> {
        let mut parser = EnvParser::new();
        let settings = Self {
            e2e_config: parser.get_optional_path("E2E_CONFIG", true),
            clusterctl_config: parser.get_optional_path("CLUSTERCTL_CONFIG", false),
            kubeconfig: parser.get_path("KUBECONFIG", Self::DEFAULT_KUBECONFIG, false),
            proxy_name: parser.get_string("PROXY_NAME", Self::DEFAULT_PROXY_NAME),
            artifacts: parser.get_path("ARTIFACTS", Self::DEFAULT_ARTIFACTS, false),
            skip_cleanup: parser.get_bool("SKIP_CLEANUP", false),
            parallel: parser.get_u32_range("PARALLEL", 1, 1, Self::MAX_PARALLEL),
            log_level: parser.get_log_level("LOG_LEVEL", "info"),
            command_timeout: parser.get_duration("COMMAND_TIMEOUT", crate::kubectl::DEFAULT_COMMAND_TIMEOUT),
            flavor: parser.get_optional_string("FLAVOR"),
        };
        if parser.has_errors() {
            return Err(parser.take_errors());
        }
        Ok(settings)
    }
}
