use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use capc_e2e_core::collab::TemplateRenderer;
use capc_e2e_core::config::KUBERNETES_VERSION;
use capc_e2e_core::mock::{MockEndpoint, MockRenderer};
use capc_e2e_core::scenario::INVALID_WORKER_OFFERING_VARIABLE;
use capc_e2e_core::{E2EConfig, ScenarioInput};
use tempfile::TempDir;

pub const PROXY_NAME: &str = "bootstrap";
pub const BAD_OFFERING: &str = "bad-offering";

/// Where a management cluster's log collector leaves the CAPC controller log.
pub const CONTROLLER_LOG: &str =
    "logs/capc-system/capc-controller-manager/capc-controller-manager-7d9c5b6f4-x2vzq/manager.log";

/// A scratch directory for building log trees.
pub struct LogTree {
    pub dir: TempDir,
}

impl LogTree {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        write_file(&self.root().join(rel), contents.as_ref())
    }
}

pub fn write_file(path: &Path, contents: &[u8]) -> PathBuf {
    fs::create_dir_all(path.parent().expect("path has a parent")).expect("Failed to create parent dir");
    fs::write(path, contents).expect("Failed to write file");
    path.to_path_buf()
}

/// Artifact folder, clusterctl config and in-memory collaborators for one
/// or more scenario runs.
pub struct ScenarioFixture {
    pub dir: TempDir,
    pub clusterctl_config: PathBuf,
    pub artifacts: PathBuf,
    pub config: E2EConfig,
    pub endpoint: MockEndpoint,
    pub renderer: MockRenderer,
}

impl ScenarioFixture {
    /// `wait-errors` budget as humantime strings, e.g. `("2s", "20ms")`.
    pub fn new(deadline: &str, interval: &str) -> Self {
        crate::test_log!("FIXTURE: scenario fixture deadline={deadline} interval={interval}");

        let dir = TempDir::new().expect("Failed to create temp dir");
        let clusterctl_config = dir.path().join("clusterctl-config.yaml");
        fs::write(
            &clusterctl_config,
            "providers:\n  - name: cloudstack\n    type: InfrastructureProvider\n",
        )
        .expect("Failed to write clusterctl config");
        let artifacts = dir.path().join("_artifacts");
        let config = E2EConfig::default()
            .with_variable(KUBERNETES_VERSION, "v1.27.2")
            .with_variable(INVALID_WORKER_OFFERING_VARIABLE, BAD_OFFERING)
            .with_interval("default/wait-errors", deadline, interval);

        Self {
            dir,
            clusterctl_config,
            artifacts,
            config,
            endpoint: MockEndpoint::new(PROXY_NAME),
            renderer: MockRenderer::new(),
        }
    }

    pub fn input(&self) -> ScenarioInput {
        self.input_with(Arc::new(self.renderer.clone()))
    }

    pub fn input_with(&self, renderer: Arc<dyn TemplateRenderer>) -> ScenarioInput {
        ScenarioInput {
            e2e_config: Arc::new(self.config.clone()),
            clusterctl_config_path: self.clusterctl_config.clone(),
            endpoint: Arc::new(self.endpoint.clone()),
            renderer,
            artifact_folder: self.artifacts.clone(),
            skip_cleanup: false,
            flavor: None,
        }
    }

    /// `<artifacts>/clusters/<proxy>`
    pub fn log_folder(&self) -> PathBuf {
        self.artifacts.join("clusters").join(PROXY_NAME)
    }

    pub fn controller_log(&self) -> PathBuf {
        self.log_folder().join(CONTROLLER_LOG)
    }

    /// Write the controller log with the rejection for `offering`.
    pub fn write_rejection(&self, offering: &str) -> PathBuf {
        write_file(&self.controller_log(), rejection_log(offering).as_bytes())
    }
}

/// Controller log lines ending with a rejection for `offering`.
pub fn rejection_log(offering: &str) -> String {
    format!(
        "I1016 10:00:00.000000       1 cloudstackmachine_controller.go:93] \"Reconciling CloudStackMachine\"\n\
         E1016 10:00:01.000000       1 controller.go:324] \"Reconciler error\" err=\"No match found for {offering}: {{Count:0 ServiceOfferings:[]}}\"\n"
    )
}
