use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{error, info, warn};

use super::definition::{ScenarioDefinition, WAIT_DELETE_CLUSTER};
use super::{ScenarioReport, ScenarioState, Transition};
use crate::cancel::CancelToken;
use crate::cleanup::{CleanupGuarantor, ScenarioResources};
use crate::collab::{ClusterRef, ClusterTemplateRequest, OrchestrationEndpoint, TemplateRenderer};
use crate::config::{E2EConfig, KUBERNETES_VERSION};
use crate::errors::{ConfigError, EndpointError, ScenarioError, SetupError};
use crate::poll::{DeadlineBudget, PollOutcome, PollReport, poll_until};
use crate::signature::{ExpectedSignature, SignatureMatcher};
use crate::util::unique_name;

/// Immutable configuration for one run.
#[derive(Clone)]
pub struct ScenarioInput {
    pub e2e_config: Arc<E2EConfig>,
    /// Must be an existing file.
    pub clusterctl_config_path: PathBuf,
    pub endpoint: Arc<dyn OrchestrationEndpoint>,
    pub renderer: Arc<dyn TemplateRenderer>,
    /// Created if absent.
    pub artifact_folder: PathBuf,
    pub skip_cleanup: bool,
    /// Overrides the definition's flavor.
    pub flavor: Option<String>,
}

impl std::fmt::Debug for ScenarioInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioInput")
            .field("endpoint", &self.endpoint.name())
            .field("clusterctl_config_path", &self.clusterctl_config_path)
            .field("artifact_folder", &self.artifact_folder)
            .field("skip_cleanup", &self.skip_cleanup)
            .field("flavor", &self.flavor)
            .finish()
    }
}

/// A scenario in the `Init` state.
#[derive(Debug, Clone)]
pub struct NegativeScenario {
    definition: ScenarioDefinition,
    created_at: DateTime<Utc>,
}

impl NegativeScenario {
    pub fn new(definition: ScenarioDefinition) -> Self {
        Self {
            definition,
            created_at: Utc::now(),
        }
    }

    pub fn invalid_worker_offering() -> Self {
        Self::new(ScenarioDefinition::invalid_worker_offering())
    }

    pub fn definition(&self) -> &ScenarioDefinition {
        &self.definition
    }

    /// Validate `input` and resolve everything the run needs up front.
    pub fn configure(self, input: ScenarioInput) -> Result<ConfiguredScenario, SetupError> {
        let name = self.definition.name.clone();
        let invalid = |message: String| SetupError::InvalidInput {
            scenario: name.clone(),
            message,
        };

        self.definition.validate().map_err(invalid)?;
        if input.endpoint.name().trim().is_empty() {
            return Err(invalid("endpoint name can't be empty".to_string()));
        }
        if !input.clusterctl_config_path.is_file() {
            return Err(SetupError::MissingConfigFile(input.clusterctl_config_path));
        }
        std::fs::create_dir_all(&input.artifact_folder).map_err(|source| SetupError::ArtifactFolder {
            path: input.artifact_folder.clone(),
            source,
        })?;

        let config = &input.e2e_config;
        let kubernetes_version = config.get_variable(KUBERNETES_VERSION)?;
        let signature = ExpectedSignature::from_variable(
            config,
            &self.definition.signature_prefix,
            &self.definition.signature_variable,
        )?;
        let budget = config.get_intervals(&name, &self.definition.wait_key)?;
        let delete_wait = match config.get_intervals(&name, WAIT_DELETE_CLUSTER) {
            Ok(budget) => Some(budget),
            Err(ConfigError::MissingIntervals { .. }) => None,
            Err(e) => return Err(e.into()),
        };

        let flavor = self
            .definition
            .effective_flavor(input.flavor.as_deref())
            .to_string();
        let log_folder = input
            .artifact_folder
            .join("clusters")
            .join(input.endpoint.name());
        let cluster_name = unique_name(&name);

        info!(
            scenario = %name,
            cluster = %cluster_name,
            %flavor,
            signature = %signature,
            %budget,
            "Scenario configured"
        );

        Ok(ConfiguredScenario {
            transitions: vec![
                Transition {
                    state: ScenarioState::Init,
                    at: self.created_at,
                },
                Transition::now(ScenarioState::Configured),
            ],
            started_at: self.created_at,
            definition: self.definition,
            input,
            signature,
            kubernetes_version,
            flavor,
            cluster_name,
            log_folder,
            budget,
            delete_wait,
        })
    }
}

/// A validated scenario, ready to run.
#[derive(Debug)]
pub struct ConfiguredScenario {
    definition: ScenarioDefinition,
    input: ScenarioInput,
    signature: ExpectedSignature,
    kubernetes_version: String,
    flavor: String,
    cluster_name: String,
    log_folder: PathBuf,
    budget: DeadlineBudget,
    delete_wait: Option<DeadlineBudget>,
    transitions: Vec<Transition>,
    started_at: DateTime<Utc>,
}

impl ConfiguredScenario {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn signature(&self) -> &ExpectedSignature {
        &self.signature
    }

    pub fn budget(&self) -> DeadlineBudget {
        self.budget
    }

    /// `<artifacts>/clusters/<endpoint name>`, the tree the signature is
    /// searched in.
    pub fn log_folder(&self) -> &Path {
        &self.log_folder
    }

    /// Submit, poll, assert, then tear down. Always ends in `CleanedUp`.
    pub async fn run(mut self, cancel: &CancelToken) -> ScenarioReport {
        let mut transitions = std::mem::take(&mut self.transitions);
        let mut resources = ScenarioResources::new(self.name(), self.log_folder.join("resources"));
        let mut poll = None;

        let outcome = AssertUnwindSafe(self.drive(&mut resources, &mut transitions, &mut poll, cancel))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(scenario = %self.name(), %message, "Scenario panicked");
                Err(ScenarioError::Panicked {
                    scenario: self.name().to_string(),
                    message,
                })
            }
        };

        match &result {
            Ok(()) => {
                transitions.push(Transition::now(ScenarioState::Succeeded));
                info!(scenario = %self.name(), cluster = %self.cluster_name, "Scenario succeeded");
            }
            Err(e) => {
                transitions.push(Transition::now(ScenarioState::Failed));
                warn!(scenario = %self.name(), cluster = %self.cluster_name, error = %e, "Scenario failed");
            }
        }

        let namespace = resources.namespace.as_ref().map(|ns| ns.name.clone());
        let guarantor = CleanupGuarantor::new(Arc::clone(&self.input.endpoint), self.input.skip_cleanup)
            .with_delete_wait(self.delete_wait);
        let cleanup = guarantor.teardown(resources).await;
        transitions.push(Transition::now(ScenarioState::CleanedUp));

        ScenarioReport::new(
            self.definition.name,
            self.input.endpoint.name().to_string(),
            namespace,
            self.cluster_name,
            self.signature.as_str().to_string(),
            transitions,
            poll,
            cleanup,
            result.err(),
            self.started_at,
        )
    }

    async fn drive(
        &self,
        resources: &mut ScenarioResources,
        transitions: &mut Vec<Transition>,
        poll: &mut Option<PollReport>,
        cancel: &CancelToken,
    ) -> Result<(), ScenarioError> {
        let name = self.name();
        let endpoint = &self.input.endpoint;
        let namespace_failed = |source: EndpointError| SetupError::Namespace {
            scenario: name.to_string(),
            source,
        };

        let namespace = endpoint
            .create_namespace(&unique_name(name))
            .await
            .map_err(namespace_failed)?;
        info!(scenario = %name, namespace = %namespace, "Created namespace");
        resources.namespace = Some(namespace.clone());
        let watch = endpoint
            .watch_namespace_events(&namespace, &resources.resources_dir)
            .await
            .map_err(namespace_failed)?;
        resources.watch = Some(watch);

        let submission = |source: EndpointError| ScenarioError::Submission {
            scenario: name.to_string(),
            endpoint: endpoint.name().to_string(),
            source,
        };
        let request = ClusterTemplateRequest {
            namespace: namespace.name.clone(),
            cluster_name: self.cluster_name.clone(),
            kubernetes_version: self.kubernetes_version.clone(),
            control_plane_machine_count: self.definition.control_plane_machine_count,
            worker_machine_count: self.definition.worker_machine_count,
            flavor: self.flavor.clone(),
            infrastructure_provider: self.definition.infrastructure_provider.clone(),
            kubeconfig_path: endpoint.kubeconfig_path().to_path_buf(),
            clusterctl_config_path: self.input.clusterctl_config_path.clone(),
            log_folder: self.log_folder.clone(),
        };
        let template = self.input.renderer.render(&request).await.map_err(submission)?;
        endpoint.apply(&template).await.map_err(submission)?;
        resources.cluster = Some(ClusterRef::new(namespace.name.clone(), self.cluster_name.clone()));
        transitions.push(Transition::now(ScenarioState::ActionSubmitted));
        info!(scenario = %name, cluster = %self.cluster_name, "Applied cluster template");

        let cluster = endpoint
            .get_cluster_by_name(&self.cluster_name, &namespace.name)
            .await
            .map_err(submission)?;
        resources.cluster = Some(cluster);

        transitions.push(Transition::now(ScenarioState::Polling));
        let matcher = SignatureMatcher::new(
            self.log_folder.clone(),
            self.definition.log_filter(),
            self.signature.clone(),
        );
        info!(scenario = %name, signature = %self.signature, budget = %self.budget, "Waiting for expected error");
        let report = poll_until(&matcher, self.budget, cancel).await;
        let outcome = report.outcome.clone();
        let (attempts, elapsed) = (report.attempts, report.elapsed);
        *poll = Some(report);

        let signature = self.signature.as_str().to_string();
        match outcome {
            PollOutcome::Found(path) => {
                info!(scenario = %name, %path, attempts, "Found expected error");
                Ok(())
            }
            PollOutcome::NotFound => Err(ScenarioError::PollTimeout {
                scenario: name.to_string(),
                signature,
                attempts,
                elapsed,
            }),
            PollOutcome::Error(cause) => Err(ScenarioError::Scan {
                scenario: name.to_string(),
                signature,
                cause,
            }),
            PollOutcome::Cancelled => Err(ScenarioError::Cancelled {
                scenario: name.to_string(),
                signature,
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
