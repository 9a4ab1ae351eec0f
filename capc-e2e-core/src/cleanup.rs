//! Scenario teardown.
//!
//! [`ScenarioResources`] is filled in by the controller as it acquires
//! things and moved into [`CleanupGuarantor::teardown`] exactly once. Order:
//! 1. dump namespace resources (best effort, also when cleanup is skipped)
//! 2. cancel the event watch (always)
//! 3. delete the cluster and optionally wait for it to go away
//! 4. delete the namespace
//!
//! Steps 3 and 4 are skipped with `skip_cleanup`. Failures are collected in
//! the [`CleanupReport`] and logged; they never replace the scenario result.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::collab::{ClusterRef, NamespaceRef, OrchestrationEndpoint, WatchSubscription};
use crate::errors::CleanupError;
use crate::poll::{DeadlineBudget, PollOutcome, PollResult, Probe, StopFlag, poll_until};

/// Resources owned by one scenario run.
pub struct ScenarioResources {
    pub scenario: String,
    /// `<artifacts>/clusters/<proxy>/resources`; endpoints write per-namespace
    /// events and dumps below it.
    pub resources_dir: PathBuf,
    pub namespace: Option<NamespaceRef>,
    pub watch: Option<Box<dyn WatchSubscription>>,
    pub cluster: Option<ClusterRef>,
}

impl ScenarioResources {
    pub fn new(scenario: impl Into<String>, resources_dir: impl Into<PathBuf>) -> Self {
        Self {
            scenario: scenario.into(),
            resources_dir: resources_dir.into(),
            namespace: None,
            watch: None,
            cluster: None,
        }
    }
}

impl std::fmt::Debug for ScenarioResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioResources")
            .field("scenario", &self.scenario)
            .field("namespace", &self.namespace)
            .field("watch", &self.watch.is_some())
            .field("cluster", &self.cluster)
            .finish()
    }
}

impl Drop for ScenarioResources {
    fn drop(&mut self) {
        // Teardown takes the watch; reaching here with one means teardown
        // never ran.
        if let Some(watch) = self.watch.take() {
            warn!(scenario = %self.scenario, "Scenario resources dropped without teardown; cancelling watch");
            watch.cancel();
        }
    }
}

/// What teardown did.
#[derive(Debug, Default, Serialize)]
pub struct CleanupReport {
    pub dumped: bool,
    pub watch_cancelled: bool,
    pub cluster_deleted: bool,
    pub namespace_deleted: bool,
    pub deletion_skipped: bool,
    #[serde(serialize_with = "serialize_errors")]
    pub errors: Vec<CleanupError>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

fn serialize_errors<S: Serializer>(errors: &[CleanupError], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(errors.iter().map(ToString::to_string))
}

/// Polls until a deleted cluster is no longer reported by the endpoint.
pub struct ClusterGoneProbe {
    endpoint: Arc<dyn OrchestrationEndpoint>,
    cluster: ClusterRef,
}

impl ClusterGoneProbe {
    pub fn new(endpoint: Arc<dyn OrchestrationEndpoint>, cluster: ClusterRef) -> Self {
        Self { endpoint, cluster }
    }
}

#[async_trait]
impl Probe for ClusterGoneProbe {
    fn describe(&self) -> String {
        format!("cluster {} deleted", self.cluster)
    }

    async fn probe(&self, _stop: &StopFlag) -> PollResult {
        match self
            .endpoint
            .get_cluster_by_name(&self.cluster.name, &self.cluster.namespace)
            .await
        {
            Ok(_) => PollResult::NotFound,
            Err(e) if e.is_not_found() => PollResult::Found(self.cluster.to_string()),
            Err(e) => {
                debug!(cluster = %self.cluster, error = %e, "Cluster lookup failed during deletion wait");
                PollResult::NotFound
            }
        }
    }
}

/// Runs teardown for scenario resources.
#[derive(Clone)]
pub struct CleanupGuarantor {
    endpoint: Arc<dyn OrchestrationEndpoint>,
    skip_cleanup: bool,
    delete_wait: Option<DeadlineBudget>,
}

impl CleanupGuarantor {
    pub fn new(endpoint: Arc<dyn OrchestrationEndpoint>, skip_cleanup: bool) -> Self {
        Self {
            endpoint,
            skip_cleanup,
            delete_wait: None,
        }
    }

    /// Wait for cluster deletion within `budget` before deleting the namespace.
    pub fn with_delete_wait(mut self, budget: Option<DeadlineBudget>) -> Self {
        self.delete_wait = budget;
        self
    }

    pub async fn teardown(&self, mut resources: ScenarioResources) -> CleanupReport {
        let mut report = CleanupReport::default();
        let scenario = resources.scenario.clone();

        if let Some(namespace) = &resources.namespace {
            match self
                .endpoint
                .dump_resources(namespace, &resources.resources_dir)
                .await
            {
                Ok(()) => report.dumped = true,
                Err(source) => report.errors.push(CleanupError::Dump {
                    namespace: namespace.name.clone(),
                    source,
                }),
            }
        }

        if let Some(watch) = resources.watch.take() {
            watch.cancel();
            report.watch_cancelled = true;
        }

        if self.skip_cleanup {
            report.deletion_skipped = true;
            info!(
                scenario = %scenario,
                namespace = ?resources.namespace.as_ref().map(|ns| ns.name.as_str()),
                "Skipping cluster and namespace deletion"
            );
        } else {
            if let Some(cluster) = resources.cluster.take() {
                self.delete_cluster(&cluster, &mut report).await;
            }
            if let Some(namespace) = resources.namespace.take() {
                match self.endpoint.delete_namespace(&namespace).await {
                    Ok(()) => report.namespace_deleted = true,
                    Err(source) => report.errors.push(CleanupError::DeleteNamespace {
                        namespace: namespace.name,
                        source,
                    }),
                }
            }
        }

        for error in &report.errors {
            warn!(scenario = %scenario, error = %error, "Cleanup step failed");
        }
        info!(
            scenario = %scenario,
            dumped = report.dumped,
            watch_cancelled = report.watch_cancelled,
            cluster_deleted = report.cluster_deleted,
            namespace_deleted = report.namespace_deleted,
            "Cleanup finished"
        );
        report
    }

    async fn delete_cluster(&self, cluster: &ClusterRef, report: &mut CleanupReport) {
        if let Err(source) = self.endpoint.delete_cluster(cluster).await {
            report.errors.push(CleanupError::DeleteCluster {
                namespace: cluster.namespace.clone(),
                name: cluster.name.clone(),
                source,
            });
            return;
        }
        let Some(budget) = self.delete_wait else {
            report.cluster_deleted = true;
            return;
        };

        // Teardown is not interruptible; a cancelled run still cleans up.
        let probe = ClusterGoneProbe::new(Arc::clone(&self.endpoint), cluster.clone());
        let poll = poll_until(&probe, budget, &CancelToken::never()).await;
        match poll.outcome {
            PollOutcome::Found(_) => report.cluster_deleted = true,
            _ => report.errors.push(CleanupError::ClusterDeletionTimeout {
                namespace: cluster.namespace.clone(),
                name: cluster.name.clone(),
                waited: poll.elapsed,
            }),
        }
    }
}
