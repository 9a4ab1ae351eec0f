//! Collaborator interfaces used by scenarios.
//!
//! The harness never talks to a cluster directly: submission, lookups,
//! namespace lifecycle, event watches and dumps go through an
//! [`OrchestrationEndpoint`], and template rendering through a
//! [`TemplateRenderer`]. Production implementations live in
//! [`crate::kubectl`], test doubles in [`crate::mock`].

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::EndpointError;

/// A namespace created for one scenario instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceRef {
    pub name: String,
}

impl NamespaceRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for NamespaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A submitted workload cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterRef {
    pub namespace: String,
    pub name: String,
}

impl ClusterRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Everything the renderer needs to produce a workload cluster template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterTemplateRequest {
    pub namespace: String,
    pub cluster_name: String,
    pub kubernetes_version: String,
    pub control_plane_machine_count: u32,
    pub worker_machine_count: u32,
    pub flavor: String,
    pub infrastructure_provider: String,
    pub kubeconfig_path: PathBuf,
    pub clusterctl_config_path: PathBuf,
    /// Where the renderer may leave its own logs and the rendered template.
    pub log_folder: PathBuf,
}

/// A rendered, ready-to-apply template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDocument {
    pub contents: Vec<u8>,
}

impl TemplateDocument {
    pub fn new(contents: impl Into<Vec<u8>>) -> Self {
        Self {
            contents: contents.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.contents
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}

/// Handle for a running namespace event watch.
pub trait WatchSubscription: Send {
    /// Stop the watch. Must not block.
    fn cancel(self: Box<Self>);
}

/// Control-plane API that reconciles submitted templates asynchronously.
#[async_trait]
pub trait OrchestrationEndpoint: Send + Sync {
    /// Cluster-identity name; also names the log folder under
    /// `<artifacts>/clusters/`.
    fn name(&self) -> &str;

    fn kubeconfig_path(&self) -> &Path;

    async fn create_namespace(&self, name: &str) -> Result<NamespaceRef, EndpointError>;

    async fn delete_namespace(&self, namespace: &NamespaceRef) -> Result<(), EndpointError>;

    /// Start streaming namespace events into `out_dir`.
    async fn watch_namespace_events(
        &self,
        namespace: &NamespaceRef,
        out_dir: &Path,
    ) -> Result<Box<dyn WatchSubscription>, EndpointError>;

    async fn apply(&self, template: &TemplateDocument) -> Result<(), EndpointError>;

    /// Look up a cluster; [`EndpointError::NotFound`] when it does not exist.
    async fn get_cluster_by_name(&self, name: &str, namespace: &str) -> Result<ClusterRef, EndpointError>;

    async fn delete_cluster(&self, cluster: &ClusterRef) -> Result<(), EndpointError>;

    /// Dump the namespace's resources under `out_dir` for post-mortem.
    async fn dump_resources(&self, namespace: &NamespaceRef, out_dir: &Path) -> Result<(), EndpointError>;
}

#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(&self, request: &ClusterTemplateRequest) -> Result<TemplateDocument, EndpointError>;
}
