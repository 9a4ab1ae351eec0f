//! Deterministic in-memory collaborators for scenario tests.
//!
//! [`MockEndpoint`] keeps namespaces and clusters in memory, records every
//! call in order and can be scripted to fail at any [`FailurePoint`].
//! [`MockRenderer`] renders a minimal `Cluster` manifest the endpoint
//! understands, so `apply` followed by `get_cluster_by_name` behaves like a
//! real management cluster.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::collab::{
    ClusterRef, ClusterTemplateRequest, NamespaceRef, OrchestrationEndpoint, TemplateDocument,
    TemplateRenderer, WatchSubscription,
};
use crate::errors::EndpointError;

/// Endpoint operation that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    CreateNamespace,
    Watch,
    Apply,
    GetCluster,
    DeleteCluster,
    DeleteNamespace,
    Dump,
}

/// One recorded endpoint interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateNamespace(String),
    WatchEvents(String),
    CancelWatch(String),
    Apply { clusters: Vec<ClusterRef> },
    GetCluster(ClusterRef),
    DeleteCluster(ClusterRef),
    DeleteNamespace(String),
    Dump(String),
}

/// Invoked with every cluster found in an applied template.
pub type ApplyHook = Arc<dyn Fn(&ClusterRef) + Send + Sync>;

#[derive(Default)]
struct MockState {
    namespaces: BTreeSet<String>,
    clusters: BTreeSet<(String, String)>,
    /// Deleted clusters that are still reported by lookups, with the number
    /// of lookups left before they disappear.
    lingering: HashMap<(String, String), u32>,
    calls: Vec<MockCall>,
    failures: HashMap<FailurePoint, String>,
    linger_lookups: u32,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-memory [`OrchestrationEndpoint`].
#[derive(Clone)]
pub struct MockEndpoint {
    name: String,
    kubeconfig: PathBuf,
    state: Arc<Mutex<MockState>>,
    apply_hook: Option<ApplyHook>,
}

impl std::fmt::Debug for MockEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEndpoint")
            .field("name", &self.name)
            .field("calls", &lock(&self.state).calls.len())
            .finish()
    }
}

impl MockEndpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kubeconfig: PathBuf::from("/dev/null"),
            state: Arc::default(),
            apply_hook: None,
        }
    }

    /// Fail every subsequent call at `point` with `message`.
    pub fn fail_on(&self, point: FailurePoint, message: impl Into<String>) {
        lock(&self.state).failures.insert(point, message.into());
    }

    /// Keep reporting deleted clusters for `lookups` more lookups
    /// (`u32::MAX` never lets them go).
    pub fn linger_after_delete(&self, lookups: u32) {
        lock(&self.state).linger_lookups = lookups;
    }

    /// Run `hook` for each cluster in an applied template, e.g. to simulate
    /// the provider controller writing its log.
    pub fn with_apply_hook(mut self, hook: ApplyHook) -> Self {
        self.apply_hook = Some(hook);
        self
    }

    /// Snapshot of all calls received, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state).calls.clone()
    }

    fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|c| pred(c)).count()
    }

    pub fn namespace_creations(&self) -> usize {
        self.count(|c| matches!(c, MockCall::CreateNamespace(_)))
    }

    pub fn namespace_deletions(&self) -> usize {
        self.count(|c| matches!(c, MockCall::DeleteNamespace(_)))
    }

    pub fn watch_cancellations(&self) -> usize {
        self.count(|c| matches!(c, MockCall::CancelWatch(_)))
    }

    pub fn cluster_deletions(&self) -> usize {
        self.count(|c| matches!(c, MockCall::DeleteCluster(_)))
    }

    pub fn dumps(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Dump(_)))
    }

    pub fn applies(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Apply { .. }))
    }

    pub fn live_namespaces(&self) -> Vec<String> {
        lock(&self.state).namespaces.iter().cloned().collect()
    }

    pub fn live_clusters(&self) -> Vec<ClusterRef> {
        lock(&self.state)
            .clusters
            .iter()
            .map(|(ns, name)| ClusterRef::new(ns.clone(), name.clone()))
            .collect()
    }

    /// Record `call`, then fail if `point` is scripted to.
    fn enter(&self, point: FailurePoint, call: MockCall) -> Result<MutexGuard<'_, MockState>, EndpointError> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        if let Some(message) = state.failures.get(&point) {
            return Err(EndpointError::Other(message.clone()));
        }
        Ok(state)
    }
}

#[derive(Debug, Deserialize)]
struct ManifestObject {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: ManifestMeta,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
}

/// `Cluster` objects declared in a (possibly multi-document) YAML template.
fn clusters_in(template: &TemplateDocument) -> Result<Vec<ClusterRef>, EndpointError> {
    let text = std::str::from_utf8(template.as_bytes())
        .map_err(|e| EndpointError::Other(format!("template is not UTF-8: {e}")))?;
    let mut clusters = Vec::new();
    for doc in text.split("\n---") {
        let doc = doc.trim_start_matches("---");
        if doc.trim().is_empty() {
            continue;
        }
        let object: ManifestObject = serde_yaml_ng::from_str(doc)
            .map_err(|e| EndpointError::Other(format!("invalid manifest: {e}")))?;
        if object.kind == "Cluster" {
            clusters.push(ClusterRef::new(object.metadata.namespace, object.metadata.name));
        }
    }
    Ok(clusters)
}

struct MockWatch {
    namespace: String,
    state: Arc<Mutex<MockState>>,
}

impl WatchSubscription for MockWatch {
    fn cancel(self: Box<Self>) {
        let MockWatch { namespace, state } = *self;
        lock(&state).calls.push(MockCall::CancelWatch(namespace));
    }
}

#[async_trait]
impl OrchestrationEndpoint for MockEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn kubeconfig_path(&self) -> &Path {
        &self.kubeconfig
    }

    async fn create_namespace(&self, name: &str) -> Result<NamespaceRef, EndpointError> {
        let mut state = self.enter(FailurePoint::CreateNamespace, MockCall::CreateNamespace(name.to_string()))?;
        if !state.namespaces.insert(name.to_string()) {
            return Err(EndpointError::Other(format!("namespace {name} already exists")));
        }
        Ok(NamespaceRef::new(name))
    }

    async fn delete_namespace(&self, namespace: &NamespaceRef) -> Result<(), EndpointError> {
        let mut state = self.enter(
            FailurePoint::DeleteNamespace,
            MockCall::DeleteNamespace(namespace.name.clone()),
        )?;
        state.namespaces.remove(&namespace.name);
        state.clusters.retain(|(ns, _)| ns != &namespace.name);
        Ok(())
    }

    async fn watch_namespace_events(
        &self,
        namespace: &NamespaceRef,
        _out_dir: &Path,
    ) -> Result<Box<dyn WatchSubscription>, EndpointError> {
        drop(self.enter(FailurePoint::Watch, MockCall::WatchEvents(namespace.name.clone()))?);
        Ok(Box::new(MockWatch {
            namespace: namespace.name.clone(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn apply(&self, template: &TemplateDocument) -> Result<(), EndpointError> {
        let clusters = clusters_in(template)?;
        {
            let mut state = self.enter(
                FailurePoint::Apply,
                MockCall::Apply {
                    clusters: clusters.clone(),
                },
            )?;
            for cluster in &clusters {
                if !state.namespaces.contains(&cluster.namespace) {
                    return Err(EndpointError::NotFound {
                        kind: "Namespace",
                        namespace: cluster.namespace.clone(),
                        name: cluster.namespace.clone(),
                    });
                }
                state
                    .clusters
                    .insert((cluster.namespace.clone(), cluster.name.clone()));
            }
        }
        if let Some(hook) = &self.apply_hook {
            for cluster in &clusters {
                hook(cluster);
            }
        }
        debug!(endpoint = %self.name, clusters = clusters.len(), "Mock applied template");
        Ok(())
    }

    async fn get_cluster_by_name(&self, name: &str, namespace: &str) -> Result<ClusterRef, EndpointError> {
        let key = (namespace.to_string(), name.to_string());
        let mut state = self.enter(
            FailurePoint::GetCluster,
            MockCall::GetCluster(ClusterRef::new(namespace, name)),
        )?;
        if state.clusters.contains(&key) {
            return Ok(ClusterRef::new(namespace, name));
        }
        if let Some(left) = state.lingering.get_mut(&key)
            && *left > 0
        {
            if *left != u32::MAX {
                *left -= 1;
            }
            return Ok(ClusterRef::new(namespace, name));
        }
        Err(EndpointError::NotFound {
            kind: "Cluster",
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    async fn delete_cluster(&self, cluster: &ClusterRef) -> Result<(), EndpointError> {
        let key = (cluster.namespace.clone(), cluster.name.clone());
        let mut state = self.enter(FailurePoint::DeleteCluster, MockCall::DeleteCluster(cluster.clone()))?;
        if state.clusters.remove(&key) && state.linger_lookups > 0 {
            let lookups = state.linger_lookups;
            state.lingering.insert(key, lookups);
        }
        Ok(())
    }

    async fn dump_resources(&self, namespace: &NamespaceRef, _out_dir: &Path) -> Result<(), EndpointError> {
        drop(self.enter(FailurePoint::Dump, MockCall::Dump(namespace.name.clone()))?);
        Ok(())
    }
}

/// [`TemplateRenderer`] producing a single `Cluster` manifest.
#[derive(Debug, Clone, Default)]
pub struct MockRenderer {
    requests: Arc<Mutex<Vec<ClusterTemplateRequest>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    /// Snapshot of all render requests received.
    pub fn requests(&self) -> Vec<ClusterTemplateRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl TemplateRenderer for MockRenderer {
    async fn render(&self, request: &ClusterTemplateRequest) -> Result<TemplateDocument, EndpointError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        if let Some(message) = self.failure.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(EndpointError::Other(message));
        }
        Ok(TemplateDocument::new(format!(
            "apiVersion: cluster.x-k8s.io/v1beta1\n\
             kind: Cluster\n\
             metadata:\n  name: {name}\n  namespace: {namespace}\n\
             ---\n\
             apiVersion: infrastructure.cluster.x-k8s.io/v1beta3\n\
             kind: CloudStackCluster\n\
             metadata:\n  name: {name}\n  namespace: {namespace}\n\
             # flavor: {flavor}\n",
            name = request.cluster_name,
            namespace = request.namespace,
            flavor = request.flavor,
        )))
    }
}
