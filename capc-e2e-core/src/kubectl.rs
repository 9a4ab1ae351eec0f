//! Collaborators backed by the `kubectl` and `clusterctl` binaries.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::collab::{
    ClusterRef, ClusterTemplateRequest, NamespaceRef, OrchestrationEndpoint, TemplateDocument,
    TemplateRenderer, WatchSubscription,
};
use crate::errors::EndpointError;
use crate::util::sanitize_component;

const CLUSTER_RESOURCE: &str = "clusters.cluster.x-k8s.io";

/// Kinds written to `resources.yaml` when a namespace is dumped.
const DUMP_KINDS: &str = "clusters.cluster.x-k8s.io,machinedeployments.cluster.x-k8s.io,\
machinesets.cluster.x-k8s.io,machines.cluster.x-k8s.io,kubeadmcontrolplanes.controlplane.cluster.x-k8s.io,\
kubeadmconfigs.bootstrap.cluster.x-k8s.io,cloudstackclusters.infrastructure.cluster.x-k8s.io,\
cloudstackmachines.infrastructure.cluster.x-k8s.io,cloudstackmachinetemplates.infrastructure.cluster.x-k8s.io,\
secrets,events";

/// Limit on a single `kubectl` or `clusterctl` invocation.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Run `cmd` to completion, feeding `stdin` if given. Non-zero exit is an
/// [`EndpointError::CommandFailed`].
async fn run_command(
    mut cmd: Command,
    shown: &str,
    stdin: Option<&[u8]>,
    limit: Duration,
) -> Result<Output, EndpointError> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| EndpointError::Spawn {
        command: shown.to_string(),
        source,
    })?;
    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(bytes).await?;
        pipe.shutdown().await?;
    }

    let output = tokio::time::timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| EndpointError::Other(format!("{shown} timed out after {limit:?}")))??;

    if !output.status.success() {
        return Err(EndpointError::CommandFailed {
            command: shown.to_string(),
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

/// API server "no such object" replies only; a lowercase "not found" also
/// shows up for unknown resource types and must not read as "gone".
fn is_not_found(stderr: &str) -> bool {
    stderr.contains("(NotFound)")
}

/// [`OrchestrationEndpoint`] driving a management cluster through `kubectl`.
#[derive(Debug, Clone)]
pub struct KubectlEndpoint {
    name: String,
    kubeconfig: PathBuf,
    kubectl: PathBuf,
    command_timeout: Duration,
}

impl KubectlEndpoint {
    pub fn new(name: impl Into<String>, kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kubeconfig: kubeconfig.into(),
            kubectl: PathBuf::from("kubectl"),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_binary(mut self, kubectl: impl Into<PathBuf>) -> Self {
        self.kubectl = kubectl.into();
        self
    }

    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn args(&self, args: &[&str]) -> Vec<OsString> {
        let mut all = vec![OsString::from("--kubeconfig"), self.kubeconfig.clone().into_os_string()];
        all.extend(args.iter().map(OsString::from));
        all
    }

    fn command(&self, args: &[&str]) -> (Command, String) {
        let mut cmd = Command::new(&self.kubectl);
        cmd.args(self.args(args));
        (cmd, format!("kubectl {}", args.join(" ")))
    }

    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Output, EndpointError> {
        let (cmd, shown) = self.command(args);
        debug!(endpoint = %self.name, command = %shown, "Running kubectl");
        run_command(cmd, &shown, stdin, self.command_timeout).await
    }

    /// `<out_dir>/<namespace>`, created on demand.
    async fn namespace_dir(out_dir: &Path, namespace: &NamespaceRef) -> Result<PathBuf, EndpointError> {
        let dir = out_dir.join(sanitize_component(&namespace.name));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

/// Running `kubectl get events --watch`.
pub struct KubectlWatch {
    namespace: String,
    child: Child,
}

impl WatchSubscription for KubectlWatch {
    fn cancel(self: Box<Self>) {
        let KubectlWatch { namespace, mut child } = *self;
        if let Err(e) = child.start_kill() {
            // Already exited on its own, e.g. the namespace went away.
            debug!(%namespace, error = %e, "Event watch was not running");
        }
    }
}

#[async_trait]
impl OrchestrationEndpoint for KubectlEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn kubeconfig_path(&self) -> &Path {
        &self.kubeconfig
    }

    async fn create_namespace(&self, name: &str) -> Result<NamespaceRef, EndpointError> {
        self.run(&["create", "namespace", name], None).await?;
        info!(endpoint = %self.name, namespace = %name, "Namespace created");
        Ok(NamespaceRef::new(name))
    }

    async fn delete_namespace(&self, namespace: &NamespaceRef) -> Result<(), EndpointError> {
        self.run(
            &["delete", "namespace", namespace.name.as_str(), "--ignore-not-found", "--wait=false"],
            None,
        )
        .await?;
        Ok(())
    }

    async fn watch_namespace_events(
        &self,
        namespace: &NamespaceRef,
        out_dir: &Path,
    ) -> Result<Box<dyn WatchSubscription>, EndpointError> {
        let dir = Self::namespace_dir(out_dir, namespace).await?;
        let log = tokio::fs::File::create(dir.join("events.log")).await?.into_std().await;

        let (mut cmd, shown) = self.command(&[
            "get",
            "events",
            "--namespace",
            namespace.name.as_str(),
            "--watch",
            "--output",
            "wide",
        ]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let child = cmd.spawn().map_err(|source| EndpointError::Spawn {
            command: shown,
            source,
        })?;
        debug!(endpoint = %self.name, namespace = %namespace, "Watching namespace events");
        Ok(Box::new(KubectlWatch {
            namespace: namespace.name.clone(),
            child,
        }))
    }

    async fn apply(&self, template: &TemplateDocument) -> Result<(), EndpointError> {
        if template.is_empty() {
            return Err(EndpointError::Other("refusing to apply an empty template".to_string()));
        }
        self.run(&["apply", "-f", "-"], Some(template.as_bytes())).await?;
        Ok(())
    }

    async fn get_cluster_by_name(&self, name: &str, namespace: &str) -> Result<ClusterRef, EndpointError> {
        match self
            .run(&["get", CLUSTER_RESOURCE, name, "--namespace", namespace, "-o", "name"], None)
            .await
        {
            Ok(_) => Ok(ClusterRef::new(namespace, name)),
            Err(EndpointError::CommandFailed { stderr, .. }) if is_not_found(&stderr) => Err(EndpointError::NotFound {
                kind: "Cluster",
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn delete_cluster(&self, cluster: &ClusterRef) -> Result<(), EndpointError> {
        self.run(
            &[
                "delete",
                CLUSTER_RESOURCE,
                cluster.name.as_str(),
                "--namespace",
                cluster.namespace.as_str(),
                "--ignore-not-found",
                "--wait=false",
            ],
            None,
        )
        .await?;
        info!(endpoint = %self.name, cluster = %cluster, "Cluster deletion requested");
        Ok(())
    }

    async fn dump_resources(&self, namespace: &NamespaceRef, out_dir: &Path) -> Result<(), EndpointError> {
        let dir = Self::namespace_dir(out_dir, namespace).await?;
        let output = self
            .run(
                &["get", DUMP_KINDS, "--namespace", namespace.name.as_str(), "--ignore-not-found", "-o", "yaml"],
                None,
            )
            .await?;
        let path = dir.join("resources.yaml");
        tokio::fs::write(&path, &output.stdout).await?;
        debug!(namespace = %namespace, path = %path.display(), "Dumped namespace resources");
        Ok(())
    }
}

/// [`TemplateRenderer`] running `clusterctl generate cluster`.
#[derive(Debug, Clone)]
pub struct ClusterctlRenderer {
    clusterctl: PathBuf,
    command_timeout: Duration,
}

impl Default for ClusterctlRenderer {
    fn default() -> Self {
        Self {
            clusterctl: PathBuf::from("clusterctl"),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl ClusterctlRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_binary(mut self, clusterctl: impl Into<PathBuf>) -> Self {
        self.clusterctl = clusterctl.into();
        self
    }

    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn generate_args(request: &ClusterTemplateRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "generate".into(),
            "cluster".into(),
            request.cluster_name.clone().into(),
            "--kubeconfig".into(),
            request.kubeconfig_path.clone().into_os_string(),
            "--config".into(),
            request.clusterctl_config_path.clone().into_os_string(),
            "--infrastructure".into(),
            request.infrastructure_provider.clone().into(),
            "--target-namespace".into(),
            request.namespace.clone().into(),
            "--kubernetes-version".into(),
            request.kubernetes_version.clone().into(),
            "--control-plane-machine-count".into(),
            request.control_plane_machine_count.to_string().into(),
            "--worker-machine-count".into(),
            request.worker_machine_count.to_string().into(),
        ];
        if !request.flavor.is_empty() {
            args.push("--flavor".into());
            args.push(request.flavor.clone().into());
        }
        args
    }
}

#[async_trait]
impl TemplateRenderer for ClusterctlRenderer {
    async fn render(&self, request: &ClusterTemplateRequest) -> Result<TemplateDocument, EndpointError> {
        let mut cmd = Command::new(&self.clusterctl);
        cmd.args(Self::generate_args(request));
        let shown = format!("clusterctl generate cluster {}", request.cluster_name);

        tokio::fs::create_dir_all(&request.log_folder).await?;
        let base = sanitize_component(&request.cluster_name);
        let log_path = request.log_folder.join(format!("{base}-clusterctl.log"));

        let result = run_command(cmd, &shown, None, self.command_timeout).await;
        let (stdout, stderr) = match &result {
            Ok(output) => (output.stdout.as_slice(), output.stderr.as_slice()),
            Err(EndpointError::CommandFailed { stderr, .. }) => (&[][..], stderr.as_bytes()),
            Err(_) => (&[][..], &[][..]),
        };
        if let Err(e) = tokio::fs::write(&log_path, stderr).await {
            warn!(path = %log_path.display(), error = %e, "Failed to write clusterctl log");
        }
        if !stdout.is_empty() {
            tokio::fs::write(request.log_folder.join(format!("{base}.yaml")), stdout).await?;
        }

        let output = result?;
        info!(
            cluster = %request.cluster_name,
            flavor = %request.flavor,
            bytes = output.stdout.len(),
            "Rendered cluster template"
        );
        Ok(TemplateDocument::new(output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_run_command_captures_stdout() {
        let output = run_command(sh("echo hello"), "echo", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_command_feeds_stdin() {
        let output = run_command(sh("cat"), "cat", Some(b"kind: Cluster\n"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.stdout, b"kind: Cluster\n");
    }

    #[tokio::test]
    async fn test_run_command_reports_exit_code_and_stderr() {
        let err = run_command(sh("echo nope >&2; exit 3"), "fail", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            EndpointError::CommandFailed { exit_code, stderr, .. } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_command_times_out() {
        let err = run_command(sh("sleep 5"), "sleep", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let endpoint = KubectlEndpoint::new("bootstrap", "/dev/null")
            .with_binary("/nonexistent/kubectl-for-capc-tests");
        let err = endpoint.create_namespace("ns").await.unwrap_err();
        assert!(matches!(err, EndpointError::Spawn { .. }));
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found(
            r#"Error from server (NotFound): clusters.cluster.x-k8s.io "c" not found"#
        ));
        assert!(!is_not_found("Unable to connect to the server: dial tcp"));
        assert!(!is_not_found(
            r#"error: the server doesn't have a resource type "clusters.cluster.x-k8s.io" (not found)"#
        ));
        assert!(!is_not_found(
            r#"error: resource mapping not found for name: "c" namespace: "ns" from "STDIN": no matches for kind "Cluster" in version "cluster.x-k8s.io/v1beta1""#
        ));
    }

    /// Stand-in `kubectl` that records its arguments and answers `get` by
    /// cluster name.
    fn fake_kubectl(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("kubectl");
        let script = r#"#!/bin/sh
echo "$@" >> "$(dirname "$0")/calls.log"
case "$*" in
  *" get "*" gone "*)
    echo 'Error from server (NotFound): clusters.cluster.x-k8s.io "gone" not found' >&2
    exit 1 ;;
  *" get "*" unmapped "*)
    echo 'error: the server has no resource type "clusters" (not found)' >&2
    exit 1 ;;
esac
echo ok
"#;
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_endpoint_runs_kubectl_with_kubeconfig() {
        let tmp = tempfile::tempdir().unwrap();
        let endpoint = KubectlEndpoint::new("bootstrap", "/kube/config")
            .with_binary(fake_kubectl(tmp.path()))
            .with_command_timeout(Duration::from_secs(10));

        let ns = endpoint.create_namespace("capc-ns").await.unwrap();
        assert_eq!(ns.name, "capc-ns");
        let cluster = endpoint.get_cluster_by_name("present", "capc-ns").await.unwrap();
        assert_eq!(cluster, ClusterRef::new("capc-ns", "present"));

        let calls = std::fs::read_to_string(tmp.path().join("calls.log")).unwrap();
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(lines[0], "--kubeconfig /kube/config create namespace capc-ns");
        assert_eq!(
            lines[1],
            "--kubeconfig /kube/config get clusters.cluster.x-k8s.io present --namespace capc-ns -o name"
        );
    }

    #[tokio::test]
    async fn test_get_cluster_maps_only_api_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let endpoint = KubectlEndpoint::new("bootstrap", "/kube/config").with_binary(fake_kubectl(tmp.path()));

        let err = endpoint.get_cluster_by_name("gone", "ns").await.unwrap_err();
        assert!(
            matches!(&err, EndpointError::NotFound { kind: "Cluster", name, .. } if name == "gone"),
            "{err}"
        );

        let err = endpoint.get_cluster_by_name("unmapped", "ns").await.unwrap_err();
        match err {
            EndpointError::CommandFailed { exit_code, stderr, .. } => {
                assert_eq!(exit_code, Some(1));
                assert!(stderr.contains("resource type"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_kubectl_args_prefix_kubeconfig() {
        let endpoint = KubectlEndpoint::new("bootstrap", "/home/e2e/.kube/config");
        let args = endpoint.args(&["get", "ns"]);
        assert_eq!(
            args,
            vec![
                OsString::from("--kubeconfig"),
                OsString::from("/home/e2e/.kube/config"),
                OsString::from("get"),
                OsString::from("ns"),
            ]
        );
    }

    #[test]
    fn test_generate_args() {
        let request = ClusterTemplateRequest {
            namespace: "ns-1".to_string(),
            cluster_name: "invalid-worker-offering-abc123".to_string(),
            kubernetes_version: "v1.27.2".to_string(),
            control_plane_machine_count: 1,
            worker_machine_count: 1,
            flavor: "invalid-worker-offering".to_string(),
            infrastructure_provider: "cloudstack".to_string(),
            kubeconfig_path: PathBuf::from("/kube/config"),
            clusterctl_config_path: PathBuf::from("/repo/clusterctl-config.yaml"),
            log_folder: PathBuf::from("/tmp/logs"),
        };
        let args: Vec<String> = ClusterctlRenderer::generate_args(&request)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let joined = args.join(" ");
        assert!(joined.starts_with("generate cluster invalid-worker-offering-abc123 "));
        assert!(joined.contains("--flavor invalid-worker-offering"));
        assert!(joined.contains("--worker-machine-count 1"));
        assert!(joined.contains("--target-namespace ns-1"));

        let mut no_flavor = request;
        no_flavor.flavor.clear();
        let args = ClusterctlRenderer::generate_args(&no_flavor);
        assert!(!args.iter().any(|a| a == "--flavor"));
    }
}
