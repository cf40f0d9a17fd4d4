//! Snap integration
//!
//! Directory layout, service control through `snapctl`, pre-init checks and
//! Kubernetes clients built from the local kubeconfigs. Everything the
//! orchestrator does to the host goes through the [`Snap`] trait.

use crate::error::{Error, Result};
use crate::kube_client::{ClusterApi, KubeClusterApi};
use async_trait::async_trait;
use k8sd_config::{ClusterConfig, DatastoreKind};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};

/// Role a node runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Worker,
    ControlPlane,
}

/// Kubeconfig a client authenticates with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeconfigKind {
    /// `admin.conf`, cluster admin
    Admin,
    /// `kubelet.conf`, the node identity
    Node,
}

impl KubeconfigKind {
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Admin => "admin.conf",
            Self::Node => "kubelet.conf",
        }
    }
}

/// Filesystem layout of the snap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapPaths {
    snap_dir: PathBuf,
    common_dir: PathBuf,
}

impl SnapPaths {
    /// Layout rooted at the read-only snap and its writable common directory
    pub fn new(snap_dir: impl Into<PathBuf>, common_dir: impl Into<PathBuf>) -> Self {
        Self {
            snap_dir: snap_dir.into(),
            common_dir: common_dir.into(),
        }
    }

    /// Path of a bundled executable
    pub fn binary(&self, name: &str) -> PathBuf {
        self.snap_dir.join("bin").join(name)
    }

    pub fn kubernetes_config_dir(&self) -> PathBuf {
        self.common_dir.join("etc/kubernetes")
    }

    pub fn kubernetes_pki_dir(&self) -> PathBuf {
        self.kubernetes_config_dir().join("pki")
    }

    /// Kubeconfig file of a component
    pub fn kubeconfig(&self, kind: KubeconfigKind) -> PathBuf {
        self.kubernetes_config_dir().join(kind.file_name())
    }

    pub fn k8s_dqlite_state_dir(&self) -> PathBuf {
        self.common_dir.join("var/lib/k8s-dqlite")
    }

    pub fn kubelet_root_dir(&self) -> PathBuf {
        self.common_dir.join("var/lib/kubelet")
    }

    pub fn service_arguments_dir(&self) -> PathBuf {
        self.common_dir.join("args")
    }

    pub fn service_extra_config_dir(&self) -> PathBuf {
        self.service_arguments_dir().join("conf.d")
    }

    pub fn containerd_config_dir(&self) -> PathBuf {
        self.common_dir.join("etc/containerd")
    }

    pub fn containerd_extra_config_dir(&self) -> PathBuf {
        self.containerd_config_dir().join("conf.d")
    }

    pub fn containerd_socket_dir(&self) -> PathBuf {
        self.common_dir.join("run/containerd")
    }

    pub fn containerd_state_dir(&self) -> PathBuf {
        self.common_dir.join("var/lib/containerd")
    }

    pub fn lock_files_dir(&self) -> PathBuf {
        self.common_dir.join("lock")
    }

    /// Marker present when the node joined as a worker
    pub fn worker_lock_file(&self) -> PathBuf {
        self.lock_files_dir().join("worker")
    }

    /// Directories that must exist before any file is written
    pub fn all_directories(&self) -> Vec<PathBuf> {
        vec![
            self.kubernetes_config_dir(),
            self.kubernetes_pki_dir(),
            self.k8s_dqlite_state_dir(),
            self.kubelet_root_dir(),
            self.service_arguments_dir(),
            self.service_extra_config_dir(),
            self.containerd_config_dir(),
            self.containerd_extra_config_dir(),
            self.containerd_state_dir(),
            self.lock_files_dir(),
        ]
    }
}

#[async_trait]
/// Host integration of the k8s snap
pub trait Snap: Send + Sync {
    fn paths(&self) -> &SnapPaths;

    fn hostname(&self) -> &str;

    async fn start_service(&self, name: &str) -> Result<()>;

    async fn restart_service(&self, name: &str) -> Result<()>;

    /// Mirror settings into the snap configuration
    async fn snapctl_set(&self, settings: &BTreeMap<String, String>) -> Result<()>;

    /// Verify the host can run the services of `role`
    async fn pre_init_checks(&self, config: &ClusterConfig, role: NodeRole) -> Result<()>;

    async fn kubernetes_client(&self, kind: KubeconfigKind) -> Result<Arc<dyn ClusterApi>>;
}

/// Services a worker runs, in start order
pub const WORKER_SERVICES: [&str; 4] = ["containerd", "kubelet", "kube-proxy", "k8s-apiserver-proxy"];

/// Control plane services started after the datastore, in start order
pub const CONTROL_PLANE_SERVICES: [&str; 6] = [
    "containerd",
    "kube-apiserver",
    "kubelet",
    "kube-proxy",
    "kube-controller-manager",
    "kube-scheduler",
];

/// Start the services of a worker node in order
pub async fn start_worker_services(snap: &dyn Snap) -> Result<()> {
    for service in WORKER_SERVICES {
        snap.start_service(service).await?;
    }
    Ok(())
}

/// Start the datastore first, then the API server before its clients.
pub async fn start_control_plane_services(snap: &dyn Snap, datastore: DatastoreKind) -> Result<()> {
    if datastore == DatastoreKind::K8sDqlite {
        snap.start_service("k8s-dqlite").await?;
    }
    for service in CONTROL_PLANE_SERVICES {
        snap.start_service(service).await?;
    }
    Ok(())
}

/// Create or remove the worker marker file
pub fn mark_as_worker(paths: &SnapPaths, worker: bool) -> Result<()> {
    let lock = paths.worker_lock_file();
    if worker {
        if let Some(parent) = lock.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&lock, b"")?;
    } else if lock.exists() {
        std::fs::remove_file(&lock)?;
    }
    Ok(())
}

/// Whether the node joined as a worker
pub fn is_worker(paths: &SnapPaths) -> bool {
    paths.worker_lock_file().exists()
}

/// Snap running on the local host
pub struct LocalSnap {
    paths: SnapPaths,
    hostname: String,
}

impl LocalSnap {
    /// Create a snap rooted at `paths`
    pub fn new(paths: SnapPaths, hostname: String) -> Self {
        Self { paths, hostname }
    }

    async fn snapctl(&self, args: &[String]) -> Result<()> {
        info!(args = ?args, "Running snapctl");
        let output = Command::new("snapctl").args(args).output().await?;
        if output.status.success() {
            return Ok(());
        }
        let reason = format!(
            "snapctl {} exited with {:?}: {}",
            args.join(" "),
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
        warn!(%reason, "snapctl failed");
        Err(Error::Service {
            service: args.last().cloned().unwrap_or_default(),
            reason,
        })
    }

    fn ports_for(config: &ClusterConfig, role: NodeRole) -> Vec<(&'static str, u16)> {
        let mut ports = vec![
            ("kubelet", 10250),
            ("kubelet healthz", 10248),
            ("kube-proxy healthz", 10256),
            ("kube-proxy metrics", 10249),
        ];
        match role {
            NodeRole::Worker => ports.push(("k8s-apiserver-proxy", config.api_server.secure_port())),
            NodeRole::ControlPlane => {
                ports.push(("kube-apiserver", config.api_server.secure_port()));
                ports.push(("kube-scheduler", 10259));
                ports.push(("kube-controller-manager", 10257));
                if matches!(config.datastore.datastore_kind(), Ok(DatastoreKind::K8sDqlite)) {
                    ports.push(("k8s-dqlite", config.datastore.k8s_dqlite_port()));
                }
            }
        }
        ports
    }

    fn binaries_for(role: NodeRole) -> &'static [&'static str] {
        match role {
            NodeRole::Worker => &["kubelet", "kube-proxy", "containerd", "k8s-apiserver-proxy"],
            NodeRole::ControlPlane => &[
                "kube-apiserver",
                "kube-controller-manager",
                "kube-scheduler",
                "kubelet",
                "kube-proxy",
                "containerd",
            ],
        }
    }
}

#[async_trait]
impl Snap for LocalSnap {
    fn paths(&self) -> &SnapPaths {
        &self.paths
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        self.snapctl(&["start".to_string(), "--enable".to_string(), format!("k8s.{name}")])
            .await
    }

    async fn restart_service(&self, name: &str) -> Result<()> {
        self.snapctl(&["restart".to_string(), format!("k8s.{name}")]).await
    }

    async fn snapctl_set(&self, settings: &BTreeMap<String, String>) -> Result<()> {
        if settings.is_empty() {
            return Ok(());
        }
        let mut args = vec!["set".to_string()];
        args.extend(settings.iter().map(|(key, value)| format!("{key}={value}")));
        self.snapctl(&args).await
    }

    async fn pre_init_checks(&self, config: &ClusterConfig, role: NodeRole) -> Result<()> {
        let mut failures = Vec::new();

        for (service, port) in Self::ports_for(config, role) {
            if let Err(e) = tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
                failures.push(format!("port {port} required by {service} is not available: {e}"));
            }
        }

        for binary in Self::binaries_for(role) {
            let path = self.paths.binary(binary);
            match Command::new(&path).arg("--version").output().await {
                Ok(output) if output.status.success() => {}
                Ok(output) => failures.push(format!(
                    "{} --version exited with {:?}",
                    path.display(),
                    output.status.code()
                )),
                Err(e) => failures.push(format!("{} is not runnable: {e}", path.display())),
            }
        }

        let socket_dir = self.paths.containerd_socket_dir();
        if socket_dir.exists() {
            failures.push(format!(
                "containerd socket directory {} already exists, is another container runtime running?",
                socket_dir.display()
            ));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::PreInitChecks(failures.join("; ")))
        }
    }

    async fn kubernetes_client(&self, kind: KubeconfigKind) -> Result<Arc<dyn ClusterApi>> {
        let client = KubeClusterApi::from_kubeconfig(&self.paths.kubeconfig(kind)).await?;
        Ok(Arc::new(client))
    }
}

/// Whether `path` is a plain file name, safe to join onto a directory
pub fn is_plain_file_name(path: &str) -> bool {
    let candidate = Path::new(path);
    !path.is_empty()
        && candidate.file_name().is_some_and(|name| name == candidate.as_os_str())
        && path != "."
        && path != ".."
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout() {
        let paths = SnapPaths::new("/snap/k8s/current", "/var/snap/k8s/common");
        assert_eq!(
            paths.kubeconfig(KubeconfigKind::Node),
            PathBuf::from("/var/snap/k8s/common/etc/kubernetes/kubelet.conf")
        );
        assert_eq!(
            paths.kubernetes_pki_dir(),
            PathBuf::from("/var/snap/k8s/common/etc/kubernetes/pki")
        );
        assert_eq!(paths.binary("kubelet"), PathBuf::from("/snap/k8s/current/bin/kubelet"));
    }

    #[test]
    fn test_worker_marker() {
        let dir = TempDir::new().unwrap();
        let paths = SnapPaths::new(dir.path().join("snap"), dir.path().join("common"));

        assert!(!is_worker(&paths));
        mark_as_worker(&paths, true).unwrap();
        assert!(is_worker(&paths));
        mark_as_worker(&paths, true).unwrap();
        assert!(is_worker(&paths));
        mark_as_worker(&paths, false).unwrap();
        assert!(!is_worker(&paths));
    }

    #[test]
    fn test_plain_file_name() {
        assert!(is_plain_file_name("bootstrap.yaml"));
        assert!(!is_plain_file_name("../etc/passwd"));
        assert!(!is_plain_file_name("a/b"));
        assert!(!is_plain_file_name(""));
        assert!(!is_plain_file_name(".."));
    }

    #[test]
    fn test_control_plane_ports_include_datastore() {
        let mut config = ClusterConfig::default();
        config.set_defaults();
        let ports = LocalSnap::ports_for(&config, NodeRole::ControlPlane);
        assert!(ports.contains(&("k8s-dqlite", 9000)));
        assert!(ports.contains(&("kube-apiserver", 6443)));

        let worker = LocalSnap::ports_for(&config, NodeRole::Worker);
        assert!(!worker.iter().any(|(service, _)| *service == "kube-scheduler"));
    }
}
