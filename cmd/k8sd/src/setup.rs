//! On-disk materialization
//!
//! Writes certificates, kubeconfigs, service argument files and extra
//! configuration for the services of a node. Argument files hold one
//! `--flag=value` per line and are read by the service wrappers.

use crate::error::{Error, Result};
use crate::snap::{is_plain_file_name, KubeconfigKind, SnapPaths};
use k8sd_config::cluster::Datastore;
use k8sd_config::{generate_kubeconfig, DatastoreKind, ExtraArgs};
use k8sd_crypto::pki::{ControlPlanePki, ExternalDatastorePki, K8sDqlitePki, WorkerNodePki};
use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CERT_MODE: u32 = 0o644;
const KEY_MODE: u32 = 0o600;

/// Address components on the node reach the API server through
pub const LOCAL_API_SERVER: &str = "127.0.0.1";

/// Create every directory the services expect
pub fn ensure_all_directories(paths: &SnapPaths) -> Result<()> {
    for dir in paths.all_directories() {
        fs::create_dir_all(&dir)?;
    }
    Ok(())
}

fn write_file(path: &Path, contents: &str, mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    debug!(path = %path.display(), "Wrote file");
    Ok(())
}

/// Write set values and remove files whose value is unset.
fn ensure_files(files: &[(PathBuf, Option<&str>, u32)]) -> Result<()> {
    for (path, contents, mode) in files {
        match contents.filter(|c| !c.is_empty()) {
            Some(contents) => write_file(path, contents, *mode)?,
            None if path.exists() => fs::remove_file(path)?,
            None => {}
        }
    }
    Ok(())
}

/// Write the worker certificates into the PKI directory
pub fn ensure_worker_pki(paths: &SnapPaths, pki: &WorkerNodePki) -> Result<()> {
    let dir = paths.kubernetes_pki_dir();
    ensure_files(&[
        (dir.join("ca.crt"), pki.ca_cert.as_deref(), CERT_MODE),
        (dir.join("client-ca.crt"), pki.client_ca_cert.as_deref(), CERT_MODE),
        (dir.join("kubelet.crt"), pki.kubelet_cert.as_deref(), CERT_MODE),
        (dir.join("kubelet.key"), pki.kubelet_key.as_deref(), KEY_MODE),
    ])
}

/// Write the control plane certificates and keys into the PKI directory
pub fn ensure_control_plane_pki(paths: &SnapPaths, pki: &ControlPlanePki) -> Result<()> {
    let dir = paths.kubernetes_pki_dir();
    ensure_files(&[
        (dir.join("ca.crt"), pki.ca_cert.as_deref(), CERT_MODE),
        (dir.join("ca.key"), pki.ca_key.as_deref(), KEY_MODE),
        (dir.join("client-ca.crt"), pki.client_ca_cert.as_deref(), CERT_MODE),
        (dir.join("client-ca.key"), pki.client_ca_key.as_deref(), KEY_MODE),
        (dir.join("front-proxy-ca.crt"), pki.front_proxy_ca_cert.as_deref(), CERT_MODE),
        (dir.join("front-proxy-ca.key"), pki.front_proxy_ca_key.as_deref(), KEY_MODE),
        (dir.join("front-proxy-client.crt"), pki.front_proxy_client_cert.as_deref(), CERT_MODE),
        (dir.join("front-proxy-client.key"), pki.front_proxy_client_key.as_deref(), KEY_MODE),
        (dir.join("serviceaccount.key"), pki.service_account_key.as_deref(), KEY_MODE),
        (dir.join("apiserver.crt"), pki.apiserver_cert.as_deref(), CERT_MODE),
        (dir.join("apiserver.key"), pki.apiserver_key.as_deref(), KEY_MODE),
        (
            dir.join("apiserver-kubelet-client.crt"),
            pki.apiserver_kubelet_client_cert.as_deref(),
            CERT_MODE,
        ),
        (
            dir.join("apiserver-kubelet-client.key"),
            pki.apiserver_kubelet_client_key.as_deref(),
            KEY_MODE,
        ),
        (dir.join("kubelet.crt"), pki.kubelet_cert.as_deref(), CERT_MODE),
        (dir.join("kubelet.key"), pki.kubelet_key.as_deref(), KEY_MODE),
    ])
}

/// Write the k8s-dqlite certificate pair
pub fn ensure_k8s_dqlite_pki(paths: &SnapPaths, pki: &K8sDqlitePki) -> Result<()> {
    let dir = paths.k8s_dqlite_state_dir();
    ensure_files(&[
        (dir.join("cluster.crt"), pki.k8s_dqlite_cert.as_deref(), CERT_MODE),
        (dir.join("cluster.key"), pki.k8s_dqlite_key.as_deref(), KEY_MODE),
    ])
}

/// Write the client certificates for an external datastore
pub fn ensure_external_datastore_pki(paths: &SnapPaths, pki: &ExternalDatastorePki) -> Result<()> {
    let dir = paths.kubernetes_pki_dir();
    ensure_files(&[
        (dir.join("datastore-ca.crt"), pki.datastore_ca_cert.as_deref(), CERT_MODE),
        (dir.join("datastore-client.crt"), pki.datastore_client_cert.as_deref(), CERT_MODE),
        (dir.join("datastore-client.key"), pki.datastore_client_key.as_deref(), KEY_MODE),
    ])
}

/// Write a client certificate kubeconfig
pub fn kubeconfig(path: &Path, server: &str, ca: &str, cert: &str, key: &str) -> Result<()> {
    let contents = generate_kubeconfig(server, ca, cert, key)?;
    write_file(path, &contents, KEY_MODE)
}

/// Kubeconfigs of the kubelet and kube-proxy on a worker
pub fn worker_kubeconfigs(paths: &SnapPaths, secure_port: u16, pki: &WorkerNodePki) -> Result<()> {
    let server = format!("{LOCAL_API_SERVER}:{secure_port}");
    let ca = pki.ca_cert.as_deref().unwrap_or_default();
    kubeconfig(
        &paths.kubeconfig(KubeconfigKind::Node),
        &server,
        ca,
        pki.kubelet_client_cert.as_deref().unwrap_or_default(),
        pki.kubelet_client_key.as_deref().unwrap_or_default(),
    )?;
    kubeconfig(
        &paths.kubernetes_config_dir().join("proxy.conf"),
        &server,
        ca,
        pki.kube_proxy_client_cert.as_deref().unwrap_or_default(),
        pki.kube_proxy_client_key.as_deref().unwrap_or_default(),
    )
}

/// Kubeconfigs of every control plane component
pub fn control_plane_kubeconfigs(
    paths: &SnapPaths,
    secure_port: u16,
    pki: &ControlPlanePki,
) -> Result<()> {
    let server = format!("{LOCAL_API_SERVER}:{secure_port}");
    let ca = pki.ca_cert.as_deref().unwrap_or_default();
    let dir = paths.kubernetes_config_dir();

    for (file, cert, key) in [
        ("admin.conf", &pki.admin_client_cert, &pki.admin_client_key),
        (
            "controller.conf",
            &pki.kube_controller_manager_client_cert,
            &pki.kube_controller_manager_client_key,
        ),
        (
            "scheduler.conf",
            &pki.kube_scheduler_client_cert,
            &pki.kube_scheduler_client_key,
        ),
        ("proxy.conf", &pki.kube_proxy_client_cert, &pki.kube_proxy_client_key),
        ("kubelet.conf", &pki.kubelet_client_cert, &pki.kubelet_client_key),
    ] {
        kubeconfig(
            &dir.join(file),
            &server,
            ca,
            cert.as_deref().unwrap_or_default(),
            key.as_deref().unwrap_or_default(),
        )?;
    }
    Ok(())
}

fn parse_arguments(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("--"))
        .map(|line| match line.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (line.to_string(), "true".to_string()),
        })
        .collect()
}

fn normalize_flag(flag: &str) -> String {
    if flag.starts_with("--") {
        flag.to_string()
    } else {
        format!("--{flag}")
    }
}

/// Apply `updates`, then `extra`, to the argument file of `service`.
///
/// A `None` in `extra` removes the flag.
pub fn update_service_arguments(
    paths: &SnapPaths,
    service: &str,
    updates: &[(&str, String)],
    extra: &ExtraArgs,
) -> Result<()> {
    let path = paths.service_arguments_dir().join(service);
    let mut arguments = match fs::read_to_string(&path) {
        Ok(contents) => parse_arguments(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
        Err(e) => return Err(e.into()),
    };

    for (flag, value) in updates {
        arguments.insert(normalize_flag(flag), value.clone());
    }
    for (flag, value) in extra {
        match value {
            Some(value) => arguments.insert(normalize_flag(flag), value.clone()),
            None => arguments.remove(&normalize_flag(flag)),
        };
    }

    let contents: String = arguments
        .iter()
        .map(|(flag, value)| format!("{flag}={value}\n"))
        .collect();
    write_file(&path, &contents, CERT_MODE)?;
    info!(service, "Updated service arguments");
    Ok(())
}

fn display(path: PathBuf) -> String {
    path.display().to_string()
}

/// containerd arguments and config, with optional extra TOML
pub fn containerd(paths: &SnapPaths, extra_config: Option<&str>, extra: &ExtraArgs) -> Result<()> {
    let config_path = paths.containerd_config_dir().join("config.toml");
    let config = format!(
        r#"version = 2
root = "{root}"
state = "{state}"
imports = ["{imports}/*.toml"]

[grpc]
address = "{socket}"

[plugins."io.containerd.grpc.v1.cri".containerd]
snapshotter = "overlayfs"
"#,
        root = paths.containerd_state_dir().display(),
        state = paths.containerd_socket_dir().display(),
        imports = paths.containerd_extra_config_dir().display(),
        socket = paths.containerd_socket_dir().join("containerd.sock").display(),
    );
    write_file(&config_path, &config, CERT_MODE)?;

    ensure_files(&[(
        paths.containerd_extra_config_dir().join("00-k8sd-extra.toml"),
        extra_config,
        CERT_MODE,
    )])?;

    update_service_arguments(
        paths,
        "containerd",
        &[
            ("--config", display(config_path)),
            ("--root", display(paths.containerd_state_dir())),
            ("--state", display(paths.containerd_socket_dir())),
            (
                "--address",
                display(paths.containerd_socket_dir().join("containerd.sock")),
            ),
        ],
        extra,
    )
}

/// Node-local kubelet settings shared by both roles
pub struct KubeletSettings<'a> {
    pub node_name: &'a str,
    pub node_ip: IpAddr,
    pub cluster_dns: &'a str,
    pub cluster_domain: &'a str,
    pub cloud_provider: &'a str,
}

/// kubelet arguments on a worker
pub fn kubelet_worker(paths: &SnapPaths, settings: &KubeletSettings<'_>, extra: &ExtraArgs) -> Result<()> {
    kubelet(paths, settings, &[], extra)
}

/// kubelet arguments on a control plane node, registered with taints
pub fn kubelet_control_plane(
    paths: &SnapPaths,
    settings: &KubeletSettings<'_>,
    taints: &[String],
    extra: &ExtraArgs,
) -> Result<()> {
    kubelet(paths, settings, taints, extra)
}

fn kubelet(
    paths: &SnapPaths,
    settings: &KubeletSettings<'_>,
    taints: &[String],
    extra: &ExtraArgs,
) -> Result<()> {
    let pki = paths.kubernetes_pki_dir();
    let mut args = vec![
        ("--anonymous-auth", "false".to_string()),
        ("--authentication-token-webhook", "true".to_string()),
        ("--client-ca-file", display(pki.join("client-ca.crt"))),
        (
            "--container-runtime-endpoint",
            display(paths.containerd_socket_dir().join("containerd.sock")),
        ),
        ("--fail-swap-on", "false".to_string()),
        ("--hostname-override", settings.node_name.to_string()),
        ("--kubeconfig", display(paths.kubeconfig(KubeconfigKind::Node))),
        ("--node-ip", settings.node_ip.to_string()),
        ("--root-dir", display(paths.kubelet_root_dir())),
        ("--tls-cert-file", display(pki.join("kubelet.crt"))),
        ("--tls-private-key-file", display(pki.join("kubelet.key"))),
    ];
    if !settings.cluster_dns.is_empty() {
        args.push(("--cluster-dns", settings.cluster_dns.to_string()));
    }
    if !settings.cluster_domain.is_empty() {
        args.push(("--cluster-domain", settings.cluster_domain.to_string()));
    }
    if !settings.cloud_provider.is_empty() {
        args.push(("--cloud-provider", settings.cloud_provider.to_string()));
    }
    if !taints.is_empty() {
        args.push(("--register-with-taints", taints.join(",")));
    }
    update_service_arguments(paths, "kubelet", &args, extra)
}

/// kube-proxy arguments
pub fn kube_proxy(paths: &SnapPaths, hostname: &str, pod_cidr: &str, extra: &ExtraArgs) -> Result<()> {
    update_service_arguments(
        paths,
        "kube-proxy",
        &[
            ("--cluster-cidr", pod_cidr.to_string()),
            ("--healthz-bind-address", "0.0.0.0".to_string()),
            ("--hostname-override", hostname.to_string()),
            (
                "--kubeconfig",
                display(paths.kubernetes_config_dir().join("proxy.conf")),
            ),
            ("--profiling", "false".to_string()),
        ],
        extra,
    )
}

/// Arguments and endpoint list of the local API server proxy
pub fn k8s_apiserver_proxy(
    paths: &SnapPaths,
    servers: &[String],
    secure_port: u16,
    extra: &ExtraArgs,
) -> Result<()> {
    let endpoints_path = paths.kubernetes_config_dir().join("k8s-apiserver-proxy.json");
    let endpoints = serde_json::to_string(&serde_json::json!({ "endpoints": servers }))?;
    write_file(&endpoints_path, &endpoints, CERT_MODE)?;

    update_service_arguments(
        paths,
        "k8s-apiserver-proxy",
        &[
            ("--endpoints", display(endpoints_path)),
            ("--kubeconfig", display(paths.kubeconfig(KubeconfigKind::Node))),
            ("--listen", format!(":{secure_port}")),
        ],
        extra,
    )
}

/// k8s-dqlite arguments and its init file with the listen address
pub fn k8s_dqlite(paths: &SnapPaths, address: &str, extra: &ExtraArgs) -> Result<()> {
    let state = paths.k8s_dqlite_state_dir();
    write_file(&state.join("init.yaml"), &format!("Address: {address}\n"), CERT_MODE)?;

    update_service_arguments(
        paths,
        "k8s-dqlite",
        &[
            ("--listen", format!("unix://{}", state.join("k8s-dqlite.sock").display())),
            ("--storage-dir", display(state)),
        ],
        extra,
    )
}

/// kube-controller-manager arguments
pub fn kube_controller_manager(paths: &SnapPaths, extra: &ExtraArgs) -> Result<()> {
    let pki = paths.kubernetes_pki_dir();
    let kubeconfig = display(paths.kubernetes_config_dir().join("controller.conf"));
    let mut args = vec![
        ("--authentication-kubeconfig", kubeconfig.clone()),
        ("--authorization-kubeconfig", kubeconfig.clone()),
        ("--kubeconfig", kubeconfig),
        ("--leader-elect-lease-duration", "30s".to_string()),
        ("--leader-elect-renew-deadline", "15s".to_string()),
        ("--profiling", "false".to_string()),
        ("--root-ca-file", display(pki.join("ca.crt"))),
        ("--service-account-private-key-file", display(pki.join("serviceaccount.key"))),
        ("--use-service-account-credentials", "true".to_string()),
    ];
    // Signing in-cluster is only possible with the CA key at hand.
    if pki.join("ca.key").exists() {
        args.push(("--cluster-signing-cert-file", display(pki.join("ca.crt"))));
        args.push(("--cluster-signing-key-file", display(pki.join("ca.key"))));
    }
    update_service_arguments(paths, "kube-controller-manager", &args, extra)
}

/// kube-scheduler arguments
pub fn kube_scheduler(paths: &SnapPaths, extra: &ExtraArgs) -> Result<()> {
    let kubeconfig = display(paths.kubernetes_config_dir().join("scheduler.conf"));
    update_service_arguments(
        paths,
        "kube-scheduler",
        &[
            ("--authentication-kubeconfig", kubeconfig.clone()),
            ("--authorization-kubeconfig", kubeconfig.clone()),
            ("--kubeconfig", kubeconfig),
            ("--leader-elect-lease-duration", "30s".to_string()),
            ("--leader-elect-renew-deadline", "15s".to_string()),
            ("--profiling", "false".to_string()),
        ],
        extra,
    )
}

/// Settings of the API server on this node
pub struct ApiServerSettings<'a> {
    pub node_ip: IpAddr,
    pub secure_port: u16,
    pub service_cidr: &'a str,
    pub auth_webhook_url: &'a str,
    pub datastore: &'a Datastore,
    pub authorization_mode: &'a str,
}

/// kube-apiserver arguments
pub fn kube_apiserver(paths: &SnapPaths, settings: &ApiServerSettings<'_>, extra: &ExtraArgs) -> Result<()> {
    let pki = paths.kubernetes_pki_dir();
    let config_dir = paths.kubernetes_config_dir();

    let webhook_config = config_dir.join("auth-token-webhook.conf");
    write_file(
        &webhook_config,
        &format!(
            r#"apiVersion: v1
kind: Config
clusters:
- name: k8s-token-auth-service
  cluster:
    insecure-skip-tls-verify: true
    server: {}
current-context: webhook
contexts:
- context:
    cluster: k8s-token-auth-service
    user: k8s-apiserver
  name: webhook
users:
- name: k8s-apiserver
  user: {{}}
"#,
            settings.auth_webhook_url
        ),
        KEY_MODE,
    )?;

    let mut args = vec![
        ("--advertise-address", settings.node_ip.to_string()),
        ("--allow-privileged", "true".to_string()),
        ("--authentication-token-webhook-config-file", display(webhook_config)),
        ("--authorization-mode", settings.authorization_mode.to_string()),
        ("--client-ca-file", display(pki.join("client-ca.crt"))),
        ("--kubelet-certificate-authority", display(pki.join("ca.crt"))),
        ("--kubelet-client-certificate", display(pki.join("apiserver-kubelet-client.crt"))),
        ("--kubelet-client-key", display(pki.join("apiserver-kubelet-client.key"))),
        ("--profiling", "false".to_string()),
        ("--proxy-client-cert-file", display(pki.join("front-proxy-client.crt"))),
        ("--proxy-client-key-file", display(pki.join("front-proxy-client.key"))),
        ("--requestheader-allowed-names", "front-proxy-client".to_string()),
        ("--requestheader-client-ca-file", display(pki.join("front-proxy-ca.crt"))),
        ("--requestheader-extra-headers-prefix", "X-Remote-Extra-".to_string()),
        ("--requestheader-group-headers", "X-Remote-Group".to_string()),
        ("--requestheader-username-headers", "X-Remote-User".to_string()),
        ("--secure-port", settings.secure_port.to_string()),
        ("--service-account-issuer", "https://kubernetes.default.svc".to_string()),
        ("--service-account-key-file", display(pki.join("serviceaccount.key"))),
        ("--service-account-signing-key-file", display(pki.join("serviceaccount.key"))),
        ("--service-cluster-ip-range", settings.service_cidr.to_string()),
        ("--tls-cert-file", display(pki.join("apiserver.crt"))),
        ("--tls-private-key-file", display(pki.join("apiserver.key"))),
    ];

    match settings.datastore.datastore_kind()? {
        DatastoreKind::K8sDqlite => {
            let socket = paths.k8s_dqlite_state_dir().join("k8s-dqlite.sock");
            args.push(("--etcd-servers", format!("unix://{}", socket.display())));
        }
        DatastoreKind::External => {
            let servers = settings
                .datastore
                .external_servers
                .as_deref()
                .unwrap_or_default()
                .join(",");
            args.push(("--etcd-servers", servers));
            for (flag, file, value) in [
                ("--etcd-cafile", "datastore-ca.crt", &settings.datastore.external_ca_cert),
                ("--etcd-certfile", "datastore-client.crt", &settings.datastore.external_client_cert),
                ("--etcd-keyfile", "datastore-client.key", &settings.datastore.external_client_key),
            ] {
                if value.as_deref().is_some_and(|v| !v.is_empty()) {
                    args.push((flag, display(pki.join(file))));
                }
            }
        }
    }

    update_service_arguments(paths, "kube-apiserver", &args, extra)
}

/// Write user supplied files next to the service arguments
pub fn extra_node_config_files(paths: &SnapPaths, files: &BTreeMap<String, String>) -> Result<()> {
    let dir = paths.service_extra_config_dir();
    for (name, contents) in files {
        if !is_plain_file_name(name) {
            return Err(Error::InvalidConfiguration(format!(
                "extra node config file name {name:?} must not contain a path"
            )));
        }
        write_file(&dir.join(name), contents, KEY_MODE)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths(dir: &TempDir) -> SnapPaths {
        SnapPaths::new(dir.path().join("snap"), dir.path().join("common"))
    }

    fn read_args(paths: &SnapPaths, service: &str) -> BTreeMap<String, String> {
        parse_arguments(&fs::read_to_string(paths.service_arguments_dir().join(service)).unwrap())
    }

    #[test]
    fn test_service_arguments_with_extra_args() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        ensure_all_directories(&paths).unwrap();

        let mut extra = ExtraArgs::new();
        extra.insert("--profiling".to_string(), None);
        extra.insert("v".to_string(), Some("4".to_string()));
        kube_proxy(&paths, "worker-1", "10.1.0.0/16", &extra).unwrap();

        let args = read_args(&paths, "kube-proxy");
        assert_eq!(args.get("--cluster-cidr").map(String::as_str), Some("10.1.0.0/16"));
        assert_eq!(args.get("--hostname-override").map(String::as_str), Some("worker-1"));
        assert_eq!(args.get("--v").map(String::as_str), Some("4"));
        assert!(!args.contains_key("--profiling"));
    }

    #[test]
    fn test_service_arguments_keep_existing_flags() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        ensure_all_directories(&paths).unwrap();
        fs::write(
            paths.service_arguments_dir().join("kube-scheduler"),
            "--custom=yes\n--kubeconfig=/old\n",
        )
        .unwrap();

        kube_scheduler(&paths, &ExtraArgs::new()).unwrap();

        let args = read_args(&paths, "kube-scheduler");
        assert_eq!(args.get("--custom").map(String::as_str), Some("yes"));
        assert!(args["--kubeconfig"].ends_with("scheduler.conf"));
    }

    #[test]
    fn test_worker_pki_files() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        ensure_all_directories(&paths).unwrap();

        let pki = WorkerNodePki {
            ca_cert: Some("CA".to_string()),
            client_ca_cert: Some("CCA".to_string()),
            kubelet_cert: Some("CERT".to_string()),
            kubelet_key: Some("KEY".to_string()),
            ..Default::default()
        };
        ensure_worker_pki(&paths, &pki).unwrap();

        let pki_dir = paths.kubernetes_pki_dir();
        assert_eq!(fs::read_to_string(pki_dir.join("kubelet.crt")).unwrap(), "CERT");
        let mode = fs::metadata(pki_dir.join("kubelet.key")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, KEY_MODE);
    }

    #[test]
    fn test_unset_values_remove_files() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        ensure_all_directories(&paths).unwrap();
        let stale = paths.kubernetes_pki_dir().join("ca.key");
        fs::write(&stale, "old").unwrap();

        let pki = ControlPlanePki::default();
        ensure_control_plane_pki(&paths, &pki).unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn test_extra_config_files_reject_paths() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);

        let mut files = BTreeMap::new();
        files.insert("bootstrap.yaml".to_string(), "a: b".to_string());
        extra_node_config_files(&paths, &files).unwrap();
        assert!(paths.service_extra_config_dir().join("bootstrap.yaml").exists());

        files.insert("../escape".to_string(), "x".to_string());
        assert!(matches!(
            extra_node_config_files(&paths, &files),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_apiserver_external_datastore() {
        let dir = TempDir::new().unwrap();
        let paths = paths(&dir);
        ensure_all_directories(&paths).unwrap();

        let datastore = Datastore {
            kind: Some("external".to_string()),
            external_servers: Some(vec!["https://10.0.0.9:2379".to_string(), "https://10.0.0.10:2379".to_string()]),
            external_ca_cert: Some("CA".to_string()),
            ..Default::default()
        };
        let settings = ApiServerSettings {
            node_ip: "10.0.0.1".parse().unwrap(),
            secure_port: 6443,
            service_cidr: "10.152.183.0/24",
            auth_webhook_url: "https://10.0.0.1:6400/1.0/kubernetes/auth/webhook",
            datastore: &datastore,
            authorization_mode: "Node,RBAC",
        };
        kube_apiserver(&paths, &settings, &ExtraArgs::new()).unwrap();

        let args = read_args(&paths, "kube-apiserver");
        assert_eq!(
            args.get("--etcd-servers").map(String::as_str),
            Some("https://10.0.0.9:2379,https://10.0.0.10:2379")
        );
        assert!(args.contains_key("--etcd-cafile"));
        assert!(!args.contains_key("--etcd-keyfile"));
        assert_eq!(args.get("--secure-port").map(String::as_str), Some("6443"));
    }
}
