//! Node bootstrap
//!
//! Runs once when a node is initialized. The init configuration selects the
//! role: a worker joins an existing cluster through a join token, anything
//! else bootstraps the first control plane node. Every step either succeeds
//! or aborts the run with an error naming the step.

use crate::error::{Error, Result, StageExt};
use crate::features::FeatureControllers;
use crate::join::{trust_bootstrap, PeerTransport};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::setup::{self, ApiServerSettings, KubeletSettings};
use crate::snap::{self, KubeconfigKind, NodeRole, Snap};
use crate::store::ClusterStore;
use k8sd_api::GetWorkerJoinInfoResponse;
use k8sd_config::bootstrap::timeout_from_map;
use k8sd_config::cluster::DEFAULT_SECURE_PORT;
use k8sd_config::network::{service_ips_from_cidrs, split_ip_and_dns_sans};
use k8sd_config::{
    BootstrapConfig, ClusterConfig, DatastoreKind, InitConfig, JoinToken, WorkerJoinConfig,
};
use k8sd_crypto::pki::{
    ControlPlanePki, ControlPlanePkiOpts, ExternalDatastorePki, K8sDqlitePki, K8sDqlitePkiOpts,
    WorkerNodePki,
};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Lifetime of certificates generated at bootstrap
const CERTIFICATE_YEARS: u32 = 20;

/// Name and address the node is known by in the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub name: String,
    /// `ip:port` of the local daemon, or a bare IP
    pub address: String,
}

impl NodeIdentity {
    /// IP part of the node address
    pub fn ip(&self) -> Result<IpAddr> {
        self.address
            .parse::<SocketAddr>()
            .map(|addr| addr.ip())
            .or_else(|_| self.address.parse::<IpAddr>())
            .map_err(|_| {
                Error::InvalidConfiguration(format!(
                    "failed to parse node IP address {:?}",
                    self.address
                ))
            })
    }

    fn auth_webhook_url(&self) -> String {
        format!("https://{}/1.0/kubernetes/auth/webhook", self.address)
    }
}

/// Node daemon state shared by the bootstrap hook and the API handlers
pub struct App {
    snap: Arc<dyn Snap>,
    store: Arc<dyn ClusterStore>,
    transport: Arc<dyn PeerTransport>,
    node: NodeIdentity,
    features: FeatureControllers,
    readiness: RetryConfig,
}

impl App {
    /// Create the daemon with the default API server readiness budget
    pub fn new(
        snap: Arc<dyn Snap>,
        store: Arc<dyn ClusterStore>,
        transport: Arc<dyn PeerTransport>,
        node: NodeIdentity,
        features: FeatureControllers,
    ) -> Self {
        Self {
            snap,
            store,
            transport,
            node,
            features,
            readiness: RetryConfig::readiness(Duration::from_secs(120)),
        }
    }

    /// Replace the retry budget of the API server readiness wait
    pub fn with_readiness(mut self, readiness: RetryConfig) -> Self {
        self.readiness = readiness;
        self
    }

    /// Host integration of this node
    pub fn snap(&self) -> &Arc<dyn Snap> {
        &self.snap
    }

    /// Cluster configuration store
    pub fn store(&self) -> &Arc<dyn ClusterStore> {
        &self.store
    }

    /// Name and address this node is known by
    pub fn node(&self) -> &NodeIdentity {
        &self.node
    }

    /// Bootstrap hook, bounded by the `timeout` key of the init configuration
    #[instrument(skip_all, fields(node = %self.node.name))]
    pub async fn on_bootstrap(&self, init: &BTreeMap<String, String>) -> Result<()> {
        let deadline = timeout_from_map(init).stage("failed to parse bootstrap timeout")?;
        let run = self.bootstrap(init);
        match deadline {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| Error::DeadlineExceeded(limit))?,
            None => run.await,
        }
    }

    async fn bootstrap(&self, init: &BTreeMap<String, String>) -> Result<()> {
        match InitConfig::from_map(init).stage("failed to parse init configuration")? {
            InitConfig::Worker { token, join_config } => {
                self.bootstrap_worker(&token, &join_config).await
            }
            InitConfig::ControlPlane(config) => self.bootstrap_control_plane(&config).await,
        }
    }

    async fn bootstrap_worker(&self, encoded_token: &str, join: &WorkerJoinConfig) -> Result<()> {
        let token = JoinToken::decode(encoded_token).stage("failed to parse worker token")?;
        let node_ip = self.node.ip()?;
        let paths = self.snap.paths();

        let response = trust_bootstrap(self.transport.as_ref(), &token, &self.node.name, node_ip)
            .await
            .stage("failed to retrieve worker join information")?;

        setup::ensure_all_directories(paths).stage("failed to create directories")?;

        let pki = worker_pki(&response, join);
        pki.complete_certificates()
            .stage("failed to initialize worker node certificates")?;
        setup::ensure_worker_pki(paths, &pki).stage("failed to write worker node certificates")?;
        setup::worker_kubeconfigs(paths, DEFAULT_SECURE_PORT, &pki)
            .stage("failed to generate kubeconfigs")?;

        // Workers only keep the part of the cluster configuration they use.
        let mut config = ClusterConfig::default();
        config.network.pod_cidr = Some(response.pod_cidr.clone());
        config.network.service_cidr = Some(response.service_cidr.clone());
        config.certificates.k8sd_public_key = Some(response.k8sd_public_key.clone());
        config.certificates.ca_cert = Some(response.ca_cert.clone());
        config.certificates.client_ca_cert = Some(response.client_ca_cert.clone());

        self.snap
            .pre_init_checks(&config, NodeRole::Worker)
            .await
            .stage("pre-init checks failed for worker node")?;
        self.store
            .set_cluster_config(&config)
            .await
            .stage("failed to write cluster configuration")?;

        setup::containerd(
            paths,
            join.extra_node_containerd_config.as_deref(),
            &join.extra_node_containerd_args,
        )
        .stage("failed to configure containerd")?;
        setup::kubelet_worker(
            paths,
            &KubeletSettings {
                node_name: &self.node.name,
                node_ip,
                cluster_dns: &response.cluster_dns,
                cluster_domain: &response.cluster_domain,
                cloud_provider: &response.cloud_provider,
            },
            &join.extra_node_kubelet_args,
        )
        .stage("failed to configure kubelet")?;
        setup::kube_proxy(
            paths,
            &self.node.name,
            &response.pod_cidr,
            &join.extra_node_kube_proxy_args,
        )
        .stage("failed to configure kube-proxy")?;
        setup::k8s_apiserver_proxy(
            paths,
            &response.api_servers,
            DEFAULT_SECURE_PORT,
            &join.extra_node_k8s_apiserver_proxy_args,
        )
        .stage("failed to configure k8s-apiserver-proxy")?;
        setup::extra_node_config_files(paths, &join.extra_node_config_files)
            .stage("failed to write extra node config files")?;

        snap::mark_as_worker(paths, true).stage("failed to mark node as worker")?;

        info!("Starting worker services");
        snap::start_worker_services(self.snap.as_ref())
            .await
            .stage("failed to start worker services")?;
        Ok(())
    }

    async fn bootstrap_control_plane(&self, bootstrap: &BootstrapConfig) -> Result<()> {
        let mut config =
            ClusterConfig::from_bootstrap_config(bootstrap).stage("invalid bootstrap config")?;
        config.set_defaults();
        config.validate().stage("invalid cluster configuration")?;

        let node_ip = self.node.ip()?;
        let paths = self.snap.paths();

        setup::ensure_all_directories(paths).stage("failed to create directories")?;

        let service_cidr = config.network.service_cidr.clone().unwrap_or_default();
        let pod_cidr = config.network.pod_cidr.clone().unwrap_or_default();
        let service_ips = service_ips_from_cidrs(&service_cidr)
            .stage("failed to get IP addresses from the service CIDR")?;
        let datastore = config
            .datastore
            .datastore_kind()
            .stage("invalid datastore configuration")?;

        match datastore {
            DatastoreKind::K8sDqlite => {
                let mut pki = K8sDqlitePki::new(K8sDqlitePkiOpts {
                    hostname: self.node.name.clone(),
                    ip_sans: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
                    years: CERTIFICATE_YEARS,
                    allow_self_signed_ca: true,
                });
                pki.complete_certificates()
                    .stage("failed to initialize k8s-dqlite certificates")?;
                setup::ensure_k8s_dqlite_pki(paths, &pki)
                    .stage("failed to write k8s-dqlite certificates")?;
                config.datastore.k8s_dqlite_cert = pki.k8s_dqlite_cert;
                config.datastore.k8s_dqlite_key = pki.k8s_dqlite_key;
            }
            DatastoreKind::External => {
                let pki = ExternalDatastorePki {
                    datastore_ca_cert: config.datastore.external_ca_cert.clone(),
                    datastore_client_cert: config.datastore.external_client_cert.clone(),
                    datastore_client_key: config.datastore.external_client_key.clone(),
                };
                pki.check_certificates()
                    .stage("failed to initialize external datastore certificates")?;
                setup::ensure_external_datastore_pki(paths, &pki)
                    .stage("failed to write external datastore certificates")?;
            }
        }

        let (extra_ips, extra_names) = split_ip_and_dns_sans(&bootstrap.extra_sans);
        let mut ip_sans = vec![node_ip];
        ip_sans.extend(service_ips);
        ip_sans.extend(extra_ips);

        let mut pki = control_plane_pki(
            bootstrap,
            ControlPlanePkiOpts {
                hostname: self.node.name.clone(),
                ip_sans,
                dns_sans: extra_names,
                years: CERTIFICATE_YEARS,
                allow_self_signed_ca: true,
            },
        );
        pki.complete_certificates()
            .stage("failed to initialize control plane certificates")?;
        setup::ensure_control_plane_pki(paths, &pki)
            .stage("failed to write control plane certificates")?;
        record_certificates(&mut config, &pki);

        self.snap
            .pre_init_checks(&config, NodeRole::ControlPlane)
            .await
            .stage("pre-init checks failed for bootstrap node")?;

        let secure_port = config.api_server.secure_port();
        setup::control_plane_kubeconfigs(paths, secure_port, &pki)
            .stage("failed to generate kubeconfigs")?;

        if datastore == DatastoreKind::K8sDqlite {
            let address = SocketAddr::new(node_ip, config.datastore.k8s_dqlite_port());
            setup::k8s_dqlite(paths, &address.to_string(), &bootstrap.extra_node_k8s_dqlite_args)
                .stage("failed to configure k8s-dqlite")?;
        }

        setup::containerd(
            paths,
            bootstrap.extra_node_containerd_config.as_deref(),
            &bootstrap.extra_node_containerd_args,
        )
        .stage("failed to configure containerd")?;
        setup::kubelet_control_plane(
            paths,
            &KubeletSettings {
                node_name: &self.node.name,
                node_ip,
                cluster_dns: config.kubelet.cluster_dns.as_deref().unwrap_or_default(),
                cluster_domain: config.kubelet.cluster_domain.as_deref().unwrap_or_default(),
                cloud_provider: config.kubelet.cloud_provider.as_deref().unwrap_or_default(),
            },
            config.kubelet.control_plane_taints.as_deref().unwrap_or_default(),
            &bootstrap.extra_node_kubelet_args,
        )
        .stage("failed to configure kubelet")?;
        setup::kube_proxy(paths, &self.node.name, &pod_cidr, &bootstrap.extra_node_kube_proxy_args)
            .stage("failed to configure kube-proxy")?;
        setup::kube_controller_manager(paths, &bootstrap.extra_node_kube_controller_manager_args)
            .stage("failed to configure kube-controller-manager")?;
        setup::kube_scheduler(paths, &bootstrap.extra_node_kube_scheduler_args)
            .stage("failed to configure kube-scheduler")?;
        setup::kube_apiserver(
            paths,
            &ApiServerSettings {
                node_ip,
                secure_port,
                service_cidr: &service_cidr,
                auth_webhook_url: &self.node.auth_webhook_url(),
                datastore: &config.datastore,
                authorization_mode: config.api_server.authorization_mode.as_deref().unwrap_or_default(),
            },
            &bootstrap.extra_node_kube_apiserver_args,
        )
        .stage("failed to configure kube-apiserver")?;
        setup::extra_node_config_files(paths, &bootstrap.extra_node_config_files)
            .stage("failed to write extra node config files")?;

        let config = self
            .store
            .set_cluster_config(&config)
            .await
            .stage("failed to write cluster configuration")?;
        self.snap
            .snapctl_set(&config.to_user_facing())
            .await
            .stage("failed to set snap configuration")?;

        info!(datastore = %datastore, "Starting control plane services");
        snap::start_control_plane_services(self.snap.as_ref(), datastore)
            .await
            .stage("failed to start services")?;

        self.wait_api_server_ready()
            .await
            .stage("kube-apiserver did not become ready in time")?;

        self.features.notify_features(&config);
        self.features.notify_node_config();
        Ok(())
    }

    async fn wait_api_server_ready(&self) -> Result<()> {
        let client = self
            .snap
            .kubernetes_client(KubeconfigKind::Admin)
            .await
            .map_err(|e| Error::ApiServerNotReady(e.to_string()))?;
        let endpoints = retry_with_backoff(&self.readiness, "wait for kube-apiserver", || {
            client.list_endpoints()
        })
        .await
        .map_err(|e| Error::ApiServerNotReady(e.to_string()))?;
        info!(?endpoints, "kube-apiserver is ready");
        Ok(())
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn apply_override(target: &mut Option<String>, value: &Option<String>) {
    if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
        *target = Some(value.clone());
    }
}

/// Certificates handed out by the cluster, with local overrides applied
fn worker_pki(response: &GetWorkerJoinInfoResponse, join: &WorkerJoinConfig) -> WorkerNodePki {
    let mut pki = WorkerNodePki {
        ca_cert: non_empty(&response.ca_cert),
        client_ca_cert: non_empty(&response.client_ca_cert),
        kubelet_cert: non_empty(&response.kubelet_cert),
        kubelet_key: non_empty(&response.kubelet_key),
        kubelet_client_cert: non_empty(&response.kubelet_client_cert),
        kubelet_client_key: non_empty(&response.kubelet_client_key),
        kube_proxy_client_cert: non_empty(&response.kube_proxy_client_cert),
        kube_proxy_client_key: non_empty(&response.kube_proxy_client_key),
    };
    apply_override(&mut pki.kubelet_cert, &join.kubelet_crt);
    apply_override(&mut pki.kubelet_key, &join.kubelet_key);
    apply_override(&mut pki.kubelet_client_cert, &join.kubelet_client_crt);
    apply_override(&mut pki.kubelet_client_key, &join.kubelet_client_key);
    apply_override(&mut pki.kube_proxy_client_cert, &join.kube_proxy_client_crt);
    apply_override(&mut pki.kube_proxy_client_key, &join.kube_proxy_client_key);
    pki
}

/// Control plane bundle seeded with the certificates supplied at bootstrap
fn control_plane_pki(bootstrap: &BootstrapConfig, opts: ControlPlanePkiOpts) -> ControlPlanePki {
    let mut pki = ControlPlanePki::new(opts);
    for (target, value) in [
        (&mut pki.ca_cert, &bootstrap.ca_crt),
        (&mut pki.ca_key, &bootstrap.ca_key),
        (&mut pki.client_ca_cert, &bootstrap.client_ca_crt),
        (&mut pki.client_ca_key, &bootstrap.client_ca_key),
        (&mut pki.front_proxy_ca_cert, &bootstrap.front_proxy_ca_crt),
        (&mut pki.front_proxy_ca_key, &bootstrap.front_proxy_ca_key),
        (&mut pki.front_proxy_client_cert, &bootstrap.front_proxy_client_crt),
        (&mut pki.front_proxy_client_key, &bootstrap.front_proxy_client_key),
        (&mut pki.service_account_key, &bootstrap.service_account_key),
        (&mut pki.apiserver_kubelet_client_cert, &bootstrap.apiserver_kubelet_client_crt),
        (&mut pki.apiserver_kubelet_client_key, &bootstrap.apiserver_kubelet_client_key),
        (&mut pki.admin_client_cert, &bootstrap.admin_client_crt),
        (&mut pki.admin_client_key, &bootstrap.admin_client_key),
        (&mut pki.kube_controller_manager_client_cert, &bootstrap.kube_controller_manager_client_crt),
        (&mut pki.kube_controller_manager_client_key, &bootstrap.kube_controller_manager_client_key),
        (&mut pki.kube_scheduler_client_cert, &bootstrap.kube_scheduler_client_crt),
        (&mut pki.kube_scheduler_client_key, &bootstrap.kube_scheduler_client_key),
        (&mut pki.kube_proxy_client_cert, &bootstrap.kube_proxy_client_crt),
        (&mut pki.kube_proxy_client_key, &bootstrap.kube_proxy_client_key),
        (&mut pki.apiserver_cert, &bootstrap.apiserver_crt),
        (&mut pki.apiserver_key, &bootstrap.apiserver_key),
        (&mut pki.kubelet_cert, &bootstrap.kubelet_crt),
        (&mut pki.kubelet_key, &bootstrap.kubelet_key),
        (&mut pki.kubelet_client_cert, &bootstrap.kubelet_client_crt),
        (&mut pki.kubelet_client_key, &bootstrap.kubelet_client_key),
    ] {
        apply_override(target, value);
    }
    pki
}

fn record_certificates(config: &mut ClusterConfig, pki: &ControlPlanePki) {
    let certificates = &mut config.certificates;
    certificates.ca_cert.clone_from(&pki.ca_cert);
    certificates.ca_key.clone_from(&pki.ca_key);
    certificates.client_ca_cert.clone_from(&pki.client_ca_cert);
    certificates.client_ca_key.clone_from(&pki.client_ca_key);
    certificates.front_proxy_ca_cert.clone_from(&pki.front_proxy_ca_cert);
    certificates.front_proxy_ca_key.clone_from(&pki.front_proxy_ca_key);
    certificates
        .apiserver_kubelet_client_cert
        .clone_from(&pki.apiserver_kubelet_client_cert);
    certificates
        .apiserver_kubelet_client_key
        .clone_from(&pki.apiserver_kubelet_client_key);
    certificates.service_account_key.clone_from(&pki.service_account_key);
    certificates.admin_client_cert.clone_from(&pki.admin_client_cert);
    certificates.admin_client_key.clone_from(&pki.admin_client_key);
    certificates.k8sd_public_key.clone_from(&pki.k8sd_public_key);
    certificates.k8sd_private_key.clone_from(&pki.k8sd_private_key);
}
