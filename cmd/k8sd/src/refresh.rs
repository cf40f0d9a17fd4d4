//! Certificate refresh
//!
//! Refresh is a two step exchange: `plan` picks a seed and names the CSRs
//! the node will create, so an operator can approve them, and `run` creates
//! and waits on those CSRs. Only worker nodes are refreshed this way.

use crate::bootstrap::App;
use crate::csr::{issue_certificates, CertificateRequest, KeyUsage};
use crate::error::{Error, Result, StageExt};
use crate::setup;
use crate::snap::{self, KubeconfigKind};
use k8sd_api::{RefreshCertificatesPlanResponse, RefreshCertificatesRunResponse};
use k8sd_config::cluster::DEFAULT_SECURE_PORT;
use k8sd_crypto::pki::{WorkerCertificate, WorkerNodePki};
use k8sd_crypto::validity_duration;
use rand::Rng;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{info, instrument};

const KUBELET_SERVING: &str = "kubelet-serving";
const KUBELET_CLIENT: &str = "kubelet-client";
const KUBE_PROXY_CLIENT: &str = "kube-proxy-client";

fn csr_name(seed: u64, certificate: &str) -> String {
    format!("k8sd-{seed}-worker-{certificate}")
}

/// CSR names a worker creates for `seed`, in request order
pub fn plan_names(seed: u64) -> Vec<String> {
    [KUBELET_SERVING, KUBELET_CLIENT, KUBE_PROXY_CLIENT]
        .iter()
        .map(|certificate| csr_name(seed, certificate))
        .collect()
}

/// The three worker certificate requests for `seed`
pub fn worker_requests(seed: u64, hostname: &str, node_ip: IpAddr) -> Vec<CertificateRequest> {
    let node_cn = format!("system:node:{hostname}");

    vec![
        CertificateRequest {
            name: csr_name(seed, KUBELET_SERVING),
            common_name: node_cn.clone(),
            organization: Some("system:nodes".to_string()),
            key_usages: vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment, KeyUsage::ServerAuth],
            hostnames: vec![hostname.to_string()],
            ips: vec![node_ip],
            signer_name: "k8sd.io/kubelet-serving".to_string(),
            target: WorkerCertificate::KubeletServing,
        },
        CertificateRequest {
            name: csr_name(seed, KUBELET_CLIENT),
            common_name: node_cn,
            organization: Some("system:nodes".to_string()),
            key_usages: vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment, KeyUsage::ClientAuth],
            hostnames: Vec::new(),
            ips: Vec::new(),
            signer_name: "k8sd.io/kubelet-client".to_string(),
            target: WorkerCertificate::KubeletClient,
        },
        CertificateRequest {
            name: csr_name(seed, KUBE_PROXY_CLIENT),
            common_name: "system:kube-proxy".to_string(),
            organization: None,
            key_usages: vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment, KeyUsage::ClientAuth],
            hostnames: Vec::new(),
            ips: Vec::new(),
            signer_name: "k8sd.io/kube-proxy-client".to_string(),
            target: WorkerCertificate::KubeProxyClient,
        },
    ]
}

/// Lifetime of the kubelet serving certificate in `pki`
fn kubelet_validity(pki: &WorkerNodePki) -> Result<Duration> {
    let cert = pki
        .kubelet_cert
        .as_deref()
        .ok_or_else(|| Error::MissingCertificate("kubelet certificate".to_string()))?;
    validity_duration(cert).stage("failed to load kubelet certificate")
}

impl App {
    /// Pick a seed and name the CSRs a refresh with that seed will create
    pub fn refresh_plan(&self) -> RefreshCertificatesPlanResponse {
        let seed = rand::thread_rng().gen_range(0..1u64 << 63);
        let certificate_signing_requests = if snap::is_worker(self.snap().paths()) {
            plan_names(seed)
        } else {
            Vec::new()
        };
        RefreshCertificatesPlanResponse {
            seed,
            certificate_signing_requests,
        }
    }

    /// Reissue the worker certificates through CSRs named after `seed`
    #[instrument(skip(self))]
    pub async fn refresh_run(&self, seed: u64) -> Result<RefreshCertificatesRunResponse> {
        let snap = self.snap();
        if !snap::is_worker(snap.paths()) {
            return Err(Error::NotImplemented("control plane certificate refresh"));
        }
        let node_ip = self.node().ip()?;

        let config = self
            .store()
            .get_cluster_config()
            .await
            .stage("failed to get cluster configuration")?;
        let (Some(ca_cert), Some(client_ca_cert)) = (
            config.certificates.ca_cert.filter(|c| !c.is_empty()),
            config.certificates.client_ca_cert.filter(|c| !c.is_empty()),
        ) else {
            return Err(Error::MissingCaCertificate);
        };
        let mut pki = WorkerNodePki {
            ca_cert: Some(ca_cert),
            client_ca_cert: Some(client_ca_cert),
            ..Default::default()
        };

        let client = snap
            .kubernetes_client(KubeconfigKind::Node)
            .await
            .stage("failed to get Kubernetes client")?;
        issue_certificates(client, worker_requests(seed, snap.hostname(), node_ip), &mut pki)
            .await
            .stage("failed to get worker node certificates")?;

        setup::ensure_worker_pki(snap.paths(), &pki).stage("failed to write worker PKI")?;
        setup::worker_kubeconfigs(snap.paths(), DEFAULT_SECURE_PORT, &pki)
            .stage("failed to generate kubeconfigs")?;

        snap.restart_service("kubelet")
            .await
            .stage("failed to restart kubelet")?;
        snap.restart_service("kube-proxy")
            .await
            .stage("failed to restart kube-proxy")?;

        let validity = kubelet_validity(&pki)?;
        info!(expiration_seconds = validity.as_secs(), "Refreshed worker certificates");
        Ok(RefreshCertificatesRunResponse {
            expiration_seconds: validity.as_secs(),
        })
    }
}
