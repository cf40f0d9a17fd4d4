use super::{ensure_ca, ensure_pair, is_set, years_to_days, PkiError};
use crate::ca::{CertificateAuthority, CertificateTemplate, CertificateUsage};
use crate::generate_rsa_key;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const KEY_BITS: u32 = 2048;

/// DNS names every API server certificate carries
const KUBERNETES_DNS_SANS: [&str; 5] = [
    "kubernetes",
    "kubernetes.default",
    "kubernetes.default.svc",
    "kubernetes.default.svc.cluster",
    "kubernetes.default.svc.cluster.local",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlPlanePkiOpts {
    pub hostname: String,
    pub ip_sans: Vec<IpAddr>,
    pub dns_sans: Vec<String>,
    pub years: u32,
    pub allow_self_signed_ca: bool,
}

/// Certificates of a control plane node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlPlanePki {
    opts: ControlPlanePkiOpts,

    pub ca_cert: Option<String>,
    pub ca_key: Option<String>,
    pub client_ca_cert: Option<String>,
    pub client_ca_key: Option<String>,
    pub front_proxy_ca_cert: Option<String>,
    pub front_proxy_ca_key: Option<String>,
    pub front_proxy_client_cert: Option<String>,
    pub front_proxy_client_key: Option<String>,
    pub service_account_key: Option<String>,
    pub k8sd_public_key: Option<String>,
    pub k8sd_private_key: Option<String>,

    pub apiserver_cert: Option<String>,
    pub apiserver_key: Option<String>,
    pub apiserver_kubelet_client_cert: Option<String>,
    pub apiserver_kubelet_client_key: Option<String>,
    pub admin_client_cert: Option<String>,
    pub admin_client_key: Option<String>,
    pub kube_controller_manager_client_cert: Option<String>,
    pub kube_controller_manager_client_key: Option<String>,
    pub kube_scheduler_client_cert: Option<String>,
    pub kube_scheduler_client_key: Option<String>,
    pub kube_proxy_client_cert: Option<String>,
    pub kube_proxy_client_key: Option<String>,
    pub kubelet_cert: Option<String>,
    pub kubelet_key: Option<String>,
    pub kubelet_client_cert: Option<String>,
    pub kubelet_client_key: Option<String>,
}

impl ControlPlanePki {
    pub fn new(opts: ControlPlanePkiOpts) -> Self {
        Self {
            opts,
            ..Default::default()
        }
    }

    pub fn opts(&self) -> &ControlPlanePkiOpts {
        &self.opts
    }

    /// Generate every missing slot. Supplied values are never replaced, so a
    /// second call on a complete bundle changes nothing.
    pub fn complete_certificates(&mut self) -> Result<(), PkiError> {
        let days = years_to_days(self.opts.years);
        let allow_self_signed = self.opts.allow_self_signed_ca;

        let ca = ensure_ca(
            "kubernetes CA",
            "kubernetes-ca",
            &mut self.ca_cert,
            &mut self.ca_key,
            allow_self_signed,
            days,
        )?;

        // The client CA falls back to the main CA.
        if !is_set(&self.client_ca_cert) && !is_set(&self.client_ca_key) {
            self.client_ca_cert.clone_from(&self.ca_cert);
            self.client_ca_key.clone_from(&self.ca_key);
        }
        let client_ca = ensure_ca(
            "kubernetes client CA",
            "kubernetes-ca-client",
            &mut self.client_ca_cert,
            &mut self.client_ca_key,
            false,
            days,
        )?;

        let front_proxy_ca = ensure_ca(
            "front-proxy CA",
            "kubernetes-front-proxy-ca",
            &mut self.front_proxy_ca_cert,
            &mut self.front_proxy_ca_key,
            allow_self_signed,
            days,
        )?;
        ensure_pair(
            "front-proxy client",
            &mut self.front_proxy_client_cert,
            &mut self.front_proxy_client_key,
            front_proxy_ca.as_ref(),
            || CertificateTemplate::new("front-proxy-client", CertificateUsage::Client, days),
        )?;

        if !is_set(&self.service_account_key) {
            let (private_key, _) = generate_rsa_key(KEY_BITS)?;
            self.service_account_key = Some(private_key);
        }

        match (is_set(&self.k8sd_public_key), is_set(&self.k8sd_private_key)) {
            (true, true) => {}
            (false, false) => {
                let (private_key, public_key) = generate_rsa_key(KEY_BITS)?;
                self.k8sd_private_key = Some(private_key);
                self.k8sd_public_key = Some(public_key);
            }
            _ => {
                return Err(PkiError::IncompletePki(
                    "k8sd public and private key must be specified together".to_string(),
                ))
            }
        }

        self.complete_server_certificates(ca.as_ref(), days)?;
        self.complete_client_certificates(client_ca.as_ref(), days)
    }

    fn complete_server_certificates(
        &mut self,
        ca: Option<&CertificateAuthority>,
        days: u32,
    ) -> Result<(), PkiError> {
        let hostname = self.opts.hostname.clone();

        let mut apiserver_dns: Vec<String> =
            KUBERNETES_DNS_SANS.iter().map(ToString::to_string).collect();
        apiserver_dns.extend(self.opts.dns_sans.iter().cloned());
        let mut apiserver_ips = vec![
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ];
        apiserver_ips.extend(self.opts.ip_sans.iter().copied());
        dedup(&mut apiserver_ips);

        ensure_pair(
            "kube-apiserver",
            &mut self.apiserver_cert,
            &mut self.apiserver_key,
            ca,
            || {
                CertificateTemplate::new("kube-apiserver", CertificateUsage::Server, days)
                    .dns_names(apiserver_dns)
                    .ip_addresses(apiserver_ips)
            },
        )?;

        let mut kubelet_ips = self.opts.ip_sans.clone();
        dedup(&mut kubelet_ips);
        ensure_pair(
            "kubelet",
            &mut self.kubelet_cert,
            &mut self.kubelet_key,
            ca,
            || {
                CertificateTemplate::new(
                    format!("system:node:{hostname}"),
                    CertificateUsage::Server,
                    days,
                )
                .organization("system:nodes")
                .dns_names([hostname.clone()])
                .ip_addresses(kubelet_ips)
            },
        )
    }

    fn complete_client_certificates(
        &mut self,
        client_ca: Option<&CertificateAuthority>,
        days: u32,
    ) -> Result<(), PkiError> {
        let node = format!("system:node:{}", self.opts.hostname);
        let client = |cn: &str, organization: Option<&str>| {
            let template = CertificateTemplate::new(cn, CertificateUsage::Client, days);
            match organization {
                Some(organization) => template.organization(organization),
                None => template,
            }
        };

        ensure_pair(
            "kube-apiserver kubelet client",
            &mut self.apiserver_kubelet_client_cert,
            &mut self.apiserver_kubelet_client_key,
            client_ca,
            || client("apiserver-kubelet-client", Some("system:masters")),
        )?;
        ensure_pair(
            "admin client",
            &mut self.admin_client_cert,
            &mut self.admin_client_key,
            client_ca,
            || client("kubernetes-admin", Some("system:masters")),
        )?;
        ensure_pair(
            "kube-controller-manager client",
            &mut self.kube_controller_manager_client_cert,
            &mut self.kube_controller_manager_client_key,
            client_ca,
            || client("system:kube-controller-manager", None),
        )?;
        ensure_pair(
            "kube-scheduler client",
            &mut self.kube_scheduler_client_cert,
            &mut self.kube_scheduler_client_key,
            client_ca,
            || client("system:kube-scheduler", None),
        )?;
        ensure_pair(
            "kube-proxy client",
            &mut self.kube_proxy_client_cert,
            &mut self.kube_proxy_client_key,
            client_ca,
            || client("system:kube-proxy", None),
        )?;
        ensure_pair(
            "kubelet client",
            &mut self.kubelet_client_cert,
            &mut self.kubelet_client_key,
            client_ca,
            || client(&node, Some("system:nodes")),
        )
    }
}

fn dedup(ips: &mut Vec<IpAddr>) {
    let mut seen = Vec::with_capacity(ips.len());
    ips.retain(|ip| {
        if seen.contains(ip) {
            false
        } else {
            seen.push(*ip);
            true
        }
    });
}
