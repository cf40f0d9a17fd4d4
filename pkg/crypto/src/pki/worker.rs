use super::{is_set, PkiError};

/// Leaf certificate slots of a worker node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerCertificate {
    KubeletServing,
    KubeletClient,
    KubeProxyClient,
}

impl WorkerCertificate {
    pub const ALL: [Self; 3] = [Self::KubeletServing, Self::KubeletClient, Self::KubeProxyClient];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KubeletServing => "kubelet",
            Self::KubeletClient => "kubelet-client",
            Self::KubeProxyClient => "kube-proxy-client",
        }
    }
}

/// Certificates of a worker node.
///
/// Workers never generate material locally: the CAs come from the cluster
/// and the leaf certificates are either handed out by a control plane or
/// obtained through signing requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerNodePki {
    pub ca_cert: Option<String>,
    pub client_ca_cert: Option<String>,
    pub kubelet_cert: Option<String>,
    pub kubelet_key: Option<String>,
    pub kubelet_client_cert: Option<String>,
    pub kubelet_client_key: Option<String>,
    pub kube_proxy_client_cert: Option<String>,
    pub kube_proxy_client_key: Option<String>,
}

impl WorkerNodePki {
    pub fn certificate(&self, slot: WorkerCertificate) -> (Option<&str>, Option<&str>) {
        let (cert, key) = match slot {
            WorkerCertificate::KubeletServing => (&self.kubelet_cert, &self.kubelet_key),
            WorkerCertificate::KubeletClient => (&self.kubelet_client_cert, &self.kubelet_client_key),
            WorkerCertificate::KubeProxyClient => {
                (&self.kube_proxy_client_cert, &self.kube_proxy_client_key)
            }
        };
        (cert.as_deref(), key.as_deref())
    }

    pub fn set_certificate(&mut self, slot: WorkerCertificate, cert: String, key: String) {
        let (cert_slot, key_slot) = match slot {
            WorkerCertificate::KubeletServing => (&mut self.kubelet_cert, &mut self.kubelet_key),
            WorkerCertificate::KubeletClient => {
                (&mut self.kubelet_client_cert, &mut self.kubelet_client_key)
            }
            WorkerCertificate::KubeProxyClient => {
                (&mut self.kube_proxy_client_cert, &mut self.kube_proxy_client_key)
            }
        };
        *cert_slot = Some(cert);
        *key_slot = Some(key);
    }

    /// Verify that every slot is populated. Nothing is generated.
    pub fn complete_certificates(&self) -> Result<(), PkiError> {
        if !is_set(&self.ca_cert) {
            return Err(PkiError::IncompletePki("kubernetes CA not specified".to_string()));
        }
        if !is_set(&self.client_ca_cert) {
            return Err(PkiError::IncompletePki(
                "kubernetes client CA not specified".to_string(),
            ));
        }
        for slot in WorkerCertificate::ALL {
            match self.certificate(slot) {
                (Some(cert), Some(key)) if !cert.trim().is_empty() && !key.trim().is_empty() => {}
                _ => {
                    return Err(PkiError::IncompletePki(format!(
                        "{} certificate and key must be specified",
                        slot.as_str()
                    )))
                }
            }
        }
        Ok(())
    }
}
