//! Certificate issuance through Kubernetes CertificateSigningRequests
//!
//! Every request generates its own key, submits a CSR and watches it until
//! the signer approves and issues it, or until it is denied or fails.
//! [`issue_certificates`] runs a batch concurrently and only touches the
//! PKI bundle once every request succeeded.

use crate::error::{Error, Result};
use crate::kube_client::ClusterApi;
use k8s_openapi::api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use k8sd_crypto::pki::{WorkerCertificate, WorkerNodePki};
use k8sd_crypto::{generate_csr, load_certificate, Subject};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// RSA key size of every requested certificate
pub const CSR_KEY_BITS: u32 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Key usage requested in a CSR
pub enum KeyUsage {
    DigitalSignature,
    KeyEncipherment,
    ServerAuth,
    ClientAuth,
}

impl KeyUsage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DigitalSignature => "digital signature",
            Self::KeyEncipherment => "key encipherment",
            Self::ServerAuth => "server auth",
            Self::ClientAuth => "client auth",
        }
    }
}

/// One certificate to obtain and the slot it lands in
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    /// Name of the CSR object
    pub name: String,
    pub common_name: String,
    pub organization: Option<String>,
    pub key_usages: Vec<KeyUsage>,
    pub hostnames: Vec<String>,
    pub ips: Vec<IpAddr>,
    pub signer_name: String,
    pub target: WorkerCertificate,
}

impl CertificateRequest {
    fn subject(&self) -> Subject {
        let subject = Subject::new(self.common_name.clone());
        match &self.organization {
            Some(organization) => subject.with_organization(organization.clone()),
            None => subject,
        }
    }

    fn to_object(&self, csr_pem: String) -> CertificateSigningRequest {
        CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(csr_pem.into_bytes()),
                signer_name: self.signer_name.clone(),
                usages: Some(self.key_usages.iter().map(|u| u.as_str().to_string()).collect()),
                ..Default::default()
            },
            status: None,
        }
    }
}

/// Approval state of a submitted CSR
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsrState {
    Pending,
    ApprovedNotYetIssued,
    ApprovedIssued(String),
    Denied(String),
    Failed(String),
}

impl CsrState {
    /// The first true Approved, Denied or Failed condition decides.
    pub fn evaluate(csr: &CertificateSigningRequest) -> Self {
        let Some(status) = &csr.status else {
            return Self::Pending;
        };

        for condition in status.conditions.iter().flatten() {
            if condition.status != "True" {
                continue;
            }
            let reason = || {
                condition
                    .reason
                    .clone()
                    .or_else(|| condition.message.clone())
                    .unwrap_or_default()
            };
            match condition.type_.as_str() {
                "Approved" => {
                    return match status.certificate.as_ref().filter(|c| !c.0.is_empty()) {
                        Some(cert) => Self::ApprovedIssued(String::from_utf8_lossy(&cert.0).into_owned()),
                        None => Self::ApprovedNotYetIssued,
                    };
                }
                "Denied" => return Self::Denied(reason()),
                "Failed" => return Self::Failed(reason()),
                _ => {}
            }
        }
        Self::Pending
    }
}

/// Obtain one certificate, returning `(cert_pem, key_pem)`
pub async fn request_certificate(
    api: &dyn ClusterApi,
    request: &CertificateRequest,
) -> Result<(String, String)> {
    let subject = request.subject();
    let hostnames = request.hostnames.clone();
    let ips = request.ips.clone();
    let (csr_pem, key_pem) =
        tokio::task::spawn_blocking(move || generate_csr(&subject, CSR_KEY_BITS, &hostnames, &ips))
            .await
            .map_err(|e| Error::Task(e.to_string()))??;

    api.create_csr(&request.to_object(csr_pem))
        .await
        .map_err(|e| Error::SubmissionFailed {
            name: request.name.clone(),
            reason: e.to_string(),
        })?;

    let name = request.name.as_str();
    let mut issued = None;
    let mut on_update = |csr: &CertificateSigningRequest| -> Result<bool> {
        match CsrState::evaluate(csr) {
            CsrState::ApprovedIssued(cert) => {
                issued = Some(cert);
                Ok(true)
            }
            CsrState::Denied(reason) => Err(Error::Denied {
                name: name.to_string(),
                reason,
            }),
            CsrState::Failed(reason) => Err(Error::Failed {
                name: name.to_string(),
                reason,
            }),
            CsrState::Pending | CsrState::ApprovedNotYetIssued => Ok(false),
        }
    };
    api.watch_csr(name, &mut on_update).await?;

    let cert_pem = issued.ok_or_else(|| Error::Watch(format!("CSR {name} ended without a certificate")))?;
    load_certificate(&cert_pem).map_err(|e| Error::InvalidCertificate {
        name: name.to_string(),
        reason: e.to_string(),
    })?;

    info!(name, "Certificate issued");
    Ok((cert_pem, key_pem))
}

/// Obtain every requested certificate concurrently and store them in `pki`.
///
/// The first failure cancels the remaining requests and is returned; `pki`
/// is left untouched unless all requests succeed.
pub async fn issue_certificates(
    api: Arc<dyn ClusterApi>,
    requests: Vec<CertificateRequest>,
    pki: &mut WorkerNodePki,
) -> Result<()> {
    let mut targets = HashSet::new();
    for request in &requests {
        if !targets.insert(request.target) {
            return Err(Error::InvalidConfiguration(format!(
                "certificate {} requested twice",
                request.target.as_str()
            )));
        }
    }

    let token = CancellationToken::new();
    let mut tasks = JoinSet::new();
    for request in requests {
        let api = api.clone();
        let token = token.clone();
        tasks.spawn(async move {
            let target = request.target;
            tokio::select! {
                () = token.cancelled() => Err(Error::Cancelled),
                result = request_certificate(api.as_ref(), &request) => {
                    result.map(|(cert, key)| (target, cert, key))
                }
            }
        });
    }

    let mut issued = Vec::new();
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(|e| Error::Task(e.to_string())).and_then(|r| r);
        match result {
            Ok(certificate) => issued.push(certificate),
            Err(e) if first_error.is_none() => {
                warn!(error = %e, "Certificate request failed, cancelling the others");
                token.cancel();
                first_error = Some(e);
            }
            Err(_) => {}
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    for (target, cert, key) in issued {
        pki.set_certificate(target, cert, key);
    }
    Ok(())
}
