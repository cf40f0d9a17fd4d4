//! PKI bundles
//!
//! A bundle holds the certificate and key material one node role needs.
//! Slots are `Option<String>` PEM values; completion either fills every
//! required slot or fails naming the first slot it could not satisfy.

use crate::ca::{CaError, CertificateAuthority, CertificateTemplate};
use crate::CryptoError;
use thiserror::Error;

mod control_plane;
mod datastore;
mod worker;

pub use control_plane::{ControlPlanePki, ControlPlanePkiOpts};
pub use datastore::{ExternalDatastorePki, K8sDqlitePki, K8sDqlitePkiOpts};
pub use worker::{WorkerCertificate, WorkerNodePki};

#[derive(Error, Debug)]
pub enum PkiError {
    #[error("missing certificate: {0}")]
    MissingCertificate(&'static str),
    #[error("incomplete PKI: {0}")]
    IncompletePki(String),
    #[error("CA error: {0}")]
    Ca(#[from] CaError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

fn is_set(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Ensure a certificate/key pair is present, issuing it when both halves
/// are missing and a signing CA is available.
fn ensure_pair(
    name: &'static str,
    cert: &mut Option<String>,
    key: &mut Option<String>,
    signer: Option<&CertificateAuthority>,
    template: impl FnOnce() -> CertificateTemplate,
) -> Result<(), PkiError> {
    match (is_set(cert), is_set(key)) {
        (true, true) => Ok(()),
        (false, false) => {
            let ca = signer.ok_or_else(|| {
                PkiError::IncompletePki(format!("{name} certificate not specified and no CA key available to sign it"))
            })?;
            let (cert_pem, key_pem) = ca.issue_certificate(template())?;
            *cert = Some(cert_pem);
            *key = Some(key_pem);
            Ok(())
        }
        (true, false) => Err(PkiError::IncompletePki(format!(
            "{name} certificate specified without key"
        ))),
        (false, true) => Err(PkiError::IncompletePki(format!(
            "{name} key specified without certificate"
        ))),
    }
}

/// Ensure a CA pair is present, generating a self-signed CA when allowed.
/// Returns the loaded CA when its key is available.
fn ensure_ca(
    name: &'static str,
    common_name: &str,
    cert: &mut Option<String>,
    key: &mut Option<String>,
    allow_self_signed: bool,
    validity_days: u32,
) -> Result<Option<CertificateAuthority>, PkiError> {
    match (is_set(cert), is_set(key)) {
        (false, false) => {
            if !allow_self_signed {
                return Err(PkiError::IncompletePki(format!("{name} not specified")));
            }
            let ca = CertificateAuthority::generate_root_ca(common_name, validity_days)?;
            *cert = Some(ca.ca_cert_pem().to_string());
            *key = Some(ca.ca_key_pem());
            Ok(Some(ca))
        }
        (true, true) => {
            let ca = CertificateAuthority::from_pem(
                cert.as_deref().unwrap_or_default(),
                key.as_deref().unwrap_or_default(),
            )?;
            Ok(Some(ca))
        }
        // Externally managed CA: leaf certificates must be supplied.
        (true, false) => Ok(None),
        (false, true) => Err(PkiError::IncompletePki(format!(
            "{name} key specified without certificate"
        ))),
    }
}

fn years_to_days(years: u32) -> u32 {
    years.saturating_mul(365)
}
