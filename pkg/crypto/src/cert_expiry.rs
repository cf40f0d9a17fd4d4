//! Certificate validity utilities
//!
//! Used to report the lifetime of refreshed certificates.

use openssl::asn1::Asn1TimeRef;
use openssl::x509::X509;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CertExpiryError {
    #[error("Failed to parse certificate: {0}")]
    ParseError(#[from] openssl::error::ErrorStack),

    #[error("Certificate validity period is inverted")]
    InvertedValidity,
}

pub type Result<T> = std::result::Result<T, CertExpiryError>;

/// Length of the certificate validity period (`notAfter - notBefore`)
pub fn validity_duration(cert_pem: &str) -> Result<Duration> {
    let cert = X509::from_pem(cert_pem.as_bytes())?;
    let seconds = seconds_between(cert.not_before(), cert.not_after())?;
    u64::try_from(seconds)
        .map(Duration::from_secs)
        .map_err(|_| CertExpiryError::InvertedValidity)
}

fn seconds_between(from: &Asn1TimeRef, to: &Asn1TimeRef) -> Result<i64> {
    let diff = from.diff(to)?;
    Ok(i64::from(diff.days) * 86400 + i64::from(diff.secs))
}
