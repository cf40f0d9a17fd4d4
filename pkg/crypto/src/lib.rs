//! Cryptographic primitives for k8sd
//!
//! Key and CSR generation, certificate loading and fingerprinting, the
//! certificate authority used to complete PKI bundles, and the bundles
//! themselves.

use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Name, X509Req, X509};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use thiserror::Error;

pub mod ca;
pub mod cert_expiry;
pub mod pki;

pub use ca::{CertificateAuthority, CertificateTemplate};
pub use cert_expiry::{validity_duration, CertExpiryError};

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("Certificate generation error: {0}")]
    CertGen(String),
    #[error("Certificate parse error: {0}")]
    Parse(String),
}

/// Subject of a certificate signing request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    pub common_name: String,
    pub organization: Vec<String>,
}

impl Subject {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: Vec::new(),
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization.push(organization.into());
        self
    }
}

/// Generate an RSA private key and a PKCS#10 CSR for `subject`.
///
/// Hostnames and IPs are requested as subject alternative names.
/// Returns `(csr_pem, key_pem)`, the key in PKCS#8 form.
pub fn generate_csr(
    subject: &Subject,
    key_bits: u32,
    hostnames: &[String],
    ips: &[IpAddr],
) -> Result<(String, String), CryptoError> {
    let rsa = Rsa::generate(key_bits)?;
    let private_key = PKey::from_rsa(rsa)?;

    let mut req_builder = X509Req::builder()?;
    req_builder.set_version(0)?;

    let mut name_builder = X509Name::builder()?;
    name_builder.append_entry_by_text("CN", &subject.common_name)?;
    for organization in &subject.organization {
        name_builder.append_entry_by_text("O", organization)?;
    }
    let name = name_builder.build();
    req_builder.set_subject_name(&name)?;
    req_builder.set_pubkey(&private_key)?;

    if !hostnames.is_empty() || !ips.is_empty() {
        let mut san_builder = SubjectAlternativeName::new();
        for hostname in hostnames {
            san_builder.dns(hostname);
        }
        for ip in ips {
            san_builder.ip(&ip.to_string());
        }
        let san = san_builder.build(&req_builder.x509v3_context(None))?;
        let mut extensions = Stack::new()?;
        extensions.push(san)?;
        req_builder.add_extensions(&extensions)?;
    }

    req_builder.sign(&private_key, MessageDigest::sha256())?;
    let csr = req_builder.build();

    let csr_pem = String::from_utf8(csr.to_pem()?)
        .map_err(|e| CryptoError::CertGen(format!("CSR is not valid UTF-8: {e}")))?;
    let key_pem = String::from_utf8(private_key.private_key_to_pem_pkcs8()?)
        .map_err(|e| CryptoError::CertGen(format!("key is not valid UTF-8: {e}")))?;

    Ok((csr_pem, key_pem))
}

/// Generate an RSA key pair, returned as `(private_key_pem, public_key_pem)`.
pub fn generate_rsa_key(key_bits: u32) -> Result<(String, String), CryptoError> {
    let rsa = Rsa::generate(key_bits)?;
    let private_pem = String::from_utf8(rsa.private_key_to_pem()?)
        .map_err(|e| CryptoError::CertGen(format!("key is not valid UTF-8: {e}")))?;
    let public_pem = String::from_utf8(rsa.public_key_to_pem()?)
        .map_err(|e| CryptoError::CertGen(format!("key is not valid UTF-8: {e}")))?;
    Ok((private_pem, public_pem))
}

/// Parse a PEM encoded certificate.
pub fn load_certificate(cert_pem: &str) -> Result<X509, CryptoError> {
    if cert_pem.trim().is_empty() {
        return Err(CryptoError::Parse("empty certificate".to_string()));
    }
    X509::from_pem(cert_pem.as_bytes())
        .map_err(|e| CryptoError::Parse(format!("failed to parse certificate: {e}")))
}

/// SHA-256 fingerprint of a certificate's DER encoding, as lowercase hex.
pub fn certificate_fingerprint(cert: &X509) -> Result<String, CryptoError> {
    let der = cert.to_der()?;
    Ok(der_fingerprint(&der))
}

/// SHA-256 fingerprint of raw DER bytes, as lowercase hex.
pub fn der_fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// First common name in the certificate subject.
pub fn common_name(cert: &X509) -> Option<String> {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_csr() {
        let subject = Subject::new("system:node:worker-1").with_organization("system:nodes");
        let (csr_pem, key_pem) = generate_csr(
            &subject,
            2048,
            &["worker-1".to_string()],
            &["10.0.0.5".parse().unwrap()],
        )
        .unwrap();

        assert!(csr_pem.contains("BEGIN CERTIFICATE REQUEST"));
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));

        let csr = X509Req::from_pem(csr_pem.as_bytes()).unwrap();
        let cn = csr
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(cn, "system:node:worker-1");
        assert!(csr.verify(&csr.public_key().unwrap()).unwrap());
    }

    #[test]
    fn test_generate_csr_without_sans() {
        let (csr_pem, _) = generate_csr(&Subject::new("system:kube-proxy"), 2048, &[], &[]).unwrap();
        assert!(X509Req::from_pem(csr_pem.as_bytes()).is_ok());
    }

    #[test]
    fn test_load_certificate_rejects_garbage() {
        assert!(matches!(load_certificate(""), Err(CryptoError::Parse(_))));
        assert!(matches!(
            load_certificate("-----BEGIN CERTIFICATE-----\nnope\n-----END CERTIFICATE-----\n"),
            Err(CryptoError::Parse(_))
        ));
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let ca = CertificateAuthority::generate_root_ca("test-ca", 1).unwrap();
        let cert = load_certificate(ca.ca_cert_pem()).unwrap();

        let first = certificate_fingerprint(&cert).unwrap();
        let second = certificate_fingerprint(&cert).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(common_name(&cert).as_deref(), Some("test-ca"));
    }

    #[test]
    fn test_generate_rsa_key() {
        let (private_pem, public_pem) = generate_rsa_key(2048).unwrap();
        assert!(private_pem.contains("BEGIN RSA PRIVATE KEY"));
        assert!(public_pem.contains("BEGIN PUBLIC KEY"));
    }
}
