//! Certificate Authority management for k8sd
//!
//! Provides CA certificate generation and issuance of the leaf certificates
//! used by the Kubernetes components.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

#[derive(Error, Debug)]
pub enum CaError {
    #[error("Certificate generation error: {0}")]
    CertGen(String),
    #[error("Certificate parse error: {0}")]
    Parse(String),
}

/// Extended key usage of an issued certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateUsage {
    Server,
    Client,
    ServerAndClient,
}

/// Parameters of a leaf certificate
#[derive(Debug, Clone)]
pub struct CertificateTemplate {
    pub common_name: String,
    pub organization: Option<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub usage: CertificateUsage,
    pub validity_days: u32,
}

impl CertificateTemplate {
    pub fn new(common_name: impl Into<String>, usage: CertificateUsage, validity_days: u32) -> Self {
        Self {
            common_name: common_name.into(),
            organization: None,
            dns_names: Vec::new(),
            ip_addresses: Vec::new(),
            usage,
            validity_days,
        }
    }

    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn dns_names(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.dns_names.extend(names);
        self
    }

    pub fn ip_addresses(mut self, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        self.ip_addresses.extend(ips);
        self
    }

    fn into_params(self) -> CertificateParams {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name);
        if let Some(organization) = self.organization {
            dn.push(DnType::OrganizationName, organization);
        }
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;

        params.subject_alt_names = self
            .dns_names
            .into_iter()
            .map(SanType::DnsName)
            .chain(self.ip_addresses.into_iter().map(SanType::IpAddress))
            .collect();

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = match self.usage {
            CertificateUsage::Server => vec![ExtendedKeyUsagePurpose::ServerAuth],
            CertificateUsage::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
            CertificateUsage::ServerAndClient => vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
        };

        set_validity(&mut params, self.validity_days);
        params
    }
}

fn set_validity(params: &mut CertificateParams, validity_days: u32) {
    let not_before = OffsetDateTime::now_utc();
    params.not_before = not_before;
    params.not_after = not_before + Duration::days(i64::from(validity_days));
}

/// Certificate Authority for issuing certificates
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Generate a new self-signed root CA certificate
    pub fn generate_root_ca(common_name: &str, validity_days: u32) -> Result<Self, CaError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, validity_days);

        let ca_cert = Certificate::from_params(params)
            .map_err(|e| CaError::CertGen(format!("Failed to generate CA certificate: {e}")))?;
        let ca_cert_pem = ca_cert
            .serialize_pem()
            .map_err(|e| CaError::CertGen(format!("Failed to serialize CA certificate: {e}")))?;

        Ok(Self {
            ca_cert,
            ca_cert_pem,
        })
    }

    /// Load an existing CA certificate and key from PEM strings
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CaError> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| CaError::Parse(format!("Failed to parse CA private key: {e}")))?;

        let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CaError::Parse(format!("Failed to parse CA certificate: {e}")))?;

        let ca_cert = Certificate::from_params(params)
            .map_err(|e| CaError::Parse(format!("Failed to load CA certificate: {e}")))?;

        Ok(Self {
            ca_cert,
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// Issue a new certificate signed by this CA, returned as `(cert_pem, key_pem)`
    pub fn issue_certificate(
        &self,
        template: CertificateTemplate,
    ) -> Result<(String, String), CaError> {
        let cert = Certificate::from_params(template.into_params())
            .map_err(|e| CaError::CertGen(format!("Failed to generate certificate: {e}")))?;

        let cert_pem = cert
            .serialize_pem_with_signer(&self.ca_cert)
            .map_err(|e| CaError::CertGen(format!("Failed to sign certificate: {e}")))?;
        let key_pem = cert.serialize_private_key_pem();

        Ok((cert_pem, key_pem))
    }

    /// Get the CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Get the CA private key in PEM format
    pub fn ca_key_pem(&self) -> String {
        self.ca_cert.serialize_private_key_pem()
    }
}

/// Generate a self-signed leaf certificate, returned as `(cert_pem, key_pem)`
pub fn generate_self_signed(template: CertificateTemplate) -> Result<(String, String), CaError> {
    let cert = Certificate::from_params(template.into_params())
        .map_err(|e| CaError::CertGen(format!("Failed to generate certificate: {e}")))?;
    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| CaError::CertGen(format!("Failed to serialize certificate: {e}")))?;
    Ok((cert_pem, cert.serialize_private_key_pem()))
}
