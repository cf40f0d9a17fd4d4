use super::{is_set, years_to_days, PkiError};
use crate::ca::{generate_self_signed, CertificateTemplate, CertificateUsage};
use std::net::IpAddr;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct K8sDqlitePkiOpts {
    pub hostname: String,
    pub ip_sans: Vec<IpAddr>,
    pub years: u32,
    pub allow_self_signed_ca: bool,
}

/// Certificate of the embedded k8s-dqlite datastore
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct K8sDqlitePki {
    opts: K8sDqlitePkiOpts,
    pub k8s_dqlite_cert: Option<String>,
    pub k8s_dqlite_key: Option<String>,
}

impl K8sDqlitePki {
    pub fn new(opts: K8sDqlitePkiOpts) -> Self {
        Self {
            opts,
            ..Default::default()
        }
    }

    pub fn complete_certificates(&mut self) -> Result<(), PkiError> {
        match (is_set(&self.k8s_dqlite_cert), is_set(&self.k8s_dqlite_key)) {
            (true, true) => Ok(()),
            (false, false) => {
                if !self.opts.allow_self_signed_ca {
                    return Err(PkiError::IncompletePki(
                        "k8s-dqlite certificate not specified".to_string(),
                    ));
                }
                let mut dns_names = vec!["k8s".to_string()];
                if !self.opts.hostname.is_empty() {
                    dns_names.push(self.opts.hostname.clone());
                }
                let template = CertificateTemplate::new(
                    "k8s",
                    CertificateUsage::ServerAndClient,
                    years_to_days(self.opts.years),
                )
                .dns_names(dns_names)
                .ip_addresses(self.opts.ip_sans.iter().copied());
                let (cert, key) = generate_self_signed(template)?;
                self.k8s_dqlite_cert = Some(cert);
                self.k8s_dqlite_key = Some(key);
                Ok(())
            }
            _ => Err(PkiError::IncompletePki(
                "k8s-dqlite certificate and key must be specified together".to_string(),
            )),
        }
    }
}

/// Client certificates for an external datastore, always supplied by the user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalDatastorePki {
    pub datastore_ca_cert: Option<String>,
    pub datastore_client_cert: Option<String>,
    pub datastore_client_key: Option<String>,
}

impl ExternalDatastorePki {
    pub fn check_certificates(&self) -> Result<(), PkiError> {
        if !is_set(&self.datastore_ca_cert) {
            return Err(PkiError::MissingCertificate("datastore CA certificate"));
        }
        if !is_set(&self.datastore_client_cert) {
            return Err(PkiError::MissingCertificate("datastore client certificate"));
        }
        if !is_set(&self.datastore_client_key) {
            return Err(PkiError::MissingCertificate("datastore client key"));
        }
        Ok(())
    }
}
