//! Error taxonomy of the daemon
//!
//! Bootstrap and refresh steps wrap failures in [`Error::Stage`] so the
//! caller sees which step failed; [`Error::root`] recovers the kind.

use k8sd_config::ConfigError;
use k8sd_crypto::cert_expiry::CertExpiryError;
use k8sd_crypto::pki::PkiError;
use k8sd_crypto::CryptoError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
/// Errors of the node daemon
pub enum Error {
    #[error("invalid join token: {0}")]
    InvalidToken(String),

    #[error("no cluster member reachable: {0}")]
    NoReachablePeer(String),

    #[error("fingerprint from token ({expected:?}) does not match fingerprint of node {address:?} ({actual:?})")]
    FingerprintMismatch {
        address: String,
        expected: String,
        actual: String,
    },

    #[error("worker join request failed: {0}")]
    JoinRequestFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("unsupported datastore {0}, must be one of k8s-dqlite, external")]
    UnsupportedDatastore(String),

    #[error("missing certificate: {0}")]
    MissingCertificate(String),

    #[error("incomplete PKI: {0}")]
    IncompletePki(String),

    #[error("failed to create CSR {name}: {reason}")]
    SubmissionFailed { name: String, reason: String },

    #[error("CSR {name} issued an invalid certificate: {reason}")]
    InvalidCertificate { name: String, reason: String },

    #[error("CSR {name} was denied: {reason}")]
    Denied { name: String, reason: String },

    #[error("CSR {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("kube-apiserver did not become ready: {0}")]
    ApiServerNotReady(String),

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("missing CA certificates")]
    MissingCaCertificate,

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("pre-init checks failed: {0}")]
    PreInitChecks(String),

    #[error("service {service} failed: {reason}")]
    Service { service: String, reason: String },

    #[error("no endpoints for the kubernetes service")]
    NoEndpoints,

    #[error("certificate error: {0}")]
    Crypto(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("watch error: {0}")]
    Watch(String),

    #[error("task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Innermost error, skipping stage wrappers
    pub fn root(&self) -> &Self {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Wrap the error of a failed step with the step's description
pub trait StageExt<T> {
    fn stage(self, stage: &'static str) -> Result<T>;
}

impl<T, E: Into<Error>> StageExt<T> for std::result::Result<T, E> {
    fn stage(self, stage: &'static str) -> Result<T> {
        self.map_err(|e| Error::Stage {
            stage,
            source: Box::new(e.into()),
        })
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidToken(msg) => Self::InvalidToken(msg),
            ConfigError::UnsupportedDatastore(kind) => Self::UnsupportedDatastore(kind),
            ConfigError::InvalidConfiguration(msg) => Self::InvalidConfiguration(msg),
            ConfigError::Io(e) => Self::Io(e),
            ConfigError::Json(e) => Self::Json(e),
            other => Self::InvalidConfiguration(other.to_string()),
        }
    }
}

impl From<PkiError> for Error {
    fn from(err: PkiError) -> Self {
        match err {
            PkiError::MissingCertificate(slot) => Self::MissingCertificate(slot.to_string()),
            PkiError::IncompletePki(msg) => Self::IncompletePki(msg),
            other => Self::Crypto(other.to_string()),
        }
    }
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        Self::Crypto(err.to_string())
    }
}

impl From<CertExpiryError> for Error {
    fn from(err: CertExpiryError) -> Self {
        Self::Crypto(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_wraps_and_root_unwraps() {
        let result: Result<()> = Err(Error::MissingCaCertificate);
        let err = result
            .stage("failed to refresh certificates")
            .stage("refresh")
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "refresh: failed to refresh certificates: missing CA certificates"
        );
        assert!(matches!(err.root(), Error::MissingCaCertificate));
    }

    #[test]
    fn test_config_errors_keep_their_kind() {
        let err: Error = ConfigError::UnsupportedDatastore("bogus".to_string()).into();
        assert!(matches!(err, Error::UnsupportedDatastore(kind) if kind == "bogus"));

        let err: Error = ConfigError::InvalidToken("empty".to_string()).into();
        assert!(matches!(err, Error::InvalidToken(_)));
    }

    #[test]
    fn test_pki_errors_keep_their_kind() {
        let err: Error = PkiError::MissingCertificate("datastore client key").into();
        assert!(matches!(err, Error::MissingCertificate(slot) if slot == "datastore client key"));
    }
}
