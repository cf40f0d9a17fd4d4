//! Configuration types for k8sd
//!
//! The daemon configuration file, the cluster configuration shared by all
//! nodes, and the payloads a node is bootstrapped with.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod bootstrap;
pub mod cluster;
pub mod kubeconfig;
pub mod network;
pub mod token;

pub use bootstrap::{BootstrapConfig, ExtraArgs, InitConfig, WorkerJoinConfig};
pub use cluster::{ClusterConfig, DatastoreKind};
pub use kubeconfig::generate_kubeconfig;
pub use token::JoinToken;

/// Default location of the daemon configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/k8sd/k8sd.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid join token: {0}")]
    InvalidToken(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("unsupported datastore {0}, must be one of k8s-dqlite, external")]
    UnsupportedDatastore(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Settings of the local daemon process
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Node name in the cluster, the hostname when unset
    pub node_name: Option<String>,
    /// Address other members reach this node on
    pub node_address: Option<String>,
    /// Address the HTTP API listens on
    pub listen_address: String,
    /// Daemon state, including the cluster configuration store
    pub state_dir: PathBuf,
    /// Read-only snap installation
    pub snap_dir: PathBuf,
    /// Writable snap data shared across revisions
    pub snap_common_dir: PathBuf,
    /// OTLP collector endpoint, tracing export is disabled when unset
    pub otlp_endpoint: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            node_address: None,
            listen_address: "0.0.0.0:6400".to_string(),
            state_dir: PathBuf::from("/var/snap/k8s/common/var/lib/k8sd/state"),
            snap_dir: PathBuf::from("/snap/k8s/current"),
            snap_common_dir: PathBuf::from("/var/snap/k8s/common"),
            otlp_endpoint: None,
        }
    }
}

impl DaemonConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Self = serde_yaml::from_reader(file)?;
        Ok(config)
    }

    /// Load the configuration, falling back to defaults when the file is absent
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let yaml = r#"
node_name: worker-1
node_address: 10.0.0.5
otlp_endpoint: http://collector:4317
"#;
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", yaml).unwrap();

        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.node_name.as_deref(), Some("worker-1"));
        assert_eq!(config.node_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.listen_address, "0.0.0.0:6400");
        assert_eq!(config.snap_common_dir, PathBuf::from("/var/snap/k8s/common"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = DaemonConfig::load_or_default("/nonexistent/k8sd.yaml").unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert!(matches!(
            DaemonConfig::load("/nonexistent/k8sd.yaml"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not: valid: yaml: [").unwrap();
        assert!(matches!(
            DaemonConfig::load(file.path()),
            Err(ConfigError::Yaml(_))
        ));
    }
}
