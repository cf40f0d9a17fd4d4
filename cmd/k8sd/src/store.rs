//! Cluster configuration store
//!
//! Holds the configuration shared by the control plane. Writes merge the
//! update into what is stored and return the merged result.

use crate::error::Result;
use async_trait::async_trait;
use k8sd_config::ClusterConfig;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

#[async_trait]
/// Persistent cluster configuration
pub trait ClusterStore: Send + Sync {
    async fn get_cluster_config(&self) -> Result<ClusterConfig>;

    /// Merge `config` into the stored configuration and return the result
    async fn set_cluster_config(&self, config: &ClusterConfig) -> Result<ClusterConfig>;
}

/// JSON file in the daemon state directory
pub struct FileClusterStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileClusterStore {
    /// Create a store backed by the JSON file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<ClusterConfig> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ClusterConfig::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ClusterStore for FileClusterStore {
    async fn get_cluster_config(&self) -> Result<ClusterConfig> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    async fn set_cluster_config(&self, config: &ClusterConfig) -> Result<ClusterConfig> {
        let _guard = self.lock.lock().await;
        let merged = self.read().await?.merge(config)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Replace the file in one step so readers never see a partial write.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&merged)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), "Stored cluster configuration");
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_store_reads_empty_config() {
        let dir = TempDir::new().unwrap();
        let store = FileClusterStore::new(dir.path().join("cluster.json"));
        assert_eq!(store.get_cluster_config().await.unwrap(), ClusterConfig::default());
    }

    #[tokio::test]
    async fn test_set_merges_with_stored_config() {
        let dir = TempDir::new().unwrap();
        let store = FileClusterStore::new(dir.path().join("state").join("cluster.json"));

        let mut first = ClusterConfig::default();
        first.network.pod_cidr = Some("10.1.0.0/16".to_string());
        first.api_server.secure_port = Some(6443);
        store.set_cluster_config(&first).await.unwrap();

        let mut second = ClusterConfig::default();
        second.api_server.secure_port = Some(7443);
        let merged = store.set_cluster_config(&second).await.unwrap();

        assert_eq!(merged.network.pod_cidr.as_deref(), Some("10.1.0.0/16"));
        assert_eq!(merged.api_server.secure_port, Some(7443));
        assert_eq!(store.get_cluster_config().await.unwrap(), merged);
    }
}
