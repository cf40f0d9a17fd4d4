//! Kubernetes API access
//!
//! The daemon needs three calls from the API server: the endpoints of the
//! `kubernetes` service, creating a CSR and watching it until a terminal
//! state.

use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryConfig};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::{Api, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use std::path::Path;
use tracing::{debug, info, warn};

/// Callback evaluating a CSR update: `Ok(true)` ends the watch successfully,
/// `Ok(false)` keeps watching, an error ends it with that error.
pub type CsrUpdateFn<'a> = dyn FnMut(&CertificateSigningRequest) -> Result<bool> + Send + 'a;

#[async_trait]
/// Kubernetes API calls the daemon makes
pub trait ClusterApi: Send + Sync {
    /// Addresses (`ip:port`) of the API servers, never empty on success
    async fn list_endpoints(&self) -> Result<Vec<String>>;

    async fn create_csr(&self, csr: &CertificateSigningRequest) -> Result<()>;

    /// Watch a CSR until `on_update` reports a terminal state. No timeout of
    /// its own; callers bound it.
    async fn watch_csr(&self, name: &str, on_update: &mut CsrUpdateFn<'_>) -> Result<()>;
}

/// [`ClusterApi`] backed by a kube client
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect with the credentials of a kubeconfig file
    pub async fn from_kubeconfig(path: &Path) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path)?;
        let config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        let client = Client::try_from(config)?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_endpoints(&self) -> Result<Vec<String>> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), "default");
        let endpoints = retry_with_backoff(
            &RetryConfig::api_lookup(),
            "get kubernetes endpoints",
            || api.get("kubernetes"),
        )
        .await?;

        let addresses = endpoint_addresses(&endpoints);
        if addresses.is_empty() {
            return Err(Error::NoEndpoints);
        }
        Ok(addresses)
    }

    async fn create_csr(&self, csr: &CertificateSigningRequest) -> Result<()> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        api.create(&PostParams::default(), csr).await?;
        info!(name = ?csr.metadata.name, "Submitted CSR");
        Ok(())
    }

    async fn watch_csr(&self, name: &str, on_update: &mut CsrUpdateFn<'_>) -> Result<()> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let mut stream = watcher(api, config).default_backoff().applied_objects().boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(csr) => {
                    debug!(name, "Observed CSR update");
                    if on_update(&csr)? {
                        return Ok(());
                    }
                }
                Err(e) => warn!(name, error = %e, "CSR watch error, retrying"),
            }
        }

        Err(Error::Watch(format!("watch of CSR {name} ended")))
    }
}

/// `ip:port` pairs of every ready address, using the `https` port when named
pub fn endpoint_addresses(endpoints: &Endpoints) -> Vec<String> {
    let mut addresses = Vec::new();
    for subset in endpoints.subsets.iter().flatten() {
        let ports = subset.ports.as_deref().unwrap_or_default();
        let port = ports
            .iter()
            .find(|p| p.name.as_deref() == Some("https"))
            .or_else(|| ports.first())
            .map(|p| p.port);

        for address in subset.addresses.iter().flatten() {
            match port {
                Some(port) if address.ip.contains(':') => {
                    addresses.push(format!("[{}]:{port}", address.ip));
                }
                Some(port) => addresses.push(format!("{}:{port}", address.ip)),
                None => addresses.push(address.ip.clone()),
            }
        }
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset};

    fn address(ip: &str) -> EndpointAddress {
        EndpointAddress {
            ip: ip.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_endpoint_addresses() {
        let endpoints = Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![address("10.0.0.1"), address("fd00::1")]),
                ports: Some(vec![
                    EndpointPort {
                        name: Some("metrics".to_string()),
                        port: 9090,
                        ..Default::default()
                    },
                    EndpointPort {
                        name: Some("https".to_string()),
                        port: 6443,
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }]),
            ..Default::default()
        };

        assert_eq!(
            endpoint_addresses(&endpoints),
            vec!["10.0.0.1:6443".to_string(), "[fd00::1]:6443".to_string()]
        );
    }

    #[test]
    fn test_empty_endpoints() {
        assert!(endpoint_addresses(&Endpoints::default()).is_empty());
    }
}
