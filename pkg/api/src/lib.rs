//! Request and response contracts of the k8sd HTTP API
//!
//! Every response body is wrapped in a [`Response`] envelope carrying either
//! an error string or the typed metadata.

use serde::{Deserialize, Serialize};

/// Prefix of every k8sd endpoint
pub const API_PREFIX: &str = "/1.0/k8sd";

pub const WORKER_INFO_PATH: &str = "/1.0/k8sd/worker/info";
pub const REFRESH_CERTS_PLAN_PATH: &str = "/1.0/k8sd/refresh-certs/plan";
pub const REFRESH_CERTS_RUN_PATH: &str = "/1.0/k8sd/refresh-certs/run";

/// Header carrying the name of a joining worker
pub const WORKER_NAME_HEADER: &str = "worker-name";
/// Header carrying the join token secret
pub const WORKER_TOKEN_HEADER: &str = "worker-token";

/// Response envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response<T> {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub metadata: T,
}

impl<T> Response<T> {
    pub fn success(metadata: T) -> Self {
        Self {
            error: String::new(),
            metadata,
        }
    }
}

impl<T: Default> Response<T> {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            metadata: T::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetWorkerJoinInfoRequest {
    /// Address of the joining worker
    pub address: String,
}

/// Everything a worker needs to join the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GetWorkerJoinInfoResponse {
    pub ca_cert: String,
    #[serde(rename = "clientCACert")]
    pub client_ca_cert: String,
    pub kubelet_cert: String,
    pub kubelet_key: String,
    pub kubelet_client_cert: String,
    pub kubelet_client_key: String,
    pub kube_proxy_client_cert: String,
    pub kube_proxy_client_key: String,
    #[serde(rename = "podCIDR")]
    pub pod_cidr: String,
    #[serde(rename = "serviceCIDR")]
    pub service_cidr: String,
    pub k8sd_public_key: String,
    #[serde(rename = "clusterDNS")]
    pub cluster_dns: String,
    pub cluster_domain: String,
    pub cloud_provider: String,
    pub api_servers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RefreshCertificatesPlanResponse {
    pub seed: u64,
    pub certificate_signing_requests: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefreshCertificatesRunRequest {
    pub seed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshCertificatesRunResponse {
    pub expiration_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_info_wire_names() {
        let body = json!({
            "error": "",
            "metadata": {
                "caCert": "CA",
                "clientCACert": "CCA",
                "kubeletCert": "KC",
                "kubeProxyClientKey": "KPK",
                "podCIDR": "10.1.0.0/16",
                "serviceCIDR": "10.152.183.0/24",
                "k8sdPublicKey": "PUB",
                "clusterDNS": "10.152.183.10",
                "apiServers": ["10.0.0.1:6443"]
            }
        });

        let response: Response<GetWorkerJoinInfoResponse> = serde_json::from_value(body).unwrap();
        let info = response.metadata;
        assert_eq!(info.ca_cert, "CA");
        assert_eq!(info.client_ca_cert, "CCA");
        assert_eq!(info.kubelet_cert, "KC");
        assert_eq!(info.kube_proxy_client_key, "KPK");
        assert_eq!(info.pod_cidr, "10.1.0.0/16");
        assert_eq!(info.service_cidr, "10.152.183.0/24");
        assert_eq!(info.k8sd_public_key, "PUB");
        assert_eq!(info.cluster_dns, "10.152.183.10");
        assert_eq!(info.api_servers, vec!["10.0.0.1:6443".to_string()]);
        assert!(info.cloud_provider.is_empty());
    }

    #[test]
    fn test_refresh_wire_names() {
        let plan = Response::success(RefreshCertificatesPlanResponse {
            seed: 7,
            certificate_signing_requests: vec!["k8sd-7-worker-kubelet-client".to_string()],
        });
        let value = serde_json::to_value(&plan).unwrap();
        assert_eq!(value["metadata"]["seed"], 7);
        assert_eq!(
            value["metadata"]["certificateSigningRequests"][0],
            "k8sd-7-worker-kubelet-client"
        );

        let run = serde_json::to_value(RefreshCertificatesRunResponse {
            expiration_seconds: 86400,
        })
        .unwrap();
        assert_eq!(run, json!({"expirationSeconds": 86400}));
    }

    #[test]
    fn test_run_request_is_strict() {
        assert!(serde_json::from_str::<RefreshCertificatesRunRequest>(r#"{"seed":1}"#).is_ok());
        assert!(
            serde_json::from_str::<RefreshCertificatesRunRequest>(r#"{"seed":1,"x":2}"#).is_err()
        );
    }

    #[test]
    fn test_failure_envelope() {
        let response: Response<RefreshCertificatesRunResponse> = Response::failure("not implemented");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"], "not implemented");
    }
}
