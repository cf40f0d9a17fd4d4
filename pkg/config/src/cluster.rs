//! Cluster configuration
//!
//! Every field is optional so that worker nodes can persist the subset they
//! know about. Control plane nodes build the full configuration from the
//! bootstrap payload, apply defaults and validate it before use.

use crate::bootstrap::{BootstrapConfig, UserFacingClusterConfig};
use crate::network::{cidrs_overlap, parse_cidrs};
use crate::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_POD_CIDR: &str = "10.1.0.0/16";
pub const DEFAULT_SERVICE_CIDR: &str = "10.152.183.0/24";
pub const DEFAULT_K8S_DQLITE_PORT: u16 = 9000;
pub const DEFAULT_SECURE_PORT: u16 = 6443;
pub const DEFAULT_AUTHORIZATION_MODE: &str = "Node,RBAC";
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Backend storing the cluster state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatastoreKind {
    K8sDqlite,
    External,
}

impl DatastoreKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::K8sDqlite => "k8s-dqlite",
            Self::External => "external",
        }
    }
}

impl FromStr for DatastoreKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "k8s-dqlite" => Ok(Self::K8sDqlite),
            "external" => Ok(Self::External),
            other => Err(ConfigError::UnsupportedDatastore(other.to_string())),
        }
    }
}

impl fmt::Display for DatastoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Certificates {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ca_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ca_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub front_proxy_ca_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub front_proxy_ca_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apiserver_kubelet_client_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apiserver_kubelet_client_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_client_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_client_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8sd_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8sd_private_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Datastore {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s_dqlite_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s_dqlite_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s_dqlite_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_servers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ca_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_client_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_client_key: Option<String>,
}

impl Datastore {
    /// Configured backend, `k8s-dqlite` when unset
    pub fn datastore_kind(&self) -> Result<DatastoreKind, ConfigError> {
        self.kind
            .as_deref()
            .map_or(Ok(DatastoreKind::K8sDqlite), DatastoreKind::from_str)
    }

    pub fn k8s_dqlite_port(&self) -> u16 {
        self.k8s_dqlite_port.unwrap_or(DEFAULT_K8S_DQLITE_PORT)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiServer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_mode: Option<String>,
}

impl ApiServer {
    pub fn secure_port(&self) -> u16 {
        self.secure_port.unwrap_or(DEFAULT_SECURE_PORT)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Kubelet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_dns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_plane_taints: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_storage: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_server: Option<bool>,
}

/// Configuration shared by every node of the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub network: Network,
    pub certificates: Certificates,
    pub datastore: Datastore,
    pub api_server: ApiServer,
    pub kubelet: Kubelet,
    pub features: Features,
}

impl ClusterConfig {
    /// Build the configuration of a new cluster from its bootstrap payload.
    ///
    /// Fails on an unsupported datastore type before anything else happens.
    pub fn from_bootstrap_config(bootstrap: &BootstrapConfig) -> Result<Self, ConfigError> {
        let datastore_kind = bootstrap
            .datastore_type
            .as_deref()
            .filter(|kind| !kind.is_empty())
            .map(DatastoreKind::from_str)
            .transpose()?;

        let authorization_mode = match bootstrap.disable_rbac {
            Some(true) => Some("AlwaysAllow".to_string()),
            _ => None,
        };

        let UserFacingClusterConfig {
            network,
            dns,
            gateway,
            ingress,
            load_balancer,
            local_storage,
            metrics_server,
            cloud_provider,
        } = bootstrap.cluster_config.clone();

        let mut config = Self {
            network: Network {
                enabled: network.enabled,
                pod_cidr: bootstrap.pod_cidr.clone(),
                service_cidr: bootstrap.service_cidr.clone(),
            },
            certificates: Certificates::default(),
            datastore: Datastore {
                kind: datastore_kind.map(|kind| kind.as_str().to_string()),
                k8s_dqlite_port: bootstrap.k8s_dqlite_port,
                ..Default::default()
            },
            api_server: ApiServer {
                secure_port: bootstrap.secure_port,
                authorization_mode,
            },
            kubelet: Kubelet {
                cloud_provider,
                cluster_dns: dns.service_ip,
                cluster_domain: dns.cluster_domain,
                control_plane_taints: bootstrap.control_plane_taints.clone(),
            },
            features: Features {
                dns: dns.enabled,
                gateway: gateway.enabled,
                ingress: ingress.enabled,
                load_balancer: load_balancer.enabled,
                local_storage: local_storage.enabled,
                metrics_server: metrics_server.enabled,
            },
        };

        if datastore_kind == Some(DatastoreKind::External) {
            config.datastore.external_servers = Some(bootstrap.datastore_servers.clone());
            config.datastore.external_ca_cert.clone_from(&bootstrap.datastore_ca_crt);
            config.datastore.external_client_cert.clone_from(&bootstrap.datastore_client_crt);
            config.datastore.external_client_key.clone_from(&bootstrap.datastore_client_key);
        }

        Ok(config)
    }

    /// Fill unset fields with cluster defaults
    pub fn set_defaults(&mut self) {
        fn default<T>(field: &mut Option<T>, value: impl FnOnce() -> T) {
            if field.is_none() {
                *field = Some(value());
            }
        }

        default(&mut self.network.enabled, || true);
        default(&mut self.network.pod_cidr, || DEFAULT_POD_CIDR.to_string());
        default(&mut self.network.service_cidr, || DEFAULT_SERVICE_CIDR.to_string());
        default(&mut self.datastore.kind, || DatastoreKind::K8sDqlite.as_str().to_string());
        default(&mut self.datastore.k8s_dqlite_port, || DEFAULT_K8S_DQLITE_PORT);
        default(&mut self.api_server.secure_port, || DEFAULT_SECURE_PORT);
        default(&mut self.api_server.authorization_mode, || {
            DEFAULT_AUTHORIZATION_MODE.to_string()
        });
        default(&mut self.kubelet.cluster_domain, || DEFAULT_CLUSTER_DOMAIN.to_string());
        default(&mut self.features.dns, || true);
        default(&mut self.features.gateway, || false);
        default(&mut self.features.ingress, || false);
        default(&mut self.features.load_balancer, || false);
        default(&mut self.features.local_storage, || false);
        default(&mut self.features.metrics_server, || false);
    }

    /// Check the configuration is usable, naming the first violated constraint
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pod_cidr = self
            .network
            .pod_cidr
            .as_deref()
            .ok_or_else(|| ConfigError::InvalidConfiguration("pod CIDR is not set".to_string()))?;
        let service_cidr = self.network.service_cidr.as_deref().ok_or_else(|| {
            ConfigError::InvalidConfiguration("service CIDR is not set".to_string())
        })?;

        let pods = parse_cidrs(pod_cidr)?;
        let services = parse_cidrs(service_cidr)?;
        if cidrs_overlap(&pods, &services) {
            return Err(ConfigError::InvalidConfiguration(format!(
                "pod CIDR {pod_cidr} and service CIDR {service_cidr} overlap"
            )));
        }

        if self.api_server.secure_port == Some(0) {
            return Err(ConfigError::InvalidConfiguration(
                "API server secure port must not be 0".to_string(),
            ));
        }

        match self.datastore.datastore_kind()? {
            DatastoreKind::K8sDqlite => {
                if self.datastore.k8s_dqlite_port == Some(0) {
                    return Err(ConfigError::InvalidConfiguration(
                        "k8s-dqlite port must not be 0".to_string(),
                    ));
                }
            }
            DatastoreKind::External => {
                let servers = self.datastore.external_servers.as_deref().unwrap_or_default();
                if servers.iter().all(|server| server.trim().is_empty()) {
                    return Err(ConfigError::InvalidConfiguration(
                        "external datastore requires at least one server".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Overlay the fields set in `update` onto this configuration.
    pub fn merge(&self, update: &Self) -> Result<Self, ConfigError> {
        let mut base = serde_json::to_value(self)?;
        merge_values(&mut base, serde_json::to_value(update)?);
        Ok(serde_json::from_value(base)?)
    }

    /// Settings mirrored into the snap configuration, keyed by snap option
    pub fn to_user_facing(&self) -> BTreeMap<String, String> {
        let mut settings = BTreeMap::new();
        let mut flag = |key: &str, value: Option<bool>| {
            if let Some(value) = value {
                settings.insert(format!("{key}.enabled"), value.to_string());
            }
        };
        flag("network", self.network.enabled);
        flag("dns", self.features.dns);
        flag("gateway", self.features.gateway);
        flag("ingress", self.features.ingress);
        flag("load-balancer", self.features.load_balancer);
        flag("local-storage", self.features.local_storage);
        flag("metrics-server", self.features.metrics_server);

        if let Some(domain) = &self.kubelet.cluster_domain {
            settings.insert("dns.cluster-domain".to_string(), domain.clone());
        }
        if let Some(service_ip) = &self.kubelet.cluster_dns {
            settings.insert("dns.service-ip".to_string(), service_ip.clone());
        }
        if let Some(provider) = &self.kubelet.cloud_provider {
            settings.insert("cloud-provider".to_string(), provider.clone());
        }
        settings
    }
}

fn merge_values(base: &mut Value, update: Value) {
    match (base, update) {
        (Value::Object(base), Value::Object(update)) => {
            for (key, value) in update {
                if value.is_null() {
                    continue;
                }
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, update) => *base = update,
    }
}
