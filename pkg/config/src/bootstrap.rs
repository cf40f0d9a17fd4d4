//! Bootstrap payloads
//!
//! A node is initialised from a map of string keys. A `workerToken` key makes
//! it a worker joining an existing cluster, otherwise it bootstraps a new
//! cluster as its first control plane node.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const WORKER_TOKEN_KEY: &str = "workerToken";
pub const WORKER_JOIN_CONFIG_KEY: &str = "workerJoinConfig";
pub const BOOTSTRAP_CONFIG_KEY: &str = "bootstrapConfig";
pub const TIMEOUT_KEY: &str = "timeout";

/// Extra command line arguments for a service. A `None` value removes the flag.
pub type ExtraArgs = BTreeMap<String, Option<String>>;

/// Feature toggle in the user facing configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Feature {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DnsFeature {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_ip: Option<String>,
}

/// Cluster settings a user may set at bootstrap time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct UserFacingClusterConfig {
    pub network: Feature,
    pub dns: DnsFeature,
    pub gateway: Feature,
    pub ingress: Feature,
    pub load_balancer: Feature,
    pub local_storage: Feature,
    pub metrics_server: Feature,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<String>,
}

/// Configuration of the first control plane node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BootstrapConfig {
    pub cluster_config: UserFacingClusterConfig,
    pub control_plane_taints: Option<Vec<String>>,
    pub pod_cidr: Option<String>,
    pub service_cidr: Option<String>,
    pub disable_rbac: Option<bool>,
    pub secure_port: Option<u16>,
    pub k8s_dqlite_port: Option<u16>,
    pub datastore_type: Option<String>,
    pub datastore_servers: Vec<String>,
    pub datastore_ca_crt: Option<String>,
    pub datastore_client_crt: Option<String>,
    pub datastore_client_key: Option<String>,
    pub extra_sans: Vec<String>,

    pub ca_crt: Option<String>,
    pub ca_key: Option<String>,
    pub client_ca_crt: Option<String>,
    pub client_ca_key: Option<String>,
    pub front_proxy_ca_crt: Option<String>,
    pub front_proxy_ca_key: Option<String>,
    pub front_proxy_client_crt: Option<String>,
    pub front_proxy_client_key: Option<String>,
    pub apiserver_kubelet_client_crt: Option<String>,
    pub apiserver_kubelet_client_key: Option<String>,
    pub admin_client_crt: Option<String>,
    pub admin_client_key: Option<String>,
    pub kube_controller_manager_client_crt: Option<String>,
    pub kube_controller_manager_client_key: Option<String>,
    pub kube_scheduler_client_crt: Option<String>,
    pub kube_scheduler_client_key: Option<String>,
    pub kube_proxy_client_crt: Option<String>,
    pub kube_proxy_client_key: Option<String>,
    pub service_account_key: Option<String>,
    pub apiserver_crt: Option<String>,
    pub apiserver_key: Option<String>,
    pub kubelet_crt: Option<String>,
    pub kubelet_key: Option<String>,
    pub kubelet_client_crt: Option<String>,
    pub kubelet_client_key: Option<String>,

    pub extra_node_config_files: BTreeMap<String, String>,
    pub extra_node_kube_apiserver_args: ExtraArgs,
    pub extra_node_kube_controller_manager_args: ExtraArgs,
    pub extra_node_kube_scheduler_args: ExtraArgs,
    pub extra_node_kube_proxy_args: ExtraArgs,
    pub extra_node_kubelet_args: ExtraArgs,
    pub extra_node_containerd_args: ExtraArgs,
    pub extra_node_k8s_dqlite_args: ExtraArgs,
    /// Raw TOML merged into the containerd configuration
    pub extra_node_containerd_config: Option<String>,
}

/// Configuration of a worker joining an existing cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WorkerJoinConfig {
    pub kubelet_crt: Option<String>,
    pub kubelet_key: Option<String>,
    pub kubelet_client_crt: Option<String>,
    pub kubelet_client_key: Option<String>,
    pub kube_proxy_client_crt: Option<String>,
    pub kube_proxy_client_key: Option<String>,

    pub extra_node_config_files: BTreeMap<String, String>,
    pub extra_node_kubelet_args: ExtraArgs,
    pub extra_node_kube_proxy_args: ExtraArgs,
    pub extra_node_containerd_args: ExtraArgs,
    pub extra_node_k8s_apiserver_proxy_args: ExtraArgs,
    pub extra_node_containerd_config: Option<String>,
}

/// Parsed init configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitConfig {
    Worker {
        token: String,
        join_config: WorkerJoinConfig,
    },
    ControlPlane(Box<BootstrapConfig>),
}

impl InitConfig {
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        if let Some(token) = map.get(WORKER_TOKEN_KEY) {
            let join_config = match map.get(WORKER_JOIN_CONFIG_KEY) {
                Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw).map_err(|e| {
                    ConfigError::InvalidConfiguration(format!(
                        "failed to unmarshal worker join config: {e}"
                    ))
                })?,
                _ => WorkerJoinConfig::default(),
            };
            return Ok(Self::Worker {
                token: token.clone(),
                join_config,
            });
        }

        let bootstrap_config = match map.get(BOOTSTRAP_CONFIG_KEY) {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw).map_err(|e| {
                ConfigError::InvalidConfiguration(format!(
                    "failed to unmarshal bootstrap config: {e}"
                ))
            })?,
            _ => BootstrapConfig::default(),
        };
        Ok(Self::ControlPlane(Box::new(bootstrap_config)))
    }
}

/// Deadline for the whole bootstrap, from the `timeout` key
pub fn timeout_from_map(map: &BTreeMap<String, String>) -> Result<Option<Duration>, ConfigError> {
    map.get(TIMEOUT_KEY)
        .map(|raw| parse_duration(raw))
        .transpose()
}

/// Parse a Go style duration such as `30s`, `1m30s`, `500ms` or `1.5h`.
/// A plain number is taken as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let invalid = || ConfigError::InvalidConfiguration(format!("invalid duration {raw:?}"));

    if raw.is_empty() {
        return Err(invalid());
    }
    if let Ok(seconds) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let mut rest = raw;
    let mut total = 0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let (number, tail) = rest.split_at(number_len);
        let value: f64 = number.parse().map_err(|_| invalid())?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let scale = match unit {
            "ns" => 1e-9,
            "us" | "\u{b5}s" | "\u{3bc}s" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        total += value * scale;
        rest = tail;
    }
    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_worker_selected_by_token() {
        let init = InitConfig::from_map(&map(&[
            ("workerToken", "abc"),
            ("workerJoinConfig", r#"{"kubelet-crt":"CERT","extra-node-kubelet-args":{"--v":"4","--foo":null}}"#),
            ("bootstrapConfig", "ignored"),
        ]))
        .unwrap();

        match init {
            InitConfig::Worker { token, join_config } => {
                assert_eq!(token, "abc");
                assert_eq!(join_config.kubelet_crt.as_deref(), Some("CERT"));
                assert_eq!(join_config.extra_node_kubelet_args.get("--v"), Some(&Some("4".to_string())));
                assert_eq!(join_config.extra_node_kubelet_args.get("--foo"), Some(&None));
            }
            InitConfig::ControlPlane(_) => panic!("expected worker"),
        }
    }

    #[test]
    fn test_control_plane_by_default() {
        let init = InitConfig::from_map(&map(&[(
            "bootstrapConfig",
            r#"{"service-cidr":"10.96.0.0/12","datastore-type":"k8s-dqlite","extra-sans":["1.2.3.4"],"cluster-config":{"dns":{"enabled":true}}}"#,
        )]))
        .unwrap();

        let InitConfig::ControlPlane(config) = init else {
            panic!("expected control plane");
        };
        assert_eq!(config.service_cidr.as_deref(), Some("10.96.0.0/12"));
        assert_eq!(config.extra_sans, vec!["1.2.3.4".to_string()]);
        assert_eq!(config.cluster_config.dns.enabled, Some(true));

        let empty = InitConfig::from_map(&BTreeMap::new()).unwrap();
        assert_eq!(empty, InitConfig::ControlPlane(Box::default()));
    }

    #[test]
    fn test_invalid_payload() {
        assert!(matches!(
            InitConfig::from_map(&map(&[("bootstrapConfig", "{not json")])),
            Err(ConfigError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_timeout() {
        assert_eq!(timeout_from_map(&BTreeMap::new()).unwrap(), None);
        assert_eq!(
            timeout_from_map(&map(&[("timeout", "5m")])).unwrap(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_compound_durations() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1h0m5s").unwrap(), Duration::from_secs(3605));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(
            timeout_from_map(&map(&[("timeout", "2m30s")])).unwrap(),
            Some(Duration::from_secs(150))
        );

        assert!(parse_duration("5").is_ok());
        assert!(parse_duration("1m30").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("ms").is_err());
    }
}
