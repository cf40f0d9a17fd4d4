//! Notifications to the feature controllers
//!
//! Controllers reconcile on their own schedule; a notification only wakes
//! them up. Channels hold a single pending notification, so notifying a
//! controller that has not caught up yet is a no-op.

use k8sd_config::ClusterConfig;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Cluster features with their own controller
pub enum Feature {
    Network,
    Dns,
    Gateway,
    Ingress,
    LoadBalancer,
    LocalStorage,
    MetricsServer,
}

impl Feature {
    pub const ALL: [Self; 7] = [
        Self::Network,
        Self::Dns,
        Self::Gateway,
        Self::Ingress,
        Self::LoadBalancer,
        Self::LocalStorage,
        Self::MetricsServer,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Dns => "dns",
            Self::Gateway => "gateway",
            Self::Ingress => "ingress",
            Self::LoadBalancer => "load-balancer",
            Self::LocalStorage => "local-storage",
            Self::MetricsServer => "metrics-server",
        }
    }

    fn enabled(self, config: &ClusterConfig) -> bool {
        let flag = match self {
            Self::Network => config.network.enabled,
            Self::Dns => config.features.dns,
            Self::Gateway => config.features.gateway,
            Self::Ingress => config.features.ingress,
            Self::LoadBalancer => config.features.load_balancer,
            Self::LocalStorage => config.features.local_storage,
            Self::MetricsServer => config.features.metrics_server,
        };
        flag.unwrap_or(false)
    }
}

/// Receiving ends, one per controller
pub struct FeatureReceivers {
    pub features: BTreeMap<Feature, mpsc::Receiver<bool>>,
    pub node_config: mpsc::Receiver<()>,
}

#[derive(Clone)]
/// Sending ends, one per controller
pub struct FeatureControllers {
    features: BTreeMap<Feature, mpsc::Sender<bool>>,
    node_config: mpsc::Sender<()>,
}

impl FeatureControllers {
    /// Create the notification channels
    pub fn channel() -> (Self, FeatureReceivers) {
        let mut senders = BTreeMap::new();
        let mut receivers = BTreeMap::new();
        for feature in Feature::ALL {
            let (tx, rx) = mpsc::channel(1);
            senders.insert(feature, tx);
            receivers.insert(feature, rx);
        }
        let (node_config_tx, node_config_rx) = mpsc::channel(1);

        (
            Self {
                features: senders,
                node_config: node_config_tx,
            },
            FeatureReceivers {
                features: receivers,
                node_config: node_config_rx,
            },
        )
    }

    /// Wake every feature controller with its enabled state
    pub fn notify_features(&self, config: &ClusterConfig) {
        for (feature, tx) in &self.features {
            if tx.try_send(feature.enabled(config)).is_err() {
                debug!(feature = feature.as_str(), "Feature controller already notified");
            }
        }
    }

    /// Wake the node configuration controller
    pub fn notify_node_config(&self) {
        if self.node_config.try_send(()).is_err() {
            debug!("Node config controller already notified");
        }
    }
}
