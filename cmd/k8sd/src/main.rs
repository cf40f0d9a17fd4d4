//! k8sd - node bootstrap and certificate lifecycle daemon
//!
//! `k8sd bootstrap` turns the host into a worker or the first control plane
//! node and exits. `k8sd serve` runs the node API, which drives certificate
//! refresh.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use k8sd_config::DaemonConfig;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

mod bootstrap;
mod csr;
mod error;
mod features;
mod join;
mod kube_client;
mod refresh;
mod retry;
mod server;
mod setup;
mod snap;
mod store;
mod telemetry;
#[cfg(test)]
mod testing;

use bootstrap::{App, NodeIdentity};
use features::{FeatureControllers, FeatureReceivers};
use join::HttpsPeerTransport;
use snap::{LocalSnap, SnapPaths};
use store::FileClusterStore;

#[derive(Parser)]
#[command(name = "k8sd")]
#[command(about = "Kubernetes node bootstrap and certificate daemon", long_about = None)]
struct Cli {
    /// Daemon configuration file
    #[arg(long, default_value = k8sd_config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Node name, overrides the configuration file
    #[arg(long, global = true)]
    node_name: Option<String>,

    /// Address other members reach this node on
    #[arg(long, global = true)]
    node_address: Option<String>,

    /// Address the node API listens on
    #[arg(long, global = true)]
    listen_address: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn apply_overrides(&self, config: &mut DaemonConfig) {
        if let Some(name) = &self.node_name {
            config.node_name = Some(name.clone());
        }
        if let Some(address) = &self.node_address {
            config.node_address = Some(address.clone());
        }
        if let Some(listen) = &self.listen_address {
            config.listen_address.clone_from(listen);
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the node API
    Serve,
    /// Initialize this node and exit
    Bootstrap {
        /// YAML map of init configuration keys
        #[arg(long)]
        init_config: PathBuf,
    },
}

/// Identity from the daemon configuration; a bare address gets the listen port
fn node_identity(config: &DaemonConfig) -> Result<NodeIdentity> {
    let name = match &config.node_name {
        Some(name) => name.clone(),
        None => hostname::get()
            .context("failed to read hostname")?
            .into_string()
            .map_err(|_| anyhow!("hostname is not valid UTF-8"))?,
    };

    let Some(address) = config.node_address.as_deref() else {
        bail!("node_address must be set in the daemon configuration");
    };
    let address = match address.parse::<IpAddr>() {
        Ok(ip) => {
            let listen: SocketAddr = config
                .listen_address
                .parse()
                .with_context(|| format!("invalid listen address {:?}", config.listen_address))?;
            SocketAddr::new(ip, listen.port()).to_string()
        }
        Err(_) => address.to_string(),
    };

    Ok(NodeIdentity { name, address })
}

fn build_app(config: &DaemonConfig, node: NodeIdentity) -> (Arc<App>, FeatureReceivers) {
    let paths = SnapPaths::new(&config.snap_dir, &config.snap_common_dir);
    let snap = Arc::new(LocalSnap::new(paths, node.name.clone()));
    let store = Arc::new(FileClusterStore::new(config.state_dir.join("cluster.json")));
    let (features, receivers) = FeatureControllers::channel();

    let app = App::new(
        snap,
        store,
        Arc::new(HttpsPeerTransport::default()),
        node,
        features,
    );
    (Arc::new(app), receivers)
}

/// Log reconcile requests until every sender is gone
fn spawn_feature_listeners(receivers: FeatureReceivers) {
    for (feature, mut rx) in receivers.features {
        tokio::spawn(async move {
            while let Some(enabled) = rx.recv().await {
                info!(feature = feature.as_str(), enabled, "Feature reconcile requested");
            }
        });
    }
    let mut node_config = receivers.node_config;
    tokio::spawn(async move {
        while node_config.recv().await.is_some() {
            info!("Node configuration reconcile requested");
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutting down");
}

async fn serve(config: &DaemonConfig, app: Arc<App>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_address))?;
    info!(addr = %config.listen_address, node = %app.node().name, "Serving node API");

    axum::serve(listener, server::create_router(app))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("node API server failed")
}

async fn run_bootstrap(app: &App, init_config: &Path) -> Result<()> {
    let raw = tokio::fs::read_to_string(init_config)
        .await
        .with_context(|| format!("failed to read {}", init_config.display()))?;
    let init: BTreeMap<String, String> =
        serde_yaml::from_str(&raw).context("failed to parse init configuration")?;

    app.on_bootstrap(&init).await.context("bootstrap failed")?;
    info!(node = %app.node().name, "Node bootstrapped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = DaemonConfig::load_or_default(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    cli.apply_overrides(&mut config);

    telemetry::init_telemetry("k8sd", config.otlp_endpoint.as_deref())
        .map_err(|e| anyhow!("failed to initialize telemetry: {e}"))?;

    let node = node_identity(&config)?;
    let (app, receivers) = build_app(&config, node);
    spawn_feature_listeners(receivers);

    let result = match &cli.command {
        Commands::Serve => serve(&config, app).await,
        Commands::Bootstrap { init_config } => run_bootstrap(&app, init_config).await,
    };

    telemetry::shutdown_telemetry();
    result
}
