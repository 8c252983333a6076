//! Trellis operator - cluster lifecycle planner

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trellis::controller::{error_policy, reconcile, Context};
use trellis::crd::TrellisCluster;

/// Trellis - declarative lifecycle planner for multi-node distro clusters
#[derive(Parser, Debug)]
#[command(name = "trellis", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "TRELLIS_NAMESPACE")]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", serde_yaml::to_string(&TrellisCluster::crd())?);
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let client = Client::try_default().await?;
    let clusters: Api<TrellisCluster> = match &cli.namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    let context = Arc::new(Context::new(client));

    // Machine and plan-record changes are picked up through the requeue
    // policy in the controller module; every waiting pass re-enters within
    // seconds.
    tracing::info!("starting trellis controller");
    Controller::new(clusters, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => tracing::debug!(cluster = %obj.name, "reconciled"),
                Err(e) => tracing::warn!(error = %e, "reconciliation error"),
            }
        })
        .await;

    tracing::info!("controller terminated");
    Ok(())
}
