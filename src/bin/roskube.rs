//! roskube - pod orchestration for RouterOS devices.
//!
//! ## Usage
//!
//! ```sh
//! roskube --config /etc/roskube/config.yaml
//! roskube --config config.yaml --manifest /etc/roskube/pods.yaml
//! ```
//!
//! Runs the embedded registry, the management API, the reconciler, the
//! supervisor watchdog, the infrastructure watchdog, and the image GC as
//! one process. SIGINT shuts everything down after the current iteration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use roskube::config::Config;
use roskube::image::ImageManager;
use roskube::network::NetworkManager;
use roskube::provider::api::ApiServer;
use roskube::provider::Provider;
use roskube::registry::Registry;
use roskube::runtime::{RouterOsClient, RuntimePort};
use roskube::store::BlobStore;
use roskube::supervisor::Supervisor;

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    manifest: Option<PathBuf>,
    debug: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                args.config = Some(PathBuf::from(
                    iter.next().ok_or("--config requires a path")?,
                ));
            }
            "--manifest" => {
                args.manifest = Some(PathBuf::from(
                    iter.next().ok_or("--manifest requires a path")?,
                ));
            }
            "--debug" => args.debug = true,
            "--help" | "-h" => {
                println!(
                    "usage: roskube [--config <path>] [--manifest <path>] [--debug]"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(args)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install tracing subscriber");
        return ExitCode::FAILURE;
    }

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to load config");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };
    if args.manifest.is_some() {
        config.manifest_path = args.manifest.clone();
    }

    info!(node = %config.node_name, "starting roskube");

    if let Err(e) = run(config).await {
        error!(error = %e, "fatal");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(config: Config) -> roskube::Result<()> {
    let runtime: Arc<dyn RuntimePort> = Arc::new(RouterOsClient::new(&config.routeros)?);

    let store = Arc::new(BlobStore::new(config.registry.store_path.clone())?);
    let registry = Arc::new(Registry::new(config.registry.clone(), store));

    let network = Arc::new(NetworkManager::new(config.network.clone(), runtime.clone())?);
    if let Err(e) = network.sync().await {
        warn!(error = %e, "failed to sync existing allocations");
    }

    let images = Arc::new(ImageManager::new(
        config.storage.clone(),
        config.registry.clone(),
        runtime.clone(),
    ));
    let supervisor = Arc::new(Supervisor::new(config.supervisor.clone(), runtime.clone()));
    let provider = Arc::new(Provider::new(
        config.clone(),
        runtime,
        images.clone(),
        network,
        supervisor.clone(),
    ));
    let api = Arc::new(ApiServer::new(provider.clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = Vec::new();
    {
        let registry = registry.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = registry.serve(rx).await {
                error!(error = %e, "registry server error");
            }
        }));
    }
    {
        let api = api.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = api.serve(rx).await {
                error!(error = %e, "API server error");
            }
        }));
    }

    // Converge once before the periodic loops take over, then boot
    // supervised containers in dependency order.
    if let Err(e) = provider.reconcile().await {
        warn!(error = %e, "initial reconciliation failed");
    }
    supervisor.execute_boot_sequence().await;

    {
        let provider = provider.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            provider.run_reconciler(rx).await;
        }));
    }
    {
        let provider = provider.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            provider.run_infra_watchdog(rx).await;
        }));
    }
    {
        let supervisor = supervisor.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            supervisor.run_watchdog(rx).await;
        }));
    }
    {
        let images = images.clone();
        let rx = shutdown_rx;
        tasks.push(tokio::spawn(async move {
            images.run_gc(rx).await;
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}
