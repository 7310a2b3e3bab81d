//! Perimeter Server
//!
//! Connects to every configured device and keeps the sessions alive until
//! the process is told to stop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use perimeter_runtime::ServiceManager;

use perimeter::analytics::AnalyticsBridge;
use perimeter::devices::WebSocketTransport;
use perimeter::project::{Project, ProjectLoader};
use perimeter::registry::{PresenceService, Registry};

/// Perimeter device server
#[derive(Parser, Debug)]
#[command(name = "perimeter")]
#[command(about = "Perimeter security device server", long_about = None)]
struct Args {
    /// Path to the project directory
    #[arg(short, long, default_value = "./project")]
    project: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Load and validate the project, print the device table and exit
    #[arg(long)]
    no_connect: bool,
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting perimeter server v{}", env!("CARGO_PKG_VERSION"));

    let project = ProjectLoader::load(&args.project)
        .await
        .with_context(|| format!("failed to load project {}", args.project.display()))?;
    info!("Loaded project: {} ({})", project.name(), project.id());

    if args.no_connect {
        print_devices(&project);
        return Ok(());
    }

    let service_manager = Arc::new(ServiceManager::new());
    let publisher = service_manager.event_publisher();

    let registry = Arc::new(Registry::new(project.descriptors(), publisher)?);

    // Services first so they see the first connection events
    service_manager
        .spawn(PresenceService::new(registry.clone()))
        .await?;
    service_manager.spawn(AnalyticsBridge::new()).await?;

    registry.start(Arc::new(WebSocketTransport::new()), project.reconnect_policy());

    shutdown_signal().await;

    registry.shutdown().await;

    info!("Shutting down services...");
    if let Err(e) = service_manager.shutdown_all().await {
        warn!("Some services did not shut down cleanly: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("perimeter=info,perimeter_runtime=info"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn print_devices(project: &Project) {
    println!("{:<16} {:<10} {:<24} ENDPOINT", "ID", "CLASS", "NAME");
    for device in project.devices.values() {
        println!(
            "{:<16} {:<10} {:<24} {}",
            device.device.id,
            device.device.class.as_str(),
            device.device.name,
            device.connection.endpoint
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
