//! Service registry daemon - main entry point.
//!
//! Runs the system-wide registry with its IPC control interface. With
//! `--profile` the process additionally hosts the services declared in the
//! profile document; the path must live under one of the configured system
//! profile directories, otherwise startup aborts before any registry
//! interaction.

use std::sync::Arc;

use clap::Parser;

use servicehub_core::host::ServiceHost;
use servicehub_core::ipc::{IpcContext, IpcServer};
use servicehub_core::loader::FactoryLoader;
use servicehub_core::profile::validate_profile_path;
use servicehub_core::registry::{LocalRegistryConnector, ServiceRegistry};
use servicehub_core::types::CallerIdentity;
use servicehub_core::Config;

#[derive(Debug, Parser)]
#[command(name = "servicehubd", about = "System service registry daemon")]
struct Args {
    /// Profile document describing services hosted by this process.
    #[arg(long, env = "SERVICEHUB_PROFILE")]
    profile: Option<std::path::PathBuf>,

    /// Override the IPC listen address.
    #[arg(long, env = "SERVICEHUB_LISTEN")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = Config::default();

    servicehub_core::observability::init_tracing();

    // Path validation happens before the registry is even constructed.
    let profile_path = match &args.profile {
        Some(path) => Some(validate_profile_path(
            path,
            &config.host.profile_dirs,
            &config.host.profile_extension,
        )?),
        None => None,
    };

    let registry = ServiceRegistry::new(config.registry.clone());
    tracing::info!("service registry up (device {})", registry.device_id());

    let host = match profile_path {
        Some(path) => {
            let connector = Arc::new(LocalRegistryConnector::new(CallerIdentity::system(
                std::process::id(),
            )));
            connector.set_registry(registry.clone());

            // Factories for hosted services are registered by the embedding
            // build; an empty loader leaves every profile on-demand-only.
            let loader = Arc::new(FactoryLoader::new());
            let host = ServiceHost::new(
                config.host.clone(),
                std::process::id(),
                loader,
                connector,
            );
            host.bootstrap(&path).await?;
            Some(host)
        }
        None => None,
    };

    let addr = args
        .listen
        .unwrap_or_else(|| config.server.listen_addr.clone())
        .parse()?;
    let server = Arc::new(IpcServer::new(
        IpcContext {
            registry: registry.clone(),
            host: host.clone(),
            ipc: config.ipc.clone(),
        },
        addr,
    ));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
            shutdown_server.shutdown();
        }
    });

    server.serve().await?;

    if let Some(host) = host {
        host.shutdown();
    }
    registry.shutdown();
    Ok(())
}
