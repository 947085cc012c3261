use color_eyre::eyre::{self, eyre, WrapErr};
use seatvm_executor::{
    ContainerProvider, HostConfig, ImageBuilder, IpCommand, MicroVmManager, NetworkFabric,
    NetworkOps, ProviderSet,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const USAGE: &str = "usage: seatvm [serve|build-image]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Serve,
    BuildImage,
}

fn parse_mode(arg: Option<&str>) -> eyre::Result<Mode> {
    match arg {
        None | Some("serve") => Ok(Mode::Serve),
        Some("build-image") => Ok(Mode::BuildImage),
        Some(other) => Err(eyre!("unknown command '{other}'\n{USAGE}")),
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let arg = std::env::args().nth(1);
    let mode = parse_mode(arg.as_deref())?;
    let config = HostConfig::from_env().wrap_err("Failed to load host configuration")?;

    match mode {
        Mode::BuildImage => build_image(&config).await,
        Mode::Serve => serve(config).await,
    }
}

async fn build_image(config: &HostConfig) -> eyre::Result<()> {
    let build = config.image_build_from_env()?;
    info!(image = %build.image, output = %build.output.display(), "Building template image");

    let builder = ImageBuilder::connect()?;
    let output = builder.build(&build).await?;
    info!(output = %output.display(), "Template image built");
    Ok(())
}

async fn serve(config: HostConfig) -> eyre::Result<()> {
    info!("Starting seatvm host service...");

    // Bring the fabric up front so a broken host fails at startup, not on the first seat.
    bring_up_fabric(Arc::new(IpCommand::new()), &config).await?;

    let manager = MicroVmManager::from_config(&config);
    let mut providers = ProviderSet::new().with(Arc::new(manager.clone()));
    match ContainerProvider::connect(config.container.clone()) {
        Ok(containers) => providers = providers.with(Arc::new(containers)),
        Err(e) => warn!(error = %e, "Container runtime unavailable, serving microVM seats only"),
    }
    info!(runtimes = ?providers.runtimes(), "Seat providers ready");

    let reconciler =
        manager.spawn_reconciler(Duration::from_secs(config.vm.reconcile_interval_secs.max(1)));

    wait_for_shutdown_signal().await?;
    info!("Shutdown signal received, tearing down seats");

    reconciler.stop().await;
    let destroyed = manager.shutdown().await;
    info!(destroyed, "seatvm host service stopped");
    Ok(())
}

async fn bring_up_fabric(ops: Arc<dyn NetworkOps>, config: &HostConfig) -> eyre::Result<()> {
    NetworkFabric::new(ops, config.fabric.clone())
        .ensure_bridge()
        .await
        .map_err(|e| eyre!("Failed to set up the network fabric: {e:#}"))
}

async fn wait_for_shutdown_signal() -> eyre::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for ctrl-c");
            }
        }
        _ = terminate.recv() => {}
    }
    Ok(())
}
