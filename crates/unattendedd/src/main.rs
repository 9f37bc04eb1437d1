//! Unattended Daemon - keeps a managed application running and up to date
//!
//! Launches the active version, checks the update server on a schedule,
//! stages new versions side by side and restarts into them per the
//! configured strategy.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use unattended_common::load_manifests;
use unattendedd::config::{Config, UpdateStrategy, CONFIG_PATH};
use unattendedd::coordinator::{ChildProcess, ProcessCoordinator};
use unattendedd::orchestrator::Orchestrator;
use unattendedd::scheduler::{run_periodic, Schedule};
use unattendedd::stager::Stager;
use unattendedd::target::Target;
use unattendedd::update_client::{SidecarVersionProbe, UpdateClient};

#[derive(Parser)]
#[command(name = "unattendedd")]
#[command(about = "Unattended - update supervisor for a managed application", long_about = None)]
#[command(version = unattended_common::VERSION)]
struct Args {
    /// Config file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Run a single update cycle without launching the application, then exit
    #[arg(long)]
    once: bool,

    /// Print the default configuration and exit
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_default_config {
        print!("{}", Config::default_toml()?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Unattended v{} starting", unattended_common::VERSION);

    // Anything that fails before the loops start is fatal
    let config = Config::load_from_path(&args.config)?;
    let strategy = config.updates.strategy();
    let interval = config.updates.interval();

    let target = Arc::new(Target::new(&config.target).context("Failed to resolve the target application")?);
    let manifests = load_manifests(&config.configuration_directory)?;
    info!(
        "Tracking {} application(s), strategy {}, interval {}",
        manifests.len(),
        strategy,
        interval
    );
    if manifests.is_empty() {
        warn!(
            "No update manifests in {}, update checks will find nothing",
            config.configuration_directory.display()
        );
    }

    let client = UpdateClient::new(
        &config.client_id,
        &config.updates.channel,
        config.updates.check_timeout(),
        Arc::new(SidecarVersionProbe),
    )?;
    let stager = Stager::new(target.clone(), config.updates.download_timeout())?;
    let (process, events) = ChildProcess::new(config.supervisor.stop_timeout());
    let coordinator: Arc<dyn ProcessCoordinator> = Arc::new(process);

    let orchestrator = Arc::new(Orchestrator::new(
        target,
        manifests,
        client,
        stager,
        coordinator,
        strategy,
    ));

    if args.once {
        // Nothing is running, so stage and switch only
        let outcome = orchestrator.run_cycle_with(UpdateStrategy::Off).await;
        info!("Update cycle finished: {:?}", outcome);
        return Ok(());
    }

    orchestrator.launch().await?;

    let cancel = CancellationToken::new();
    let event_loop = tokio::spawn(orchestrator.clone().run_events(events, cancel.clone()));
    let liveness = tokio::spawn(
        orchestrator
            .clone()
            .run_liveness(config.supervisor.liveness_interval(), cancel.clone()),
    );
    let timer = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(run_periodic(Schedule::from(interval), cancel.clone(), move || {
            let orchestrator = orchestrator.clone();
            async move {
                orchestrator.run_cycle().await;
            }
        }))
    };

    info!("Unattended ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down gracefully");

    cancel.cancel();
    for (name, handle) in [("event loop", event_loop), ("liveness loop", liveness)] {
        if let Err(e) = handle.await {
            warn!("{} ended abnormally: {}", name, e);
        }
    }
    if let Err(e) = timer.await {
        warn!("Update timer ended abnormally: {}", e);
    }

    orchestrator.shutdown().await?;
    info!("Managed application stopped");

    Ok(())
}
