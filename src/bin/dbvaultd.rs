//! Daemon entry point: runs the transfer receiver, the scheduler tick loop,
//! and the retention sweep side by side, stopping all three on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dbvault::alert::LogAlertSink;
use dbvault::auth::AuthService;
use dbvault::catalog::Catalog;
use dbvault::config::Config;
use dbvault::orchestrator::Orchestrator;
use dbvault::retention::RetentionEngine;
use dbvault::scheduler::Scheduler;
use dbvault::service::SystemdServiceController;
use dbvault::tools::backoff::BackoffPolicy;
use dbvault::tools::naming::LayoutStrategy;
use dbvault::transfer::chunk_manager::ChunkManager;
use dbvault::transfer::receiver::Receiver;
use dbvault::transfer::sender::TlsClientConfig;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;

#[derive(Parser, Debug)]
#[command(name = "dbvaultd", about = "Cold backup orchestrator daemon")]
struct Args {
    /// Path to the daemon's TOML configuration file.
    #[arg(long, default_value = "/etc/dbvault/dbvaultd.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load(&args.config).with_context(|| format!("loading {}", args.config.display()))?;

    std::fs::create_dir_all(&config.scratch_dir)
        .with_context(|| format!("creating scratch directory '{}'", config.scratch_dir.display()))?;
    std::fs::create_dir_all(&config.storage_root)
        .with_context(|| format!("creating storage root '{}'", config.storage_root.display()))?;

    let catalog = Arc::new(Catalog::open(&config.catalog_path)?);
    let layout = LayoutStrategy::parse(&config.layout);

    let tls = TlsClientConfig {
        ca_cert: config.outbound_tls.ca_cert.clone(),
        client_cert: config.outbound_tls.client_cert.clone(),
        client_key: config.outbound_tls.client_key.clone(),
        verify_peer: config.outbound_tls.verify_peer,
    };

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(SystemdServiceController),
        catalog.clone(),
        Arc::new(LogAlertSink),
        tls,
        BackoffPolicy::default(),
        config.scratch_dir.clone(),
        layout.clone(),
    ));

    let chunk_manager = Arc::new(ChunkManager::new(config.scratch_dir.clone()));
    let auth = Arc::new(AuthService::new());
    let receiver = Arc::new(Receiver::new(
        chunk_manager,
        auth,
        catalog.clone(),
        layout,
        config.storage_root.clone(),
        config.listener.max_connections,
    ));

    let scheduler = Arc::new(Scheduler::new(catalog.clone(), orchestrator));
    let retention = RetentionEngine::new(catalog.clone(), config.storage_root.clone());

    let (receiver_shutdown_tx, receiver_shutdown_rx) = oneshot::channel();
    let (scheduler_shutdown_tx, scheduler_shutdown_rx) = oneshot::channel();
    let (retention_shutdown_tx, mut retention_shutdown_rx) = oneshot::channel();

    let listener_config = config.listener.clone();
    let receiver_task = tokio::spawn(async move { receiver.run(&listener_config, receiver_shutdown_rx).await });
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_shutdown_rx).await });

    let sweep_interval = std::time::Duration::from_secs(config.retention_sweep_interval_secs);
    let retention_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            tokio::select! {
                _ = &mut retention_shutdown_rx => return,
                _ = ticker.tick() => {
                    match retention.execute_all() {
                        Ok(result) => {
                            for (name, outcome) in result.policy_results {
                                match outcome {
                                    Ok(impact) => log::info!(
                                        "retention policy '{name}' removed {} file(s) ({} bytes){}",
                                        impact.files,
                                        impact.bytes,
                                        if impact.warnings.is_empty() {
                                            String::new()
                                        } else {
                                            format!(" with warnings: {}", impact.warnings.join("; "))
                                        }
                                    ),
                                    Err(err) => log::error!("retention policy '{name}' failed: {err}"),
                                }
                            }
                        }
                        Err(err) => log::error!("retention sweep failed to load policies: {err}"),
                    }
                }
            }
        }
    });

    let mut sigint = signal(SignalKind::interrupt()).context("unable to install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("unable to install SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => log::info!("received SIGINT"),
        _ = sigterm.recv() => log::info!("received SIGTERM"),
    }

    let _ = receiver_shutdown_tx.send(());
    let _ = scheduler_shutdown_tx.send(());
    let _ = retention_shutdown_tx.send(());

    let (receiver_result, scheduler_result, retention_result) =
        tokio::join!(receiver_task, scheduler_task, retention_task);
    receiver_result.context("receiver task panicked")?.context("receiver task failed")?;
    scheduler_result.context("scheduler task panicked")?;
    retention_result.context("retention task panicked")?;

    Ok(())
}
