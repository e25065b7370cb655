//! Operator CLI for client credentials, schedules, and retention policies.
//! Every subcommand exits non-zero and logs to stderr on failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dbvault::alert::LogAlertSink;
use dbvault::auth::hash_secret;
use dbvault::catalog::models::{AnchorTime, ClientCredential, IntervalKind, Permission, Recurrence, Schedule};
use dbvault::catalog::Catalog;
use dbvault::config::Config;
use dbvault::orchestrator::Orchestrator;
use dbvault::retention::RetentionEngine;
use dbvault::scheduler::Scheduler;
use dbvault::service::SystemdServiceController;
use dbvault::tools::backoff::BackoffPolicy;
use dbvault::tools::naming::LayoutStrategy;
use dbvault::transfer::sender::TlsClientConfig;
use rand::RngCore;

#[derive(Parser, Debug)]
#[command(name = "dbvault-admin", about = "Administer the backup orchestrator's catalog")]
struct Args {
    #[arg(long, default_value = "/etc/dbvault/dbvaultd.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Registers a new client and prints its freshly generated secret.
    AddClient {
        client_id: String,
        #[arg(long)]
        admin: bool,
        #[arg(long)]
        resume_only: bool,
    },
    ListClients,
    ResetSecret {
        client_id: String,
    },
    DisableClient {
        client_id: String,
    },
    AddSchedule {
        config_id: i64,
        /// One of hourly, daily, weekly, monthly.
        #[arg(long)]
        interval: String,
        #[arg(long, default_value_t = 1)]
        value: u32,
        #[arg(long, default_value_t = 0)]
        hour: u32,
        #[arg(long, default_value_t = 0)]
        minute: u32,
        /// Update an existing schedule instead of creating one.
        #[arg(long)]
        schedule_id: Option<i64>,
    },
    TriggerNow {
        schedule_id: i64,
    },
    ApplyRetention {
        #[arg(long)]
        dry_run: bool,
    },
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::encode(bytes)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load(&args.config).with_context(|| format!("loading {}", args.config.display()))?;
    let catalog = Arc::new(Catalog::open(&config.catalog_path)?);

    let result = match args.command {
        Command::AddClient { client_id, admin, resume_only } => add_client(&catalog, client_id, admin, resume_only),
        Command::ListClients => list_clients(&catalog),
        Command::ResetSecret { client_id } => reset_secret(&catalog, client_id),
        Command::DisableClient { client_id } => disable_client(&catalog, client_id),
        Command::AddSchedule { config_id, interval, value, hour, minute, schedule_id } => {
            add_schedule(catalog, &config, config_id, interval, value, hour, minute, schedule_id)
        }
        Command::TriggerNow { schedule_id } => trigger_now(catalog, &config, schedule_id),
        Command::ApplyRetention { dry_run } => apply_retention(catalog, &config.storage_root, dry_run),
    };

    if let Err(err) = result {
        log::error!("{err:?}");
        std::process::exit(1);
    }
    Ok(())
}

fn add_client(catalog: &Catalog, client_id: String, admin: bool, resume_only: bool) -> Result<()> {
    if catalog.get_credential(&client_id)?.is_some() {
        bail!("client '{client_id}' already exists");
    }
    let secret = generate_secret();
    let permissions = if admin {
        Permission::SYSTEM_ADMIN
    } else if resume_only {
        Permission::TRANSFER_RESUME
    } else {
        Permission::TRANSFER_UPLOAD | Permission::TRANSFER_RESUME
    };

    catalog.upsert_credential(&ClientCredential {
        client_id: client_id.clone(),
        secret_hash: hash_secret(&secret)?,
        permissions,
        is_active: true,
        expires_at: None,
    })?;

    println!("client_id: {client_id}");
    println!("client_secret: {secret}");
    println!("(the secret above is shown once; it is not recoverable from the catalog)");
    Ok(())
}

fn list_clients(catalog: &Catalog) -> Result<()> {
    let credentials = catalog.list_credentials()?;
    for credential in credentials {
        println!(
            "{:<24} active={:<5} permissions={:?} expires_at={}",
            credential.client_id,
            credential.is_active,
            credential.permissions,
            credential.expires_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".into()),
        );
    }
    Ok(())
}

fn reset_secret(catalog: &Catalog, client_id: String) -> Result<()> {
    let mut credential = catalog
        .get_credential(&client_id)?
        .ok_or_else(|| anyhow::anyhow!("no such client '{client_id}'"))?;
    let secret = generate_secret();
    credential.secret_hash = hash_secret(&secret)?;
    catalog.upsert_credential(&credential)?;
    println!("client_secret: {secret}");
    Ok(())
}

fn disable_client(catalog: &Catalog, client_id: String) -> Result<()> {
    catalog.set_credential_active(&client_id, false)?;
    println!("disabled '{client_id}'");
    Ok(())
}

/// `add_or_update_schedule` only touches the catalog, but `Scheduler::new`
/// still wants an `Orchestrator` handle - built here from the daemon's own
/// config so the CLI never has to duplicate its construction rules.
fn build_scheduler(catalog: Arc<Catalog>, config: &Config) -> Scheduler {
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
        LayoutStrategy::parse(&config.layout),
    ));
    Scheduler::new(catalog, orchestrator)
}

#[allow(clippy::too_many_arguments)]
fn add_schedule(
    catalog: Arc<Catalog>,
    config: &Config,
    config_id: i64,
    interval: String,
    value: u32,
    hour: u32,
    minute: u32,
    schedule_id: Option<i64>,
) -> Result<()> {
    if catalog.get_config(config_id)?.is_none() {
        bail!("no such backup config {config_id}");
    }
    let kind = IntervalKind::parse(&interval).ok_or_else(|| anyhow::anyhow!("unknown interval '{interval}'"))?;

    let scheduler = build_scheduler(catalog, config);
    let id = scheduler.add_or_update_schedule(Schedule {
        id: schedule_id.unwrap_or(0),
        config_id,
        recurrence: Recurrence { kind, value, anchor: AnchorTime { hour, minute } },
        enabled: true,
        last_fire_at: None,
        next_fire_at: None,
    })?;
    println!("schedule id: {id}");
    Ok(())
}

fn trigger_now(catalog: Arc<Catalog>, config: &Config, schedule_id: i64) -> Result<()> {
    let scheduler = Arc::new(build_scheduler(catalog, config));
    let runtime = tokio::runtime::Runtime::new().context("unable to start runtime")?;
    runtime.block_on(scheduler.trigger_now(schedule_id))
}

fn apply_retention(catalog: Arc<Catalog>, storage_root: &Path, dry_run: bool) -> Result<()> {
    let policies = catalog.enabled_policies()?;
    let engine = RetentionEngine::new(catalog, storage_root.to_path_buf());
    for policy in policies {
        let impact = if dry_run { engine.estimate_impact(&policy)? } else { engine.execute(&policy)? };
        println!(
            "{}'{}' {} {} file(s) ({} bytes){}",
            if dry_run { "[dry-run] " } else { "" },
            policy.name,
            if dry_run { "would remove" } else { "removed" },
            impact.files,
            impact.bytes,
            if impact.warnings.is_empty() { String::new() } else { format!(" warnings: {}", impact.warnings.join("; ")) }
        );
    }
    Ok(())
}
