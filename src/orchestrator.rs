//! Component H - backup orchestrator.
//!
//! `RunState` is `RunStatus` itself (catalog/models.rs): an explicit tagged
//! union matched on at each step, replacing exceptions-as-control-flow with
//! a per-step rollback table. Each step here
//! is a plain function returning `Result`; [`Orchestrator::execute`] is the
//! `match` over them.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::alert::{AlertEvent, AlertSink};
use crate::archive;
use crate::catalog::models::{BackupConfig, BackupRun, ChunkStatus, RunStatus};
use crate::catalog::Catalog;
use crate::checksum;
use crate::probe::{self, ConnectionSpec};
use crate::service::ServiceController;
use crate::tools::backoff::BackoffPolicy;
use crate::tools::naming::{sanitize, LayoutStrategy, LayoutTokens};
use crate::transfer::sender::{self, TlsClientConfig, UploadRequest};

/// Conventional local MySQL/MariaDB port probed after restart. BackupConfig
/// carries network coordinates for the *transfer target*, not
/// the local database, so there is no per-config override of this; it
/// matches the service being a local MySQL/MariaDB instance.
const DB_PROBE_PORT: u16 = 3306;

#[derive(Debug, Clone)]
pub struct ProgressSample {
    pub operation_id: Uuid,
    pub status: RunStatus,
    pub overall_progress: f64,
    pub current_operation: String,
}

/// Shared cooperative-cancellation flag. Plain `Arc<AtomicBool>`
/// rather than a channel: both the async orchestrator and the archive
/// writer's blocking thread need to poll it, and a flag is the simplest
/// thing both sides can read without synchronization machinery.
pub type CancelSignal = Arc<AtomicBool>;

pub fn new_cancel_signal() -> CancelSignal {
    Arc::new(AtomicBool::new(false))
}

fn is_cancelled(cancel: &CancelSignal) -> bool {
    cancel.load(Ordering::Relaxed)
}

pub struct Orchestrator {
    service: Arc<dyn ServiceController>,
    catalog: Arc<Catalog>,
    alert_sink: Arc<dyn AlertSink>,
    tls: TlsClientConfig,
    backoff: BackoffPolicy,
    scratch_dir: PathBuf,
    layout: LayoutStrategy,
}

impl Orchestrator {
    pub fn new(
        service: Arc<dyn ServiceController>,
        catalog: Arc<Catalog>,
        alert_sink: Arc<dyn AlertSink>,
        tls: TlsClientConfig,
        backoff: BackoffPolicy,
        scratch_dir: PathBuf,
        layout: LayoutStrategy,
    ) -> Self {
        Self {
            service,
            catalog,
            alert_sink,
            tls,
            backoff,
            scratch_dir,
            layout,
        }
    }

    pub async fn execute(
        &self,
        config: &BackupConfig,
        progress: Option<mpsc::Sender<ProgressSample>>,
        cancel: CancelSignal,
    ) -> BackupRun {
        let mut run = BackupRun::new(config.id);
        if let Err(err) = self.catalog.create_run(&run) {
            log::error!("unable to persist new run: {err}");
            run.status = RunStatus::Failed;
            run.error_message = Some(err.to_string());
            return run;
        }

        if let Err(message) = self.validate(config).await {
            self.fail(&mut run, config, message).await;
            return run;
        }

        let description = match self.service.describe(&config.service_id).await {
            Ok(description) => description,
            Err(err) => {
                self.fail(&mut run, config, err.to_string()).await;
                return run;
            }
        };
        if !description.can_stop {
            self.fail(&mut run, config, description.advisory(&config.service_id)).await;
            return run;
        }

        self.transition(&mut run, RunStatus::StoppingDb, 0.1, "stopping database service", &progress)
            .await;
        if let Err(err) = self.service.stop(&config.service_id).await {
            self.fail(&mut run, config, err.to_string()).await;
            return run;
        }

        self.transition(&mut run, RunStatus::Compressing, 0.2, "compressing data directory", &progress)
            .await;
        let scratch_path = self.scratch_dir.join(format!("{}.zip.part", run.id));
        let compress_result = self.compress(config, run.id, &scratch_path, &cancel, &progress).await;

        if is_cancelled(&cancel) {
            let _ = self.service.start(&config.service_id).await;
            let _ = tokio::fs::remove_file(&scratch_path).await;
            self.cancel(&mut run).await;
            return run;
        }
        if let Err(err) = compress_result {
            // Compression failure always attempts a restart before surfacing.
            let _ = self.service.start(&config.service_id).await;
            self.fail(&mut run, config, err.to_string()).await;
            return run;
        }

        self.transition(&mut run, RunStatus::StartingDb, 0.55, "restarting database service", &progress)
            .await;
        if let Err(err) = self.service.start(&config.service_id).await {
            let _ = tokio::fs::remove_file(&scratch_path).await;
            self.fail(&mut run, config, err.to_string()).await;
            return run;
        }

        if is_cancelled(&cancel) {
            let _ = tokio::fs::remove_file(&scratch_path).await;
            self.cancel(&mut run).await;
            return run;
        }

        self.transition(&mut run, RunStatus::Verifying, 0.6, "verifying database connectivity", &progress)
            .await;
        let reachable = probe::verify(ConnectionSpec {
            host: "127.0.0.1",
            port: DB_PROBE_PORT,
        })
        .await;
        if !reachable {
            let _ = tokio::fs::remove_file(&scratch_path).await;
            self.fail(&mut run, config, "database did not accept a connection after restart".into())
                .await;
            return run;
        }

        if is_cancelled(&cancel) {
            let _ = tokio::fs::remove_file(&scratch_path).await;
            self.cancel(&mut run).await;
            return run;
        }

        self.transition(&mut run, RunStatus::Transferring, 0.7, "transferring archive", &progress)
            .await;
        match self.transfer(config, &run, &scratch_path).await {
            Ok((filename, file_size, md5, sha256)) => {
                let _ = tokio::fs::remove_file(&scratch_path).await;
                self.transition(&mut run, RunStatus::Completed, 1.0, "completed", &progress).await;
                run.status = RunStatus::Completed;
                run.ended_at = Some(Utc::now());
                run.file_path = Some(filename);
                run.file_size = Some(file_size);
                run.checksum_md5 = Some(md5.clone());
                run.checksum_sha256 = Some(sha256.clone());
                if let Err(err) = self.catalog.finish_run(
                    run.id,
                    RunStatus::Completed,
                    run.file_path.as_deref(),
                    Some(file_size),
                    Some(&md5),
                    Some(&sha256),
                    None,
                ) {
                    log::error!("failed to persist completed run {}: {err}", run.id);
                }
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&scratch_path).await;
                self.fail(&mut run, config, err.to_string()).await;
            }
        }

        run
    }

    async fn validate(&self, config: &BackupConfig) -> Result<(), String> {
        if config.name.trim().is_empty() {
            return Err("backup config has an empty name".into());
        }
        if !tokio::fs::try_exists(&config.data_dir).await.unwrap_or(false) {
            return Err(format!("data directory '{}' does not exist", config.data_dir.display()));
        }
        let reachable = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            tokio::net::TcpStream::connect((config.target_host.as_str(), config.target_port)),
        )
        .await;
        if !matches!(reachable, Ok(Ok(_))) {
            return Err(format!("target '{}:{}' is not reachable", config.target_host, config.target_port));
        }
        // Disk space is a warning-only check; without a
        // filesystem-stat crate in the dependency tree, an out-of-space
        // condition surfaces as `StorageError::OutOfSpace` from the archive
        // writer or receiver instead of being pre-flighted here.
        Ok(())
    }

    async fn compress(
        &self,
        config: &BackupConfig,
        run_id: Uuid,
        scratch_path: &std::path::Path,
        cancel: &CancelSignal,
        progress: &Option<mpsc::Sender<ProgressSample>>,
    ) -> Result<(), anyhow::Error> {
        let (tx, mut rx) = mpsc::channel(16);
        let forward = progress.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Some(tx) = &forward {
                    let fraction = if event.total_bytes == 0 {
                        0.2
                    } else {
                        0.2 + 0.3 * (event.processed_bytes as f64 / event.total_bytes as f64)
                    };
                    let _ = tx
                        .send(ProgressSample {
                            operation_id: run_id,
                            status: RunStatus::Compressing,
                            overall_progress: fraction,
                            current_operation: event.current_entry,
                        })
                        .await;
                }
            }
        });

        let result = archive::write_archive_cancellable(
            config.data_dir.clone(),
            scratch_path.to_path_buf(),
            Some(tx),
            Some(cancel.clone()),
        )
        .await;
        let _ = forwarder.await;
        result
    }

    async fn transfer(
        &self,
        config: &BackupConfig,
        run: &BackupRun,
        scratch_path: &std::path::Path,
    ) -> Result<(String, u64, String, String), anyhow::Error> {
        let filename_tokens = LayoutTokens {
            server: &config.target_host,
            database: &config.name,
            when: run.started_at,
            kind: "full",
        };
        let filename = crate::tools::naming::render_template(&config.naming_template, &filename_tokens);
        let filename = sanitize(&filename);

        let upload = UploadRequest {
            host: config.target_host.clone(),
            port: config.target_port,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            file_path: scratch_path.to_path_buf(),
            filename: filename.clone(),
            source_name: Some(config.name.clone()),
        };

        let (md5, sha256) = checksum::checksum_file(scratch_path)?;
        let file_size = tokio::fs::metadata(scratch_path).await?.len();
        let expected_chunks = crate::transfer::chunk_manager::expected_chunk_count(
            file_size,
            sender::select_chunking(file_size).chunk_size,
        );
        self.catalog
            .create_chunk_rows(run.id, expected_chunks, sender::select_chunking(file_size).chunk_size)?;

        let response = sender::send_with_retries(&upload, &self.tls, self.backoff).await?;
        if !response.success {
            anyhow::bail!(response.error.unwrap_or_else(|| "transfer failed".into()));
        }

        // Records only a terminal chunk status rather than one catalog
        // write per ack.
        for index in 0..expected_chunks {
            let _ = self.catalog.update_chunk_status(run.id, index, ChunkStatus::Acked, None);
        }

        Ok((filename, file_size, md5, sha256))
    }

    async fn transition(
        &self,
        run: &mut BackupRun,
        status: RunStatus,
        overall_progress: f64,
        current_operation: &str,
        progress: &Option<mpsc::Sender<ProgressSample>>,
    ) {
        run.status = status;
        if let Err(err) = self.catalog.update_run_status(run.id, status) {
            log::warn!("failed to persist status transition for run {}: {err}", run.id);
        }
        if let Some(tx) = progress {
            let _ = tx
                .send(ProgressSample {
                    operation_id: run.id,
                    status,
                    overall_progress,
                    current_operation: current_operation.to_owned(),
                })
                .await;
        }
    }

    async fn fail(&self, run: &mut BackupRun, config: &BackupConfig, message: String) {
        run.status = RunStatus::Failed;
        run.ended_at = Some(Utc::now());
        run.error_message = Some(message.clone());
        if let Err(err) = self
            .catalog
            .finish_run(run.id, RunStatus::Failed, None, None, None, None, Some(&message))
        {
            log::error!("failed to persist failed run {}: {err}", run.id);
        }
        self.alert_sink
            .notify(AlertEvent {
                config_name: config.name.clone(),
                run_id: run.id,
                status: RunStatus::Failed,
                message,
            })
            .await;
    }

    async fn cancel(&self, run: &mut BackupRun) {
        run.status = RunStatus::Cancelled;
        run.ended_at = Some(Utc::now());
        run.error_message = Some("cancelled".into());
        if let Err(err) = self.catalog.finish_run(
            run.id,
            RunStatus::Cancelled,
            None,
            None,
            None,
            None,
            Some("operation cancelled"),
        ) {
            log::error!("failed to persist cancelled run {}: {err}", run.id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alert::LogAlertSink;
    use crate::service::fakes::FakeServiceController;

    fn config() -> BackupConfig {
        BackupConfig {
            id: 1,
            name: "test-db".into(),
            service_id: "mysqld".into(),
            data_dir: PathBuf::from("/nonexistent/data/dir"),
            target_host: "127.0.0.1".into(),
            target_port: 1,
            client_id: "client-a".into(),
            client_secret: "secret".into(),
            target_subdir: "".into(),
            naming_template: "{database}-{year}{month}{day}.zip".into(),
            is_active: true,
        }
    }

    fn orchestrator(service: Arc<dyn ServiceController>) -> Orchestrator {
        Orchestrator::new(
            service,
            Arc::new(Catalog::open_in_memory().unwrap()),
            Arc::new(LogAlertSink),
            TlsClientConfig {
                ca_cert: None,
                client_cert: None,
                client_key: None,
                verify_peer: false,
            },
            BackoffPolicy::default(),
            std::env::temp_dir(),
            LayoutStrategy::FlatServer,
        )
    }

    #[tokio::test]
    async fn validate_rejects_a_missing_data_directory() {
        let orch = orchestrator(Arc::new(FakeServiceController::new(true)));
        let run = orch.execute(&config(), None, new_cancel_signal()).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.unwrap().contains("data directory"));
    }

    #[tokio::test]
    async fn unstoppable_service_fails_without_creating_scratch_state() {
        let orch = orchestrator(Arc::new(FakeServiceController::new(false)));
        let mut cfg = config();
        let dir = tempfile::tempdir().unwrap();
        cfg.data_dir = dir.path().to_path_buf();

        let run = orch.execute(&cfg, None, new_cancel_signal()).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.unwrap().contains("not in a stoppable state"));
    }

    #[tokio::test]
    async fn cancellation_during_compression_restarts_the_database() {
        let service = Arc::new(FakeServiceController::new(true));
        let orch = orchestrator(service.clone());
        let mut cfg = config();
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("{i}.bin")), vec![0u8; 4096]).unwrap();
        }
        cfg.data_dir = dir.path().to_path_buf();
        cfg.target_port = 0; // validate() only needs *some* listener; see below

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        cfg.target_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let cancel = new_cancel_signal();
        cancel.store(true, Ordering::Relaxed);
        let run = orch.execute(&cfg, None, cancel).await;

        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(
            service.states.lock().unwrap().get("mysqld").copied(),
            Some(crate::service::ServiceState::Running)
        );
    }
}
