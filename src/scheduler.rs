//! Component I - scheduler.
//!
//! A 60 s tick loop that dispatches due schedules to the
//! orchestrator under a per-config guard, so no two runs for the same
//! `BackupConfig` are ever in flight together.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Error};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::catalog::models::{RunStatus, Schedule};
use crate::catalog::Catalog;
use crate::orchestrator::{new_cancel_signal, Orchestrator};
use crate::tools::recurrence::compute_next_fire_at;

const TICK_INTERVAL: Duration = Duration::from_secs(60);

pub struct Scheduler {
    catalog: Arc<Catalog>,
    orchestrator: Arc<Orchestrator>,
    in_flight: Mutex<HashSet<i64>>,
}

impl Scheduler {
    pub fn new(catalog: Arc<Catalog>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            catalog,
            orchestrator,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Runs the tick loop until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("scheduler stopping");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        log::error!("scheduler tick failed: {err}");
                    }
                }
            }
        }
    }

    async fn tick(&self) -> Result<(), Error> {
        let now = Utc::now();
        let due = self.catalog.due_schedules(now).context("unable to load due schedules")?;
        for schedule in due {
            self.dispatch(schedule, now).await;
        }
        Ok(())
    }

    async fn dispatch(&self, schedule: Schedule, now: DateTime<Utc>) {
        {
            let mut guard = self.in_flight.lock().await;
            if guard.contains(&schedule.config_id) || self.catalog.has_in_flight_run(schedule.config_id).unwrap_or(false) {
                log::debug!("skipping schedule {}: a run is already in flight for config {}", schedule.id, schedule.config_id);
                return;
            }
            guard.insert(schedule.config_id);
        }

        self.run_once(schedule, now).await;
    }

    async fn run_once(&self, schedule: Schedule, now: DateTime<Utc>) {
        let config = match self.catalog.get_config(schedule.config_id) {
            Ok(Some(config)) if config.is_active => config,
            Ok(Some(_)) => {
                log::warn!("schedule {} points at an inactive config; skipping", schedule.id);
                self.in_flight.lock().await.remove(&schedule.config_id);
                return;
            }
            Ok(None) => {
                log::warn!("schedule {} points at a missing config; skipping", schedule.id);
                self.in_flight.lock().await.remove(&schedule.config_id);
                return;
            }
            Err(err) => {
                log::error!("unable to load config for schedule {}: {err}", schedule.id);
                self.in_flight.lock().await.remove(&schedule.config_id);
                return;
            }
        };

        let run = self.orchestrator.execute(&config, None, new_cancel_signal()).await;
        if run.status == RunStatus::Failed {
            log::warn!("scheduled run {} for config {} failed", run.id, config.id);
        }

        let fired_at = Utc::now();
        let mut updated = schedule.clone();
        updated.last_fire_at = Some(fired_at);
        updated.next_fire_at = if updated.enabled {
            Some(compute_next_fire_at(&updated.recurrence, fired_at))
        } else {
            None
        };
        if let Err(err) = self.catalog.update_schedule_fire_times(schedule.id, fired_at, updated.next_fire_at) {
            log::error!("failed to advance schedule {} past {now}: {err}", schedule.id);
        }

        self.in_flight.lock().await.remove(&schedule.config_id);
    }

    /// Validates and persists a schedule, computing its initial
    /// `next_fire_at`.
    pub fn add_or_update_schedule(&self, mut schedule: Schedule) -> Result<i64, Error> {
        if schedule.recurrence.value == 0 {
            schedule.recurrence.value = 1;
        }
        let base = schedule.last_fire_at.unwrap_or_else(Utc::now);
        schedule.next_fire_at = if schedule.enabled {
            Some(compute_next_fire_at(&schedule.recurrence, base))
        } else {
            None
        };

        if schedule.id == 0 {
            self.catalog.create_schedule(&schedule)
        } else {
            self.catalog.update_schedule(&schedule)?;
            Ok(schedule.id)
        }
    }

    /// Bypasses the tick and dispatches immediately, under the same
    /// per-config guard.
    pub async fn trigger_now(self: &Arc<Self>, schedule_id: i64) -> Result<(), Error> {
        let schedule = self
            .catalog
            .get_schedule(schedule_id)
            .context("unable to load schedule")?
            .ok_or_else(|| anyhow::anyhow!("no such schedule"))?;

        {
            let mut guard = self.in_flight.lock().await;
            if guard.contains(&schedule.config_id) || self.catalog.has_in_flight_run(schedule.config_id).unwrap_or(false) {
                bail!("a run is already in flight for config {}", schedule.config_id);
            }
            guard.insert(schedule.config_id);
        }

        self.run_once(schedule, Utc::now()).await;
        Ok(())
    }

    /// `min(next_fire_at)` over enabled schedules.
    pub fn next_across_all(&self) -> Result<Option<DateTime<Utc>>, Error> {
        self.catalog.min_next_fire_at()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::alert::LogAlertSink;
    use crate::catalog::models::{AnchorTime, BackupConfig, IntervalKind, Recurrence};
    use crate::service::fakes::FakeServiceController;
    use crate::tools::backoff::BackoffPolicy;
    use crate::transfer::sender::TlsClientConfig;

    fn orchestrator(catalog: Arc<Catalog>) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            Arc::new(FakeServiceController::new(false)),
            catalog,
            Arc::new(LogAlertSink),
            TlsClientConfig {
                ca_cert: None,
                client_cert: None,
                client_key: None,
                verify_peer: false,
            },
            BackoffPolicy::default(),
            std::env::temp_dir(),
            crate::tools::naming::LayoutStrategy::FlatServer,
        ))
    }

    fn daily_recurrence() -> Recurrence {
        Recurrence {
            kind: IntervalKind::Daily,
            value: 1,
            anchor: AnchorTime { hour: 2, minute: 0 },
        }
    }

    #[tokio::test]
    async fn add_or_update_schedule_computes_a_future_next_fire_at() {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let scheduler = Scheduler::new(catalog.clone(), orchestrator(catalog.clone()));

        let id = scheduler
            .add_or_update_schedule(Schedule {
                id: 0,
                config_id: 1,
                recurrence: daily_recurrence(),
                enabled: true,
                last_fire_at: None,
                next_fire_at: None,
            })
            .unwrap();

        let persisted = catalog.get_schedule(id).unwrap().unwrap();
        assert!(persisted.next_fire_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn a_failed_run_still_advances_next_fire_at() {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let scheduler = Arc::new(Scheduler::new(catalog.clone(), orchestrator(catalog.clone())));

        let config_id = catalog
            .create_config(&BackupConfig {
                id: 0,
                name: "broken".into(),
                service_id: "mysqld".into(),
                data_dir: PathBufShim::missing(),
                target_host: "127.0.0.1".into(),
                target_port: 1,
                client_id: "client-a".into(),
                client_secret: "secret".into(),
                target_subdir: "".into(),
                naming_template: "{database}.zip".into(),
                is_active: true,
            })
            .unwrap();

        let schedule_id = scheduler
            .add_or_update_schedule(Schedule {
                id: 0,
                config_id,
                recurrence: daily_recurrence(),
                enabled: true,
                last_fire_at: None,
                next_fire_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            })
            .unwrap();

        scheduler.trigger_now(schedule_id).await.unwrap();

        let updated = catalog.get_schedule(schedule_id).unwrap().unwrap();
        assert!(updated.last_fire_at.is_some());
        assert!(updated.next_fire_at.unwrap() > Utc::now());
    }

    /// Tiny local helper so the failing-run test doesn't need a real
    /// throwaway directory just to name a path that won't exist.
    struct PathBufShim;
    impl PathBufShim {
        fn missing() -> std::path::PathBuf {
            std::path::PathBuf::from("/nonexistent/dbvault-test-dir")
        }
    }
}
