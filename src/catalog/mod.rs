//! Component K - the catalog.
//!
//! Owns persistence of `BackupConfig`, `Schedule`, `BackupRun` and
//! `TransferChunk`. Backed by SQLite in WAL mode through
//! `rusqlite`, one connection per process guarded by a mutex - every write
//! is a single transaction, so writes are single-row atomic.

pub mod models;
mod schema;

use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Error};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use models::{
    AnchorTime, BackupConfig, BackupRun, ChunkStatus, ClientCredential, IntervalKind, Permission,
    Recurrence, RetentionPolicy, RunStatus, Schedule, TransferChunk,
};

/// Non-terminal runs older than this are reclaimed as `Failed` on startup,
/// recovering from a crash mid-run.
const STALE_RUN_GRACE: Duration = Duration::hours(6);

pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("unable to open catalog at '{}'", path.as_ref().display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(schema::SCHEMA)?;
        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.reclaim_stale_runs()?;
        Ok(catalog)
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Reclaims non-terminal runs abandoned by a crashed process.
    fn reclaim_stale_runs(&self) -> Result<(), Error> {
        let cutoff = Utc::now() - STALE_RUN_GRACE;
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE backup_run SET status = 'failed', ended_at = ?1,
                error_message = 'reclaimed after process restart: run did not reach a terminal state'
             WHERE status NOT IN ('completed', 'failed', 'cancelled') AND started_at < ?2",
            params![Utc::now().to_rfc3339(), cutoff.to_rfc3339()],
        )?;
        if changed > 0 {
            log::warn!("reclaimed {} stale backup run(s) as failed", changed);
        }
        Ok(())
    }

    // ---- BackupConfig -----------------------------------------------

    pub fn create_config(&self, config: &BackupConfig) -> Result<i64, Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO backup_config
                (name, service_id, data_dir, target_host, target_port,
                 client_id, client_secret, target_subdir, naming_template, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                config.name,
                config.service_id,
                config.data_dir.to_string_lossy(),
                config.target_host,
                config.target_port,
                config.client_id,
                config.client_secret,
                config.target_subdir,
                config.naming_template,
                config.is_active,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_config(&self, id: i64) -> Result<Option<BackupConfig>, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, service_id, data_dir, target_host, target_port,
                    client_id, client_secret, target_subdir, naming_template, is_active
             FROM backup_config WHERE id = ?1",
            params![id],
            row_to_config,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list_active_configs(&self) -> Result<Vec<BackupConfig>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, service_id, data_dir, target_host, target_port,
                    client_id, client_secret, target_subdir, naming_template, is_active
             FROM backup_config WHERE is_active = 1",
        )?;
        let rows = stmt.query_map([], row_to_config)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Error::from)
    }

    /// Deletion is a soft flag.
    pub fn deactivate_config(&self, id: i64) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE backup_config SET is_active = 0 WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ---- Schedule -----------------------------------------------------

    pub fn create_schedule(&self, schedule: &Schedule) -> Result<i64, Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO schedule
                (config_id, interval_kind, interval_value, anchor_hour, anchor_minute,
                 enabled, last_fire_at, next_fire_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                schedule.config_id,
                schedule.recurrence.kind.as_str(),
                schedule.recurrence.value,
                schedule.recurrence.anchor.hour,
                schedule.recurrence.anchor.minute,
                schedule.enabled,
                schedule.last_fire_at.map(|t| t.to_rfc3339()),
                schedule.next_fire_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_schedule_fire_times(
        &self,
        id: i64,
        last_fire_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE schedule SET last_fire_at = ?1, next_fire_at = ?2 WHERE id = ?3",
            params![last_fire_at.to_rfc3339(), next_fire_at.map(|t| t.to_rfc3339()), id],
        )?;
        Ok(())
    }

    pub fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, config_id, interval_kind, interval_value, anchor_hour, anchor_minute,
                    enabled, last_fire_at, next_fire_at
             FROM schedule
             WHERE enabled = 1 AND next_fire_at IS NOT NULL AND next_fire_at <= ?1
             ORDER BY next_fire_at ASC",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339()], row_to_schedule)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Error::from)
    }

    /// Updates recurrence/enabled for an existing schedule; used by
    /// `add_or_update_schedule` when `schedule.id` already exists.
    pub fn update_schedule(&self, schedule: &Schedule) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE schedule SET interval_kind = ?1, interval_value = ?2, anchor_hour = ?3,
                anchor_minute = ?4, enabled = ?5, next_fire_at = ?6
             WHERE id = ?7",
            params![
                schedule.recurrence.kind.as_str(),
                schedule.recurrence.value,
                schedule.recurrence.anchor.hour,
                schedule.recurrence.anchor.minute,
                schedule.enabled,
                schedule.next_fire_at.map(|t| t.to_rfc3339()),
                schedule.id,
            ],
        )?;
        Ok(())
    }

    pub fn get_schedule(&self, id: i64) -> Result<Option<Schedule>, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, config_id, interval_kind, interval_value, anchor_hour, anchor_minute,
                    enabled, last_fire_at, next_fire_at
             FROM schedule WHERE id = ?1",
            params![id],
            row_to_schedule,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn min_next_fire_at(&self) -> Result<Option<DateTime<Utc>>, Error> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT MIN(next_fire_at) FROM schedule WHERE enabled = 1 AND next_fire_at IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(match raw {
            Some(raw) => Some(DateTime::parse_from_rfc3339(&raw)?.with_timezone(&Utc)),
            None => None,
        })
    }

    // ---- BackupRun ------------------------------------------------------

    pub fn create_run(&self, run: &BackupRun) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO backup_run
                (id, config_id, started_at, ended_at, status, file_path, file_size,
                 checksum_md5, checksum_sha256, error_message, resume_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.id.to_string(),
                run.config_id,
                run.started_at.to_rfc3339(),
                run.ended_at.map(|t| t.to_rfc3339()),
                run.status.as_str(),
                run.file_path,
                run.file_size,
                run.checksum_md5,
                run.checksum_sha256,
                run.error_message,
                run.resume_token,
            ],
        )?;
        Ok(())
    }

    pub fn update_run_status(&self, id: Uuid, status: RunStatus) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE backup_run SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id.to_string()],
        )?;
        Ok(())
    }

    /// Marks a run terminal, recording its final status and output file.
    #[allow(clippy::too_many_arguments)]
    pub fn finish_run(
        &self,
        id: Uuid,
        status: RunStatus,
        file_path: Option<&str>,
        file_size: Option<u64>,
        checksum_md5: Option<&str>,
        checksum_sha256: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), Error> {
        if !status.is_terminal() {
            bail!("finish_run called with non-terminal status {:?}", status);
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE backup_run SET status = ?1, ended_at = ?2, file_path = ?3, file_size = ?4,
                checksum_md5 = ?5, checksum_sha256 = ?6, error_message = ?7
             WHERE id = ?8",
            params![
                status.as_str(),
                Utc::now().to_rfc3339(),
                file_path,
                file_size,
                checksum_md5,
                checksum_sha256,
                error_message,
                id.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn set_resume_token(&self, id: Uuid, token: &str) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE backup_run SET resume_token = ?1 WHERE id = ?2",
            params![token, id.to_string()],
        )?;
        Ok(())
    }

    pub fn get_run(&self, id: Uuid) -> Result<Option<BackupRun>, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, config_id, started_at, ended_at, status, file_path, file_size,
                    checksum_md5, checksum_sha256, error_message, resume_token
             FROM backup_run WHERE id = ?1",
            params![id.to_string()],
            row_to_run,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Completed runs with a known file, newest first - the input the
    /// retention engine (component J) evaluates.
    pub fn completed_runs_with_files(&self) -> Result<Vec<BackupRun>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, config_id, started_at, ended_at, status, file_path, file_size,
                    checksum_md5, checksum_sha256, error_message, resume_token
             FROM backup_run
             WHERE status = 'completed' AND file_path IS NOT NULL AND file_size IS NOT NULL
             ORDER BY started_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_run)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Error::from)
    }

    /// True if some run for `config_id` is still in a non-terminal state -
    /// the scheduler's per-config overlap guard.
    pub fn has_in_flight_run(&self, config_id: i64) -> Result<bool, Error> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM backup_run
             WHERE config_id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')",
            params![config_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Deletes a run row. Honors `RetentionPolicy.hard_purge`: soft-delete
    /// here means "mark failed with a tombstone message" since the run is
    /// already terminal and has no separate active flag like `BackupConfig`.
    pub fn delete_run(&self, id: Uuid, hard_purge: bool) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM transfer_chunk WHERE run_id = ?1", params![id.to_string()])?;
        if hard_purge {
            conn.execute("DELETE FROM backup_run WHERE id = ?1", params![id.to_string()])?;
        } else {
            conn.execute(
                "UPDATE backup_run SET file_path = NULL, error_message = 'purged by retention policy'
                 WHERE id = ?1",
                params![id.to_string()],
            )?;
        }
        Ok(())
    }

    // ---- TransferChunk --------------------------------------------------

    pub fn create_chunk_rows(&self, run_id: Uuid, count: u32, chunk_size: u32) -> Result<(), Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for index in 0..count {
            tx.execute(
                "INSERT INTO transfer_chunk (run_id, chunk_index, chunk_size, status)
                 VALUES (?1, ?2, ?3, 'pending')",
                params![run_id.to_string(), index, chunk_size],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn update_chunk_status(
        &self,
        run_id: Uuid,
        index: u32,
        status: ChunkStatus,
        error: Option<&str>,
    ) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE transfer_chunk SET status = ?1, transfer_time = ?2, error = ?3
             WHERE run_id = ?4 AND chunk_index = ?5",
            params![status.as_str(), Utc::now().to_rfc3339(), error, run_id.to_string(), index],
        )?;
        Ok(())
    }

    pub fn chunks_for_run(&self, run_id: Uuid) -> Result<Vec<TransferChunk>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT run_id, chunk_index, chunk_size, status, transfer_time, error
             FROM transfer_chunk WHERE run_id = ?1 ORDER BY chunk_index ASC",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], row_to_chunk)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Error::from)
    }

    // ---- RetentionPolicy --------------------------------------------------

    pub fn create_policy(&self, policy: &RetentionPolicy) -> Result<i64, Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO retention_policy
                (name, enabled, max_age_days, max_count, max_storage_bytes, hard_purge)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                policy.name,
                policy.enabled,
                policy.max_age_days,
                policy.max_count,
                policy.max_storage_bytes,
                policy.hard_purge,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn enabled_policies(&self) -> Result<Vec<RetentionPolicy>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, enabled, max_age_days, max_count, max_storage_bytes, hard_purge
             FROM retention_policy WHERE enabled = 1",
        )?;
        let rows = stmt.query_map([], row_to_policy)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Error::from)
    }

    // ---- ClientCredential --------------------------------------------------

    pub fn upsert_credential(&self, credential: &ClientCredential) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO client_credential (client_id, secret_hash, permissions, is_active, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(client_id) DO UPDATE SET
                secret_hash = excluded.secret_hash,
                permissions = excluded.permissions,
                is_active = excluded.is_active,
                expires_at = excluded.expires_at",
            params![
                credential.client_id,
                credential.secret_hash,
                credential.permissions.bits(),
                credential.is_active,
                credential.expires_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_credential(&self, client_id: &str) -> Result<Option<ClientCredential>, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT client_id, secret_hash, permissions, is_active, expires_at
             FROM client_credential WHERE client_id = ?1",
            params![client_id],
            row_to_credential,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list_credentials(&self) -> Result<Vec<ClientCredential>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT client_id, secret_hash, permissions, is_active, expires_at FROM client_credential",
        )?;
        let rows = stmt.query_map([], row_to_credential)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Error::from)
    }

    pub fn set_credential_active(&self, client_id: &str, is_active: bool) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE client_credential SET is_active = ?1 WHERE client_id = ?2",
            params![is_active, client_id],
        )?;
        Ok(())
    }
}

fn row_to_config(row: &rusqlite::Row) -> rusqlite::Result<BackupConfig> {
    let data_dir: String = row.get(3)?;
    Ok(BackupConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        service_id: row.get(2)?,
        data_dir: data_dir.into(),
        target_host: row.get(4)?,
        target_port: row.get(5)?,
        client_id: row.get(6)?,
        client_secret: row.get(7)?,
        target_subdir: row.get(8)?,
        naming_template: row.get(9)?,
        is_active: row.get(10)?,
    })
}

fn row_to_schedule(row: &rusqlite::Row) -> rusqlite::Result<Schedule> {
    let kind: String = row.get(2)?;
    let last_fire_at: Option<String> = row.get(7)?;
    let next_fire_at: Option<String> = row.get(8)?;
    Ok(Schedule {
        id: row.get(0)?,
        config_id: row.get(1)?,
        recurrence: Recurrence {
            kind: IntervalKind::parse(&kind).unwrap_or(IntervalKind::Daily),
            value: row.get(3)?,
            anchor: AnchorTime {
                hour: row.get(4)?,
                minute: row.get(5)?,
            },
        },
        enabled: row.get(6)?,
        last_fire_at: last_fire_at.map(|raw| parse_rfc3339(&raw)),
        next_fire_at: next_fire_at.map(|raw| parse_rfc3339(&raw)),
    })
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<BackupRun> {
    let id: String = row.get(0)?;
    let started_at: String = row.get(2)?;
    let ended_at: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(BackupRun {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        config_id: row.get(1)?,
        started_at: parse_rfc3339(&started_at),
        ended_at: ended_at.map(|raw| parse_rfc3339(&raw)),
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        file_path: row.get(5)?,
        file_size: row.get(6)?,
        checksum_md5: row.get(7)?,
        checksum_sha256: row.get(8)?,
        error_message: row.get(9)?,
        resume_token: row.get(10)?,
    })
}

fn row_to_chunk(row: &rusqlite::Row) -> rusqlite::Result<TransferChunk> {
    let run_id: String = row.get(0)?;
    let status: String = row.get(3)?;
    let transfer_time: Option<String> = row.get(4)?;
    Ok(TransferChunk {
        run_id: Uuid::parse_str(&run_id).unwrap_or_default(),
        chunk_index: row.get(1)?,
        chunk_size: row.get(2)?,
        status: ChunkStatus::parse(&status).unwrap_or(ChunkStatus::Failed),
        transfer_time: transfer_time.map(|raw| parse_rfc3339(&raw)),
        error: row.get(5)?,
    })
}

fn row_to_policy(row: &rusqlite::Row) -> rusqlite::Result<RetentionPolicy> {
    Ok(RetentionPolicy {
        id: row.get(0)?,
        name: row.get(1)?,
        enabled: row.get(2)?,
        max_age_days: row.get(3)?,
        max_count: row.get(4)?,
        max_storage_bytes: row.get(5)?,
        hard_purge: row.get(6)?,
    })
}

fn row_to_credential(row: &rusqlite::Row) -> rusqlite::Result<ClientCredential> {
    let permissions: u32 = row.get(2)?;
    let expires_at: Option<String> = row.get(4)?;
    Ok(ClientCredential {
        client_id: row.get(0)?,
        secret_hash: row.get(1)?,
        permissions: Permission::from_bits_truncate(permissions),
        is_active: row.get(3)?,
        expires_at: expires_at.map(|raw| parse_rfc3339(&raw)),
    })
}

fn parse_rfc3339(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
