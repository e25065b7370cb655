//! Entities persisted by the catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub id: i64,
    pub name: String,
    pub service_id: String,
    pub data_dir: PathBuf,
    pub target_host: String,
    pub target_port: u16,
    pub client_id: String,
    pub client_secret: String,
    pub target_subdir: String,
    pub naming_template: String,
    pub is_active: bool,
}

/// `(interval_kind, interval_value, anchor)` - a cron-equivalent
/// recurrence descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalKind {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl IntervalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalKind::Hourly => "hourly",
            IntervalKind::Daily => "daily",
            IntervalKind::Weekly => "weekly",
            IntervalKind::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hourly" => Some(IntervalKind::Hourly),
            "daily" => Some(IntervalKind::Daily),
            "weekly" => Some(IntervalKind::Weekly),
            "monthly" => Some(IntervalKind::Monthly),
            _ => None,
        }
    }
}

/// Time-of-day anchor used by `Daily`/`Weekly`/`Monthly` recurrences.
/// `Hourly` ignores everything but `minute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorTime {
    pub hour: u32,
    pub minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recurrence {
    pub kind: IntervalKind,
    /// Interval value: every Nth hour/day/week/month. `0` is normalized to `1`.
    pub value: u32,
    pub anchor: AnchorTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub config_id: i64,
    pub recurrence: Recurrence,
    pub enabled: bool,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub next_fire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Queued,
    StoppingDb,
    Compressing,
    StartingDb,
    Verifying,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::StoppingDb => "stopping_db",
            RunStatus::Compressing => "compressing",
            RunStatus::StartingDb => "starting_db",
            RunStatus::Verifying => "verifying",
            RunStatus::Transferring => "transferring",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => RunStatus::Queued,
            "stopping_db" => RunStatus::StoppingDb,
            "compressing" => RunStatus::Compressing,
            "starting_db" => RunStatus::StartingDb,
            "verifying" => RunStatus::Verifying,
            "transferring" => RunStatus::Transferring,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }

    /// The non-terminal state sequence a run's status is a prefix of,
    /// ending at a terminal state.
    pub fn sequence() -> &'static [RunStatus] {
        &[
            RunStatus::Queued,
            RunStatus::StoppingDb,
            RunStatus::Compressing,
            RunStatus::StartingDb,
            RunStatus::Verifying,
            RunStatus::Transferring,
            RunStatus::Completed,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRun {
    pub id: Uuid,
    pub config_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub file_path: Option<String>,
    pub file_size: Option<u64>,
    pub checksum_md5: Option<String>,
    pub checksum_sha256: Option<String>,
    pub error_message: Option<String>,
    pub resume_token: Option<String>,
}

impl BackupRun {
    pub fn new(config_id: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            config_id,
            started_at: Utc::now(),
            ended_at: None,
            status: RunStatus::Queued,
            file_path: None,
            file_size: None,
            checksum_md5: None,
            checksum_sha256: None,
            error_message: None,
            resume_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkStatus {
    Pending,
    Sent,
    Acked,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Sent => "sent",
            ChunkStatus::Acked => "acked",
            ChunkStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => ChunkStatus::Pending,
            "sent" => ChunkStatus::Sent,
            "acked" => ChunkStatus::Acked,
            "failed" => ChunkStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferChunk {
    pub run_id: Uuid,
    pub chunk_index: u32,
    pub chunk_size: u32,
    pub status: ChunkStatus,
    pub transfer_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub max_age_days: Option<u32>,
    pub max_count: Option<u32>,
    pub max_storage_bytes: Option<u64>,
    /// Hard-purge the catalog row on deletion, instead of soft-deleting it.
    pub hard_purge: bool,
}

bitflags::bitflags! {
    // The `serde` feature on the `bitflags` dependency supplies
    // Serialize/Deserialize for this type (encoded as the raw bits).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permission: u32 {
        const TRANSFER_UPLOAD = 0b0000_0001;
        const TRANSFER_RESUME = 0b0000_0010;
        const SYSTEM_ADMIN    = 0b1000_0000;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCredential {
    pub client_id: String,
    pub secret_hash: String,
    pub permissions: Permission,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ClientCredential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }

    pub fn authorized_for(&self, required: Permission) -> bool {
        self.permissions.contains(Permission::SYSTEM_ADMIN) || self.permissions.contains(required)
    }
}
