//! Catalog schema. No migration framework: each statement is
//! `CREATE TABLE IF NOT EXISTS`, applied once when the catalog opens.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_config (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL UNIQUE,
    service_id      TEXT NOT NULL,
    data_dir        TEXT NOT NULL,
    target_host     TEXT NOT NULL,
    target_port     INTEGER NOT NULL,
    client_id       TEXT NOT NULL,
    client_secret   TEXT NOT NULL,
    target_subdir   TEXT NOT NULL,
    naming_template TEXT NOT NULL,
    is_active       INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS schedule (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    config_id       INTEGER NOT NULL REFERENCES backup_config(id),
    interval_kind   TEXT NOT NULL,
    interval_value  INTEGER NOT NULL,
    anchor_hour     INTEGER NOT NULL,
    anchor_minute   INTEGER NOT NULL,
    enabled         INTEGER NOT NULL DEFAULT 1,
    last_fire_at    TEXT,
    next_fire_at    TEXT
);

CREATE TABLE IF NOT EXISTS backup_run (
    id              TEXT PRIMARY KEY,
    config_id       INTEGER NOT NULL REFERENCES backup_config(id),
    started_at      TEXT NOT NULL,
    ended_at        TEXT,
    status          TEXT NOT NULL,
    file_path       TEXT,
    file_size       INTEGER,
    checksum_md5    TEXT,
    checksum_sha256 TEXT,
    error_message   TEXT,
    resume_token    TEXT
);

CREATE INDEX IF NOT EXISTS idx_backup_run_config ON backup_run(config_id);
CREATE INDEX IF NOT EXISTS idx_backup_run_status ON backup_run(status);

CREATE TABLE IF NOT EXISTS transfer_chunk (
    run_id          TEXT NOT NULL REFERENCES backup_run(id),
    chunk_index     INTEGER NOT NULL,
    chunk_size      INTEGER NOT NULL,
    status          TEXT NOT NULL,
    transfer_time   TEXT,
    error           TEXT,
    PRIMARY KEY (run_id, chunk_index)
);

CREATE TABLE IF NOT EXISTS retention_policy (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    name               TEXT NOT NULL UNIQUE,
    enabled            INTEGER NOT NULL DEFAULT 1,
    max_age_days       INTEGER,
    max_count          INTEGER,
    max_storage_bytes  INTEGER,
    hard_purge         INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS client_credential (
    client_id       TEXT PRIMARY KEY,
    secret_hash     TEXT NOT NULL,
    permissions     INTEGER NOT NULL,
    is_active       INTEGER NOT NULL DEFAULT 1,
    expires_at      TEXT
);
"#;
