//! Loads the daemon/admin tool's TOML configuration file.
//!
//! It exists because something has to turn a file on disk into
//! the structs the core consumes, but it does not validate business rules
//! (e.g. chunk size bounds); the components that own those rules do.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path to the SQLite catalog database (component K).
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,

    /// Directory scratch archives are written to before transfer.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// Root directory the receiver stores finished archives under.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    pub listener: ListenerConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// TLS material used when this process is the *sending* side of a
    /// transfer (component F dialing out to another `dbvaultd`).
    #[serde(default)]
    pub outbound_tls: OutboundTlsConfig,

    /// Directory layout strategy name, parsed by `tools::naming::LayoutStrategy::parse`.
    #[serde(default = "default_layout")]
    pub layout: String,

    #[serde(default = "default_retention_sweep_interval_secs")]
    pub retention_sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboundTlsConfig {
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    #[serde(default = "default_verify_peer")]
    pub verify_peer: bool,
}

impl Default for OutboundTlsConfig {
    fn default() -> Self {
        Self {
            ca_cert: None,
            client_cert: None,
            client_key: None,
            verify_peer: default_verify_peer(),
        }
    }
}

fn default_verify_peer() -> bool {
    true
}

fn default_layout() -> String {
    "flat-server".to_owned()
}

fn default_retention_sweep_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub bind_address: String,
    pub port: u16,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    /// Optional CA bundle used to validate client certificates.
    pub client_ca: Option<PathBuf>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_small_chunk_size")]
    pub small_chunk_size: u32,
    #[serde(default = "default_large_chunk_size")]
    pub large_chunk_size: u32,
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            small_chunk_size: default_small_chunk_size(),
            large_chunk_size: default_large_chunk_size(),
            large_file_threshold: default_large_file_threshold(),
        }
    }
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("/var/lib/dbvault/catalog.sqlite3")
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/dbvault/archives")
}

fn default_max_connections() -> usize {
    16
}

fn default_small_chunk_size() -> u32 {
    8 * 1024 * 1024
}

fn default_large_chunk_size() -> u32 {
    32 * 1024 * 1024
}

fn default_large_file_threshold() -> u64 {
    1024 * 1024 * 1024
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file '{}'", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("unable to parse config file '{}'", path.display()))?;
        Ok(config)
    }
}
