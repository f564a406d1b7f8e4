use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::fs::path::clean_path;

/// Environment variable naming the JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "DFS_CONFIG_PATH";
/// Environment variable overriding `mountPoint`.
pub const MOUNT_POINT_ENV: &str = "DFS_MOUNT_POINT";

#[derive(Parser, Debug)]
#[command(name = "dfs-preload", about = "Distributed filesystem client interception core")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the resolved client configuration
    ShowConfig {
        /// Path to the JSON configuration file (defaults to $DFS_CONFIG_PATH)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run a verification workload against an in-process storage cluster
    Verify {
        /// Path to the JSON configuration file (defaults to $DFS_CONFIG_PATH)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Mirror every operation into this local directory and compare results
        #[arg(long)]
        replicate: Option<PathBuf>,

        /// Number of files written by each worker
        #[arg(long, default_value_t = 8)]
        files: usize,

        /// Bytes written to each file
        #[arg(long, default_value_t = 256 * 1024)]
        size: usize,

        /// Number of worker threads
        #[arg(long, default_value_t = 4)]
        threads: usize,

        /// Hot-reload the storage backend halfway through the run
        #[arg(long)]
        reload: bool,
    },
}

/// Page cache sizing and flush policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub small_block_size: usize,
    pub small_blocks: usize,
    pub big_block_size: usize,
    pub big_blocks: usize,
    /// How often the background flusher wakes up.
    pub flush_interval_ms: u64,
    /// Dirty blocks older than this are written back by the flusher.
    pub dirty_age_ms: u64,
    /// Buffer writes to regular files instead of writing them through.
    pub write_back_regular: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            small_block_size: 4096,
            small_blocks: 8192,
            big_block_size: 128 * 1024,
            big_blocks: 512,
            flush_interval_ms: 1000,
            dirty_age_ms: 3000,
            write_back_regular: false,
        }
    }
}

impl CacheConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn dirty_age(&self) -> Duration {
        Duration::from_millis(self.dirty_age_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub mount_point: String,
    pub log_dir: PathBuf,
    pub log_level: String,
    /// Comma separated list of in-mount prefixes left to the native filesystem.
    pub ignore_path: String,
    pub replicate_path: Option<PathBuf>,
    pub cache: CacheConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mount_point: "/mnt/dfs".to_string(),
            log_dir: PathBuf::from("/tmp"),
            log_level: "info".to_string(),
            ignore_path: String::new(),
            replicate_path: None,
            cache: CacheConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Read a JSON configuration file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| ClientError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Resolve the configuration the way a preloaded library does at startup:
    /// an explicit path, else `DFS_CONFIG_PATH`, else defaults, then the
    /// mount point override from `DFS_MOUNT_POINT`.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(p) => Self::load(&p)?,
            None => Self::default(),
        };
        if let Ok(mount) = std::env::var(MOUNT_POINT_ENV) {
            if !mount.is_empty() {
                config.mount_point = mount;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Check invariants and normalise the mount point.
    pub fn validate(&mut self) -> Result<()> {
        if !self.mount_point.starts_with('/') {
            return Err(ClientError::Config(format!(
                "mountPoint must be absolute, got {:?}",
                self.mount_point
            )));
        }
        self.mount_point = clean_path(&self.mount_point);
        if self.mount_point == "/" {
            return Err(ClientError::Config("mountPoint cannot be /".to_string()));
        }
        let c = &self.cache;
        if c.small_block_size == 0 || c.big_block_size == 0 {
            return Err(ClientError::Config("cache block sizes must be non-zero".to_string()));
        }
        if c.small_blocks == 0 || c.big_blocks == 0 {
            return Err(ClientError::Config("cache capacities must be non-zero".to_string()));
        }
        if c.flush_interval_ms == 0 {
            return Err(ClientError::Config("flushIntervalMs must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Ignore prefixes as cleaned in-mount paths without the leading slash.
    pub fn ignore_prefixes(&self) -> Vec<String> {
        self.ignore_path
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| clean_path(p).trim_start_matches('/').to_string())
            .filter(|p| !p.is_empty() && p != ".")
            .collect()
    }
}
