#![allow(dead_code)]

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;

use rand::Rng;

use dfs_preload::backend::memory::{MemoryBackend, MemoryExtentReader, MemoryStore};
use dfs_preload::backend::{Fd, StorageBackend};
use dfs_preload::config::ClientConfig;
use dfs_preload::fs::Client;

pub const MOUNT: &str = "/mnt/dfs";

/// Process path of an in-mount path.
pub fn mp(path: &str) -> String {
    format!("{}{}", MOUNT, path)
}

/// Small caches and a flusher that never fires on its own during a test.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig {
        mount_point: MOUNT.to_string(),
        ..ClientConfig::default()
    };
    config.cache.small_block_size = 4096;
    config.cache.small_blocks = 64;
    config.cache.big_block_size = 16 * 1024;
    config.cache.big_blocks = 16;
    config.cache.flush_interval_ms = 60_000;
    config.cache.dirty_age_ms = 60_000;
    config
}

/// A client over an in-process store, keeping handles on the store, the
/// session and the extent reader so tests can look underneath the client.
pub struct TestClient {
    pub store: Arc<MemoryStore>,
    pub backend: Arc<MemoryBackend>,
    pub reader: Arc<MemoryExtentReader>,
    pub client: Client,
}

impl TestClient {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self::build(MemoryStore::new(), config, false)
    }

    /// Another client session sharing `store`.
    pub fn on_store(store: Arc<MemoryStore>) -> Self {
        Self::build(store, test_config(), false)
    }

    pub fn build(store: Arc<MemoryStore>, config: ClientConfig, direct_reads: bool) -> Self {
        let backend = Arc::new(MemoryBackend::connect(Arc::clone(&store)));
        let reader = Arc::new(MemoryExtentReader::new(Arc::clone(&store)));
        let session: Arc<dyn StorageBackend> = backend.clone();
        let client = Client::new(config, session).expect("failed to build client");
        if direct_reads {
            client.set_extent_reader(Some(reader.clone()));
        }
        TestClient {
            store,
            backend,
            reader,
            client,
        }
    }
}

impl Deref for TestClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

/// Open (creating) `path` read-write.
pub fn create(client: &Client, path: &str) -> Fd {
    client
        .open(&mp(path), libc::O_CREAT | libc::O_RDWR, 0o644)
        .expect("failed to create file")
}

/// Everything readable through `fd` from offset 0, without moving its cursor.
pub fn read_all(client: &Client, fd: Fd) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = client
            .pread(fd, &mut buf, out.len() as i64)
            .expect("pread failed");
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill(&mut data[..]);
    data
}

pub fn dfs_preload_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_dfs-preload"))
}

/// Run the binary with `args`, ignoring any configuration from the
/// environment of the test run.
pub fn run_cli(args: &[&str]) -> Output {
    Command::new(dfs_preload_binary())
        .args(args)
        .env_remove("DFS_CONFIG_PATH")
        .env_remove("DFS_MOUNT_POINT")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run dfs-preload")
}

/// Write a configuration file logging into `dir` and return its path.
pub fn write_cli_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.json");
    let config = serde_json::json!({
        "mountPoint": MOUNT,
        "logDir": dir,
        "logLevel": "info",
    });
    std::fs::write(&path, config.to_string()).expect("failed to write config");
    path
}
