use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use dfs_preload::backend::memory::{MemoryBackend, MemoryExtentReader, MemoryStore};
use dfs_preload::backend::{Fd, StorageBackend};
use dfs_preload::config::{Cli, ClientConfig, Command};
use dfs_preload::error::{ClientError, Result};
use dfs_preload::fs::Client;

const LOG_FILE_NAME: &str = "dfs-preload.log";

/// Odd chunk size so writes straddle cache block boundaries.
const WRITE_CHUNK: usize = 4096 + 13;

fn init_logging(config: &ClientConfig) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::never(&config.log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        );
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("dfs-preload: tracing subscriber already installed");
    }
    guard
}

fn load_config(path: Option<&Path>) -> ClientConfig {
    ClientConfig::resolve(path).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    })
}

/// Deterministic file contents for worker `worker`, file `index`.
fn pattern(worker: usize, index: usize, len: usize) -> Vec<u8> {
    let mut state = (worker as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ index as u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn file_name(worker: usize, index: usize) -> String {
    match index % 3 {
        0 => format!("w{}-bin.{:06}", worker, index),
        1 => format!("w{}-relay-bin.{:06}", worker, index),
        _ => format!("w{}-{}.dat", worker, index),
    }
}

struct Written {
    fd: Fd,
    path: String,
    expected: Vec<u8>,
}

/// Write one file: first half through the primary descriptor, second half
/// through a dup sharing its cursor.
fn write_file(client: &Client, path: &str, data: &[u8]) -> Result<Fd> {
    let fd = client.open(path, libc::O_CREAT | libc::O_RDWR | libc::O_TRUNC, 0o644)?;
    let half = data.len() / 2;
    for chunk in data[..half].chunks(WRITE_CHUNK) {
        client.write(fd, chunk)?;
    }
    let alias = client.dup(fd)?;
    for chunk in data[half..].chunks(WRITE_CHUNK) {
        client.write(alias, chunk)?;
    }
    client.close(alias)?;
    Ok(fd)
}

fn write_phase(client: &Client, dir: &str, worker: usize, files: usize, size: usize) -> Result<Vec<Written>> {
    let mut written = Vec::with_capacity(files);
    for index in 0..files {
        let path = format!("{}/{}", dir, file_name(worker, index));
        let mut expected = pattern(worker, index, size);
        let fd = write_file(client, &path, &expected)?;
        if index + 1 == files {
            let keep = expected.len() / 2;
            client.ftruncate(fd, keep as i64)?;
            expected.truncate(keep);
        }
        written.push(Written { fd, path, expected });
    }
    Ok(written)
}

/// Read everything back through the open descriptors, then again through a
/// fresh open. Returns a description of every mismatch.
fn check_phase(client: &Client, written: Vec<Written>) -> Result<Vec<String>> {
    let mut mismatches = Vec::new();
    for file in written {
        let end = client.lseek(file.fd, 0, libc::SEEK_END)?;
        if end != file.expected.len() as u64 {
            mismatches.push(format!("{}: size {} != {}", file.path, end, file.expected.len()));
        }
        let mut buf = vec![0u8; file.expected.len()];
        let n = client.pread(file.fd, &mut buf, 0)?;
        if buf[..n] != file.expected[..] {
            mismatches.push(format!("{}: contents differ through open descriptor", file.path));
        }
        client.close(file.fd)?;

        let fd = client.open(&file.path, libc::O_RDONLY, 0)?;
        let mut reread = Vec::with_capacity(file.expected.len());
        let mut chunk = vec![0u8; WRITE_CHUNK];
        loop {
            let n = client.read(fd, &mut chunk)?;
            if n == 0 {
                break;
            }
            reread.extend_from_slice(&chunk[..n]);
        }
        client.close(fd)?;
        if reread != file.expected {
            mismatches.push(format!("{}: contents differ after reopen", file.path));
        }
    }
    Ok(mismatches)
}

fn run_verify(client: &Client, store: &Arc<MemoryStore>, files: usize, size: usize, threads: usize, reload: bool) -> Result<Vec<String>> {
    let dir = format!("{}/verify", client.config().mount_point);
    client.mkdir(&dir, 0o755)?;

    let phases: Vec<Result<Vec<Written>>> = std::thread::scope(|s| {
        let dir = &dir;
        let handles: Vec<_> = (0..threads)
            .map(|worker| s.spawn(move || write_phase(client, dir, worker, files, size)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(ClientError::State("worker panicked".to_string()))))
            .collect()
    });
    let mut per_worker = Vec::with_capacity(threads);
    for phase in phases {
        per_worker.push(phase?);
    }
    info!("write phase done: {} files per worker", files);

    if reload {
        let store = Arc::clone(store);
        client.reload_backend(move |sdk_state| {
            let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::resume(store, sdk_state)?);
            Ok(backend)
        })?;
    }

    let checks: Vec<Result<Vec<String>>> = std::thread::scope(|s| {
        let handles: Vec<_> = per_worker
            .into_iter()
            .map(|written| s.spawn(move || check_phase(client, written)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(ClientError::State("worker panicked".to_string()))))
            .collect()
    });
    let mut mismatches = Vec::new();
    for check in checks {
        mismatches.extend(check?);
    }
    Ok(mismatches)
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::ShowConfig { config } => {
            let config = load_config(config.as_deref());
            match serde_json::to_string_pretty(&config) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Command::Verify {
            config,
            replicate,
            files,
            size,
            threads,
            reload,
        } => {
            let mut config = load_config(config.as_deref());
            if replicate.is_some() {
                config.replicate_path = replicate;
            }
            if let Some(root) = &config.replicate_path {
                // A previous run's mirror would make the first mkdir diverge.
                match std::fs::remove_dir_all(root.join("verify")) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        eprintln!("Error: cannot clear {}: {}", root.display(), e);
                        std::process::exit(1);
                    }
                }
            }
            let guard = init_logging(&config);

            info!(
                "dfs-preload verify: mount_point={}, files={}, size={}, threads={}, reload={}",
                config.mount_point, files, size, threads, reload
            );

            let threads = threads.max(1);
            let store = MemoryStore::new();
            let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::connect(Arc::clone(&store)));
            let outcome = Client::new(config, backend).and_then(|client| {
                client.set_extent_reader(Some(Arc::new(MemoryExtentReader::new(Arc::clone(&store)))));
                run_verify(&client, &store, files, size, threads, reload)
            });
            let code = match outcome {
                Ok(mismatches) if mismatches.is_empty() => {
                    info!("verify passed: {} files checked", files * threads);
                    0
                }
                Ok(mismatches) => {
                    for m in &mismatches {
                        error!("{}", m);
                    }
                    error!("verify failed: {} mismatches", mismatches.len());
                    1
                }
                Err(e) if e.is_divergence() => {
                    error!("verify stopped on divergence: {}", e);
                    1
                }
                Err(e) => {
                    warn!("verify aborted: {}", e);
                    1
                }
            };
            // Flush buffered log lines before exiting.
            drop(guard);
            if code != 0 {
                std::process::exit(code);
            }
        }
    }
}
