//! Concurrency tests: many threads sharing one client, its descriptor tables
//! and its caches.

mod helpers;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dfs_preload::backend::memory::WriteHook;
use helpers::{create, mp, read_all, test_config, TestClient};

const THREADS: usize = 8;

/// Test: parallel writers on distinct files never see each other's data.
#[test]
fn test_parallel_writers_distinct_files() {
    let tc = TestClient::new();
    let contents: Vec<Vec<u8>> = (0..THREADS).map(|_| helpers::random_bytes(50_000)).collect();

    std::thread::scope(|s| {
        for (i, data) in contents.iter().enumerate() {
            let tc = &tc;
            s.spawn(move || {
                let name = match i % 3 {
                    0 => format!("/w{}-bin.000001", i),
                    1 => format!("/w{}-relay-bin.000001", i),
                    _ => format!("/w{}.dat", i),
                };
                let fd = create(tc, &name);
                for chunk in data.chunks(3_333) {
                    assert_eq!(tc.write(fd, chunk).unwrap(), chunk.len());
                }
                assert_eq!(&read_all(tc, fd), data);
                tc.close(fd).unwrap();
            });
        }
    });

    assert!(tc.files().is_empty());
    assert!(tc.inodes().is_empty());
    assert_eq!(tc.backend.open_descriptors(), 0);
    for (i, data) in contents.iter().enumerate() {
        let name = match i % 3 {
            0 => format!("/w{}-bin.000001", i),
            1 => format!("/w{}-relay-bin.000001", i),
            _ => format!("/w{}.dat", i),
        };
        assert_eq!(&tc.store.contents(&name).unwrap(), data);
    }
}

/// Test: appends through one shared descriptor and its aliases never
/// interleave inside a record.
#[test]
fn test_shared_append_descriptor() {
    let tc = TestClient::new();
    let fd = tc
        .open(&mp("/append.log"), libc::O_CREAT | libc::O_WRONLY | libc::O_APPEND, 0o644)
        .unwrap();
    const RECORDS: usize = 200;

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let tc = &tc;
            s.spawn(move || {
                let alias = tc.dup(fd).unwrap();
                for r in 0..RECORDS {
                    let record = format!("t{}r{:06}\n", t, r);
                    assert_eq!(record.len(), 10);
                    let target = if r % 2 == 0 { fd } else { alias };
                    tc.write(target, record.as_bytes()).unwrap();
                }
                tc.close(alias).unwrap();
            });
        }
    });
    tc.close(fd).unwrap();

    let data = tc.store.contents("/append.log").unwrap();
    assert_eq!(data.len(), THREADS * RECORDS * 10);
    let records: HashSet<&[u8]> = data.chunks(10).collect();
    assert_eq!(records.len(), THREADS * RECORDS);
    for record in records {
        assert_eq!(record[0], b't');
        assert_eq!(record[9], b'\n');
    }
}

/// Test: concurrent opens and closes of one file keep the inode registry and
/// the SDK session balanced.
#[test]
fn test_concurrent_open_close_same_inode() {
    let tc = TestClient::new();
    let fd = create(&tc, "/hot.dat");
    tc.write(fd, b"seed").unwrap();
    tc.close(fd).unwrap();

    std::thread::scope(|s| {
        for _ in 0..THREADS {
            let tc = &tc;
            s.spawn(move || {
                for _ in 0..100 {
                    let fd = tc.open(&mp("/hot.dat"), libc::O_RDONLY, 0).unwrap();
                    let mut buf = [0u8; 4];
                    assert_eq!(tc.pread(fd, &mut buf, 0).unwrap(), 4);
                    assert_eq!(&buf, b"seed");
                    tc.close(fd).unwrap();
                }
            });
        }
    });

    assert!(tc.files().is_empty());
    assert!(tc.inodes().is_empty());
    assert_eq!(tc.backend.open_descriptors(), 0);
}

/// Test: racing dup and close of aliases leaves only the primary behind.
#[test]
fn test_dup_close_races() {
    let tc = TestClient::new();
    let fd = create(&tc, "/dups.dat");

    std::thread::scope(|s| {
        for _ in 0..THREADS {
            let tc = &tc;
            s.spawn(move || {
                for _ in 0..100 {
                    let alias = tc.dup(fd).unwrap();
                    assert_ne!(alias, fd);
                    tc.fstat(alias).unwrap();
                    tc.close(alias).unwrap();
                }
            });
        }
    });

    assert!(tc.fd_space().is_empty());
    assert_eq!(tc.files().len(), 1);
    assert_eq!(tc.inode_of(fd).unwrap().fd_refs(), 1);
    tc.close(fd).unwrap();
    assert_eq!(tc.backend.open_descriptors(), 0);
}

/// Test: positional writes to disjoint block-aligned regions of one
/// write-back file survive heavy eviction.
#[test]
fn test_disjoint_regions_with_tiny_cache() {
    let mut config = test_config();
    config.cache.big_block_size = 4096;
    config.cache.big_blocks = 3;
    let tc = TestClient::with_config(config);
    const REGION: usize = 4 * 4096;

    let fd = create(&tc, "/regions-bin.000001");
    let regions: Vec<Vec<u8>> = (0..THREADS).map(|_| helpers::random_bytes(REGION)).collect();

    std::thread::scope(|s| {
        for (i, data) in regions.iter().enumerate() {
            let tc = &tc;
            s.spawn(move || {
                let base = i * REGION;
                for (j, chunk) in data.chunks(1_000).enumerate() {
                    let offset = (base + j * 1_000) as i64;
                    assert_eq!(tc.pwrite(fd, chunk, offset).unwrap(), chunk.len());
                }
            });
        }
    });

    let expected: Vec<u8> = regions.concat();
    assert_eq!(tc.fstat(fd).unwrap().size, expected.len() as u64);
    assert_eq!(read_all(&tc, fd), expected);
    tc.close(fd).unwrap();
    assert_eq!(tc.store.contents("/regions-bin.000001").unwrap(), expected);
}

/// Test: the last close of a dirty log writes it back without holding up
/// opens and stats of other files, while a reopen of the same file waits and
/// then sees everything.
#[test]
fn test_slow_close_does_not_stall_other_files() {
    let tc = TestClient::new();
    let other = create(&tc, "/other.txt");
    tc.write(other, b"unrelated").unwrap();
    tc.close(other).unwrap();

    let data = helpers::random_bytes(40_000);
    let fd = create(&tc, "/mysql-bin.000009");
    tc.write(fd, &data).unwrap();

    let entered = Arc::new(AtomicBool::new(false));
    let hook: WriteHook = {
        let entered = Arc::clone(&entered);
        Arc::new(move |_ino: u64, _offset: u64| {
            if !entered.swap(true, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(500));
            }
        })
    };
    tc.backend.set_inode_write_hook(Some(hook));

    std::thread::scope(|s| {
        let closer = s.spawn(|| tc.close(fd));
        while !entered.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }

        let started = Instant::now();
        assert_eq!(tc.stat(&mp("/other.txt")).unwrap().size, 9);
        let ofd = tc.open(&mp("/other.txt"), libc::O_RDONLY, 0).unwrap();
        assert_eq!(read_all(&tc, ofd), b"unrelated");
        tc.close(ofd).unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(300),
            "unrelated file blocked for {:?}",
            started.elapsed()
        );

        let again = tc.open(&mp("/mysql-bin.000009"), libc::O_RDONLY, 0).unwrap();
        assert_eq!(read_all(&tc, again), data);
        tc.close(again).unwrap();
        closer.join().unwrap().unwrap();
    });

    tc.backend.set_inode_write_hook(None);
    assert!(tc.inodes().is_empty());
    assert_eq!(tc.store.contents("/mysql-bin.000009").unwrap(), data);
}
