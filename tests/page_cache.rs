//! Page cache tests: prefix serving, hole refusal, eviction, write-back and
//! the background flusher.

mod helpers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dfs_preload::backend::memory::{MemoryBackend, MemoryStore};
use dfs_preload::backend::{Ino, StorageBackend};
use dfs_preload::cache::{CacheKind, CachePolicy, PageCache};
use dfs_preload::fs::handles::FileType;
use dfs_preload::fs::inodes::cache_policy;
use helpers::{create, test_config, TestClient};

/// A session with one empty file, returning the session and the file's inode.
fn backend_with_file(path: &str) -> (Arc<MemoryBackend>, Ino) {
    let backend = Arc::new(MemoryBackend::connect(MemoryStore::new()));
    let fd = backend.open(path, libc::O_CREAT | libc::O_RDWR, 0o644).unwrap();
    let ino = backend.file_info(fd).unwrap().ino;
    backend.close(fd).unwrap();
    (backend, ino)
}

// ---------------------------------------------------------------------------
// Reads and writes
// ---------------------------------------------------------------------------

/// Test: only the fully cached prefix of a request is served.
#[test]
fn test_read_serves_cached_prefix() {
    let (backend, ino) = backend_with_file("/f");
    let cache = PageCache::new("test", 4, 8);

    assert_eq!(cache.write(ino, 0, b"abcdef", CachePolicy::WRITE_BACK, &*backend), 6);

    let mut buf = [0u8; 10];
    assert_eq!(cache.read(ino, 0, &mut buf), 6);
    assert_eq!(&buf[..6], b"abcdef");

    let mut mid = [0u8; 2];
    assert_eq!(cache.read(ino, 2, &mut mid), 2);
    assert_eq!(&mid, b"cd");

    assert_eq!(cache.read(ino, 8, &mut mid), 0);
    assert_eq!(cache.read(ino + 1, 0, &mut mid), 0);
}

/// Test: a write that would leave a hole inside a block is refused.
#[test]
fn test_write_refuses_holes() {
    let (backend, ino) = backend_with_file("/f");
    let cache = PageCache::new("test", 4, 8);

    assert_eq!(cache.write(ino, 0, b"ab", CachePolicy::WRITE_BACK, &*backend), 2);
    assert_eq!(cache.write(ino, 3, b"d", CachePolicy::WRITE_BACK, &*backend), 0);
    assert_eq!(cache.write(ino, 2, b"cd", CachePolicy::WRITE_BACK, &*backend), 2);

    let mut buf = [0u8; 4];
    assert_eq!(cache.read(ino, 0, &mut buf), 4);
    assert_eq!(&buf, b"abcd");
}

/// Test: write-through blocks are stored clean.
#[test]
fn test_write_through_blocks_are_clean() {
    let (backend, ino) = backend_with_file("/f");
    let cache = PageCache::new("test", 4, 8);
    cache.write(ino, 0, b"abcdefgh", CachePolicy::WRITE_THROUGH, &*backend);
    assert!(!cache.has_dirty(ino));
    assert_eq!(cache.stats().blocks, 2);
    assert_eq!(cache.stats().dirty_blocks, 0);
}

// ---------------------------------------------------------------------------
// Eviction
// ---------------------------------------------------------------------------

/// Test: evicting a dirty block writes it back first, so no confirmed write
/// is lost.
#[test]
fn test_dirty_eviction_writes_back() {
    let (backend, ino) = backend_with_file("/f");
    let cache = PageCache::new("test", 4, 2);

    cache.write(ino, 0, b"aaaa", CachePolicy::WRITE_BACK, &*backend);
    cache.write(ino, 4, b"bbbb", CachePolicy::WRITE_BACK, &*backend);
    assert!(backend.store().inode_contents(ino).unwrap().is_empty());

    cache.write(ino, 8, b"cccc", CachePolicy::WRITE_BACK, &*backend);
    assert_eq!(cache.stats().blocks, 2);
    assert_eq!(backend.store().inode_contents(ino).unwrap(), b"aaaa");

    cache.flush_inode(ino, &*backend).unwrap();
    assert_eq!(backend.store().inode_contents(ino).unwrap(), b"aaaabbbbcccc");
    assert!(!cache.has_dirty(ino));
}

/// Test: high-priority blocks are passed over while other victims exist.
#[test]
fn test_priority_blocks_survive_eviction() {
    let (backend, ino) = backend_with_file("/f");
    let other = ino + 100;
    let cache = PageCache::new("test", 4, 2);
    let high = CachePolicy::WRITE_THROUGH | CachePolicy::PRIORITY_HIGH;

    cache.write(ino, 0, b"keep", high, &*backend);
    cache.write(other, 0, b"old!", CachePolicy::WRITE_THROUGH, &*backend);
    cache.write(other, 4, b"new!", CachePolicy::WRITE_THROUGH, &*backend);

    let mut buf = [0u8; 4];
    assert_eq!(cache.read(ino, 0, &mut buf), 4);
    assert_eq!(&buf, b"keep");
    assert_eq!(cache.read(other, 0, &mut buf), 0);
    assert_eq!(cache.read(other, 4, &mut buf), 4);
}

/// Test: populate never evicts dirty blocks to make room.
#[test]
fn test_populate_skips_dirty_victims() {
    let (backend, ino) = backend_with_file("/f");
    let cache = PageCache::new("test", 4, 1);

    cache.write(ino, 0, b"dirt", CachePolicy::WRITE_BACK, &*backend);
    cache.populate(ino, 4, b"read", CachePolicy::WRITE_BACK, || true);

    let mut buf = [0u8; 4];
    assert_eq!(cache.read(ino, 4, &mut buf), 0);
    assert_eq!(cache.read(ino, 0, &mut buf), 4);
    assert!(cache.has_dirty(ino));
}

/// Test: populate inserts nothing once its data went stale.
#[test]
fn test_populate_respects_invalidation() {
    let cache = PageCache::new("test", 4, 8);
    cache.populate(7, 0, b"stale", CachePolicy::WRITE_BACK, || false);
    assert_eq!(cache.stats().blocks, 0);

    cache.populate(7, 0, b"fresh", CachePolicy::WRITE_BACK, || true);
    let mut buf = [0u8; 5];
    assert_eq!(cache.read(7, 0, &mut buf), 5);
    assert_eq!(&buf, b"fresh");
    assert!(!cache.has_dirty(7));
}

// ---------------------------------------------------------------------------
// Invalidation and flushing
// ---------------------------------------------------------------------------

/// Test: truncate cuts cached and dirty bytes at the new size.
#[test]
fn test_truncate_cuts_blocks() {
    let (backend, ino) = backend_with_file("/f");
    let cache = PageCache::new("test", 4, 8);
    cache.write(ino, 0, b"0123456789", CachePolicy::WRITE_BACK, &*backend);

    cache.truncate(ino, 5);
    let mut buf = [0u8; 10];
    assert_eq!(cache.read(ino, 0, &mut buf), 5);
    assert_eq!(cache.stats().blocks, 2);

    cache.flush_inode(ino, &*backend).unwrap();
    assert_eq!(backend.store().inode_contents(ino).unwrap(), b"01234");
}

/// Test: clear_range drops blocks, dirty or not, and leaves others alone.
#[test]
fn test_clear_range() {
    let (backend, ino) = backend_with_file("/f");
    let cache = PageCache::new("test", 4, 8);
    cache.write(ino, 0, b"abcdefghijkl", CachePolicy::WRITE_BACK, &*backend);

    cache.clear_range(ino, 4, 4);
    let mut buf = [0u8; 12];
    assert_eq!(cache.read(ino, 0, &mut buf), 4);
    assert_eq!(cache.read(ino, 8, &mut buf), 4);
    assert_eq!(cache.stats().blocks, 2);

    cache.evict_inode(ino);
    assert_eq!(cache.stats().blocks, 0);
    assert_eq!(cache.stats().inodes, 0);
}

/// Test: flush_aged only writes blocks dirty for long enough.
#[test]
fn test_flush_aged() {
    let (backend, ino) = backend_with_file("/f");
    let cache = PageCache::new("test", 4, 8);
    cache.write(ino, 0, b"abcdef", CachePolicy::WRITE_BACK, &*backend);

    assert_eq!(cache.flush_aged(Duration::from_secs(3600), &*backend), 0);
    assert!(cache.has_dirty(ino));

    assert_eq!(cache.flush_aged(Duration::ZERO, &*backend), 2);
    assert!(!cache.has_dirty(ino));
    assert_eq!(backend.store().inode_contents(ino).unwrap(), b"abcdef");
}

/// Test: flush_range leaves dirty blocks outside the range alone.
#[test]
fn test_flush_range() {
    let (backend, ino) = backend_with_file("/f");
    let cache = PageCache::new("test", 4, 8);
    cache.write(ino, 0, b"abcdefgh", CachePolicy::WRITE_BACK, &*backend);

    cache.flush_range(ino, 0, 2, &*backend).unwrap();
    assert_eq!(backend.store().inode_contents(ino).unwrap(), b"abcd");
    assert!(cache.has_dirty(ino));
}

/// Test: the background flusher writes aged blocks without any fsync.
#[test]
fn test_background_flusher() {
    let mut config = test_config();
    config.cache.flush_interval_ms = 50;
    config.cache.dirty_age_ms = 0;
    let tc = TestClient::with_config(config);

    let fd = create(&tc, "/mysql-bin.000010");
    tc.write(fd, b"flushed later").unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while tc.store.contents("/mysql-bin.000010").unwrap().is_empty() {
        assert!(Instant::now() < deadline, "flusher never wrote the block");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(tc.store.contents("/mysql-bin.000010").unwrap(), b"flushed later");
    tc.close(fd).unwrap();
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Test: file names map to file types, and file types to cache policies.
#[test]
fn test_file_types_and_policies() {
    assert_eq!(FileType::classify("/mysql-bin.000001", false), FileType::BinLog);
    assert_eq!(FileType::classify("/data/binlog.000123", false), FileType::BinLog);
    assert_eq!(FileType::classify("/host-relay-bin.000002", false), FileType::RelayLog);
    assert_eq!(FileType::classify("/ib_logfile0", false), FileType::RedoLog);
    assert_eq!(FileType::classify("/#ib_redo12", false), FileType::RedoLog);
    assert_eq!(FileType::classify("/mysql-bin.index", false), FileType::Regular);
    assert_eq!(FileType::classify("/t1.ibd", false), FileType::Regular);
    assert_eq!(FileType::classify("/mysql-bin.000001", true), FileType::Other);

    assert_eq!(
        cache_policy(FileType::BinLog, false),
        Some((CacheKind::Big, CachePolicy::WRITE_BACK))
    );
    assert_eq!(
        cache_policy(FileType::RelayLog, false),
        Some((CacheKind::Big, CachePolicy::WRITE_BACK | CachePolicy::PRIORITY_HIGH))
    );
    assert_eq!(
        cache_policy(FileType::Regular, false),
        Some((CacheKind::Small, CachePolicy::WRITE_THROUGH))
    );
    assert_eq!(
        cache_policy(FileType::RedoLog, true),
        Some((CacheKind::Small, CachePolicy::WRITE_BACK))
    );
    assert_eq!(cache_policy(FileType::Other, false), None);
}

/// Test: with a tiny cache, a large write-back file still reaches the store
/// intact once closed.
#[test]
fn test_tiny_cache_keeps_all_writes() {
    let mut config = test_config();
    config.cache.big_block_size = 4096;
    config.cache.big_blocks = 2;
    let tc = TestClient::with_config(config);
    let data = helpers::random_bytes(64 * 1024 + 123);

    let fd = create(&tc, "/small-bin.000001");
    for chunk in data.chunks(3_000) {
        tc.write(fd, chunk).unwrap();
    }
    assert_eq!(helpers::read_all(&tc, fd), data);
    tc.close(fd).unwrap();
    assert_eq!(tc.store.contents("/small-bin.000001").unwrap(), data);
}
