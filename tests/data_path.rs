//! Read/write data path tests: cache interplay, size refresh, the direct
//! extent path and cursor semantics.

mod helpers;

use std::io::{IoSlice, IoSliceMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dfs_preload::backend::memory::{MemoryBackend, MemoryStore, WriteHook};
use dfs_preload::backend::StorageBackend;
use helpers::{create, mp, random_bytes, read_all, test_config, TestClient};

// ---------------------------------------------------------------------------
// Round trips
// ---------------------------------------------------------------------------

/// Test: bytes written are read back through the same descriptor and land in
/// the store.
#[test]
fn test_write_then_read_round_trip() {
    let tc = TestClient::new();
    let fd = create(&tc, "/hello.txt");

    assert_eq!(tc.write(fd, b"hello world").unwrap(), 11);
    assert_eq!(tc.lseek(fd, 0, libc::SEEK_SET).unwrap(), 0);

    let mut buf = [0u8; 11];
    assert_eq!(tc.read(fd, &mut buf).unwrap(), 11);
    assert_eq!(&buf, b"hello world");

    let mut word = [0u8; 5];
    assert_eq!(tc.pread(fd, &mut word, 6).unwrap(), 5);
    assert_eq!(&word, b"world");

    tc.close(fd).unwrap();
    assert_eq!(tc.store.contents("/hello.txt").unwrap(), b"hello world");
}

/// Test: a multi-block random payload survives the round trip.
#[test]
fn test_large_round_trip() {
    let tc = TestClient::new();
    let data = random_bytes(100_000);
    let fd = create(&tc, "/big.dat");
    for chunk in data.chunks(7_001) {
        tc.write(fd, chunk).unwrap();
    }
    assert_eq!(read_all(&tc, fd), data);
    tc.close(fd).unwrap();

    let fd = tc.open(&mp("/big.dat"), libc::O_RDONLY, 0).unwrap();
    assert_eq!(read_all(&tc, fd), data);
    tc.close(fd).unwrap();
}

// ---------------------------------------------------------------------------
// Write policies
// ---------------------------------------------------------------------------

/// Test: regular files are written through, so the store sees the bytes
/// before any flush.
#[test]
fn test_regular_files_write_through() {
    let tc = TestClient::new();
    let fd = create(&tc, "/plain.txt");
    tc.write(fd, b"abc").unwrap();

    assert_eq!(tc.store.contents("/plain.txt").unwrap(), b"abc");
    assert!(tc.backend.stats().pwrites() >= 1);
    tc.close(fd).unwrap();
}

/// Test: binlog writes stay in the cache until fsync.
#[test]
fn test_binlog_writes_buffered_until_fsync() {
    let tc = TestClient::new();
    let fd = create(&tc, "/mysql-bin.000001");
    tc.write(fd, b"abc").unwrap();

    assert!(tc.store.contents("/mysql-bin.000001").unwrap().is_empty());
    assert_eq!(tc.fstat(fd).unwrap().size, 3);

    tc.fsync(fd).unwrap();
    assert_eq!(tc.store.contents("/mysql-bin.000001").unwrap(), b"abc");
    tc.close(fd).unwrap();
}

/// Test: closing the last descriptor writes back dirty blocks.
#[test]
fn test_close_flushes_dirty_blocks() {
    let tc = TestClient::new();
    let fd = create(&tc, "/host-relay-bin.000007");
    let data = random_bytes(40_000);
    tc.write(fd, &data).unwrap();
    tc.close(fd).unwrap();

    assert_eq!(tc.store.contents("/host-relay-bin.000007").unwrap(), data);
    assert!(tc.inodes().is_empty());
}

/// Test: O_SYNC descriptors write through even for log files.
#[test]
fn test_o_sync_forces_write_through() {
    let tc = TestClient::new();
    let fd = tc
        .open(&mp("/binlog.000002"), libc::O_CREAT | libc::O_RDWR | libc::O_SYNC, 0o644)
        .unwrap();
    tc.write(fd, b"durable").unwrap();
    assert_eq!(tc.store.contents("/binlog.000002").unwrap(), b"durable");
    assert_eq!(tc.caches().small.stats().dirty_blocks, 0);
    assert_eq!(tc.caches().big.stats().dirty_blocks, 0);
    tc.close(fd).unwrap();
}

/// Test: a read that misses the cache while an uncached write is still on
/// its way to the store must not leave the old bytes cached.
#[test]
fn test_read_racing_uncached_write_sees_new_bytes() {
    let tc = TestClient::new();
    let other = MemoryBackend::connect(tc.store.clone());
    let ofd = other.open("/race.dat", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
    other.pwrite(ofd, &[b'a'; 8192], 0).unwrap();
    other.close(ofd).unwrap();

    let fd = tc.open(&mp("/race.dat"), libc::O_RDWR, 0).unwrap();
    // Leaves a block whose valid bytes start mid-block, so the next write
    // before them cannot go into the cache.
    tc.pwrite(fd, b"X", 4596).unwrap();

    let entered = Arc::new(AtomicBool::new(false));
    let resume = Arc::new(AtomicBool::new(false));
    let hook: WriteHook = {
        let entered = Arc::clone(&entered);
        let resume = Arc::clone(&resume);
        Arc::new(move |_ino: u64, offset: u64| {
            if offset == 4096 {
                entered.store(true, Ordering::SeqCst);
                while !resume.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        })
    };
    tc.backend.set_pwrite_hook(Some(hook));

    std::thread::scope(|s| {
        let writer = s.spawn(|| tc.pwrite(fd, b"BBBBBBBBBB", 4096).unwrap());
        while !entered.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        let mut stale = vec![0u8; 1000];
        assert_eq!(tc.pread(fd, &mut stale, 4096).unwrap(), 1000);
        resume.store(true, Ordering::SeqCst);
        assert_eq!(writer.join().unwrap(), 10);
    });
    tc.backend.set_pwrite_hook(None);

    let mut buf = [0u8; 10];
    assert_eq!(tc.pread(fd, &mut buf, 4096).unwrap(), 10);
    assert_eq!(&buf, b"BBBBBBBBBB");
    tc.close(fd).unwrap();
}

/// Test: a read that reaches the store below the cached size first asks the
/// SDK to persist the descriptor.
#[test]
fn test_uncached_read_flushes_descriptor() {
    let tc = TestClient::new();
    let fd = create(&tc, "/flushed.dat");
    tc.write(fd, &random_bytes(20_000)).unwrap();
    tc.close(fd).unwrap();

    let fd = tc.open(&mp("/flushed.dat"), libc::O_RDONLY, 0).unwrap();
    let flushes = tc.backend.stats().flushes();
    let mut buf = [0u8; 100];
    assert_eq!(tc.pread(fd, &mut buf, 0).unwrap(), 100);
    assert!(tc.backend.stats().flushes() > flushes);
    tc.close(fd).unwrap();
}

/// Test: O_APPEND writes go to the end regardless of an earlier lseek.
#[test]
fn test_append_ignores_prior_lseek() {
    let tc = TestClient::new();
    let fd = tc
        .open(&mp("/append.log"), libc::O_CREAT | libc::O_RDWR | libc::O_APPEND, 0o644)
        .unwrap();
    tc.write(fd, b"abc").unwrap();
    tc.lseek(fd, 0, libc::SEEK_SET).unwrap();
    tc.write(fd, b"de").unwrap();

    assert_eq!(read_all(&tc, fd), b"abcde");
    assert_eq!(tc.lseek(fd, 0, libc::SEEK_CUR).unwrap(), 5);
    tc.close(fd).unwrap();
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Test: repeated reads return the same bytes and are served from the cache.
#[test]
fn test_cached_reads_are_idempotent() {
    let tc = TestClient::new();
    let data = random_bytes(10_000);
    let fd = create(&tc, "/idem.dat");
    tc.write(fd, &data).unwrap();

    let preads = tc.backend.stats().preads();
    let mut first = vec![0u8; data.len()];
    let mut second = vec![0u8; data.len()];
    assert_eq!(tc.pread(fd, &mut first, 0).unwrap(), data.len());
    assert_eq!(tc.pread(fd, &mut second, 0).unwrap(), data.len());

    assert_eq!(first, data);
    assert_eq!(first, second);
    assert_eq!(tc.backend.stats().preads(), preads);
    tc.close(fd).unwrap();
}

/// Test: reads at and beyond EOF are short.
#[test]
fn test_short_reads_at_eof() {
    let tc = TestClient::new();
    let fd = create(&tc, "/short.txt");
    tc.write(fd, b"abc").unwrap();

    let mut buf = [0u8; 10];
    assert_eq!(tc.pread(fd, &mut buf, 1).unwrap(), 2);
    assert_eq!(&buf[..2], b"bc");
    assert_eq!(tc.pread(fd, &mut buf, 5).unwrap(), 0);
    tc.close(fd).unwrap();
}

/// Test: a file grown by another client is seen once a read reaches the
/// cached end of file.
#[test]
fn test_growth_by_other_client_seen_after_refresh() {
    let tc = TestClient::new();
    let fd = create(&tc, "/grow.txt");
    tc.write(fd, b"abc").unwrap();

    let other = MemoryBackend::connect(tc.store.clone());
    let ofd = other.open("/grow.txt", libc::O_WRONLY, 0).unwrap();
    other.pwrite(ofd, b"defg", 3).unwrap();
    other.close(ofd).unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(tc.pread(fd, &mut buf, 0).unwrap(), 7);
    assert_eq!(&buf[..7], b"abcdefg");
    assert_eq!(tc.fstat(fd).unwrap().size, 7);
    assert!(tc.backend.stats().refreshes() >= 1);
    tc.close(fd).unwrap();
}

/// Test: binlog readers do not refresh the extent map at EOF.
#[test]
fn test_binlog_reads_do_not_refresh() {
    let tc = TestClient::new();
    let fd = create(&tc, "/node-bin.000003");
    tc.write(fd, b"abc").unwrap();
    tc.fsync(fd).unwrap();

    let other = MemoryBackend::connect(tc.store.clone());
    let ofd = other.open("/node-bin.000003", libc::O_WRONLY, 0).unwrap();
    other.pwrite(ofd, b"def", 3).unwrap();
    other.close(ofd).unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(tc.pread(fd, &mut buf, 0).unwrap(), 3);
    assert_eq!(&buf[..3], b"abc");
    assert_eq!(tc.backend.stats().refreshes(), 0);
    tc.close(fd).unwrap();
}

/// Test: reads go through the extent reader and fall back to the session
/// when it fails.
#[test]
fn test_direct_extent_path_and_fallback() {
    let store = MemoryStore::with_extent_size(4096);
    let tc = TestClient::build(store, test_config(), true);
    let data = random_bytes(20_000);

    let fd = create(&tc, "/extents.dat");
    tc.write(fd, &data).unwrap();
    tc.close(fd).unwrap();

    let fd = tc.open(&mp("/extents.dat"), libc::O_RDONLY, 0).unwrap();
    let mut buf = vec![0u8; data.len()];
    assert_eq!(tc.pread(fd, &mut buf, 0).unwrap(), data.len());
    assert_eq!(buf, data);
    assert!(tc.reader.reads() >= 5, "expected one read per extent");
    tc.close(fd).unwrap();

    tc.reader.set_failing(true);
    let preads = tc.backend.stats().preads();
    let fd = tc.open(&mp("/extents.dat"), libc::O_RDONLY, 0).unwrap();
    let mut buf = vec![0u8; data.len()];
    assert_eq!(tc.pread(fd, &mut buf, 0).unwrap(), data.len());
    assert_eq!(buf, data);
    assert!(tc.backend.stats().preads() > preads);
    tc.close(fd).unwrap();
}

// ---------------------------------------------------------------------------
// Vector I/O
// ---------------------------------------------------------------------------

/// Test: writev/preadv scatter and gather and move the cursor.
#[test]
fn test_vector_io() {
    let tc = TestClient::new();
    let fd = create(&tc, "/vec.txt");

    let n = tc
        .writev(fd, &[IoSlice::new(b"abc"), IoSlice::new(b"def")])
        .unwrap();
    assert_eq!(n, 6);
    assert_eq!(tc.lseek(fd, 0, libc::SEEK_CUR).unwrap(), 6);

    let mut a = [0u8; 2];
    let mut b = [0u8; 4];
    let n = tc
        .preadv(fd, &mut [IoSliceMut::new(&mut a), IoSliceMut::new(&mut b)], 0)
        .unwrap();
    assert_eq!(n, 6);
    assert_eq!(&a, b"ab");
    assert_eq!(&b, b"cdef");

    tc.pwritev(fd, &[IoSlice::new(b"XY")], 1).unwrap();
    assert_eq!(read_all(&tc, fd), b"aXYdef");
    tc.close(fd).unwrap();
}

/// Test: vector writes over dirty cached blocks do not get shadowed by them.
#[test]
fn test_vector_write_over_dirty_blocks() {
    let tc = TestClient::new();
    let fd = create(&tc, "/mysql-bin.000009");
    tc.write(fd, b"0123456789").unwrap();
    tc.pwritev(fd, &[IoSlice::new(b"ab"), IoSlice::new(b"cd")], 2).unwrap();

    assert_eq!(read_all(&tc, fd), b"01abcd6789");
    tc.close(fd).unwrap();
    assert_eq!(tc.store.contents("/mysql-bin.000009").unwrap(), b"01abcd6789");
}

// ---------------------------------------------------------------------------
// Argument checks
// ---------------------------------------------------------------------------

/// Test: negative offsets and bad whence values are EINVAL.
#[test]
fn test_invalid_offsets() {
    let tc = TestClient::new();
    let fd = create(&tc, "/args.txt");
    tc.write(fd, b"abc").unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(tc.pread(fd, &mut buf, -1).unwrap_err().errno(), libc::EINVAL);
    assert_eq!(tc.pwrite(fd, b"x", -5).unwrap_err().errno(), libc::EINVAL);
    assert_eq!(tc.lseek(fd, -4, libc::SEEK_END).unwrap_err().errno(), libc::EINVAL);
    assert_eq!(tc.lseek(fd, 0, 42).unwrap_err().errno(), libc::EINVAL);
    assert_eq!(tc.lseek(fd, -1, libc::SEEK_END).unwrap(), 2);
    tc.close(fd).unwrap();
}

/// Test: zero-length transfers succeed without touching anything.
#[test]
fn test_zero_length_io() {
    let tc = TestClient::new();
    let fd = create(&tc, "/zero.txt");
    assert_eq!(tc.write(fd, b"").unwrap(), 0);
    let mut empty = [0u8; 0];
    assert_eq!(tc.read(fd, &mut empty).unwrap(), 0);
    assert_eq!(tc.fstat(fd).unwrap().size, 0);
    tc.close(fd).unwrap();
}

/// Test: access mode is enforced on the descriptor.
#[test]
fn test_access_mode_enforced() {
    let tc = TestClient::new();
    let fd = create(&tc, "/ro.txt");
    tc.write(fd, b"abc").unwrap();
    tc.close(fd).unwrap();

    let ro = tc.open(&mp("/ro.txt"), libc::O_RDONLY, 0).unwrap();
    assert_eq!(tc.write(ro, b"x").unwrap_err().errno(), libc::EBADF);
    tc.close(ro).unwrap();

    let wo = tc.open(&mp("/ro.txt"), libc::O_WRONLY, 0).unwrap();
    let mut buf = [0u8; 3];
    assert_eq!(tc.read(wo, &mut buf).unwrap_err().errno(), libc::EBADF);
    tc.close(wo).unwrap();
}
