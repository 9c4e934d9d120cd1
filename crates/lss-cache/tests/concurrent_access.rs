#![forbid(unsafe_code)]
//! Multi-threaded cache behaviour over a device that counts and can stall
//! or fail reads.

use lss_block::{
    MemoryByteDevice, SegmentGeometry, SegmentManager, SegmentState, SegmentedDevice,
};
use lss_cache::{Cache, CacheConfig, ExtentRef, TestBlock};
use lss_error::{LssError, Result};
use lss_types::{Paddr, SegmentId};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

/// Segment manager wrapper that counts reads, optionally holds them until
/// released, and optionally fails them.
struct GatedDevice {
    inner: SegmentedDevice<MemoryByteDevice>,
    reads: AtomicUsize,
    fail_reads: AtomicBool,
    gate_closed: Mutex<bool>,
    gate: Condvar,
}

impl GatedDevice {
    fn new() -> Self {
        Self {
            inner: SegmentedDevice::ephemeral(SegmentGeometry::default_test()).expect("device"),
            reads: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            gate_closed: Mutex::new(false),
            gate: Condvar::new(),
        }
    }

    fn close_gate(&self) {
        *self.gate_closed.lock() = true;
    }

    fn open_gate(&self) {
        *self.gate_closed.lock() = false;
        self.gate.notify_all();
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl SegmentManager for GatedDevice {
    fn geometry(&self) -> SegmentGeometry {
        self.inner.geometry()
    }

    fn open(&self, id: SegmentId) -> Result<()> {
        self.inner.open(id)
    }

    fn close(&self, id: SegmentId) -> Result<()> {
        self.inner.close(id)
    }

    fn release(&self, id: SegmentId) -> Result<()> {
        self.inner.release(id)
    }

    fn write(&self, addr: Paddr, data: &[u8]) -> Result<()> {
        self.inner.write(addr, data)
    }

    fn read(&self, addr: Paddr, buf: &mut [u8]) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut closed = self.gate_closed.lock();
        while *closed {
            self.gate.wait(&mut closed);
        }
        drop(closed);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(LssError::Io(std::io::Error::other("injected medium error")));
        }
        self.inner.read(addr, buf)
    }

    fn segment_state(&self, id: SegmentId) -> Option<SegmentState> {
        self.inner.segment_state(id)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

const SEG: SegmentId = SegmentId(1);

fn seeded() -> (Arc<GatedDevice>, Arc<Cache<GatedDevice>>, Paddr) {
    let dev = Arc::new(GatedDevice::new());
    dev.open(SEG).expect("open segment");
    let addr = Paddr::new(SEG, 4096);
    let content: Vec<u8> = (0..4096_u32).map(|i| (i % 256) as u8).collect();
    dev.write(addr, &content).expect("seed");
    let cache = Arc::new(Cache::new(Arc::clone(&dev), CacheConfig::default()));
    cache.init();
    (dev, cache, addr)
}

fn spawn_fetchers(
    cache: &Arc<Cache<GatedDevice>>,
    addr: Paddr,
    n: usize,
) -> Vec<thread::JoinHandle<Result<ExtentRef>>> {
    let barrier = Arc::new(Barrier::new(n));
    (0..n)
        .map(|_| {
            let cache = Arc::clone(cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.fetch_extent::<TestBlock>(addr, 4096)
            })
        })
        .collect()
}

#[test]
fn concurrent_misses_issue_one_read() {
    let (dev, cache, addr) = seeded();
    dev.close_gate();
    let handles = spawn_fetchers(&cache, addr, 8);
    thread::sleep(Duration::from_millis(50));
    dev.open_gate();

    let extents: Vec<ExtentRef> = handles
        .into_iter()
        .map(|h| h.join().expect("join").expect("fetch"))
        .collect();
    assert_eq!(dev.reads(), 1);
    for extent in &extents {
        assert!(Arc::ptr_eq(extent, &extents[0]));
    }
    let expected: Vec<u8> = (0..4096_u32).map(|i| (i % 256) as u8).collect();
    assert_eq!(extents[0].to_vec(), expected);
    assert!(extents[0].is_clean());
}

#[test]
fn read_failure_reaches_every_waiter_and_is_not_cached() {
    let (dev, cache, addr) = seeded();
    dev.fail_reads.store(true, Ordering::SeqCst);
    dev.close_gate();
    let handles = spawn_fetchers(&cache, addr, 6);
    thread::sleep(Duration::from_millis(50));
    dev.open_gate();

    for handle in handles {
        let err = handle.join().expect("join").expect_err("read fails");
        assert!(err.to_string().contains("injected medium error"), "{err}");
    }
    assert!(dev.reads() >= 1);
    assert_eq!(cache.summary().extents, 0, "no poisoned entry");

    dev.fail_reads.store(false, Ordering::SeqCst);
    let before = dev.reads();
    let extent = cache.fetch_extent::<TestBlock>(addr, 4096).expect("retry by caller");
    assert_eq!(dev.reads(), before + 1);
    assert!(extent.is_clean());
}

#[test]
fn conflicting_writers_exactly_one_commits() {
    let (_dev, cache, addr) = seeded();
    let seed = cache.fetch_extent::<TestBlock>(addr, 4096).expect("warm");
    let writers = 8;
    let barrier = Arc::new(Barrier::new(writers));
    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut t = cache.create_transaction();
                let seen = cache
                    .get_extent::<TestBlock>(&mut t, addr, 4096)
                    .expect("read");
                let dup = cache.duplicate_for_write(&mut t, &seen);
                dup.fill(u8::try_from(i).expect("tag"));
                barrier.wait();
                let record = cache.try_construct_record(&mut t)?;
                let base = Paddr::new(SegmentId(2), 4096 * i32::try_from(i + 1).expect("off"));
                cache.complete_commit(t, base);
                Some((i, record))
            })
        })
        .collect();

    let winners: Vec<_> = handles
        .into_iter()
        .filter_map(|h| h.join().expect("join"))
        .collect();
    assert_eq!(winners.len(), 1, "validation admits one writer per version");
    let (tag, record) = &winners[0];
    assert_eq!(record.deltas.len(), 1);

    assert!(!seed.is_valid());
    let live = cache.fetch_extent::<TestBlock>(addr, 4096).expect("live");
    assert_eq!(live.to_vec(), vec![u8::try_from(*tag).expect("tag"); 4096]);
    assert_eq!(live.version(), 1);
    assert_eq!(cache.summary().dirty, 1);
}

#[test]
fn readers_wait_for_in_flight_commit() {
    let (_dev, cache, addr) = seeded();
    cache.fetch_extent::<TestBlock>(addr, 4096).expect("warm");

    let mut t = cache.create_transaction();
    let seen = cache.get_extent::<TestBlock>(&mut t, addr, 4096).expect("read");
    cache.duplicate_for_write(&mut t, &seen).fill(0x77);
    let _record = cache.try_construct_record(&mut t).expect("valid");

    let reader = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || cache.fetch_extent::<TestBlock>(addr, 4096))
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!reader.is_finished(), "reader must block on the pending duplicate");
    cache.complete_commit(t, Paddr::new(SegmentId(2), 4096));

    let extent = reader.join().expect("join").expect("fetch");
    assert!(extent.is_dirty());
    assert_eq!(extent.to_vec(), vec![0x77; 4096]);
}

#[test]
fn readers_see_failed_append() {
    let (_dev, cache, addr) = seeded();
    let original = cache.fetch_extent::<TestBlock>(addr, 4096).expect("warm");

    let mut t = cache.create_transaction();
    let seen = cache.get_extent::<TestBlock>(&mut t, addr, 4096).expect("read");
    cache.duplicate_for_write(&mut t, &seen).fill(0x11);
    cache.try_construct_record(&mut t).expect("valid");

    let reader = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || cache.fetch_extent::<TestBlock>(addr, 4096))
    };
    thread::sleep(Duration::from_millis(100));
    cache.fail_commit(t, &LssError::NoSpace);

    let err = reader.join().expect("join").expect_err("append failed");
    assert!(matches!(err, LssError::NoSpace), "{err:?}");
    let live = cache.fetch_extent::<TestBlock>(addr, 4096).expect("original back");
    assert!(Arc::ptr_eq(&live, &original));
}
