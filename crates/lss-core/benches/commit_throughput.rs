#![forbid(unsafe_code)]

//! Commit throughput benchmark.
//!
//! Measures full transaction commits (validate, append, complete) for fresh
//! 4 KiB extents and for small in-place mutations of a hot extent.

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use lss_block::{FileByteDevice, MemoryByteDevice, SegmentGeometry, SegmentedDevice};
use lss_cache::TestBlock;
use lss_core::{TransactionManager, TransactionManagerConfig};
use lss_journal::JournalOptions;
use lss_types::Paddr;
use std::sync::Arc;
use tempfile::NamedTempFile;

const COMMITS_PER_BATCH: usize = 64;

fn memory_store() -> TransactionManager<SegmentedDevice<MemoryByteDevice>> {
    let dev = Arc::new(SegmentedDevice::ephemeral(SegmentGeometry::default_test()).expect("device"));
    let tm = TransactionManager::new(dev, TransactionManagerConfig::default());
    tm.mkfs().expect("mkfs");
    tm.mount().expect("mount");
    tm
}

fn seeded_store() -> (TransactionManager<SegmentedDevice<MemoryByteDevice>>, Paddr) {
    let tm = memory_store();
    let mut t = tm.create_transaction();
    let ext = tm.alloc_extent::<TestBlock>(&mut t, 4096);
    ext.fill(0xAB);
    let base = tm.submit_transaction(t).expect("seed");
    (tm, base)
}

fn bench_commits(c: &mut Criterion) {
    c.bench_function("commit_fresh_4k_x64", |b| {
        b.iter_batched(
            memory_store,
            |tm| {
                for i in 0..COMMITS_PER_BATCH {
                    let mut t = tm.create_transaction();
                    let ext = tm.alloc_extent::<TestBlock>(&mut t, 4096);
                    ext.fill(u8::try_from(i % 256).unwrap_or(0));
                    tm.submit_transaction(t).expect("commit");
                }
                tm
            },
            BatchSize::LargeInput,
        );
    });

    c.bench_function("commit_mutate_64b_x64", |b| {
        b.iter_batched(
            seeded_store,
            |(tm, addr)| {
                for i in 0..COMMITS_PER_BATCH {
                    let mut t = tm.create_transaction();
                    let seen = tm.read_extent::<TestBlock>(&mut t, addr, 4096).expect("read");
                    let dup = tm.get_mutable_extent(&mut t, &seen);
                    let offset = u32::try_from((i * 64) % 4096).unwrap_or(0);
                    dup.write_bytes(offset, &[0xCD; 64]);
                    tm.submit_transaction(t).expect("commit");
                }
                tm
            },
            BatchSize::LargeInput,
        );
    });

    c.bench_function("commit_fresh_4k_file_nosync_x64", |b| {
        b.iter_batched(
            || {
                let tmp = NamedTempFile::new().expect("temp file");
                let g = SegmentGeometry::default_test();
                let file = FileByteDevice::create(tmp.path(), g.size).expect("create");
                let dev = Arc::new(SegmentedDevice::new(file, g).expect("segmented"));
                let tm = TransactionManager::new(
                    dev,
                    TransactionManagerConfig {
                        journal: JournalOptions {
                            sync_on_submit: false,
                        },
                        ..TransactionManagerConfig::default()
                    },
                );
                tm.mkfs().expect("mkfs");
                tm.mount().expect("mount");
                (tmp, tm)
            },
            |(tmp, tm)| {
                for _ in 0..COMMITS_PER_BATCH {
                    let mut t = tm.create_transaction();
                    tm.alloc_extent::<TestBlock>(&mut t, 4096).fill(0x42);
                    tm.submit_transaction(t).expect("commit");
                }
                (tmp, tm)
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_commits);
criterion_main!(benches);
