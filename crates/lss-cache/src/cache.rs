//! Cache orchestration: retrieval, staging, validation, completion, replay.

use crate::extent::{CachedExtent, ExtentKind, ExtentRef, ExtentState};
use crate::index::ExtentIndex;
use crate::record::{RecordBuilder, fresh_offsets};
use crate::transaction::{Transaction, TransactionStage};
use lss_block::SegmentManager;
use lss_error::{LssError, Result};
use lss_types::{
    Checksum, DeltaInfo, ExtentLen, ExtentType, Laddr, Paddr, ROOT_BLOCK_SIZE, Record, TxnId,
    checksum,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Compare disk fills against caller-supplied checksums.
    pub verify_checksums: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            verify_checksums: true,
        }
    }
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSummary {
    pub extents: usize,
    pub dirty: usize,
    pub io_pending: usize,
    pub bytes: u64,
    pub by_state: BTreeMap<String, usize>,
    pub root_version: Option<u32>,
}

#[derive(Debug, Default)]
pub(crate) struct CacheState {
    index: ExtentIndex,
    root: Option<ExtentRef>,
}

impl CacheState {
    /// Reverse the merge of a validated transaction whose record never
    /// reached the log.
    ///
    /// Duplicates leave the index; displaced extents come back with their
    /// prior state when their address is still free; the previous root is
    /// restored if `t`'s root is still resident.
    pub(crate) fn unwind_merge(&mut self, t: &mut Transaction) {
        for dup in t.mutated_block_list().iter().filter(|d| d.is_valid()) {
            self.index.erase(dup);
            dup.set_state(ExtentState::Invalid);
        }
        for (extent, prior) in t.take_displaced() {
            if self.index.find_offset(extent.paddr()).is_some() {
                continue;
            }
            extent.set_state(prior);
            self.index.insert(extent);
        }
        let Some(root) = t.root().cloned() else {
            return;
        };
        root.set_state(ExtentState::Invalid);
        if self.root.as_ref().is_some_and(|r| Arc::ptr_eq(r, &root)) {
            if let Some(previous) = t.take_displaced_root() {
                previous.set_state(ExtentState::Dirty);
                self.root = Some(previous);
            }
        }
    }
}

/// Transactional extent cache over a segment manager.
///
/// All structural changes to the index and every commit validation happen
/// under one mutex. Disk reads and waits on extent latches happen outside
/// it.
pub struct Cache<D: SegmentManager> {
    device: Arc<D>,
    config: CacheConfig,
    next_txn: AtomicU64,
    state: Arc<Mutex<CacheState>>,
}

impl<D: SegmentManager> fmt::Debug for Cache<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("config", &self.config)
            .field("next_txn", &self.next_txn.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<D: SegmentManager> Cache<D> {
    #[must_use]
    pub fn new(device: Arc<D>, config: CacheConfig) -> Self {
        Self {
            device,
            config,
            next_txn: AtomicU64::new(1),
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Install a zeroed resident root.
    pub fn init(&self) {
        let mut state = self.state.lock();
        if let Some(old) = state.root.replace(Arc::new(CachedExtent::new_root())) {
            debug!(target: "lss::cache", root = %old, "root_replaced_on_init");
        }
        info!(target: "lss::cache", extents = state.index.len(), "cache_init");
    }

    /// Drop the index, dirty map and root. The cache may be `init`-ed again.
    pub fn close(&self) {
        let mut state = self.state.lock();
        let extents = state.index.len();
        let dirty = state.index.dirty_len();
        state.index.clear();
        state.root = None;
        info!(target: "lss::cache", extents, dirty, "cache_closed");
    }

    #[must_use]
    pub fn create_transaction(&self) -> Transaction {
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed));
        trace!(target: "lss::cache", txn = id.0, "txn_created");
        Transaction::new(id)
    }

    /// Cached extent at `addr`, filling it from disk on a miss.
    pub fn fetch_extent<T: ExtentKind>(&self, addr: Paddr, len: ExtentLen) -> Result<ExtentRef> {
        self.lookup_or_fill(T::TYPE, addr, len, None)
    }

    /// Like [`fetch_extent`](Self::fetch_extent), and if this call performs
    /// the disk fill, reject content whose checksum is not `expected`.
    pub fn fetch_extent_verified<T: ExtentKind>(
        &self,
        addr: Paddr,
        len: ExtentLen,
        expected: Checksum,
    ) -> Result<ExtentRef> {
        self.lookup_or_fill(T::TYPE, addr, len, Some(expected))
    }

    /// Untyped fetch, for callers that learn the type at runtime.
    pub fn get_extent_by_type(
        &self,
        ext_type: ExtentType,
        addr: Paddr,
        len: ExtentLen,
    ) -> Result<ExtentRef> {
        self.lookup_or_fill(ext_type, addr, len, None)
    }

    fn lookup_or_fill(
        &self,
        ext_type: ExtentType,
        addr: Paddr,
        len: ExtentLen,
        expected: Option<Checksum>,
    ) -> Result<ExtentRef> {
        assert!(
            !addr.is_relative() && !addr.is_null(),
            "cache lookup of unresolved address {addr}"
        );
        let (extent, fill) = {
            let mut state = self.state.lock();
            if let Some(hit) = state.index.find_offset(addr) {
                assert_eq!(hit.ext_type(), ext_type, "type mismatch for {hit}");
                assert_eq!(hit.len(), len, "length mismatch for {hit}");
                (Arc::clone(hit), false)
            } else {
                let pending = Arc::new(CachedExtent::new_pending_read(ext_type, addr, len));
                state.index.insert(Arc::clone(&pending));
                (pending, true)
            }
        };

        if !fill {
            trace!(target: "lss::cache", paddr = %addr, len, "extent_hit");
            extent.wait_io()?;
            return Ok(extent);
        }

        debug!(target: "lss::cache", paddr = %addr, len, ext_type = %ext_type, "extent_fill");
        let mut buf = vec![0_u8; len as usize];
        let outcome = self
            .device
            .read(addr, &mut buf)
            .and_then(|()| self.verify_fill(addr, &buf, expected));
        match outcome {
            Ok(()) => {
                extent.on_clean_read(buf);
                extent.complete_io();
                Ok(extent)
            }
            Err(err) => {
                let evicted = self.state.lock().index.erase(&extent);
                warn!(
                    target: "lss::cache",
                    paddr = %addr,
                    len,
                    evicted,
                    error = %err,
                    "extent_fill_failed"
                );
                extent.fail_io(&err);
                Err(err)
            }
        }
    }

    fn verify_fill(&self, addr: Paddr, buf: &[u8], expected: Option<Checksum>) -> Result<()> {
        let Some(expected) = expected.filter(|_| self.config.verify_checksums) else {
            return Ok(());
        };
        let actual = checksum(buf);
        if actual == expected {
            return Ok(());
        }
        Err(LssError::Corruption {
            segment: addr.segment.0,
            offset: i64::from(addr.offset),
            detail: format!("checksum {actual:#010x}, expected {expected:#010x}"),
        })
    }

    /// Transaction-aware lookup: local view first, then the cache.
    pub fn get_extent<T: ExtentKind>(
        &self,
        t: &mut Transaction,
        addr: Paddr,
        len: ExtentLen,
    ) -> Result<ExtentRef> {
        if let Some(local) = t.get_extent(addr) {
            assert_eq!(local.ext_type(), T::TYPE, "type mismatch for {local}");
            trace!(target: "lss::cache", txn = t.id().0, paddr = %addr, "extent_local_hit");
            return Ok(local);
        }
        assert!(
            !addr.is_relative(),
            "txn {}: placeholder {addr} is not part of this transaction",
            t.id()
        );
        let extent = self.fetch_extent::<T>(addr, len)?;
        t.add_to_read_set(Arc::clone(&extent));
        Ok(extent)
    }

    /// Fetch each `(addr, len)` in order, stopping at the first failure.
    ///
    /// Members before the failure stay in the read set.
    pub fn get_extents<T: ExtentKind>(
        &self,
        t: &mut Transaction,
        list: &[(Paddr, ExtentLen)],
    ) -> Result<Vec<ExtentRef>> {
        list.iter()
            .map(|&(addr, len)| self.get_extent::<T>(t, addr, len))
            .collect()
    }

    /// Zeroed extent staged as fresh in `t`.
    pub fn alloc_new_extent<T: ExtentKind>(&self, t: &mut Transaction, len: ExtentLen) -> ExtentRef {
        assert!(len > 0, "zero-length extent");
        let extent = Arc::new(CachedExtent::new_fresh(T::TYPE, len));
        t.add_fresh_extent(Arc::clone(&extent));
        debug!(
            target: "lss::cache",
            txn = t.id().0,
            placeholder = %extent.paddr(),
            len,
            ext_type = %T::TYPE,
            "extent_allocated"
        );
        extent
    }

    /// Writable version of `extent` private to `t`.
    pub fn duplicate_for_write(&self, t: &mut Transaction, extent: &ExtentRef) -> ExtentRef {
        if extent.is_pending() {
            let own = if extent.ext_type() == ExtentType::Root {
                t.root().is_some_and(|r| Arc::ptr_eq(r, extent))
            } else {
                t.get_extent(extent.paddr())
                    .is_some_and(|local| Arc::ptr_eq(&local, extent))
            };
            assert!(own, "txn {}: pending {extent} belongs to another transaction", t.id());
            return Arc::clone(extent);
        }

        if extent.ext_type() == ExtentType::Root {
            if let Some(root) = t.root() {
                return Arc::clone(root);
            }
            let dup = Arc::new(extent.duplicate_for_write());
            t.observe_root(Arc::clone(extent));
            t.set_root(Arc::clone(&dup));
            debug!(target: "lss::cache", txn = t.id().0, version = dup.version(), "root_duplicated");
            return dup;
        }

        if let Some(local) = t.get_extent(extent.paddr()).filter(|e| e.is_pending()) {
            return local;
        }
        let dup = Arc::new(extent.duplicate_for_write());
        t.add_to_read_set(Arc::clone(extent));
        t.add_mutated_extent(Arc::clone(&dup));
        debug!(
            target: "lss::cache",
            txn = t.id().0,
            paddr = %dup.paddr(),
            version = dup.version(),
            "extent_duplicated"
        );
        dup
    }

    pub fn retire_extent(&self, t: &mut Transaction, extent: &ExtentRef) {
        debug!(target: "lss::cache", txn = t.id().0, paddr = %extent.paddr(), "extent_retire");
        t.add_to_retired_set(Arc::clone(extent));
    }

    /// Retire whatever is resident at `addr`; never reads the disk.
    ///
    /// Returns whether an extent was found.
    pub fn retire_extent_if_cached(&self, t: &mut Transaction, addr: Paddr) -> Result<bool> {
        if let Some(local) = t.get_extent(addr) {
            self.retire_extent(t, &local);
            return Ok(true);
        }
        let resident = self.state.lock().index.find_offset(addr).cloned();
        let Some(extent) = resident else {
            trace!(target: "lss::cache", txn = t.id().0, paddr = %addr, "retire_not_cached");
            return Ok(false);
        };
        extent.wait_io()?;
        t.add_to_read_set(Arc::clone(&extent));
        self.retire_extent(t, &extent);
        Ok(true)
    }

    /// Root as seen by `t`: its pending duplicate, else the resident root.
    pub fn get_root(&self, t: &mut Transaction) -> Result<ExtentRef> {
        if let Some(root) = t.root() {
            return Ok(Arc::clone(root));
        }
        let resident = self.state.lock().root.clone().ok_or(LssError::Closed)?;
        resident.wait_io()?;
        t.observe_root(Arc::clone(&resident));
        Ok(resident)
    }

    /// Stage a zeroed root covering the whole block in `t`.
    pub fn mkfs(&self, t: &mut Transaction) -> Result<()> {
        let root = self.get_root(t)?;
        let dup = self.duplicate_for_write(t, &root);
        dup.write_bytes(0, &[0_u8; ROOT_BLOCK_SIZE as usize]);
        info!(target: "lss::cache", txn = t.id().0, "mkfs_staged");
        Ok(())
    }

    /// Validate `t` against the index and, if it still holds, merge it.
    ///
    /// `None` means a concurrent commit invalidated something `t` observed;
    /// the cache is unchanged and `t` must be discarded.
    pub fn try_construct_record(&self, t: &mut Transaction) -> Option<Record> {
        assert_eq!(
            t.stage(),
            TransactionStage::Constructing,
            "txn {} constructed twice",
            t.id()
        );
        let mut state = self.state.lock();

        if let Some(stale) = t.read_set().find(|seen| {
            !seen.is_valid()
                || !state
                    .index
                    .find_offset(seen.paddr())
                    .is_some_and(|live| Arc::ptr_eq(live, seen))
        }) {
            warn!(target: "lss::cache", txn = t.id().0, extent = %stale, "txn_conflict");
            return None;
        }
        if let Some(observed) = t.observed_root() {
            if !state.root.as_ref().is_some_and(|r| Arc::ptr_eq(r, observed)) {
                warn!(target: "lss::cache", txn = t.id().0, "txn_conflict_root");
                return None;
            }
        }

        let retired: Vec<ExtentRef> = t.retired_set().cloned().collect();
        for extent in retired {
            let prior = extent.state();
            state.index.erase(&extent);
            extent.set_state(ExtentState::Invalid);
            t.record_displaced(extent, prior);
        }

        let mut builder = RecordBuilder::new();
        for fresh in t.fresh_block_list() {
            if fresh.is_valid() {
                fresh.set_io_pending();
            }
            builder.push_fresh(fresh);
        }

        let mutated: Vec<ExtentRef> = t.mutated_block_list().to_vec();
        for dup in mutated.iter().filter(|d| d.is_valid()) {
            let original = t
                .read_set_entry(dup.paddr())
                .cloned()
                .unwrap_or_else(|| panic!("txn {}: duplicate {dup} without original", t.id()));
            let prior = original.state();
            state.index.replace(&original, Arc::clone(dup));
            original.set_state(ExtentState::Invalid);
            t.record_displaced(original, prior);
            dup.set_io_pending();
            builder.push_delta(seal_delta(dup));
        }

        if let Some(root) = t.root().cloned() {
            let previous = state.root.replace(Arc::clone(&root));
            if let Some(previous) = &previous {
                previous.set_state(ExtentState::Invalid);
            }
            t.set_displaced_root(previous);
            root.set_io_pending();
            builder.push_delta(seal_delta(&root));
        }

        t.set_merged_into(Arc::downgrade(&self.state));
        t.set_stage(TransactionStage::Validated);
        drop(state);

        let record = builder.finish();
        debug!(
            target: "lss::cache",
            txn = t.id().0,
            fresh = record.extents.len(),
            deltas = record.deltas.len(),
            data_len = record.data_len(),
            "record_constructed"
        );
        Some(record)
    }

    /// Finish `t` once its record is durable at `base`.
    pub fn complete_commit(&self, mut t: Transaction, base: Paddr) {
        assert_eq!(
            t.stage(),
            TransactionStage::Validated,
            "txn {} completed without validation",
            t.id()
        );
        assert!(!base.is_relative(), "record base {base} is relative");

        let lengths: Vec<ExtentLen> = t.fresh_block_list().iter().map(|e| e.len()).collect();
        let offsets = fresh_offsets(&lengths);
        {
            let mut state = self.state.lock();
            for (fresh, offset) in t.fresh_block_list().iter().zip(offsets) {
                fresh.complete_initial_write(base.add_offset(offset));
                if fresh.is_valid() {
                    state.index.insert(Arc::clone(fresh));
                }
            }
            for dup in t.mutated_block_list().iter().filter(|d| d.is_valid()) {
                dup.delta_written(base);
                state.index.mark_dirty(dup);
            }
            if let Some(root) = t.root() {
                root.delta_written(base);
            }
            t.set_stage(TransactionStage::Completed);
        }

        for extent in t.io_pending_extents() {
            extent.complete_io();
        }
        debug!(target: "lss::cache", txn = t.id().0, %base, "txn_completed");
    }

    /// Undo the merge of `t` after its record failed to append.
    ///
    /// Displaced extents are reinstated where their address is still free,
    /// and every waiter on `t`'s extents sees `error`.
    pub fn fail_commit(&self, mut t: Transaction, error: &LssError) {
        assert_eq!(
            t.stage(),
            TransactionStage::Validated,
            "txn {} failed without validation",
            t.id()
        );
        t.unwind(error);
        error!(target: "lss::cache", txn = t.id().0, error = %error, "txn_append_failed");
    }

    /// Apply one logged delta during mount. Single-threaded.
    ///
    /// Deltas older than the extent's version are skipped, so replaying a
    /// log twice is harmless.
    pub fn replay_delta(&self, base: Paddr, delta: &DeltaInfo) -> Result<()> {
        if delta.ext_type == ExtentType::Root {
            let root = self.state.lock().root.clone().ok_or(LssError::Closed)?;
            apply_logged_delta(&root, base, delta)?;
            return Ok(());
        }
        let extent = self.get_extent_by_type(delta.ext_type, delta.paddr, delta.length)?;
        if apply_logged_delta(&extent, base, delta)? {
            if extent.ext_type().is_logical() {
                extent.set_laddr_unchecked(delta.laddr);
            }
            self.state.lock().index.mark_dirty(&extent);
        }
        Ok(())
    }

    /// Call `f` once per dirty extent in address order.
    pub fn init_cached_extents<F>(&self, t: &mut Transaction, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Transaction, &ExtentRef) -> Result<()>,
    {
        let dirty: Vec<ExtentRef> = self.state.lock().index.dirty_iter().cloned().collect();
        debug!(target: "lss::cache", txn = t.id().0, dirty = dirty.len(), "init_cached_extents");
        for extent in &dirty {
            f(t, extent)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn summary(&self) -> CacheSummary {
        let state = self.state.lock();
        let mut summary = CacheSummary {
            extents: state.index.len(),
            dirty: state.index.dirty_len(),
            root_version: state.root.as_ref().map(|r| r.version()),
            ..CacheSummary::default()
        };
        for extent in state.index.iter() {
            *summary
                .by_state
                .entry(extent.state().to_string())
                .or_default() += 1;
            summary.bytes += u64::from(extent.len());
            if extent.is_io_pending() {
                summary.io_pending += 1;
            }
        }
        summary
    }
}

impl<D: SegmentManager> fmt::Display for Cache<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        writeln!(
            f,
            "cache: {} extents, {} dirty",
            state.index.len(),
            state.index.dirty_len()
        )?;
        match &state.root {
            Some(root) => writeln!(f, "  root {root}")?,
            None => writeln!(f, "  root <none>")?,
        }
        for extent in state.index.iter() {
            writeln!(f, "  {extent}")?;
        }
        Ok(())
    }
}

/// Build the logged delta of a mutated extent and advance its committed
/// checksum.
fn seal_delta(extent: &ExtentRef) -> DeltaInfo {
    let final_crc = extent.crc();
    let delta = DeltaInfo {
        ext_type: extent.ext_type(),
        paddr: extent.paddr(),
        laddr: if extent.ext_type().is_logical() {
            extent.laddr()
        } else {
            Laddr::NULL
        },
        prev_crc: extent.last_committed_crc(),
        final_crc,
        length: extent.len(),
        pversion: extent.version() - 1,
        bytes: extent.get_delta(),
    };
    extent.set_last_committed_crc(final_crc);
    delta
}

/// Returns `false` when the delta is already reflected in `extent`.
fn apply_logged_delta(extent: &CachedExtent, base: Paddr, delta: &DeltaInfo) -> Result<bool> {
    let corrupt = |detail: String| LssError::Corruption {
        segment: delta.paddr.segment.0,
        offset: i64::from(delta.paddr.offset),
        detail,
    };
    let version = extent.version();
    if delta.pversion < version {
        debug!(
            target: "lss::cache",
            paddr = %delta.paddr,
            pversion = delta.pversion,
            version,
            "replay_delta_skipped"
        );
        return Ok(false);
    }
    if delta.pversion > version {
        return Err(corrupt(format!(
            "delta from record {base} applies to version {}, extent is at {version}",
            delta.pversion
        )));
    }
    let before = extent.last_committed_crc();
    if before != delta.prev_crc {
        return Err(corrupt(format!(
            "delta from record {base} expects checksum {:#010x}, extent has {before:#010x}",
            delta.prev_crc
        )));
    }
    extent.apply_delta(base, &delta.bytes)?;
    let after = extent.last_committed_crc();
    if after != delta.final_crc {
        return Err(corrupt(format!(
            "delta from record {base} produced checksum {after:#010x}, logged {:#010x}",
            delta.final_crc
        )));
    }
    debug!(
        target: "lss::cache",
        %base,
        paddr = %delta.paddr,
        version = extent.version(),
        "replay_delta_applied"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{RootBlock, TestBlock, TestBlockPhysical};
    use lss_block::{SegmentGeometry, SegmentedDevice};
    use lss_types::SegmentId;

    type MemCache = Cache<SegmentedDevice<lss_block::MemoryByteDevice>>;

    fn cache() -> MemCache {
        let dev = SegmentedDevice::ephemeral(SegmentGeometry::default_test()).expect("device");
        let cache = Cache::new(Arc::new(dev), CacheConfig::default());
        cache.init();
        cache
    }

    /// Complete `t` at a fake base without touching the device.
    fn commit_at(cache: &MemCache, mut t: Transaction, base: Paddr) -> Record {
        let record = cache.try_construct_record(&mut t).expect("validated");
        cache.complete_commit(t, base);
        record
    }

    #[test]
    fn alloc_then_lookup_returns_same_object() {
        let cache = cache();
        let mut t = cache.create_transaction();
        let ext = cache.alloc_new_extent::<TestBlock>(&mut t, 4096);
        ext.fill(0x5A);
        let again = cache
            .get_extent::<TestBlock>(&mut t, ext.paddr(), 4096)
            .expect("local");
        assert!(Arc::ptr_eq(&ext, &again));
        assert_eq!(again.to_vec(), vec![0x5A; 4096]);
    }

    #[test]
    fn complete_commit_resolves_addresses_in_record_order() {
        let cache = cache();
        let mut t = cache.create_transaction();
        let a = cache.alloc_new_extent::<TestBlock>(&mut t, 4096);
        let b = cache.alloc_new_extent::<TestBlockPhysical>(&mut t, 8192);
        a.fill(1);
        b.fill(2);
        let base = Paddr::new(SegmentId(3), 8192);
        let record = commit_at(&cache, t, base);

        assert_eq!(record.extents[0].bytes, vec![1; 4096]);
        assert_eq!(record.extents[1].bytes, vec![2; 8192]);
        assert_eq!(a.paddr(), base);
        assert_eq!(b.paddr(), Paddr::new(SegmentId(3), 12288));
        assert!(a.is_clean() && b.is_clean());
        let summary = cache.summary();
        assert_eq!(summary.extents, 2);
        assert_eq!(summary.dirty, 0);
        assert_eq!(summary.io_pending, 0);
    }

    #[test]
    fn mutation_commit_replaces_original_and_marks_dirty() {
        let cache = cache();
        let mut t = cache.create_transaction();
        let fresh = cache.alloc_new_extent::<TestBlock>(&mut t, 4096);
        commit_at(&cache, t, Paddr::new(SegmentId(1), 4096));

        let mut t = cache.create_transaction();
        let seen = cache
            .get_extent::<TestBlock>(&mut t, fresh.paddr(), 4096)
            .expect("hit");
        assert!(Arc::ptr_eq(&seen, &fresh));
        let dup = cache.duplicate_for_write(&mut t, &seen);
        dup.write_bytes(10, b"hello");
        let again = cache.duplicate_for_write(&mut t, &seen);
        assert!(Arc::ptr_eq(&dup, &again), "one duplicate per address");

        let record = commit_at(&cache, t, Paddr::new(SegmentId(1), 16384));
        assert_eq!(record.deltas.len(), 1);
        let delta = &record.deltas[0];
        assert_eq!(delta.pversion, 0);
        assert_eq!(delta.prev_crc, checksum(&[0; 4096]));
        assert_eq!(delta.final_crc, dup.crc());

        assert_eq!(fresh.state(), ExtentState::Invalid);
        assert!(dup.is_dirty());
        assert_eq!(dup.last_delta_base(), Some(Paddr::new(SegmentId(1), 16384)));
        assert_eq!(cache.summary().dirty, 1);
    }

    #[test]
    fn stale_read_set_fails_validation_without_side_effects() {
        let cache = cache();
        let mut t = cache.create_transaction();
        let ext = cache.alloc_new_extent::<TestBlock>(&mut t, 4096);
        commit_at(&cache, t, Paddr::new(SegmentId(0), 4096));

        let mut reader = cache.create_transaction();
        let mut writer = cache.create_transaction();
        let seen = cache
            .get_extent::<TestBlock>(&mut reader, ext.paddr(), 4096)
            .expect("read");
        let victim_addr = Paddr::new(SegmentId(0), 8192);
        let mut setup = cache.create_transaction();
        let victim = cache.alloc_new_extent::<TestBlock>(&mut setup, 4096);
        commit_at(&cache, setup, victim_addr);
        cache.retire_extent_if_cached(&mut reader, victim_addr).expect("retire");

        let dup = cache.duplicate_for_write(&mut writer, &seen);
        dup.fill(7);
        commit_at(&cache, writer, Paddr::new(SegmentId(0), 12288));

        assert!(cache.try_construct_record(&mut reader).is_none());
        assert_eq!(reader.stage(), TransactionStage::Constructing);
        assert!(victim.is_clean(), "retirement not applied");
        let live = cache
            .fetch_extent::<TestBlock>(victim_addr, 4096)
            .expect("still indexed");
        assert!(Arc::ptr_eq(&live, &victim));
    }

    #[test]
    fn root_mutations_conflict_by_identity() {
        let cache = cache();
        let mut a = cache.create_transaction();
        let mut b = cache.create_transaction();
        let root_a = cache.get_root(&mut a).expect("root");
        let root_b = cache.get_root(&mut b).expect("root");
        cache.duplicate_for_write(&mut a, &root_a).write_bytes(0, b"A");
        cache.duplicate_for_write(&mut b, &root_b).write_bytes(0, b"B");

        let record = commit_at(&cache, a, Paddr::new(SegmentId(0), 4096));
        assert_eq!(record.deltas.last().map(|d| d.ext_type), Some(ExtentType::Root));
        assert!(cache.try_construct_record(&mut b).is_none());

        let mut c = cache.create_transaction();
        let root = cache.get_root(&mut c).expect("root");
        assert!(root.with_bytes(|b| b.starts_with(b"A")));
        assert_eq!(root.version(), 1);
    }

    #[test]
    fn mkfs_stages_full_block_root_delta() {
        let cache = cache();
        let mut t = cache.create_transaction();
        cache.mkfs(&mut t).expect("mkfs");
        let record = cache.try_construct_record(&mut t).expect("valid");
        assert_eq!(record.deltas.len(), 1);
        let delta = &record.deltas[0];
        assert_eq!(delta.ext_type, ExtentType::Root);
        assert_eq!(delta.length, ROOT_BLOCK_SIZE);
        let patches = crate::delta::decode(&delta.bytes).expect("decode");
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].bytes.len(), ROOT_BLOCK_SIZE as usize);
        cache.complete_commit(t, Paddr::new(SegmentId(0), 4096));
    }

    #[test]
    fn fail_commit_reinstates_displaced_extents() {
        let cache = cache();
        let mut t = cache.create_transaction();
        let ext = cache.alloc_new_extent::<TestBlock>(&mut t, 4096);
        commit_at(&cache, t, Paddr::new(SegmentId(0), 4096));

        let mut t = cache.create_transaction();
        let seen = cache
            .get_extent::<TestBlock>(&mut t, ext.paddr(), 4096)
            .expect("read");
        let dup = cache.duplicate_for_write(&mut t, &seen);
        dup.fill(9);
        let root = cache.get_root(&mut t).expect("root");
        let new_root = cache.duplicate_for_write(&mut t, &root);
        let fresh = cache.alloc_new_extent::<TestBlock>(&mut t, 4096);
        cache.try_construct_record(&mut t).expect("valid");
        assert!(dup.is_io_pending());

        cache.fail_commit(t, &LssError::NoSpace);
        assert!(dup.wait_io().is_err());
        assert!(new_root.wait_io().is_err());
        assert!(fresh.wait_io().is_err());
        assert!(ext.is_clean());
        let live = cache
            .fetch_extent::<TestBlock>(ext.paddr(), 4096)
            .expect("reinstated");
        assert!(Arc::ptr_eq(&live, &ext));

        let mut again = cache.create_transaction();
        let resident = cache.get_root(&mut again).expect("root");
        assert!(Arc::ptr_eq(&resident, &root));
    }

    #[test]
    fn retire_then_duplicate_panics_before_touching_the_index() {
        let cache = cache();
        let mut t = cache.create_transaction();
        let ext = cache.alloc_new_extent::<TestBlock>(&mut t, 4096);
        commit_at(&cache, t, Paddr::new(SegmentId(1), 4096));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut t = cache.create_transaction();
            let seen = cache
                .get_extent::<TestBlock>(&mut t, ext.paddr(), 4096)
                .expect("read");
            cache.retire_extent(&mut t, &seen);
            cache.duplicate_for_write(&mut t, &seen);
        }));
        let msg = outcome.expect_err("caller error").downcast::<String>().expect("message");
        assert!(msg.contains("both mutated and retired"), "{msg}");

        assert!(ext.is_clean());
        assert_eq!(cache.summary().extents, 1);
        let live = cache
            .fetch_extent::<TestBlock>(ext.paddr(), 4096)
            .expect("still indexed");
        assert!(Arc::ptr_eq(&live, &ext));
    }

    #[test]
    fn dropping_validated_transaction_unwinds_merge() {
        let cache = cache();
        let mut t = cache.create_transaction();
        let ext = cache.alloc_new_extent::<TestBlock>(&mut t, 4096);
        ext.fill(3);
        commit_at(&cache, t, Paddr::new(SegmentId(1), 4096));

        let mut t = cache.create_transaction();
        let seen = cache
            .get_extent::<TestBlock>(&mut t, ext.paddr(), 4096)
            .expect("read");
        let dup = cache.duplicate_for_write(&mut t, &seen);
        dup.fill(4);
        let root = cache.get_root(&mut t).expect("root");
        cache.duplicate_for_write(&mut t, &root).write_bytes(0, b"lost");
        cache.try_construct_record(&mut t).expect("valid");
        drop(t);

        assert!(dup.wait_io().is_err());
        assert!(!dup.is_valid());
        for _ in 0..3 {
            let live = cache
                .fetch_extent::<TestBlock>(ext.paddr(), 4096)
                .expect("original reinstated");
            assert!(Arc::ptr_eq(&live, &ext));
            assert_eq!(live.to_vec(), vec![3; 4096]);
        }
        let summary = cache.summary();
        assert_eq!(summary.by_state.get("MUTATION_PENDING"), None);
        assert_eq!(summary.io_pending, 0);

        let mut t = cache.create_transaction();
        let resident = cache.get_root(&mut t).expect("root");
        assert!(Arc::ptr_eq(&resident, &root));
        let seen = cache
            .get_extent::<TestBlock>(&mut t, ext.paddr(), 4096)
            .expect("read");
        cache.duplicate_for_write(&mut t, &seen).fill(5);
        commit_at(&cache, t, Paddr::new(SegmentId(1), 8192));
        assert_eq!(cache.summary().dirty, 1);
    }

    #[test]
    fn replay_skips_already_applied_deltas() {
        let cache = cache();
        let mut t = cache.create_transaction();
        let root = cache.get_root(&mut t).expect("root");
        let dup = cache.duplicate_for_write(&mut t, &root);
        dup.write_bytes(0, b"xyz");
        let record = commit_at(&cache, t, Paddr::new(SegmentId(0), 4096));

        let other = self::cache();
        let base = Paddr::new(SegmentId(0), 4096);
        other.replay_delta(base, &record.deltas[0]).expect("apply");
        other.replay_delta(base, &record.deltas[0]).expect("no-op");
        let mut t = other.create_transaction();
        let replayed = other.get_root(&mut t).expect("root");
        assert_eq!(replayed.to_vec(), dup.to_vec());
        assert_eq!(replayed.version(), 1);
    }

    #[test]
    fn replay_gap_is_corruption() {
        let cache = cache();
        let mut delta = DeltaInfo {
            ext_type: ExtentType::Root,
            paddr: Paddr::NULL,
            laddr: Laddr::NULL,
            prev_crc: checksum(&[0; ROOT_BLOCK_SIZE as usize]),
            final_crc: 0,
            length: ROOT_BLOCK_SIZE,
            pversion: 3,
            bytes: vec![],
        };
        let err = cache
            .replay_delta(Paddr::new(SegmentId(0), 4096), &delta)
            .expect_err("gap");
        assert!(matches!(err, LssError::Corruption { .. }), "{err:?}");

        delta.pversion = 0;
        delta.prev_crc ^= 1;
        let err = cache
            .replay_delta(Paddr::new(SegmentId(0), 4096), &delta)
            .expect_err("crc");
        assert!(err.to_string().contains("expects checksum"));
    }

    #[test]
    fn summary_serializes_and_display_lists_extents() {
        let cache = cache();
        let mut t = cache.create_transaction();
        cache.alloc_new_extent::<TestBlock>(&mut t, 4096);
        commit_at(&cache, t, Paddr::new(SegmentId(2), 4096));
        let json = serde_json::to_string(&cache.summary()).expect("json");
        assert!(json.contains("\"extents\":1"));
        assert!(json.contains("CLEAN"));
        let dump = cache.to_string();
        assert!(dump.contains("1 extents"));
        assert!(dump.contains("paddr<2, 4096>"));
    }

    #[test]
    fn close_then_init_starts_empty() {
        let cache = cache();
        let mut t = cache.create_transaction();
        cache.alloc_new_extent::<TestBlock>(&mut t, 4096);
        commit_at(&cache, t, Paddr::new(SegmentId(2), 4096));
        cache.close();
        let mut t = cache.create_transaction();
        assert!(matches!(cache.get_root(&mut t), Err(LssError::Closed)));
        cache.init();
        assert_eq!(cache.summary().extents, 0);
        let root = cache.get_root(&mut t).expect("root");
        assert_eq!(root.ext_type(), <RootBlock as ExtentKind>::TYPE);
    }
}
