//! Per-operation working set.

use crate::cache::CacheState;
use crate::extent::{ExtentRef, ExtentState};
use lss_error::LssError;
use lss_types::{ExtentType, Paddr, SegmentOffset, TxnId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStage {
    /// Reads and writes are being staged.
    Constructing,
    /// Merged into the index; the record is being appended.
    Validated,
    /// Durable (or failed) and released.
    Completed,
}

/// Isolated view of the cache for one logical operation.
///
/// Lookups consult the write set (fresh extents by placeholder, duplicates
/// by address) and then the read set. Nothing here is visible to other
/// transactions until [`Cache::try_construct_record`] merges it.
///
/// [`Cache::try_construct_record`]: crate::Cache::try_construct_record
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    stage: TransactionStage,
    read_set: BTreeMap<Paddr, ExtentRef>,
    write_set: BTreeMap<Paddr, ExtentRef>,
    fresh: Vec<ExtentRef>,
    mutated: Vec<ExtentRef>,
    retired: BTreeMap<Paddr, ExtentRef>,
    root: Option<ExtentRef>,
    observed_root: Option<ExtentRef>,
    offset: SegmentOffset,
    // Filled at merge so a failed append can reinstate what it displaced.
    displaced: Vec<(ExtentRef, ExtentState)>,
    displaced_root: Option<ExtentRef>,
    merged_into: Option<Weak<Mutex<CacheState>>>,
}

impl Transaction {
    pub(crate) fn new(id: TxnId) -> Self {
        Self {
            id,
            stage: TransactionStage::Constructing,
            read_set: BTreeMap::new(),
            write_set: BTreeMap::new(),
            fresh: Vec::new(),
            mutated: Vec::new(),
            retired: BTreeMap::new(),
            root: None,
            observed_root: None,
            offset: 0,
            displaced: Vec::new(),
            displaced_root: None,
            merged_into: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub fn stage(&self) -> TransactionStage {
        self.stage
    }

    /// Extent this transaction already knows at `addr`. Never blocks.
    #[must_use]
    pub fn get_extent(&self, addr: Paddr) -> Option<ExtentRef> {
        self.write_set
            .get(&addr)
            .or_else(|| self.read_set.get(&addr))
            .cloned()
    }

    /// Record that this transaction observed `extent`.
    pub fn add_to_read_set(&mut self, extent: ExtentRef) {
        self.assert_constructing();
        assert!(
            !extent.is_pending(),
            "txn {}: pending {extent} cannot be observed",
            self.id
        );
        let addr = extent.paddr();
        if let Some(seen) = self.read_set.get(&addr) {
            assert!(
                Arc::ptr_eq(seen, &extent),
                "txn {}: observed two extents at {addr}: {seen} and {extent}",
                self.id
            );
            return;
        }
        trace!(target: "lss::cache", txn = self.id.0, paddr = %addr, "read set add");
        self.read_set.insert(addr, extent);
    }

    /// Stage a freshly allocated extent under a record-relative placeholder.
    pub fn add_fresh_extent(&mut self, extent: ExtentRef) {
        self.assert_constructing();
        assert_eq!(
            extent.state(),
            ExtentState::InitialWritePending,
            "txn {}: fresh extent in wrong state",
            self.id
        );
        let placeholder = Paddr::record_relative(self.offset);
        self.offset = SegmentOffset::try_from(extent.len())
            .ok()
            .and_then(|len| self.offset.checked_add(len))
            .unwrap_or_else(|| panic!("txn {}: extent length overflows offset", self.id));
        extent.set_paddr(placeholder);
        self.write_set.insert(placeholder, Arc::clone(&extent));
        self.fresh.push(extent);
    }

    /// Stage a copy-on-write duplicate.
    pub fn add_mutated_extent(&mut self, extent: ExtentRef) {
        self.assert_constructing();
        assert_eq!(
            extent.state(),
            ExtentState::MutationPending,
            "txn {}: mutated extent in wrong state",
            self.id
        );
        let addr = extent.paddr();
        assert!(
            !self.retired.contains_key(&addr),
            "txn {}: {extent} cannot be both mutated and retired",
            self.id
        );
        if let Some(existing) = self.write_set.insert(addr, Arc::clone(&extent)) {
            panic!("txn {}: second duplicate at {addr}, already have {existing}", self.id);
        }
        self.mutated.push(extent);
    }

    /// Stage removal of `extent` at commit.
    ///
    /// A fresh extent of this transaction is invalidated on the spot but
    /// keeps its slot in the record.
    pub fn add_to_retired_set(&mut self, extent: ExtentRef) {
        self.assert_constructing();
        let addr = extent.paddr();
        match extent.state() {
            ExtentState::InitialWritePending => {
                assert!(
                    self.write_set
                        .get(&addr)
                        .is_some_and(|own| Arc::ptr_eq(own, &extent)),
                    "txn {}: retire of foreign fresh {extent}",
                    self.id
                );
                extent.set_state(ExtentState::Invalid);
                self.write_set.remove(&addr);
            }
            ExtentState::MutationPending => {
                panic!("txn {}: {extent} cannot be both mutated and retired", self.id);
            }
            _ => {
                assert!(
                    self.read_set
                        .get(&addr)
                        .is_some_and(|seen| Arc::ptr_eq(seen, &extent)),
                    "txn {}: retire of unobserved {extent}",
                    self.id
                );
                assert!(
                    !self.write_set.contains_key(&addr),
                    "txn {}: {extent} cannot be both mutated and retired",
                    self.id
                );
                self.retired.insert(addr, extent);
            }
        }
    }

    #[must_use]
    pub fn fresh_block_list(&self) -> &[ExtentRef] {
        &self.fresh
    }

    #[must_use]
    pub fn mutated_block_list(&self) -> &[ExtentRef] {
        &self.mutated
    }

    pub fn retired_set(&self) -> impl Iterator<Item = &ExtentRef> {
        self.retired.values()
    }

    #[must_use]
    pub fn read_set_len(&self) -> usize {
        self.read_set.len()
    }

    pub(crate) fn read_set(&self) -> impl Iterator<Item = &ExtentRef> {
        self.read_set.values()
    }

    pub(crate) fn read_set_entry(&self, addr: Paddr) -> Option<&ExtentRef> {
        self.read_set.get(&addr)
    }

    /// Pending root duplicate, if this transaction is mutating the root.
    #[must_use]
    pub fn root(&self) -> Option<&ExtentRef> {
        self.root.as_ref()
    }

    pub(crate) fn set_root(&mut self, root: ExtentRef) {
        self.assert_constructing();
        assert_eq!(root.ext_type(), ExtentType::Root);
        assert!(self.root.is_none(), "txn {}: root duplicated twice", self.id);
        self.root = Some(root);
    }

    /// Remember the first resident root seen; later sightings are ignored so
    /// a root swap in between fails validation.
    pub(crate) fn observe_root(&mut self, root: ExtentRef) {
        self.observed_root.get_or_insert(root);
    }

    pub(crate) fn observed_root(&self) -> Option<&ExtentRef> {
        self.observed_root.as_ref()
    }

    pub(crate) fn set_stage(&mut self, stage: TransactionStage) {
        self.stage = stage;
    }

    pub(crate) fn record_displaced(&mut self, extent: ExtentRef, prior: ExtentState) {
        self.displaced.push((extent, prior));
    }

    pub(crate) fn take_displaced(&mut self) -> Vec<(ExtentRef, ExtentState)> {
        std::mem::take(&mut self.displaced)
    }

    pub(crate) fn set_displaced_root(&mut self, root: Option<ExtentRef>) {
        self.displaced_root = root;
    }

    pub(crate) fn take_displaced_root(&mut self) -> Option<ExtentRef> {
        self.displaced_root.take()
    }

    pub(crate) fn set_merged_into(&mut self, state: Weak<Mutex<CacheState>>) {
        self.merged_into = Some(state);
    }

    /// Undo the merge and release every waiter with `error`.
    pub(crate) fn unwind(&mut self, error: &LssError) {
        let waiters: Vec<ExtentRef> = self.io_pending_extents().cloned().collect();
        if let Some(state) = self.merged_into.take().and_then(|w| w.upgrade()) {
            state.lock().unwind_merge(self);
        }
        self.stage = TransactionStage::Completed;
        for fresh in &self.fresh {
            fresh.set_state(ExtentState::Invalid);
        }
        for extent in &waiters {
            extent.fail_io(error);
        }
    }

    /// Extents whose I/O latch this transaction armed at merge.
    pub(crate) fn io_pending_extents(&self) -> impl Iterator<Item = &ExtentRef> {
        self.fresh
            .iter()
            .chain(self.mutated.iter())
            .filter(|e| e.is_valid())
            .chain(self.root.iter())
    }

    fn assert_constructing(&self) {
        assert_eq!(
            self.stage,
            TransactionStage::Constructing,
            "txn {} is no longer under construction",
            self.id
        );
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "txn(id={}, stage={:?}, read={}, fresh={}, mutated={}, retired={}, root={})",
            self.id,
            self.stage,
            self.read_set.len(),
            self.fresh.len(),
            self.mutated.len(),
            self.retired.len(),
            self.root.is_some()
        )
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.stage != TransactionStage::Validated {
            return;
        }
        error!(
            target: "lss::cache",
            txn = self.id.0,
            "validated_txn_dropped"
        );
        let err = LssError::Io(std::io::Error::other(format!(
            "transaction {} dropped before completion",
            self.id
        )));
        self.unwind(&err);
    }
}
