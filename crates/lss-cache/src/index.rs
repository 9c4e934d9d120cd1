//! Address-ordered index of live extents.

use crate::extent::{ExtentRef, ExtentState};
use lss_types::Paddr;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Maps each physical address to its one live extent.
///
/// The dirty map holds exactly the indexed extents in state DIRTY and is
/// updated in the same call as the state change.
#[derive(Debug, Default)]
pub struct ExtentIndex {
    extents: BTreeMap<Paddr, ExtentRef>,
    dirty: BTreeMap<Paddr, ExtentRef>,
}

impl ExtentIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn find_offset(&self, addr: Paddr) -> Option<&ExtentRef> {
        self.extents.get(&addr)
    }

    /// Add `extent` at its address. Panics if the address is occupied.
    pub fn insert(&mut self, extent: ExtentRef) {
        let addr = extent.paddr();
        assert!(
            !addr.is_relative() && !addr.is_null(),
            "cannot index unresolved {extent}"
        );
        if let Some(existing) = self.extents.get(&addr) {
            panic!("duplicate index entry at {addr}: live {existing}, inserting {extent}");
        }
        if extent.state() == ExtentState::Dirty {
            self.dirty.insert(addr, Arc::clone(&extent));
        }
        self.extents.insert(addr, extent);
    }

    /// Remove `extent` if it is the entry at its address.
    ///
    /// Returns whether anything was removed.
    pub fn erase(&mut self, extent: &ExtentRef) -> bool {
        let addr = extent.paddr();
        match self.extents.get(&addr) {
            Some(live) if Arc::ptr_eq(live, extent) => {
                self.extents.remove(&addr);
                self.dirty.remove(&addr);
                true
            }
            _ => false,
        }
    }

    /// Supersede `old` with `new` at the same address.
    pub fn replace(&mut self, old: &ExtentRef, new: ExtentRef) {
        let addr = old.paddr();
        assert_eq!(addr, new.paddr(), "replace across addresses: {old} -> {new}");
        let live = self
            .extents
            .get(&addr)
            .unwrap_or_else(|| panic!("replace of unindexed {old}"));
        assert!(Arc::ptr_eq(live, old), "replace of stale {old}, live {live}");
        self.dirty.remove(&addr);
        if new.state() == ExtentState::Dirty {
            self.dirty.insert(addr, Arc::clone(&new));
        }
        self.extents.insert(addr, new);
    }

    /// Transition an indexed extent to DIRTY and track it.
    pub fn mark_dirty(&mut self, extent: &ExtentRef) {
        let addr = extent.paddr();
        assert!(
            self.extents
                .get(&addr)
                .is_some_and(|live| Arc::ptr_eq(live, extent)),
            "mark_dirty of unindexed {extent}"
        );
        extent.set_state(ExtentState::Dirty);
        self.dirty.insert(addr, Arc::clone(extent));
    }

    pub fn clear(&mut self) {
        self.dirty.clear();
        self.extents.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    #[must_use]
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtentRef> {
        self.extents.values()
    }

    /// Dirty extents in address order.
    pub fn dirty_iter(&self) -> impl Iterator<Item = &ExtentRef> {
        self.dirty.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::CachedExtent;
    use lss_types::{ExtentType, SegmentId};

    fn clean(segment: u32, offset: i32) -> ExtentRef {
        let ext = CachedExtent::new_pending_read(
            ExtentType::TestBlock,
            Paddr::new(SegmentId(segment), offset),
            16,
        );
        ext.on_clean_read(vec![0; 16]);
        ext.complete_io();
        Arc::new(ext)
    }

    #[test]
    fn lookup_by_address() {
        let mut index = ExtentIndex::new();
        let a = clean(1, 0);
        let b = clean(0, 4096);
        index.insert(Arc::clone(&a));
        index.insert(Arc::clone(&b));
        assert_eq!(index.len(), 2);
        assert!(Arc::ptr_eq(
            index.find_offset(Paddr::new(SegmentId(1), 0)).expect("a"),
            &a
        ));
        assert!(index.find_offset(Paddr::new(SegmentId(1), 4096)).is_none());
        let order: Vec<Paddr> = index.iter().map(|e| e.paddr()).collect();
        assert_eq!(order, vec![b.paddr(), a.paddr()]);
    }

    #[test]
    #[should_panic(expected = "duplicate index entry")]
    fn duplicate_insert_panics() {
        let mut index = ExtentIndex::new();
        index.insert(clean(0, 0));
        index.insert(clean(0, 0));
    }

    #[test]
    fn erase_checks_identity() {
        let mut index = ExtentIndex::new();
        let live = clean(0, 0);
        let impostor = clean(0, 0);
        index.insert(Arc::clone(&live));
        assert!(!index.erase(&impostor));
        assert_eq!(index.len(), 1);
        assert!(index.erase(&live));
        assert!(index.is_empty());
        assert!(!index.erase(&live), "second erase is a no-op");
    }

    #[test]
    fn dirty_map_follows_state() {
        let mut index = ExtentIndex::new();
        let ext = clean(2, 0);
        index.insert(Arc::clone(&ext));
        assert_eq!(index.dirty_len(), 0);
        index.mark_dirty(&ext);
        assert!(ext.is_dirty());
        assert_eq!(index.dirty_len(), 1);

        let dup = Arc::new(ext.duplicate_for_write());
        index.replace(&ext, Arc::clone(&dup));
        assert_eq!(index.dirty_len(), 0, "pending duplicate is not dirty");
        dup.delta_written(Paddr::new(SegmentId(0), 4096));
        index.mark_dirty(&dup);
        assert!(Arc::ptr_eq(index.dirty_iter().next().expect("dirty"), &dup));

        assert!(index.erase(&dup));
        assert_eq!(index.dirty_len(), 0);
    }
}
