#![forbid(unsafe_code)]
//! Transactional extent cache.
//!
//! The cache mediates every read and write of physical extents between the
//! in-memory working set and the append-only log. Each logical operation
//! runs in its own [`Transaction`]; reads go through the transaction, then
//! the shared [`ExtentIndex`], then the device. Writes are staged as fresh
//! extents or copy-on-write duplicates inside the transaction.
//!
//! Commit is optimistic: [`Cache::try_construct_record`] re-checks, under
//! the cache's single mutex, that every extent the transaction observed is
//! still the live entry at its address, then merges the write set into the
//! index and returns the [`Record`](lss_types::Record) to append. Once the
//! log reports the record durable, [`Cache::complete_commit`] resolves the
//! placeholder addresses of fresh extents and releases waiters.
//!
//! Lock order: cache mutex, then extent state, then extent I/O latch. No
//! thread waits on an I/O latch while holding the cache mutex.

pub mod cache;
pub mod delta;
pub mod extent;
pub mod index;
pub mod io;
pub mod record;
pub mod transaction;

pub use cache::{Cache, CacheConfig, CacheSummary};
pub use extent::{
    CachedExtent, ExtentKind, ExtentRef, ExtentState, LbaInternalNode, LbaLeafNode, OnodeBlock,
    RootBlock, TestBlock, TestBlockPhysical,
};
pub use index::ExtentIndex;
pub use transaction::{Transaction, TransactionStage};
