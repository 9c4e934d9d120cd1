#![forbid(unsafe_code)]
//! Transaction manager for the log-structured store.
//!
//! Ties one [`Cache`] to one [`Journal`] over a shared segment manager:
//!
//! - `mkfs` writes an initial record holding a zeroed root.
//! - `mount` replays every logged delta into a cold cache and then offers
//!   each dirty extent to an optional [`ExtentObserver`].
//! - `submit_transaction` validates, appends, and completes a transaction,
//!   or reports [`LssError::Conflict`] so the caller can start over.

use lss_block::SegmentManager;
use lss_cache::{Cache, CacheConfig, ExtentKind, ExtentRef, Transaction};
use lss_error::{LssError, Result};
use lss_journal::{Journal, JournalOptions, ReplayReport, SegmentProvider, SequentialSegmentProvider};
use lss_types::{ExtentLen, Paddr};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionManagerConfig {
    pub journal: JournalOptions,
    pub cache: CacheConfig,
}

/// Hook run at mount for every extent left dirty by replay.
pub trait ExtentObserver: Send + Sync {
    fn init_cached_extent(&self, t: &mut Transaction, extent: &ExtentRef) -> Result<()>;
}

pub struct TransactionManager<D: SegmentManager> {
    provider: Arc<SequentialSegmentProvider>,
    journal: Journal<D>,
    cache: Cache<D>,
    observer: Option<Arc<dyn ExtentObserver>>,
    mounted: AtomicBool,
}

impl<D: SegmentManager> std::fmt::Debug for TransactionManager<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("journal", &self.journal)
            .field("cache", &self.cache)
            .field("mounted", &self.mounted.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<D: SegmentManager> TransactionManager<D> {
    #[must_use]
    pub fn new(device: Arc<D>, config: TransactionManagerConfig) -> Self {
        let provider = Arc::new(SequentialSegmentProvider::new(device.num_segments()));
        let journal = Journal::new(
            Arc::clone(&device),
            Arc::clone(&provider) as Arc<dyn SegmentProvider>,
            config.journal,
        );
        let cache = Cache::new(device, config.cache);
        Self {
            provider,
            journal,
            cache,
            observer: None,
            mounted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ExtentObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn cache(&self) -> &Cache<D> {
        &self.cache
    }

    #[must_use]
    pub fn journal(&self) -> &Journal<D> {
        &self.journal
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Write an empty store: one record carrying a zeroed root.
    pub fn mkfs(&self) -> Result<()> {
        if self.is_mounted() {
            return Err(LssError::InvalidArgument(
                "mkfs on a mounted store".to_owned(),
            ));
        }
        self.journal.open_for_write()?;
        self.cache.init();
        let mut t = self.cache.create_transaction();
        self.cache.mkfs(&mut t)?;
        let base = self.commit(t)?;
        self.journal.close()?;
        self.cache.close();
        info!(target: "lss::tm", %base, "mkfs_complete");
        Ok(())
    }

    /// Rebuild the cache from the journal and open it for new records.
    pub fn mount(&self) -> Result<ReplayReport> {
        if self.is_mounted() {
            return Err(LssError::InvalidArgument("store already mounted".to_owned()));
        }
        self.cache.init();
        let report = match self.replay_and_open() {
            Ok(report) => report,
            Err(err) => {
                warn!(target: "lss::tm", error = %err, "mount_failed");
                if let Err(close_err) = self.journal.close() {
                    warn!(target: "lss::tm", error = %close_err, "journal_close_failed");
                }
                self.cache.close();
                return Err(err);
            }
        };

        self.mounted.store(true, Ordering::Release);
        let summary = self.cache.summary();
        info!(
            target: "lss::tm",
            records = report.records,
            deltas = report.deltas,
            extents = summary.extents,
            dirty = summary.dirty,
            "mount_complete"
        );
        Ok(report)
    }

    fn replay_and_open(&self) -> Result<ReplayReport> {
        let report = self
            .journal
            .replay(|base, delta| self.cache.replay_delta(base, delta))?;
        if let Some(last) = report.last_segment {
            self.provider.advance_past(last);
        }
        self.journal.open_for_write()?;

        let mut t = self.cache.create_transaction();
        if let Some(observer) = &self.observer {
            self.cache
                .init_cached_extents(&mut t, |t, extent| observer.init_cached_extent(t, extent))?;
        }
        self.commit(t)?;
        Ok(report)
    }

    /// Stop accepting transactions and drop cached state.
    pub fn close(&self) -> Result<()> {
        if !self.mounted.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.journal.close()?;
        self.cache.close();
        info!(target: "lss::tm", "store_closed");
        Ok(())
    }

    #[must_use]
    pub fn create_transaction(&self) -> Transaction {
        self.cache.create_transaction()
    }

    /// Commit `t` and return the base address of its record.
    ///
    /// A transaction with nothing to write returns `Paddr::NULL` without
    /// touching the journal.
    pub fn submit_transaction(&self, t: Transaction) -> Result<Paddr> {
        if !self.is_mounted() {
            return Err(LssError::Closed);
        }
        self.commit(t)
    }

    fn commit(&self, mut t: Transaction) -> Result<Paddr> {
        let txn = t.id();
        let Some(record) = self.cache.try_construct_record(&mut t) else {
            warn!(target: "lss::tm", txn = txn.0, "submit_conflict");
            return Err(LssError::Conflict { txn: txn.0 });
        };
        if record.is_empty() {
            self.cache.complete_commit(t, Paddr::NULL);
            debug!(target: "lss::tm", txn = txn.0, "submit_empty");
            return Ok(Paddr::NULL);
        }
        match self.journal.submit_record(&record) {
            Ok(base) => {
                self.cache.complete_commit(t, base);
                debug!(target: "lss::tm", txn = txn.0, %base, "submit_complete");
                Ok(base)
            }
            Err(err) => {
                error!(target: "lss::tm", txn = txn.0, error = %err, "submit_failed");
                self.cache.fail_commit(t, &err);
                Err(err)
            }
        }
    }

    pub fn read_extent<T: ExtentKind>(
        &self,
        t: &mut Transaction,
        addr: Paddr,
        len: ExtentLen,
    ) -> Result<ExtentRef> {
        self.cache.get_extent::<T>(t, addr, len)
    }

    pub fn alloc_extent<T: ExtentKind>(&self, t: &mut Transaction, len: ExtentLen) -> ExtentRef {
        self.cache.alloc_new_extent::<T>(t, len)
    }

    pub fn get_mutable_extent(&self, t: &mut Transaction, extent: &ExtentRef) -> ExtentRef {
        self.cache.duplicate_for_write(t, extent)
    }

    pub fn retire_extent(&self, t: &mut Transaction, extent: &ExtentRef) {
        self.cache.retire_extent(t, extent);
    }

    pub fn get_root(&self, t: &mut Transaction) -> Result<ExtentRef> {
        self.cache.get_root(t)
    }
}
