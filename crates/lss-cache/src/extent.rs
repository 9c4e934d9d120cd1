//! Cached extents.
//!
//! A [`CachedExtent`] is one physical block: its bytes, where it lives, and
//! where it stands in the write pipeline. Extents are shared as
//! [`ExtentRef`] (`Arc`); identity (`Arc::ptr_eq`) is what commit-time
//! validation compares, so two extents with equal contents at the same
//! address are still different versions.

use crate::delta::{self, DeltaPatch};
use crate::io::IoWait;
use lss_error::{LssError, Result};
use lss_types::{
    Checksum, ExtentLen, ExtentType, ExtentVersion, Laddr, Paddr, ROOT_BLOCK_SIZE, checksum,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub type ExtentRef = Arc<CachedExtent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtentState {
    /// Freshly allocated in a transaction; not yet durable.
    InitialWritePending,
    /// Content matches what is stored at `paddr`.
    Clean,
    /// Content includes durable deltas not reflected at `paddr`.
    Dirty,
    /// Copy-on-write duplicate private to a transaction.
    MutationPending,
    /// Retired or superseded.
    Invalid,
}

impl fmt::Display for ExtentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InitialWritePending => "INITIAL_WRITE_PENDING",
            Self::Clean => "CLEAN",
            Self::Dirty => "DIRTY",
            Self::MutationPending => "MUTATION_PENDING",
            Self::Invalid => "INVALID",
        };
        f.write_str(name)
    }
}

/// Compile-time extent kind used to parameterize typed cache lookups.
pub trait ExtentKind: Send + Sync + 'static {
    const TYPE: ExtentType;
}

macro_rules! extent_kind {
    ($(#[$doc:meta])* $name:ident => $ty:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name;

        impl ExtentKind for $name {
            const TYPE: ExtentType = $ty;
        }
    };
}

extent_kind!(
    /// Singleton root metadata block.
    RootBlock => ExtentType::Root
);
extent_kind!(LbaInternalNode => ExtentType::LaddrInternal);
extent_kind!(LbaLeafNode => ExtentType::LaddrLeaf);
extent_kind!(OnodeBlock => ExtentType::OnodeBlock);
extent_kind!(
    /// Logical test extent.
    TestBlock => ExtentType::TestBlock
);
extent_kind!(
    /// Physical test extent, no logical address.
    TestBlockPhysical => ExtentType::TestBlockPhysical
);

#[derive(Debug)]
struct ExtentInner {
    paddr: Paddr,
    laddr: Laddr,
    state: ExtentState,
    version: ExtentVersion,
    last_committed_crc: Checksum,
    buf: Vec<u8>,
    patches: Vec<DeltaPatch>,
    last_delta_base: Option<Paddr>,
}

#[derive(Debug)]
pub struct CachedExtent {
    ext_type: ExtentType,
    io: IoWait,
    inner: Mutex<ExtentInner>,
}

impl CachedExtent {
    fn with_state(ext_type: ExtentType, paddr: Paddr, buf: Vec<u8>, state: ExtentState) -> Self {
        Self {
            ext_type,
            io: IoWait::new(),
            inner: Mutex::new(ExtentInner {
                paddr,
                laddr: Laddr::NULL,
                state,
                version: 0,
                last_committed_crc: 0,
                buf,
                patches: Vec::new(),
                last_delta_base: None,
            }),
        }
    }

    /// Extent about to be filled from disk; the I/O latch is armed.
    pub(crate) fn new_pending_read(ext_type: ExtentType, paddr: Paddr, len: ExtentLen) -> Self {
        let extent = Self::with_state(ext_type, paddr, vec![0; len as usize], ExtentState::Clean);
        extent.io.set_pending();
        extent
    }

    /// Zeroed extent allocated inside a transaction.
    pub(crate) fn new_fresh(ext_type: ExtentType, len: ExtentLen) -> Self {
        Self::with_state(
            ext_type,
            Paddr::NULL,
            vec![0; len as usize],
            ExtentState::InitialWritePending,
        )
    }

    /// Resident root: zeroed, dirty, never stored at a physical address.
    pub(crate) fn new_root() -> Self {
        let buf = vec![0; ROOT_BLOCK_SIZE as usize];
        let crc = checksum(&buf);
        let root = Self::with_state(ExtentType::Root, Paddr::NULL, buf, ExtentState::Dirty);
        root.inner.lock().last_committed_crc = crc;
        root
    }

    /// Copy-on-write duplicate: same address and content, version + 1.
    pub(crate) fn duplicate_for_write(&self) -> Self {
        let inner = self.inner.lock();
        Self {
            ext_type: self.ext_type,
            io: IoWait::new(),
            inner: Mutex::new(ExtentInner {
                paddr: inner.paddr,
                laddr: inner.laddr,
                state: ExtentState::MutationPending,
                version: inner.version + 1,
                last_committed_crc: inner.last_committed_crc,
                buf: inner.buf.clone(),
                patches: Vec::new(),
                last_delta_base: inner.last_delta_base,
            }),
        }
    }

    #[must_use]
    pub fn ext_type(&self) -> ExtentType {
        self.ext_type
    }

    #[must_use]
    pub fn paddr(&self) -> Paddr {
        self.inner.lock().paddr
    }

    #[must_use]
    pub fn laddr(&self) -> Laddr {
        self.inner.lock().laddr
    }

    /// Set the logical address of a pending logical extent.
    pub fn set_laddr(&self, laddr: Laddr) {
        assert!(
            self.ext_type.is_logical(),
            "{} extents carry no logical address",
            self.ext_type
        );
        let mut inner = self.inner.lock();
        assert!(
            is_pending(inner.state),
            "set_laddr on non-pending extent at {}",
            inner.paddr
        );
        inner.laddr = laddr;
    }

    #[must_use]
    pub fn state(&self) -> ExtentState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn version(&self) -> ExtentVersion {
        self.inner.lock().version
    }

    #[must_use]
    pub fn last_committed_crc(&self) -> Checksum {
        self.inner.lock().last_committed_crc
    }

    /// Record base of the last durable delta applied to this extent.
    #[must_use]
    pub fn last_delta_base(&self) -> Option<Paddr> {
        self.inner.lock().last_delta_base
    }

    #[must_use]
    pub fn len(&self) -> ExtentLen {
        self.inner.lock().buf.len() as ExtentLen
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().buf.is_empty()
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        is_pending(self.state())
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state() != ExtentState::Invalid
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state() == ExtentState::Dirty
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.state() == ExtentState::Clean
    }

    #[must_use]
    pub fn is_io_pending(&self) -> bool {
        self.io.is_pending()
    }

    /// Current content checksum.
    #[must_use]
    pub fn crc(&self) -> Checksum {
        checksum(&self.inner.lock().buf)
    }

    /// Run `f` over the current contents.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.lock().buf)
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.lock().buf.clone()
    }

    /// Overwrite `data.len()` bytes at `offset`.
    ///
    /// Only pending extents are writable. Writes to a mutation-pending
    /// duplicate are also recorded in its delta.
    pub fn write_bytes(&self, offset: u32, data: &[u8]) {
        let mut inner = self.inner.lock();
        assert!(
            is_pending(inner.state),
            "write to {} extent at {}",
            inner.state,
            inner.paddr
        );
        let start = offset as usize;
        let end = start + data.len();
        assert!(
            end <= inner.buf.len(),
            "write [{start}, {end}) past end of {}-byte extent at {}",
            inner.buf.len(),
            inner.paddr
        );
        inner.buf[start..end].copy_from_slice(data);
        if inner.state == ExtentState::MutationPending {
            inner.patches.push(DeltaPatch {
                offset,
                bytes: data.to_vec(),
            });
        }
    }

    /// Fill the whole extent with `byte`.
    pub fn fill(&self, byte: u8) {
        let len = self.len() as usize;
        self.write_bytes(0, &vec![byte; len]);
    }

    /// Encoded delta of writes made since duplication.
    #[must_use]
    pub fn get_delta(&self) -> Vec<u8> {
        delta::encode(&self.inner.lock().patches)
    }

    pub(crate) fn set_state(&self, state: ExtentState) {
        self.inner.lock().state = state;
    }

    pub(crate) fn set_last_committed_crc(&self, crc: Checksum) {
        self.inner.lock().last_committed_crc = crc;
    }

    pub(crate) fn set_paddr(&self, paddr: Paddr) {
        self.inner.lock().paddr = paddr;
    }

    pub(crate) fn set_laddr_unchecked(&self, laddr: Laddr) {
        self.inner.lock().laddr = laddr;
    }

    /// Fill completed: install contents, CLEAN, remember checksum.
    pub(crate) fn on_clean_read(&self, buf: Vec<u8>) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(buf.len(), inner.buf.len());
        inner.last_committed_crc = checksum(&buf);
        inner.buf = buf;
        inner.state = ExtentState::Clean;
    }

    /// Record containing this fresh extent is durable at `addr`.
    ///
    /// The extent becomes CLEAN: its full contents are stored at `addr`.
    /// A fresh extent retired in its own transaction stays INVALID.
    pub(crate) fn complete_initial_write(&self, addr: Paddr) {
        let mut inner = self.inner.lock();
        assert!(
            inner.paddr.is_record_relative(),
            "placeholder of fresh extent already resolved to {}",
            inner.paddr
        );
        inner.paddr = addr;
        inner.last_committed_crc = checksum(&inner.buf);
        if inner.state == ExtentState::InitialWritePending {
            inner.state = ExtentState::Clean;
        }
    }

    /// Delta of this duplicate is durable in the record at `record_base`.
    pub(crate) fn delta_written(&self, record_base: Paddr) {
        let mut inner = self.inner.lock();
        assert_eq!(
            inner.state,
            ExtentState::MutationPending,
            "delta_written on non-mutation extent at {}",
            inner.paddr
        );
        inner.last_delta_base = Some(record_base);
        inner.patches.clear();
        inner.state = ExtentState::Dirty;
    }

    /// Replay only: apply a logged delta in place and mark DIRTY.
    pub(crate) fn apply_delta(&self, record_base: Paddr, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let paddr = inner.paddr;
        delta::apply(&mut inner.buf, bytes).map_err(|e| LssError::Corruption {
            segment: paddr.segment.0,
            offset: i64::from(paddr.offset),
            detail: format!("undecodable delta from record {record_base}: {e}"),
        })?;
        inner.last_committed_crc = checksum(&inner.buf);
        inner.version += 1;
        inner.last_delta_base = Some(record_base);
        inner.state = ExtentState::Dirty;
        Ok(())
    }

    pub(crate) fn set_io_pending(&self) {
        self.io.set_pending();
    }

    pub(crate) fn complete_io(&self) {
        self.io.complete();
    }

    pub(crate) fn fail_io(&self, error: &LssError) {
        self.io.fail(error);
    }

    /// Block until pending disk fill or log append resolves.
    pub fn wait_io(&self) -> Result<()> {
        self.io.wait()
    }
}

fn is_pending(state: ExtentState) -> bool {
    matches!(
        state,
        ExtentState::InitialWritePending | ExtentState::MutationPending
    )
}

impl fmt::Display for CachedExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "extent(type={}, paddr={}, len={}, state={}, version={}, crc={:#010x}",
            self.ext_type,
            inner.paddr,
            inner.buf.len(),
            inner.state,
            inner.version,
            inner.last_committed_crc
        )?;
        if self.ext_type.is_logical() {
            write!(f, ", laddr={}", inner.laddr)?;
        }
        f.write_str(")")
    }
}
