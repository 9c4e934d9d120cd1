//! Segment manager: fixed-size append-only segments over a [`ByteDevice`].
//!
//! A segment moves through `Empty → Open → Closed → Empty`. Writes are only
//! accepted on an open segment, must start on a block boundary at or after
//! the segment's write pointer, and must fit inside the segment. Releasing
//! a closed segment zeroes it.

use crate::{ByteDevice, MemoryByteDevice};
use lss_error::{LssError, Result};
use lss_types::{Paddr, SegmentId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Device carving parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentGeometry {
    pub size: u64,
    pub block_size: u32,
    pub segment_size: u32,
}

impl SegmentGeometry {
    /// Validate a geometry: block size is a multiple of 4 KiB, the segment
    /// size a multiple of the block size, and the device size a multiple of
    /// the segment size.
    pub fn new(size: u64, block_size: u32, segment_size: u32) -> Result<Self> {
        if block_size == 0 || block_size % (4 << 10) != 0 {
            return Err(LssError::InvalidArgument(format!(
                "block_size={block_size} is not a multiple of 4096"
            )));
        }
        if segment_size == 0 || segment_size % block_size != 0 {
            return Err(LssError::InvalidArgument(format!(
                "segment_size={segment_size} is not a multiple of block_size={block_size}"
            )));
        }
        if i32::try_from(segment_size).is_err() {
            return Err(LssError::InvalidArgument(format!(
                "segment_size={segment_size} exceeds the segment offset range"
            )));
        }
        if size == 0 || size % u64::from(segment_size) != 0 {
            return Err(LssError::InvalidArgument(format!(
                "size={size} is not a multiple of segment_size={segment_size}"
            )));
        }
        if size / u64::from(segment_size) >= u64::from(SegmentId::FAKE.0) {
            return Err(LssError::InvalidArgument(format!(
                "size={size} yields too many segments"
            )));
        }
        Ok(Self {
            size,
            block_size,
            segment_size,
        })
    }

    /// 16 MiB device, 4 KiB blocks, 1 MiB segments.
    #[must_use]
    pub fn default_test() -> Self {
        Self {
            size: 16 << 20,
            block_size: 4 << 10,
            segment_size: 1 << 20,
        }
    }

    #[must_use]
    pub fn num_segments(&self) -> u32 {
        u32::try_from(self.size / u64::from(self.segment_size)).unwrap_or(u32::MAX)
    }

    fn byte_offset(&self, addr: Paddr) -> u64 {
        u64::from(addr.segment.0) * u64::from(self.segment_size)
            + u64::try_from(addr.offset).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    Empty,
    Open,
    Closed,
}

/// Physical segment storage consumed by the journal and the cache.
pub trait SegmentManager: Send + Sync {
    fn geometry(&self) -> SegmentGeometry;

    /// Open an empty segment for writing.
    fn open(&self, id: SegmentId) -> Result<()>;

    /// Close an open segment for writes.
    fn close(&self, id: SegmentId) -> Result<()>;

    /// Return a closed segment to the empty pool, discarding its contents.
    fn release(&self, id: SegmentId) -> Result<()>;

    /// Write `data` at `addr`; `addr.offset` must be block aligned and not
    /// behind the segment's write pointer.
    fn write(&self, addr: Paddr, data: &[u8]) -> Result<()>;

    /// Read `buf.len()` bytes starting at `addr`.
    fn read(&self, addr: Paddr, buf: &mut [u8]) -> Result<()>;

    fn segment_state(&self, id: SegmentId) -> Option<SegmentState>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    fn block_size(&self) -> u32 {
        self.geometry().block_size
    }

    fn segment_size(&self) -> u32 {
        self.geometry().segment_size
    }

    fn num_segments(&self) -> u32 {
        self.geometry().num_segments()
    }
}

#[derive(Debug)]
struct SegmentSlot {
    state: SegmentState,
    write_pointer: u32,
}

/// [`SegmentManager`] over any [`ByteDevice`].
#[derive(Debug)]
pub struct SegmentedDevice<B: ByteDevice> {
    inner: B,
    geometry: SegmentGeometry,
    slots: Mutex<Vec<SegmentSlot>>,
}

impl SegmentedDevice<MemoryByteDevice> {
    /// Volatile segment manager backed by memory.
    pub fn ephemeral(geometry: SegmentGeometry) -> Result<Self> {
        let len = usize::try_from(geometry.size)
            .map_err(|_| LssError::InvalidArgument("device size does not fit usize".to_owned()))?;
        Self::new(MemoryByteDevice::new(len), geometry)
    }
}

impl<B: ByteDevice> SegmentedDevice<B> {
    pub fn new(inner: B, geometry: SegmentGeometry) -> Result<Self> {
        let geometry =
            SegmentGeometry::new(geometry.size, geometry.block_size, geometry.segment_size)?;
        if inner.len_bytes() < geometry.size {
            return Err(LssError::InvalidArgument(format!(
                "device of {} bytes is smaller than geometry size {}",
                inner.len_bytes(),
                geometry.size
            )));
        }
        debug!(
            target: "lss::segment",
            size = geometry.size,
            block_size = geometry.block_size,
            segment_size = geometry.segment_size,
            segments = geometry.num_segments(),
            "segment_manager_init"
        );
        let slots = (0..geometry.num_segments())
            .map(|_| SegmentSlot {
                state: SegmentState::Empty,
                write_pointer: 0,
            })
            .collect();
        Ok(Self {
            inner,
            geometry,
            slots: Mutex::new(slots),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn index(&self, id: SegmentId) -> Result<usize> {
        if id.0 >= self.geometry.num_segments() {
            return Err(LssError::InvalidArgument(format!(
                "segment {id} out of range (num_segments={})",
                self.geometry.num_segments()
            )));
        }
        usize::try_from(id.0)
            .map_err(|_| LssError::InvalidArgument("segment id does not fit usize".to_owned()))
    }
}

impl<B: ByteDevice> SegmentManager for SegmentedDevice<B> {
    fn geometry(&self) -> SegmentGeometry {
        self.geometry
    }

    fn open(&self, id: SegmentId) -> Result<()> {
        let idx = self.index(id)?;
        let mut slots = self.slots.lock();
        let slot = &mut slots[idx];
        if slot.state != SegmentState::Empty {
            return Err(LssError::InvalidArgument(format!(
                "segment {id} is {:?}, expected Empty",
                slot.state
            )));
        }
        slot.state = SegmentState::Open;
        slot.write_pointer = 0;
        drop(slots);
        debug!(target: "lss::segment", segment = id.0, "segment_open");
        Ok(())
    }

    fn close(&self, id: SegmentId) -> Result<()> {
        let idx = self.index(id)?;
        let mut slots = self.slots.lock();
        let slot = &mut slots[idx];
        if slot.state != SegmentState::Open {
            return Err(LssError::InvalidArgument(format!(
                "segment {id} is {:?}, expected Open",
                slot.state
            )));
        }
        slot.state = SegmentState::Closed;
        let write_pointer = slot.write_pointer;
        drop(slots);
        debug!(target: "lss::segment", segment = id.0, write_pointer, "segment_close");
        Ok(())
    }

    fn release(&self, id: SegmentId) -> Result<()> {
        let idx = self.index(id)?;
        let mut slots = self.slots.lock();
        if slots[idx].state != SegmentState::Closed {
            return Err(LssError::InvalidArgument(format!(
                "segment {id} is {:?}, expected Closed",
                slots[idx].state
            )));
        }
        let zeroes = vec![0_u8; self.geometry.segment_size as usize];
        self.inner
            .write_all_at(self.geometry.byte_offset(Paddr::new(id, 0)), &zeroes)?;
        slots[idx].state = SegmentState::Empty;
        slots[idx].write_pointer = 0;
        drop(slots);
        debug!(target: "lss::segment", segment = id.0, "segment_release");
        Ok(())
    }

    fn write(&self, addr: Paddr, data: &[u8]) -> Result<()> {
        let idx = self.index(addr.segment)?;
        let offset = u32::try_from(addr.offset).map_err(|_| {
            LssError::InvalidArgument(format!("negative write offset at {addr}"))
        })?;
        let mut slots = self.slots.lock();
        let slot = &mut slots[idx];
        if slot.state != SegmentState::Open {
            return Err(LssError::Closed);
        }
        if offset < slot.write_pointer || offset % self.geometry.block_size != 0 {
            return Err(LssError::InvalidArgument(format!(
                "write at {addr} is misaligned or behind write pointer {}",
                slot.write_pointer
            )));
        }
        let len = u32::try_from(data.len()).map_err(|_| LssError::NoSpace)?;
        let end = offset.checked_add(len).ok_or(LssError::NoSpace)?;
        if end > self.geometry.segment_size {
            return Err(LssError::NoSpace);
        }
        self.inner
            .write_all_at(self.geometry.byte_offset(addr), data)?;
        let block = self.geometry.block_size;
        slot.write_pointer = end.div_ceil(block) * block;
        drop(slots);
        trace!(
            target: "lss::segment",
            segment = addr.segment.0,
            offset = addr.offset,
            len = data.len(),
            "segment_write"
        );
        Ok(())
    }

    fn read(&self, addr: Paddr, buf: &mut [u8]) -> Result<()> {
        self.index(addr.segment)?;
        let offset = u64::try_from(addr.offset)
            .map_err(|_| LssError::InvalidArgument(format!("negative read offset at {addr}")))?;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| LssError::InvalidArgument("read range overflows".to_owned()))?;
        if end > u64::from(self.geometry.segment_size) {
            return Err(LssError::InvalidArgument(format!(
                "read of {} bytes at {addr} crosses the segment end",
                buf.len()
            )));
        }
        self.inner
            .read_exact_at(self.geometry.byte_offset(addr), buf)?;
        trace!(
            target: "lss::segment",
            segment = addr.segment.0,
            offset = addr.offset,
            len = buf.len(),
            "segment_read"
        );
        Ok(())
    }

    fn segment_state(&self, id: SegmentId) -> Option<SegmentState> {
        let idx = self.index(id).ok()?;
        Some(self.slots.lock()[idx].state)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}
