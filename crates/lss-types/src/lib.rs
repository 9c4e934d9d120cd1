#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Sub;
use thiserror::Error;

/// Size of the resident root block.
pub const ROOT_BLOCK_SIZE: ExtentLen = 4096;

/// Length of an extent in bytes.
pub type ExtentLen = u32;

/// Per-extent mutation counter.
pub type ExtentVersion = u32;
pub const EXTENT_VERSION_NULL: ExtentVersion = 0;

/// Extent content checksum.
pub type Checksum = u32;

/// Checksum over an extent buffer (CRC32C).
#[must_use]
pub fn checksum(bytes: &[u8]) -> Checksum {
    crc32c::crc32c(bytes)
}

/// Physical segment identifier. The top of the range is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub u32);

impl SegmentId {
    pub const NULL: Self = Self(u32::MAX - 1);
    /// Offset is relative to the start of the containing record.
    pub const RECORD_RELATIVE: Self = Self(u32::MAX - 2);
    /// Offset is relative to the containing block.
    pub const BLOCK_RELATIVE: Self = Self(u32::MAX - 3);
    /// Used by tests that fabricate addresses.
    pub const FAKE: Self = Self(u32::MAX - 4);

    #[must_use]
    pub fn is_reserved(self) -> bool {
        self.0 >= Self::FAKE.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NULL => f.write_str("NULL_SEG"),
            Self::RECORD_RELATIVE => f.write_str("RECORD_REL_SEG"),
            Self::BLOCK_RELATIVE => f.write_str("BLOCK_REL_SEG"),
            Self::FAKE => f.write_str("FAKE_SEG"),
            Self(id) => write!(f, "{id}"),
        }
    }
}

/// Offset inside a segment. Negative values only occur in relative addresses.
pub type SegmentOffset = i32;
pub const NULL_SEG_OFFSET: SegmentOffset = i32::MAX;

/// Physical address: `(segment, offset)`, ordered by segment then offset.
///
/// Record-relative addresses are placeholders for extents whose final
/// location is known only once the containing record is durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Paddr {
    pub segment: SegmentId,
    pub offset: SegmentOffset,
}

impl Paddr {
    pub const NULL: Self = Self {
        segment: SegmentId::NULL,
        offset: NULL_SEG_OFFSET,
    };
    pub const MIN: Self = Self {
        segment: SegmentId(0),
        offset: 0,
    };

    #[must_use]
    pub const fn new(segment: SegmentId, offset: SegmentOffset) -> Self {
        Self { segment, offset }
    }

    #[must_use]
    pub const fn record_relative(offset: SegmentOffset) -> Self {
        Self::new(SegmentId::RECORD_RELATIVE, offset)
    }

    #[must_use]
    pub const fn block_relative(offset: SegmentOffset) -> Self {
        Self::new(SegmentId::BLOCK_RELATIVE, offset)
    }

    #[must_use]
    pub const fn fake(offset: SegmentOffset) -> Self {
        Self::new(SegmentId::FAKE, offset)
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.segment == SegmentId::NULL
    }

    #[must_use]
    pub fn is_relative(self) -> bool {
        self.is_record_relative() || self.is_block_relative()
    }

    #[must_use]
    pub fn is_record_relative(self) -> bool {
        self.segment == SegmentId::RECORD_RELATIVE
    }

    #[must_use]
    pub fn is_block_relative(self) -> bool {
        self.segment == SegmentId::BLOCK_RELATIVE
    }

    #[must_use]
    pub fn add_offset(self, offset: SegmentOffset) -> Self {
        Self::new(self.segment, self.offset + offset)
    }

    /// Resolve a relative address against `self`.
    #[must_use]
    pub fn add_relative(self, rel: Self) -> Self {
        assert!(rel.is_relative(), "{rel} is not a relative address");
        Self::new(self.segment, self.offset + rel.offset)
    }

    #[must_use]
    pub fn add_record_relative(self, rel: Self) -> Self {
        assert!(rel.is_record_relative(), "{rel} is not record relative");
        self.add_relative(rel)
    }

    #[must_use]
    pub fn add_block_relative(self, rel: Self) -> Self {
        assert!(rel.is_block_relative(), "{rel} is not block relative");
        self.add_relative(rel)
    }

    /// Resolve `self` against `base` if block relative, else return `self`.
    #[must_use]
    pub fn maybe_relative_to(self, base: Self) -> Self {
        assert!(
            !base.is_block_relative(),
            "base {base} must not be block relative"
        );
        if self.is_block_relative() {
            base.add_block_relative(self)
        } else {
            self
        }
    }
}

impl Sub for Paddr {
    type Output = Paddr;

    /// Difference of two record-relative addresses, as a block-relative one.
    fn sub(self, rhs: Self) -> Self::Output {
        assert!(
            self.is_record_relative() && rhs.is_record_relative(),
            "subtraction requires record relative operands: {self} - {rhs}"
        );
        Paddr::block_relative(self.offset - rhs.offset)
    }
}

impl fmt::Display for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offset == NULL_SEG_OFFSET {
            write!(f, "paddr<{}, NULL_OFF>", self.segment)
        } else {
            write!(f, "paddr<{}, {}>", self.segment, self.offset)
        }
    }
}

/// Logical address, assigned by the address-translation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Laddr(pub u64);

impl Laddr {
    pub const MIN: Self = Self(u64::MIN);
    pub const MAX: Self = Self(u64::MAX);
    pub const NULL: Self = Self(u64::MAX);
    pub const ROOT: Self = Self(u64::MAX - 1);
    pub const LBAT: Self = Self(u64::MAX - 2);

    #[must_use]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl fmt::Display for Laddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NULL => f.write_str("L_ADDR_NULL"),
            Self::ROOT => f.write_str("L_ADDR_ROOT"),
            Self::LBAT => f.write_str("L_ADDR_LBAT"),
            Self(addr) => write!(f, "{addr:#x}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic journal segment sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentSeq(pub u32);

impl SegmentSeq {
    pub const NULL: Self = Self(u32::MAX);

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for SegmentSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a physical extent. Drives delta interpretation on replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExtentType {
    Root,
    LaddrInternal,
    LaddrLeaf,
    OnodeBlock,
    TestBlock,
    TestBlockPhysical,
    None,
}

impl ExtentType {
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Root => 0,
            Self::LaddrInternal => 1,
            Self::LaddrLeaf => 2,
            Self::OnodeBlock => 3,
            Self::TestBlock => 0xF0,
            Self::TestBlockPhysical => 0xF1,
            Self::None => 0xFF,
        }
    }

    pub fn from_u8(raw: u8) -> Result<Self, ParseError> {
        Ok(match raw {
            0 => Self::Root,
            1 => Self::LaddrInternal,
            2 => Self::LaddrLeaf,
            3 => Self::OnodeBlock,
            0xF0 => Self::TestBlock,
            0xF1 => Self::TestBlockPhysical,
            0xFF => Self::None,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "extent_type",
                    reason: "unknown extent type code",
                });
            }
        })
    }

    /// Extents of logical types carry a logical address.
    #[must_use]
    pub fn is_logical(self) -> bool {
        matches!(self, Self::OnodeBlock | Self::TestBlock)
    }
}

impl fmt::Display for ExtentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Root => "ROOT",
            Self::LaddrInternal => "LADDR_INTERNAL",
            Self::LaddrLeaf => "LADDR_LEAF",
            Self::OnodeBlock => "ONODE_BLOCK",
            Self::TestBlock => "TEST_BLOCK",
            Self::TestBlockPhysical => "TEST_BLOCK_PHYSICAL",
            Self::None => "NONE",
        };
        f.write_str(name)
    }
}

/// Full contents of a newly allocated extent, written once at its final address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentPayload {
    pub ext_type: ExtentType,
    pub laddr: Laddr,
    pub bytes: Vec<u8>,
}

impl ExtentPayload {
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A mutation of an existing extent.
///
/// `pversion` is the version the delta applies on top of; `prev_crc` and
/// `final_crc` are the checksums before and after applying `bytes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaInfo {
    pub ext_type: ExtentType,
    pub paddr: Paddr,
    pub laddr: Laddr,
    pub prev_crc: Checksum,
    pub final_crc: Checksum,
    pub length: ExtentLen,
    pub pversion: ExtentVersion,
    pub bytes: Vec<u8>,
}

impl fmt::Display for DeltaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delta(type={}, paddr={}, laddr={}, prev_crc={:#010x}, final_crc={:#010x}, length={}, pversion={}, bytes={})",
            self.ext_type,
            self.paddr,
            self.laddr,
            self.prev_crc,
            self.final_crc,
            self.length,
            self.pversion,
            self.bytes.len()
        )
    }
}

/// One atomic unit appended to the log.
///
/// Fresh extents precede deltas. The final address of fresh extent `i` is
/// the record base plus the lengths of fresh extents `0..i`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub extents: Vec<ExtentPayload>,
    pub deltas: Vec<DeltaInfo>,
}

/// Entry of a [`Record`] in log order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordEntry<'a> {
    Fresh(&'a ExtentPayload),
    Delta(&'a DeltaInfo),
}

impl Record {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty() && self.deltas.is_empty()
    }

    /// Total bytes of fresh extent content.
    #[must_use]
    pub fn data_len(&self) -> u64 {
        self.extents.iter().map(|e| e.bytes.len() as u64).sum()
    }

    /// Entries in log order: fresh extents first, then deltas.
    pub fn entries(&self) -> impl Iterator<Item = RecordEntry<'_>> {
        self.extents
            .iter()
            .map(RecordEntry::Fresh)
            .chain(self.deltas.iter().map(RecordEntry::Delta))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("checksum mismatch in {what}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        what: &'static str,
        expected: u32,
        actual: u32,
    },
}

pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    let bytes = ensure_slice(data, offset, 1)?;
    Ok(bytes[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}
