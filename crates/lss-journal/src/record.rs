//! On-device framing for journal segments and records.
//!
//! # Format Overview
//!
//! ```text
//! Journal segment:
//! +----------------------+
//! | Segment Header       |  (first block, 32 bytes used)
//! +----------------------+
//! | Record               |  (mdlength + dlength, block aligned)
//! +----------------------+
//! | ...                  |
//! +----------------------+
//!
//! Segment Header:
//! +------------------+--------+
//! | magic            | 8 bytes| = SEGMENT_MAGIC
//! | version          | 2 bytes| = 1
//! | reserved         | 2 bytes| = 0
//! | segment_seq      | 4 bytes| journal segment sequence
//! | segment_id       | 4 bytes| physical segment id
//! | replay_lb.seg    | 4 bytes| replay lower bound
//! | replay_lb.off    | 4 bytes|
//! | header_crc       | 4 bytes| CRC32c of the preceding 28 bytes
//! +------------------+--------+
//!
//! Record:
//! +------------------+--------+
//! | magic            | 4 bytes| = RECORD_MAGIC
//! | mdlength         | 4 bytes| metadata length, multiple of block size
//! | dlength          | 4 bytes| total fresh extent bytes
//! | record_seq       | 8 bytes|
//! | num_deltas       | 4 bytes|
//! | num_extents      | 4 bytes|
//! | md_used          | 4 bytes| unpadded metadata length
//! | data_crc         | 4 bytes| CRC32c of the data region
//! | md_crc           | 4 bytes| CRC32c of bytes [0, 36) ++ [40, md_used)
//! +------------------+--------+
//! | For each extent:          |
//! |   type           | 1 byte |
//! |   laddr          | 8 bytes|
//! |   length         | 4 bytes|
//! +------------------+--------+
//! | For each delta:           |
//! |   type           | 1 byte |
//! |   paddr.segment  | 4 bytes|
//! |   paddr.offset   | 4 bytes|
//! |   laddr          | 8 bytes|
//! |   prev_crc       | 4 bytes|
//! |   final_crc      | 4 bytes|
//! |   length         | 4 bytes|
//! |   pversion       | 4 bytes|
//! |   payload_len    | 4 bytes|
//! |   payload        | N bytes|
//! +------------------+--------+
//! | zero padding to mdlength  |
//! +------------------+--------+
//! | extent data, back to back |  (dlength bytes)
//! +------------------+--------+
//! ```
//!
//! The first fresh extent of a record lives at `record_start + mdlength`,
//! which is the record base handed to the cache.

use lss_error::{LssError, Result};
use lss_types::{
    DeltaInfo, ExtentPayload, ExtentType, Laddr, ParseError, Paddr, Record, SegmentId,
    SegmentSeq, read_le_i32, read_le_u16, read_le_u32, read_le_u64, read_u8,
};

pub const SEGMENT_MAGIC: u64 = 0x4448_4745_5353_534C;
pub const SEGMENT_FORMAT_VERSION: u16 = 1;
pub const SEGMENT_HEADER_SIZE: usize = 32;

pub const RECORD_MAGIC: u32 = 0x4352_534C;
pub const RECORD_HEADER_SIZE: usize = 40;

const EXTENT_DESC_SIZE: usize = 1 + 8 + 4;
const DELTA_FIXED_SIZE: usize = 1 + 4 + 4 + 8 + 4 + 4 + 4 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub segment_seq: SegmentSeq,
    pub segment_id: SegmentId,
    pub replay_lb: Paddr,
}

#[must_use]
pub fn encode_segment_header(header: &SegmentHeader) -> [u8; SEGMENT_HEADER_SIZE] {
    let mut buf = [0_u8; SEGMENT_HEADER_SIZE];
    buf[0..8].copy_from_slice(&SEGMENT_MAGIC.to_le_bytes());
    buf[8..10].copy_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
    buf[12..16].copy_from_slice(&header.segment_seq.0.to_le_bytes());
    buf[16..20].copy_from_slice(&header.segment_id.0.to_le_bytes());
    buf[20..24].copy_from_slice(&header.replay_lb.segment.0.to_le_bytes());
    buf[24..28].copy_from_slice(&header.replay_lb.offset.to_le_bytes());
    let crc = crc32c::crc32c(&buf[..28]);
    buf[28..32].copy_from_slice(&crc.to_le_bytes());
    buf
}

pub fn decode_segment_header(bytes: &[u8]) -> std::result::Result<SegmentHeader, ParseError> {
    let magic = read_le_u64(bytes, 0)?;
    if magic != SEGMENT_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: SEGMENT_MAGIC,
            actual: magic,
        });
    }
    let version = read_le_u16(bytes, 8)?;
    if version != SEGMENT_FORMAT_VERSION {
        return Err(ParseError::InvalidField {
            field: "segment_header.version",
            reason: "unsupported version",
        });
    }
    let stored = read_le_u32(bytes, 28)?;
    let computed = crc32c::crc32c(&bytes[..28]);
    if stored != computed {
        return Err(ParseError::ChecksumMismatch {
            what: "segment header",
            expected: stored,
            actual: computed,
        });
    }
    Ok(SegmentHeader {
        segment_seq: SegmentSeq(read_le_u32(bytes, 12)?),
        segment_id: SegmentId(read_le_u32(bytes, 16)?),
        replay_lb: Paddr::new(SegmentId(read_le_u32(bytes, 20)?), read_le_i32(bytes, 24)?),
    })
}

/// Encoded sizes of a record: metadata (block aligned) and data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSize {
    pub mdlength: u32,
    pub dlength: u32,
}

impl RecordSize {
    #[must_use]
    pub fn total(self) -> u64 {
        u64::from(self.mdlength) + u64::from(self.dlength)
    }
}

fn metadata_used(record: &Record) -> usize {
    RECORD_HEADER_SIZE
        + record.extents.len() * EXTENT_DESC_SIZE
        + record
            .deltas
            .iter()
            .map(|d| DELTA_FIXED_SIZE + d.bytes.len())
            .sum::<usize>()
}

/// Compute the encoded size of `record` for the given block size.
pub fn encoded_record_size(record: &Record, block_size: u32) -> Result<RecordSize> {
    let too_large = || LssError::RecordTooLarge {
        length: u64::try_from(metadata_used(record)).unwrap_or(u64::MAX) + record.data_len(),
        max: u64::from(u32::MAX),
    };
    let used = u32::try_from(metadata_used(record)).map_err(|_| too_large())?;
    let mdlength = used
        .checked_next_multiple_of(block_size)
        .ok_or_else(too_large)?;
    let dlength = u32::try_from(record.data_len()).map_err(|_| too_large())?;
    Ok(RecordSize { mdlength, dlength })
}

/// Encode `record` into one contiguous buffer of `mdlength + dlength` bytes.
pub fn encode_record(record: &Record, record_seq: u64, block_size: u32) -> Result<Vec<u8>> {
    let size = encoded_record_size(record, block_size)?;
    let used = metadata_used(record);
    let total = usize::try_from(size.total())
        .map_err(|_| LssError::Format("record size does not fit usize".to_owned()))?;
    let mut buf = Vec::with_capacity(total);

    let count = |n: usize, what: &str| {
        u32::try_from(n).map_err(|_| LssError::Format(format!("too many {what} in record")))
    };

    buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
    buf.extend_from_slice(&size.mdlength.to_le_bytes());
    buf.extend_from_slice(&size.dlength.to_le_bytes());
    buf.extend_from_slice(&record_seq.to_le_bytes());
    buf.extend_from_slice(&count(record.deltas.len(), "deltas")?.to_le_bytes());
    buf.extend_from_slice(&count(record.extents.len(), "extents")?.to_le_bytes());
    buf.extend_from_slice(&count(used, "metadata bytes")?.to_le_bytes());
    // data_crc and md_crc are patched below.
    buf.extend_from_slice(&[0_u8; 8]);

    for extent in &record.extents {
        buf.push(extent.ext_type.to_u8());
        buf.extend_from_slice(&extent.laddr.0.to_le_bytes());
        buf.extend_from_slice(&count(extent.bytes.len(), "extent bytes")?.to_le_bytes());
    }
    for delta in &record.deltas {
        buf.push(delta.ext_type.to_u8());
        buf.extend_from_slice(&delta.paddr.segment.0.to_le_bytes());
        buf.extend_from_slice(&delta.paddr.offset.to_le_bytes());
        buf.extend_from_slice(&delta.laddr.0.to_le_bytes());
        buf.extend_from_slice(&delta.prev_crc.to_le_bytes());
        buf.extend_from_slice(&delta.final_crc.to_le_bytes());
        buf.extend_from_slice(&delta.length.to_le_bytes());
        buf.extend_from_slice(&delta.pversion.to_le_bytes());
        buf.extend_from_slice(&count(delta.bytes.len(), "delta bytes")?.to_le_bytes());
        buf.extend_from_slice(&delta.bytes);
    }
    debug_assert_eq!(buf.len(), used);
    buf.resize(size.mdlength as usize, 0);

    let mut data_crc = 0_u32;
    for extent in &record.extents {
        data_crc = crc32c::crc32c_append(data_crc, &extent.bytes);
        buf.extend_from_slice(&extent.bytes);
    }
    debug_assert_eq!(buf.len(), total);

    let md_crc = metadata_crc(&buf, used);
    buf[32..36].copy_from_slice(&data_crc.to_le_bytes());
    buf[36..40].copy_from_slice(&md_crc.to_le_bytes());
    Ok(buf)
}

fn metadata_crc(buf: &[u8], used: usize) -> u32 {
    let head = crc32c::crc32c(&buf[..36]);
    crc32c::crc32c_append(head, &buf[RECORD_HEADER_SIZE..used])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub mdlength: u32,
    pub dlength: u32,
    pub record_seq: u64,
    pub num_deltas: u32,
    pub num_extents: u32,
    pub md_used: u32,
    pub data_crc: u32,
    pub md_crc: u32,
}

/// Outcome of decoding a record header from the start of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderDecode {
    Header(RecordHeader),
    /// Zeroed space: no record was ever written here.
    EndOfData,
    /// Bytes are present but are not a valid record header.
    Corrupted(String),
}

#[must_use]
pub fn decode_record_header(bytes: &[u8], block_size: u32) -> HeaderDecode {
    if bytes.len() < RECORD_HEADER_SIZE {
        return HeaderDecode::Corrupted(format!(
            "record header needs {RECORD_HEADER_SIZE} bytes, got {}",
            bytes.len()
        ));
    }
    if bytes[..RECORD_HEADER_SIZE].iter().all(|&b| b == 0) {
        return HeaderDecode::EndOfData;
    }
    let field = |off: usize| read_le_u32(bytes, off).unwrap_or_default();
    let magic = field(0);
    if magic != RECORD_MAGIC {
        return HeaderDecode::Corrupted(format!(
            "bad record magic {magic:#010x}, expected {RECORD_MAGIC:#010x}"
        ));
    }
    let header = RecordHeader {
        mdlength: field(4),
        dlength: field(8),
        record_seq: read_le_u64(bytes, 12).unwrap_or_default(),
        num_deltas: field(20),
        num_extents: field(24),
        md_used: field(28),
        data_crc: field(32),
        md_crc: field(36),
    };
    if header.mdlength == 0
        || header.mdlength % block_size != 0
        || (header.md_used as usize) < RECORD_HEADER_SIZE
        || header.md_used > header.mdlength
    {
        return HeaderDecode::Corrupted(format!(
            "inconsistent record lengths: mdlength={} md_used={} block_size={block_size}",
            header.mdlength, header.md_used
        ));
    }
    HeaderDecode::Header(header)
}

/// Fresh extent descriptor stored in record metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentDesc {
    pub ext_type: ExtentType,
    pub laddr: Laddr,
    pub length: u32,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl Cursor<'_> {
    fn u8(&mut self) -> std::result::Result<u8, ParseError> {
        let v = read_u8(self.bytes, self.offset)?;
        self.offset += 1;
        Ok(v)
    }

    fn u32(&mut self) -> std::result::Result<u32, ParseError> {
        let v = read_le_u32(self.bytes, self.offset)?;
        self.offset += 4;
        Ok(v)
    }

    fn i32(&mut self) -> std::result::Result<i32, ParseError> {
        let v = read_le_i32(self.bytes, self.offset)?;
        self.offset += 4;
        Ok(v)
    }

    fn u64(&mut self) -> std::result::Result<u64, ParseError> {
        let v = read_le_u64(self.bytes, self.offset)?;
        self.offset += 8;
        Ok(v)
    }

    fn bytes(&mut self, len: usize) -> std::result::Result<Vec<u8>, ParseError> {
        let v = lss_types::ensure_slice(self.bytes, self.offset, len)?.to_vec();
        self.offset += len;
        Ok(v)
    }
}

/// Verify and decode the metadata of a record.
///
/// `metadata` must hold at least `header.md_used` bytes starting at the
/// record header.
pub fn decode_metadata(
    header: &RecordHeader,
    metadata: &[u8],
) -> std::result::Result<(Vec<ExtentDesc>, Vec<DeltaInfo>), ParseError> {
    let used = header.md_used as usize;
    lss_types::ensure_slice(metadata, 0, used)?;
    let computed = metadata_crc(metadata, used);
    if computed != header.md_crc {
        return Err(ParseError::ChecksumMismatch {
            what: "record metadata",
            expected: header.md_crc,
            actual: computed,
        });
    }

    let mut cur = Cursor {
        bytes: &metadata[..used],
        offset: RECORD_HEADER_SIZE,
    };
    let mut extents = Vec::new();
    let mut total = 0_u64;
    for _ in 0..header.num_extents {
        let desc = ExtentDesc {
            ext_type: ExtentType::from_u8(cur.u8()?)?,
            laddr: Laddr(cur.u64()?),
            length: cur.u32()?,
        };
        total += u64::from(desc.length);
        extents.push(desc);
    }
    if total != u64::from(header.dlength) {
        return Err(ParseError::InvalidField {
            field: "record.dlength",
            reason: "does not match extent descriptors",
        });
    }

    let mut deltas = Vec::new();
    for _ in 0..header.num_deltas {
        let ext_type = ExtentType::from_u8(cur.u8()?)?;
        let segment = SegmentId(cur.u32()?);
        let offset = cur.i32()?;
        let laddr = Laddr(cur.u64()?);
        let prev_crc = cur.u32()?;
        let final_crc = cur.u32()?;
        let length = cur.u32()?;
        let pversion = cur.u32()?;
        let payload_len = cur.u32()? as usize;
        let bytes = cur.bytes(payload_len)?;
        deltas.push(DeltaInfo {
            ext_type,
            paddr: Paddr::new(segment, offset),
            laddr,
            prev_crc,
            final_crc,
            length,
            pversion,
            bytes,
        });
    }
    if cur.offset != used {
        return Err(ParseError::InvalidField {
            field: "record.md_used",
            reason: "trailing metadata bytes",
        });
    }
    Ok((extents, deltas))
}

/// Rebuild fresh extent payloads from their descriptors and the data region.
pub fn split_extents(
    descs: &[ExtentDesc],
    data: &[u8],
) -> std::result::Result<Vec<ExtentPayload>, ParseError> {
    let mut offset = 0_usize;
    descs
        .iter()
        .map(|desc| {
            let len = desc.length as usize;
            let bytes = lss_types::ensure_slice(data, offset, len)?.to_vec();
            offset += len;
            Ok(ExtentPayload {
                ext_type: desc.ext_type,
                laddr: desc.laddr,
                bytes,
            })
        })
        .collect()
}
