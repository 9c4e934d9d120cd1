//! Extent delta encoding.
//!
//! A delta is the ordered list of byte-range overwrites made to an extent
//! while it was pending mutation:
//!
//! ```text
//! +------------------+--------+
//! | patch_count      | 4 bytes|
//! +------------------+--------+
//! | For each patch:           |
//! |   offset         | 4 bytes|
//! |   len            | 4 bytes|
//! |   bytes          | N bytes|
//! +------------------+--------+
//! ```
//!
//! Patches are applied in order, so later patches win on overlap.

use lss_types::{ParseError, read_le_u32};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaPatch {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

#[must_use]
pub fn encode(patches: &[DeltaPatch]) -> Vec<u8> {
    let body: usize = patches.iter().map(|p| 8 + p.bytes.len()).sum();
    let mut out = Vec::with_capacity(4 + body);
    out.extend_from_slice(&(patches.len() as u32).to_le_bytes());
    for patch in patches {
        out.extend_from_slice(&patch.offset.to_le_bytes());
        out.extend_from_slice(&(patch.bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&patch.bytes);
    }
    out
}

pub fn decode(bytes: &[u8]) -> Result<Vec<DeltaPatch>, ParseError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let count = read_le_u32(bytes, 0)? as usize;
    let mut offset = 4_usize;
    let mut patches = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let at = read_le_u32(bytes, offset)?;
        let len = read_le_u32(bytes, offset + 4)? as usize;
        offset += 8;
        let data = lss_types::ensure_slice(bytes, offset, len)?;
        offset += len;
        patches.push(DeltaPatch {
            offset: at,
            bytes: data.to_vec(),
        });
    }
    if offset != bytes.len() {
        return Err(ParseError::InvalidField {
            field: "delta",
            reason: "trailing bytes after last patch",
        });
    }
    Ok(patches)
}

/// Apply an encoded delta to `buf` in place.
///
/// The buffer is untouched if any patch is malformed or out of range.
pub fn apply(buf: &mut [u8], delta: &[u8]) -> Result<(), ParseError> {
    let patches = decode(delta)?;
    for patch in &patches {
        let end = (patch.offset as usize).checked_add(patch.bytes.len());
        if end.is_none_or(|end| end > buf.len()) {
            return Err(ParseError::InvalidField {
                field: "delta.patch",
                reason: "patch extends past extent end",
            });
        }
    }
    for patch in patches {
        let start = patch.offset as usize;
        buf[start..start + patch.bytes.len()].copy_from_slice(&patch.bytes);
    }
    Ok(())
}
