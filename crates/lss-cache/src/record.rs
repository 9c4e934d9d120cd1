//! Record construction.
//!
//! The final address of a fresh extent is the record base plus the summed
//! lengths of the fresh extents before it. [`fresh_offsets`] is the only
//! place that sum is computed; both record construction and commit
//! completion go through it.

use crate::extent::CachedExtent;
use lss_types::{DeltaInfo, ExtentLen, ExtentPayload, Record, SegmentOffset};

/// Offset of each fresh extent from the record base, in record order.
#[must_use]
pub fn fresh_offsets(lengths: &[ExtentLen]) -> Vec<SegmentOffset> {
    let mut next: SegmentOffset = 0;
    lengths
        .iter()
        .map(|&len| {
            let at = next;
            next = next.saturating_add(SegmentOffset::try_from(len).unwrap_or(SegmentOffset::MAX));
            at
        })
        .collect()
}

/// Accumulates record entries in log order.
#[derive(Debug, Default)]
pub struct RecordBuilder {
    record: Record,
}

impl RecordBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the full contents of a fresh extent.
    pub fn push_fresh(&mut self, extent: &CachedExtent) {
        assert!(
            self.record.deltas.is_empty(),
            "fresh extent {extent} after deltas"
        );
        self.record.extents.push(ExtentPayload {
            ext_type: extent.ext_type(),
            laddr: extent.laddr(),
            bytes: extent.to_vec(),
        });
    }

    pub fn push_delta(&mut self, delta: DeltaInfo) {
        self.record.deltas.push(delta);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.record.extents.len() + self.record.deltas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.record.is_empty()
    }

    #[must_use]
    pub fn finish(self) -> Record {
        self.record
    }
}
