//! Segment allocation for the journal.

use lss_error::{LssError, Result};
use lss_types::SegmentId;
use parking_lot::Mutex;
use tracing::debug;

/// Hands out empty segments to the journal and takes back closed ones.
pub trait SegmentProvider: Send + Sync {
    /// Next segment the journal may open.
    fn get_segment(&self) -> Result<SegmentId>;

    /// The journal finished writing `segment`.
    fn put_segment(&self, segment: SegmentId);
}

#[derive(Debug)]
struct ProviderState {
    next: u32,
    closed: Vec<SegmentId>,
}

/// Allocates segments in increasing id order without reuse.
#[derive(Debug)]
pub struct SequentialSegmentProvider {
    num_segments: u32,
    state: Mutex<ProviderState>,
}

impl SequentialSegmentProvider {
    #[must_use]
    pub fn new(num_segments: u32) -> Self {
        Self {
            num_segments,
            state: Mutex::new(ProviderState {
                next: 0,
                closed: Vec::new(),
            }),
        }
    }

    /// Never hand out `segment` or any segment before it.
    pub fn advance_past(&self, segment: SegmentId) {
        let mut state = self.state.lock();
        state.next = state.next.max(segment.0.saturating_add(1));
    }

    /// Segments the journal has closed, oldest first.
    #[must_use]
    pub fn closed_segments(&self) -> Vec<SegmentId> {
        self.state.lock().closed.clone()
    }
}

impl SegmentProvider for SequentialSegmentProvider {
    fn get_segment(&self) -> Result<SegmentId> {
        let mut state = self.state.lock();
        if state.next >= self.num_segments {
            return Err(LssError::NoSpace);
        }
        let id = SegmentId(state.next);
        state.next += 1;
        drop(state);
        debug!(target: "lss::journal", segment = id.0, "provide_segment");
        Ok(id)
    }

    fn put_segment(&self, segment: SegmentId) {
        self.state.lock().closed.push(segment);
    }
}
