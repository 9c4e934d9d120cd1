#![forbid(unsafe_code)]
//! Append-only record journal.
//!
//! The journal owns one open segment at a time. Each submitted record is
//! written as a single block-aligned unit; when it does not fit in the
//! current segment the journal closes it and rolls to the next segment
//! handed out by its [`SegmentProvider`]. Replay walks all journal segments
//! in sequence order and feeds every delta, together with the base address
//! of its record, to a caller-supplied handler.

pub mod provider;
pub mod record;

pub use provider::{SegmentProvider, SequentialSegmentProvider};

use lss_block::SegmentManager;
use lss_error::{LssError, Result};
use lss_types::{DeltaInfo, Paddr, ParseError, Record, SegmentId, SegmentSeq};
use parking_lot::Mutex;
use record::{
    HeaderDecode, RecordHeader, SegmentHeader, decode_metadata, decode_record_header,
    decode_segment_header, encode_record, encode_segment_header, encoded_record_size,
    split_extents,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Journal tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalOptions {
    /// Flush the device after every record before reporting it durable.
    pub sync_on_submit: bool,
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            sync_on_submit: true,
        }
    }
}

/// Statistics gathered by [`Journal::replay`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub segments_scanned: usize,
    pub records: u64,
    pub deltas: u64,
    pub fresh_extents: u64,
    /// Highest physical segment id that holds journal data.
    pub last_segment: Option<SegmentId>,
    /// Reason the scan of some segment stopped before zeroed space.
    pub discarded_tails: Vec<String>,
}

#[derive(Debug)]
struct JournalState {
    current: Option<SegmentId>,
    written_to: u32,
    next_segment_seq: SegmentSeq,
    next_record_seq: u64,
}

/// Manages the stream of atomically written records.
pub struct Journal<D: SegmentManager> {
    device: Arc<D>,
    provider: Arc<dyn SegmentProvider>,
    options: JournalOptions,
    block_size: u32,
    max_record_length: u64,
    state: Mutex<JournalState>,
}

impl<D: SegmentManager> std::fmt::Debug for Journal<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("block_size", &self.block_size)
            .field("max_record_length", &self.max_record_length)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

fn parse_to_corruption(addr: Paddr, err: &ParseError) -> LssError {
    LssError::Corruption {
        segment: addr.segment.0,
        offset: i64::from(addr.offset),
        detail: err.to_string(),
    }
}

impl<D: SegmentManager> Journal<D> {
    pub fn new(
        device: Arc<D>,
        provider: Arc<dyn SegmentProvider>,
        options: JournalOptions,
    ) -> Self {
        let block_size = device.block_size();
        let max_record_length =
            u64::from(device.segment_size()).saturating_sub(u64::from(block_size));
        Self {
            device,
            provider,
            options,
            block_size,
            max_record_length,
            state: Mutex::new(JournalState {
                current: None,
                written_to: 0,
                next_segment_seq: SegmentSeq(0),
                next_record_seq: 0,
            }),
        }
    }

    /// Largest encoded record this journal accepts.
    #[must_use]
    pub fn max_record_length(&self) -> u64 {
        self.max_record_length
    }

    /// Segment currently receiving records, if open.
    #[must_use]
    pub fn current_segment(&self) -> Option<SegmentId> {
        self.state.lock().current
    }

    /// Open a fresh segment for writing. Call after replay when remounting.
    pub fn open_for_write(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.roll(&mut state)
    }

    fn roll(&self, state: &mut JournalState) -> Result<()> {
        if let Some(old) = state.current.take() {
            self.device.close(old)?;
            self.provider.put_segment(old);
        }
        let id = self.provider.get_segment()?;
        self.device.open(id)?;
        let header = SegmentHeader {
            segment_seq: state.next_segment_seq,
            segment_id: id,
            // Nothing is ever written back out of the journal, so every
            // segment stays part of replay.
            replay_lb: Paddr::NULL,
        };
        let mut block = vec![0_u8; self.block_size as usize];
        block[..record::SEGMENT_HEADER_SIZE].copy_from_slice(&encode_segment_header(&header));
        self.device.write(Paddr::new(id, 0), &block)?;
        info!(
            target: "lss::journal",
            segment = id.0,
            segment_seq = header.segment_seq.0,
            "journal_segment_opened"
        );
        state.current = Some(id);
        state.written_to = self.block_size;
        state.next_segment_seq = state.next_segment_seq.next();
        Ok(())
    }

    /// Append `record` and return the address of its first fresh extent
    /// (`record start + metadata length`).
    ///
    /// The record is durable when this returns if `sync_on_submit` is set.
    pub fn submit_record(&self, record: &Record) -> Result<Paddr> {
        let size = encoded_record_size(record, self.block_size)?;
        let total = size.total();
        if total > self.max_record_length {
            return Err(LssError::RecordTooLarge {
                length: total,
                max: self.max_record_length,
            });
        }

        let mut state = self.state.lock();
        if state.current.is_none() {
            return Err(LssError::Closed);
        }
        if u64::from(state.written_to) + total > u64::from(self.device.segment_size()) {
            self.roll(&mut state)?;
        }
        let Some(segment) = state.current else {
            return Err(LssError::Closed);
        };

        let bytes = encode_record(record, state.next_record_seq, self.block_size)?;
        let start = Paddr::new(
            segment,
            i32::try_from(state.written_to)
                .map_err(|_| LssError::Format("segment offset exceeds i32".to_owned()))?,
        );
        self.device.write(start, &bytes)?;
        if self.options.sync_on_submit {
            self.device.sync()?;
        }

        let advance = u32::try_from(total)
            .map_err(|_| LssError::Format("record length exceeds u32".to_owned()))?
            .next_multiple_of(self.block_size);
        state.written_to += advance;
        let record_seq = state.next_record_seq;
        state.next_record_seq += 1;
        drop(state);

        let base = start.add_offset(
            i32::try_from(size.mdlength)
                .map_err(|_| LssError::Format("mdlength exceeds i32".to_owned()))?,
        );
        debug!(
            target: "lss::journal",
            record_seq,
            %start,
            %base,
            mdlength = size.mdlength,
            dlength = size.dlength,
            deltas = record.deltas.len(),
            extents = record.extents.len(),
            "record_submitted"
        );
        Ok(base)
    }

    /// Stop writing: close the open segment.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(old) = state.current.take() {
            self.device.close(old)?;
            self.provider.put_segment(old);
            info!(target: "lss::journal", segment = old.0, "journal_closed");
        }
        Ok(())
    }

    fn find_replay_segments(&self) -> Result<Vec<(SegmentId, SegmentHeader)>> {
        let mut block = vec![0_u8; self.block_size as usize];
        let mut segments = Vec::new();
        for id in 0..self.device.num_segments() {
            let id = SegmentId(id);
            self.device.read(Paddr::new(id, 0), &mut block)?;
            match decode_segment_header(&block) {
                Ok(header) if header.segment_id == id => segments.push((id, header)),
                Ok(header) => warn!(
                    target: "lss::journal",
                    segment = id.0,
                    claimed = header.segment_id.0,
                    "segment_header_id_mismatch"
                ),
                Err(_) => {}
            }
        }
        segments.sort_by_key(|(_, header)| header.segment_seq);
        Ok(segments)
    }

    /// Walk every decodable record of the journal in order.
    fn scan<F>(&self, report: &mut ReplayReport, mut visit: F) -> Result<()>
    where
        F: FnMut(Paddr, &RecordHeader, Vec<DeltaInfo>, Vec<u8>, &[record::ExtentDesc]) -> Result<()>,
    {
        let segments = self.find_replay_segments()?;
        if segments.is_empty() {
            return Err(LssError::NotFound("no journal segments on device".to_owned()));
        }
        let segment_size = self.device.segment_size();
        let block = self.block_size;
        let mut max_seq: Option<u64> = None;
        let mut newest_segment_seq = SegmentSeq(0);

        for (id, header) in &segments {
            report.segments_scanned += 1;
            report.last_segment = Some(report.last_segment.map_or(*id, |s| s.max(*id)));
            newest_segment_seq = header.segment_seq;

            let mut offset = block;
            let mut head = vec![0_u8; block as usize];
            while offset + block <= segment_size {
                let start = Paddr::new(*id, i32::try_from(offset).unwrap_or(i32::MAX));
                self.device.read(start, &mut head)?;
                let rec = match decode_record_header(&head, block) {
                    HeaderDecode::Header(rec) => rec,
                    HeaderDecode::EndOfData => break,
                    HeaderDecode::Corrupted(detail) => {
                        warn!(target: "lss::journal", %start, %detail, "journal_tail_discarded");
                        report.discarded_tails.push(format!("{start}: {detail}"));
                        break;
                    }
                };
                let total = u64::from(rec.mdlength) + u64::from(rec.dlength);
                if u64::from(offset) + total > u64::from(segment_size) {
                    let detail = format!("record of {total} bytes overruns segment");
                    warn!(target: "lss::journal", %start, %detail, "journal_tail_discarded");
                    report.discarded_tails.push(format!("{start}: {detail}"));
                    break;
                }

                let mut body = vec![0_u8; total as usize];
                self.device.read(start, &mut body)?;
                let (descs, deltas) = match decode_metadata(&rec, &body) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        warn!(target: "lss::journal", %start, error = %err, "journal_tail_discarded");
                        report.discarded_tails.push(format!("{start}: {err}"));
                        break;
                    }
                };
                let data = body.split_off(rec.mdlength as usize);
                let data_crc = crc32c::crc32c(&data);
                if data_crc != rec.data_crc {
                    let err = ParseError::ChecksumMismatch {
                        what: "record data",
                        expected: rec.data_crc,
                        actual: data_crc,
                    };
                    warn!(target: "lss::journal", %start, error = %err, "journal_tail_discarded");
                    report.discarded_tails.push(format!("{start}: {err}"));
                    break;
                }

                let base = start.add_offset(i32::try_from(rec.mdlength).unwrap_or(i32::MAX));
                report.records += 1;
                report.deltas += deltas.len() as u64;
                report.fresh_extents += descs.len() as u64;
                max_seq = Some(max_seq.map_or(rec.record_seq, |s| s.max(rec.record_seq)));
                visit(base, &rec, deltas, data, &descs)?;

                let advance = u32::try_from(total)
                    .map_err(|_| parse_to_corruption(start, &ParseError::InvalidField {
                        field: "record.length",
                        reason: "exceeds u32",
                    }))?
                    .next_multiple_of(block);
                offset += advance;
            }
        }

        let mut state = self.state.lock();
        state.next_segment_seq = newest_segment_seq.next();
        if let Some(seq) = max_seq {
            state.next_record_seq = state.next_record_seq.max(seq + 1);
        }
        Ok(())
    }

    /// Feed every delta of every durable record to `handler`, in log order.
    ///
    /// `handler` receives the record base (address of the record's first
    /// fresh extent). An error from `handler` aborts replay.
    pub fn replay<F>(&self, mut handler: F) -> Result<ReplayReport>
    where
        F: FnMut(Paddr, &DeltaInfo) -> Result<()>,
    {
        let mut report = ReplayReport::default();
        self.scan(&mut report, |base, _, deltas, _, _| {
            for delta in &deltas {
                handler(base, delta)?;
            }
            Ok(())
        })?;
        info!(
            target: "lss::journal",
            segments = report.segments_scanned,
            records = report.records,
            deltas = report.deltas,
            discarded = report.discarded_tails.len(),
            "journal_replayed"
        );
        Ok(report)
    }

    /// Decode every durable record, including fresh extent contents.
    pub fn read_records(&self) -> Result<Vec<(Paddr, Record)>> {
        let mut report = ReplayReport::default();
        let mut out = Vec::new();
        self.scan(&mut report, |base, _, deltas, data, descs| {
            let extents = split_extents(descs, &data).map_err(|e| parse_to_corruption(base, &e))?;
            out.push((base, Record { extents, deltas }));
            Ok(())
        })?;
        Ok(out)
    }
}
