#![forbid(unsafe_code)]
//! Error types for the log-structured store.
//!
//! # Error Taxonomy
//!
//! The store uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `lss-types` | Byte-level decoding failures (truncated headers, bad magic) |
//! | Runtime | `LssError` | `lss-error` (this crate) | Errors surfaced by the segment manager, journal, cache and transaction manager |
//!
//! ## Mapping Policy: ParseError → LssError
//!
//! `lss-error` does not depend on `lss-types`. The journal converts a
//! `ParseError` at the point where it knows the physical location of the
//! bytes it was decoding:
//!
//! | Situation | LssError Variant |
//! |-----------|------------------|
//! | Record or delta bytes at a known address fail to decode | `Corruption { segment, offset, detail }` |
//! | Segment header of a segment being opened is unreadable | `Format(detail)` |
//! | Anything else (tooling, tests) | `Parse(detail)` |
//!
//! ## Cache-Level Outcomes
//!
//! | Situation | Outcome |
//! |-----------|---------|
//! | Disk read fails while filling an extent | `Io`, every waiter on that extent sees the same error |
//! | Stored checksum does not match the bytes read | `Corruption` |
//! | Read-set validation fails at commit | `try_construct_record` returns `None`; the transaction manager reports `Conflict` |
//! | Record can never fit in a segment | `RecordTooLarge` |
//! | Internal invariant broken (double insert, retire of an unseen extent) | panic |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`LssError::to_errno`].
//! The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `RecordTooLarge` | `ERANGE` |
//! | `Conflict` | `EAGAIN` |
//! | `Closed` | `EBADF` |
//! | `NotFound` | `ENOENT` |

use thiserror::Error;

/// Unified error type for all store operations.
#[derive(Debug, Error)]
pub enum LssError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes at a known physical location failed verification.
    ///
    /// `segment`/`offset` identify the location for triage. Checksum
    /// mismatches on extent fill and undecodable deltas both land here.
    #[error("corrupt data at segment {segment} offset {offset}: {detail}")]
    Corruption {
        segment: u32,
        offset: i64,
        detail: String,
    },

    /// Invalid on-device format (wrong magic, unsupported version).
    #[error("invalid on-device format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without location context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Request outside the valid range of the device or segment.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No free segment or no room left in the target segment.
    #[error("no space left on device")]
    NoSpace,

    /// A record larger than any segment can hold.
    #[error("record of {length} bytes exceeds the maximum of {max} bytes")]
    RecordTooLarge { length: u64, max: u64 },

    /// Optimistic validation failed; the caller must restart the transaction.
    #[error("transaction {txn} conflicts with a concurrent commit")]
    Conflict { txn: u64 },

    /// Target segment or journal is not open for writing.
    #[error("segment or journal is closed")]
    Closed,

    /// Named object not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl LssError {
    /// Convert this error into a POSIX errno.
    ///
    /// - `Conflict` → `EAGAIN`: the transaction can be retried from scratch.
    /// - `RecordTooLarge` → `ERANGE`: no segment geometry admits the record.
    /// - `Closed` → `EBADF`: write to a segment that is not open.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::RecordTooLarge { .. } => libc::ERANGE,
            Self::Conflict { .. } => libc::EAGAIN,
            Self::Closed => libc::EBADF,
            Self::NotFound(_) => libc::ENOENT,
        }
    }

    /// Whether the caller may retry the whole transaction.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Reproduce this error for another waiter on the same failed operation.
    ///
    /// `std::io::Error` is not `Clone`; I/O errors keep their kind, raw OS
    /// code when present, and message.
    #[must_use]
    pub fn replicate(&self) -> Self {
        match self {
            Self::Io(err) => Self::Io(match err.raw_os_error() {
                Some(code) => std::io::Error::from_raw_os_error(code),
                None => std::io::Error::new(err.kind(), err.to_string()),
            }),
            Self::Corruption {
                segment,
                offset,
                detail,
            } => Self::Corruption {
                segment: *segment,
                offset: *offset,
                detail: detail.clone(),
            },
            Self::Format(s) => Self::Format(s.clone()),
            Self::Parse(s) => Self::Parse(s.clone()),
            Self::InvalidArgument(s) => Self::InvalidArgument(s.clone()),
            Self::NoSpace => Self::NoSpace,
            Self::RecordTooLarge { length, max } => Self::RecordTooLarge {
                length: *length,
                max: *max,
            },
            Self::Conflict { txn } => Self::Conflict { txn: *txn },
            Self::Closed => Self::Closed,
            Self::NotFound(s) => Self::NotFound(s.clone()),
        }
    }
}

/// Result alias using `LssError`.
pub type Result<T> = std::result::Result<T, LssError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(LssError, libc::c_int)> = vec![
            (LssError::Io(std::io::Error::other("test")), libc::EIO),
            (
                LssError::Corruption {
                    segment: 0,
                    offset: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (LssError::Format("test".into()), libc::EINVAL),
            (LssError::Parse("test".into()), libc::EINVAL),
            (LssError::InvalidArgument("test".into()), libc::EINVAL),
            (LssError::NoSpace, libc::ENOSPC),
            (LssError::RecordTooLarge { length: 2, max: 1 }, libc::ERANGE),
            (LssError::Conflict { txn: 7 }, libc::EAGAIN),
            (LssError::Closed, libc::EBADF),
            (LssError::NotFound("test".into()), libc::ENOENT),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = LssError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = LssError::Corruption {
            segment: 3,
            offset: 8192,
            detail: "crc mismatch".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt data at segment 3 offset 8192: crc mismatch"
        );

        let big = LssError::RecordTooLarge {
            length: 10,
            max: 4,
        };
        assert_eq!(
            big.to_string(),
            "record of 10 bytes exceeds the maximum of 4 bytes"
        );

        let conflict = LssError::Conflict { txn: 12 };
        assert!(conflict.is_conflict());
        assert_eq!(
            conflict.to_string(),
            "transaction 12 conflicts with a concurrent commit"
        );
        assert!(!LssError::NoSpace.is_conflict());
    }

    #[test]
    fn replicate_preserves_kind_and_errno() {
        let raw = LssError::Io(std::io::Error::from_raw_os_error(libc::EIO));
        let copy = raw.replicate();
        assert_eq!(copy.to_errno(), libc::EIO);

        let custom = LssError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "short read",
        ));
        match custom.replicate() {
            LssError::Io(err) => {
                assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
                assert!(err.to_string().contains("short read"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let corrupt = LssError::Corruption {
            segment: 1,
            offset: 2,
            detail: "bad".into(),
        };
        assert_eq!(corrupt.replicate().to_string(), corrupt.to_string());
    }
}
