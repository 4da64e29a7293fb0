//! Central error type for capture and merge operations.
//!
//! All fatal conditions funnel into [`SpoolError`]: wire-format violations
//! detected before any unchecked data is trusted, I/O failures on the spool
//! files (never retried), configuration problems, and the one resource
//! failure the offline merge can hit (reserving the in-memory orphan
//! array). Expected conditions such as trailing orphans or a requested
//! cancellation are not errors and never appear here.

use std::collections::TryReserveError;
use std::path::PathBuf;

use thiserror::Error;

use crate::wire::WireError;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, SpoolError>;

/// Errors surfaced by capture, spool I/O, and the merge engine.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// A received fragment or stored record violated the wire format.
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    /// Read, write, or open failure on a spool file or socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed validation.
    #[error("configuration validation error: {0}")]
    Configuration(String),

    /// The orphan file cannot be sorted because its length is wrong.
    #[error(
        "orphan file is {len} bytes, not a multiple of the {slot_len}-byte \
         slot width; upstream corruption likely"
    )]
    OrphanFileCorrupt {
        /// Observed file length.
        len: u64,
        /// Deployment slot width.
        slot_len: usize,
    },

    /// A stripped record was cut short, mid-header or mid-payload.
    #[error("truncated record in {}: expected {expected} bytes, found {found}", path.display())]
    TruncatedRecord {
        /// File the truncation was found in.
        path: PathBuf,
        /// Bytes the record needed.
        expected: usize,
        /// Bytes actually present.
        found: usize,
    },

    /// The in-memory orphan array could not be reserved.
    #[error("failed to reserve {bytes} bytes for the orphan sort: {source}")]
    OrphanAllocation {
        /// Requested reservation.
        bytes: usize,
        /// Underlying allocation failure.
        #[source]
        source: TryReserveError,
    },
}
