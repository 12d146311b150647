//! Append-only per-partition record storage.

use std::fmt::Debug;

use thiserror::Error;

use crate::protocol::RecordBatch;

pub use commit_log::{CommitLog, DEFAULT_MAX_SEGMENT_BYTES};

mod commit_log;
mod entry;
mod segment;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("offset {offset} is outside of [{oldest}, {newest}]")]
    OffsetOutOfRange { offset: i64, oldest: i64, newest: i64 },

    #[error("append at offset {got} is not contiguous with next offset {expected}")]
    NonContiguous { expected: i64, got: i64 },

    #[error("log io: {0}")]
    Io(#[from] std::io::Error),

    #[error("log encoding: {0}")]
    Encoding(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, LogError>;

/// A durable, offset-addressed sequence of record batches.
///
/// Offsets are dense: a batch of `n` records appended when [`Log::newest_offset`] is `o`
/// occupies `[o, o + n)` and moves the newest offset to `o + n`.
pub trait Log: Send + Sync + Debug {
    /// Appends a batch at the next offset, returning the base offset assigned to it.
    fn append(&self, batch: RecordBatch) -> Result<i64>;

    /// Appends a batch that already carries its base offset, as copied from a leader.
    ///
    /// Returns `Ok(None)` when every record of the batch is already present, and
    /// [`LogError::NonContiguous`] when the batch would leave a gap or overlap partially.
    fn append_replicated(&self, batch: RecordBatch) -> Result<Option<i64>>;

    /// Reads whole batches starting with the one containing `offset`, until `max_bytes` of
    /// payload have been collected. At least one batch is returned when any exist past
    /// `offset`, so a single oversized batch never stalls a reader.
    fn read(&self, offset: i64, max_bytes: usize) -> Result<Vec<RecordBatch>>;

    fn oldest_offset(&self) -> i64;

    /// The offset the next appended record will receive.
    fn newest_offset(&self) -> i64;

    /// Drops every batch that ends past `offset`. Truncation happens on batch boundaries,
    /// so the resulting newest offset may be lower than `offset`.
    fn truncate(&self, offset: i64) -> Result<()>;

    /// Removes the log and all of its files.
    fn delete(&self) -> Result<()>;
}
