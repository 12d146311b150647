use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::log::segment::Segment;
use crate::log::{Log, LogError, Result};
use crate::protocol::RecordBatch;

pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 1024 * 1024 * 1024;

/// A [`Log`] stored as a directory of segment files named after their base offsets.
#[derive(Debug)]
pub struct CommitLog {
    dir: PathBuf,
    max_segment_bytes: u64,
    segments: Mutex<Vec<Segment>>,
}

impl CommitLog {
    #[tracing::instrument]
    pub fn open(dir: &Path, max_segment_bytes: u64) -> Result<CommitLog> {
        std::fs::create_dir_all(dir)?;

        let mut offsets = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(offset) = entry.file_name().to_str().and_then(Segment::parse_name) {
                offsets.push(offset);
            }
        }
        offsets.sort_unstable();

        let mut segments = Vec::with_capacity(offsets.len().max(1));
        for offset in offsets {
            segments.push(Segment::open(dir, offset)?);
        }
        if segments.is_empty() {
            segments.push(Segment::open(dir, 0)?);
        }
        tracing::debug!(segments = segments.len(), "opened commit log");

        Ok(CommitLog {
            dir: dir.to_path_buf(),
            max_segment_bytes,
            segments: Mutex::new(segments),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, segments: &mut Vec<Segment>, batch: &RecordBatch) -> Result<()> {
        let roll = match segments.last() {
            Some(active) => active.full(self.max_segment_bytes) && !active.is_empty(),
            None => true,
        };
        if roll {
            segments.push(Segment::open(&self.dir, batch.base_offset)?);
        }
        if let Some(active) = segments.last_mut() {
            active.append(batch)?;
        }
        Ok(())
    }

    fn newest(segments: &[Segment]) -> i64 {
        segments.last().map_or(0, Segment::next_offset)
    }

    fn oldest(segments: &[Segment]) -> i64 {
        segments.first().map_or(0, Segment::base_offset)
    }
}

impl Log for CommitLog {
    fn append(&self, mut batch: RecordBatch) -> Result<i64> {
        let mut segments = self.segments.lock();
        let base_offset = Self::newest(&segments);
        batch.base_offset = base_offset;
        self.write(&mut segments, &batch)?;
        Ok(base_offset)
    }

    fn append_replicated(&self, batch: RecordBatch) -> Result<Option<i64>> {
        let mut segments = self.segments.lock();
        let newest = Self::newest(&segments);
        if batch.records.is_empty() || batch.next_offset() <= newest {
            return Ok(None);
        }
        if batch.base_offset != newest {
            return Err(LogError::NonContiguous {
                expected: newest,
                got: batch.base_offset,
            });
        }
        self.write(&mut segments, &batch)?;
        Ok(Some(batch.base_offset))
    }

    fn read(&self, offset: i64, max_bytes: usize) -> Result<Vec<RecordBatch>> {
        let mut segments = self.segments.lock();
        let (oldest, newest) = (Self::oldest(&segments), Self::newest(&segments));
        if offset < oldest || offset > newest {
            return Err(LogError::OffsetOutOfRange {
                offset,
                oldest,
                newest,
            });
        }

        let mut out = Vec::new();
        let mut budget = max_bytes;
        let start = segments
            .partition_point(|s| s.base_offset() <= offset)
            .saturating_sub(1);
        for segment in segments[start..].iter_mut() {
            if budget == 0 && !out.is_empty() {
                break;
            }
            segment.read(offset, &mut budget, &mut out)?;
        }
        Ok(out)
    }

    fn oldest_offset(&self) -> i64 {
        Self::oldest(&self.segments.lock())
    }

    fn newest_offset(&self) -> i64 {
        Self::newest(&self.segments.lock())
    }

    #[tracing::instrument(skip(self), fields(dir = %self.dir.display()))]
    fn truncate(&self, offset: i64) -> Result<()> {
        let mut segments = self.segments.lock();
        while segments.len() > 1 && segments.last().map_or(false, |s| s.base_offset() >= offset) {
            if let Some(segment) = segments.pop() {
                segment.remove()?;
            }
        }
        if let Some(active) = segments.last_mut() {
            active.truncate(offset)?;
        }
        tracing::debug!(newest = Self::newest(&segments), "truncated");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(dir = %self.dir.display()))]
    fn delete(&self) -> Result<()> {
        let mut segments = self.segments.lock();
        segments.clear();
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
