use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::log::entry::{Entry, IndexEntry};
use crate::log::Result;
use crate::protocol::RecordBatch;

/// One file of a commit log, holding the batches from `base_offset` up to `next_offset`.
#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    base_offset: i64,
    next_offset: i64,
    bytes: u64,
    log: File,
    index: Vec<IndexEntry>,
}

impl Segment {
    pub fn log_name(base_offset: i64) -> String {
        format!("{:020}.log", base_offset)
    }

    pub fn parse_name(name: &str) -> Option<i64> {
        name.strip_suffix(".log")?.parse().ok()
    }

    /// Opens or creates the segment starting at `base_offset`, rebuilding its index from the
    /// file. A torn frame at the tail is cut off.
    pub fn open(dir: &Path, base_offset: i64) -> Result<Segment> {
        let path = dir.join(Self::log_name(base_offset));
        let mut log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = log.metadata()?.len();
        let mut index = Vec::new();
        let mut position = 0;
        let mut next_offset = base_offset;
        log.seek(SeekFrom::Start(0))?;
        while position + Entry::SIZE as u64 <= len {
            let entry = match Entry::read_from(&mut log) {
                Ok(entry) => entry,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            if position + entry.frame_len() > len || entry.base_offset != next_offset {
                break;
            }
            log.seek(SeekFrom::Current(entry.len as i64))?;
            index.push(IndexEntry { entry, position });
            position += entry.frame_len();
            next_offset = entry.next_offset();
        }

        if position < len {
            tracing::warn!(path = %path.display(), position, len, "truncating torn segment tail");
            log.set_len(position)?;
        }
        log.seek(SeekFrom::End(0))?;

        Ok(Segment {
            path,
            base_offset,
            next_offset,
            bytes: position,
            log,
            index,
        })
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    pub fn full(&self, max_bytes: u64) -> bool {
        self.bytes >= max_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Writes `batch`, whose base offset must equal this segment's next offset. The whole
    /// frame is built in memory and written with a single call.
    pub fn append(&mut self, batch: &RecordBatch) -> Result<()> {
        let payload = bincode::serialize(batch)?;
        let entry = Entry::new(batch.base_offset, batch.records.len() as i32, payload.len() as u32);
        let mut frame = Vec::with_capacity(Entry::SIZE + payload.len());
        entry.write_to(&mut frame)?;
        frame.extend_from_slice(&payload);

        self.log.seek(SeekFrom::End(0))?;
        self.log.write_all(&frame)?;
        self.log.flush()?;

        self.index.push(IndexEntry {
            entry,
            position: self.bytes,
        });
        self.bytes += frame.len() as u64;
        self.next_offset = entry.next_offset();
        Ok(())
    }

    /// Reads batches starting with the one containing `offset`. `budget` is decremented by
    /// the payload size of every batch returned; reading stops once it is spent, except
    /// that a batch is always returned when `out` is still empty.
    pub fn read(
        &mut self,
        offset: i64,
        budget: &mut usize,
        out: &mut Vec<RecordBatch>,
    ) -> Result<()> {
        let start = self
            .index
            .partition_point(|ie| ie.entry.next_offset() <= offset);

        for ie in self.index[start..].iter() {
            if *budget == 0 && !out.is_empty() {
                break;
            }
            self.log.seek(SeekFrom::Start(ie.position + Entry::SIZE as u64))?;
            let mut payload = vec![0u8; ie.entry.len as usize];
            self.log.read_exact(&mut payload)?;
            let batch: RecordBatch = bincode::deserialize(&payload)?;
            let size = batch.payload_bytes();
            if size > *budget && !out.is_empty() {
                *budget = 0;
                break;
            }
            *budget = budget.saturating_sub(size);
            out.push(batch);
        }
        Ok(())
    }

    /// Keeps only the batches ending at or before `offset`.
    pub fn truncate(&mut self, offset: i64) -> Result<()> {
        let keep = self
            .index
            .partition_point(|ie| ie.entry.next_offset() <= offset);
        if keep == self.index.len() {
            return Ok(());
        }

        let position = self.index[keep].position;
        self.index.truncate(keep);
        self.log.set_len(position)?;
        self.log.seek(SeekFrom::End(0))?;
        self.bytes = position;
        self.next_offset = self
            .index
            .last()
            .map_or(self.base_offset, |ie| ie.entry.next_offset());
        Ok(())
    }

    pub fn remove(self) -> Result<()> {
        drop(self.log);
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Record;

    fn batch(base_offset: i64, values: &[&'static str]) -> RecordBatch {
        let mut batch = RecordBatch::new(values.iter().map(|v| Record::new(*v)).collect());
        batch.base_offset = base_offset;
        batch
    }

    #[test]
    fn reopen_rebuilds_index() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let mut segment = Segment::open(dir.path(), 0)?;
            segment.append(&batch(0, &["a", "b"]))?;
            segment.append(&batch(2, &["c"]))?;
        }
        let mut segment = Segment::open(dir.path(), 0)?;
        assert_eq!(segment.next_offset(), 3);

        let mut out = Vec::new();
        segment.read(2, &mut 1024, &mut out)?;
        assert_eq!(out, vec![batch(2, &["c"])]);
        Ok(())
    }

    #[test]
    fn torn_tail_is_cut() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let mut segment = Segment::open(dir.path(), 0)?;
            segment.append(&batch(0, &["a"]))?;
        }
        let path = dir.path().join(Segment::log_name(0));
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[0, 0, 0, 0, 0, 0, 0, 1, 0, 0])?;
        drop(file);

        let segment = Segment::open(dir.path(), 0)?;
        assert_eq!(segment.next_offset(), 1);
        assert_eq!(std::fs::metadata(&path)?.len(), segment.bytes);
        Ok(())
    }

    #[test]
    fn truncate_on_batch_boundary() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut segment = Segment::open(dir.path(), 0)?;
        segment.append(&batch(0, &["a", "b"]))?;
        segment.append(&batch(2, &["c", "d"]))?;

        segment.truncate(3)?;
        assert_eq!(segment.next_offset(), 2);
        segment.append(&batch(2, &["e"]))?;

        let mut out = Vec::new();
        segment.read(0, &mut 1024, &mut out)?;
        assert_eq!(out, vec![batch(0, &["a", "b"]), batch(2, &["e"])]);
        Ok(())
    }

    #[test]
    fn names() {
        assert_eq!(Segment::log_name(42), "00000000000000000042.log");
        assert_eq!(Segment::parse_name("00000000000000000042.log"), Some(42));
        assert_eq!(Segment::parse_name("state"), None);
    }
}
