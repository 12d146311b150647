use bytes::Bytes;

/// A single key/value record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl Record {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            key: None,
            value: value.into(),
        }
    }

    pub fn with_key(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: Some(key.into()),
            value: value.into(),
        }
    }
}

/// A batch of records occupying the contiguous offsets
/// `[base_offset, base_offset + records.len())` once appended to a log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub base_offset: i64,
    /// Milliseconds since the unix epoch, or [`RecordBatch::NO_TIMESTAMP`].
    pub timestamp: i64,
    pub records: Vec<Record>,
}

impl Default for RecordBatch {
    fn default() -> Self {
        Self {
            base_offset: 0,
            timestamp: Self::NO_TIMESTAMP,
            records: Vec::new(),
        }
    }
}

impl RecordBatch {
    pub const NO_TIMESTAMP: i64 = -1;

    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    pub fn record_count(&self) -> i64 {
        self.records.len() as i64
    }

    /// The offset following the last record of this batch.
    pub fn next_offset(&self) -> i64 {
        self.base_offset + self.record_count()
    }

    pub fn has_timestamp(&self) -> bool {
        self.timestamp > 0
    }

    pub fn payload_bytes(&self) -> usize {
        self.records
            .iter()
            .map(|r| r.value.len() + r.key.as_ref().map_or(0, Bytes::len))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets() {
        let mut batch = RecordBatch::new(vec![Record::new("a"), Record::with_key("k", "b")]);
        batch.base_offset = 5;
        assert_eq!(batch.record_count(), 2);
        assert_eq!(batch.next_offset(), 7);
        assert_eq!(batch.payload_bytes(), 3);
        assert!(!batch.has_timestamp());
    }
}
