use crate::protocol::{BrokerId, EntryPayload, LogEntry, QuorumServer};

const TERM: &[u8] = b"term";
const VOTE: &[u8] = b"vote";
const APPLIED: &[u8] = b"applied";

fn index_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

fn decode_index(key: &[u8]) -> anyhow::Result<u64> {
    Ok(u64::from_be_bytes(key.try_into()?))
}

fn decode_u64(value: Option<sled::IVec>) -> anyhow::Result<u64> {
    match value {
        Some(v) => decode_index(&v),
        None => Ok(0),
    }
}

/// The metadata log and the election state that must outlive a restart, stored next to
/// the broker's state. Entries are numbered from 1.
pub(crate) struct RaftLog {
    entries: sled::Tree,
    meta: sled::Tree,
    last_index: u64,
    last_term: u64,
}

impl RaftLog {
    pub fn open(db: &sled::Db) -> anyhow::Result<Self> {
        let entries = db.open_tree("raft_log")?;
        let meta = db.open_tree("raft_meta")?;
        let (last_index, last_term) = match entries.last()? {
            Some((k, v)) => (
                decode_index(&k)?,
                bincode::deserialize::<LogEntry>(&v)?.term,
            ),
            None => (0, 0),
        };
        Ok(Self {
            entries,
            meta,
            last_index,
            last_term,
        })
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn last_term(&self) -> u64 {
        self.last_term
    }

    pub fn get(&self, index: u64) -> anyhow::Result<Option<LogEntry>> {
        match self.entries.get(index_key(index))? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    /// The term of the entry at `index`, with the empty prefix at index 0 in term 0.
    pub fn term_at(&self, index: u64) -> anyhow::Result<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        Ok(self.get(index)?.map(|e| e.term))
    }

    pub fn append(&mut self, entry: LogEntry) -> anyhow::Result<u64> {
        let index = self.last_index + 1;
        self.entries
            .insert(index_key(index), bincode::serialize(&entry)?)?;
        self.last_index = index;
        self.last_term = entry.term;
        Ok(index)
    }

    /// Drops every entry from `index` on.
    pub fn truncate_from(&mut self, index: u64) -> anyhow::Result<()> {
        let doomed = self
            .entries
            .range(index_key(index)..)
            .keys()
            .collect::<Result<Vec<_>, _>>()?;
        for key in doomed {
            self.entries.remove(key)?;
        }
        self.last_index = index.saturating_sub(1);
        self.last_term = self.term_at(self.last_index)?.unwrap_or(0);
        Ok(())
    }

    /// Up to `max` entries starting at `from`.
    pub fn range(&self, from: u64, max: usize) -> anyhow::Result<Vec<LogEntry>> {
        self.entries
            .range(index_key(from)..)
            .values()
            .take(max)
            .map(|v| Ok(bincode::deserialize(&v?)?))
            .collect()
    }

    /// The newest server set in the log, with the index it was appended at.
    pub fn latest_config(&self) -> anyhow::Result<Option<(u64, Vec<QuorumServer>)>> {
        for item in self.entries.iter().rev() {
            let (k, v) = item?;
            if let EntryPayload::Config(servers) = bincode::deserialize::<LogEntry>(&v)?.payload {
                return Ok(Some((decode_index(&k)?, servers)));
            }
        }
        Ok(None)
    }

    pub fn term(&self) -> anyhow::Result<u64> {
        decode_u64(self.meta.get(TERM)?)
    }

    pub fn vote(&self) -> anyhow::Result<Option<BrokerId>> {
        match self.meta.get(VOTE)? {
            Some(v) => Ok(Some(BrokerId(i32::from_be_bytes(v.as_ref().try_into()?)))),
            None => Ok(None),
        }
    }

    /// Persists the current term and vote together; both must be durable before a vote
    /// is granted.
    pub fn save_election(&self, term: u64, vote: Option<BrokerId>) -> anyhow::Result<()> {
        self.meta.insert(TERM, term.to_be_bytes().to_vec())?;
        match vote {
            Some(id) => self.meta.insert(VOTE, id.0.to_be_bytes().to_vec())?,
            None => self.meta.remove(VOTE)?,
        };
        self.meta.flush()?;
        Ok(())
    }

    pub fn applied(&self) -> anyhow::Result<u64> {
        decode_u64(self.meta.get(APPLIED)?)
    }

    pub fn save_applied(&self, index: u64) -> anyhow::Result<()> {
        self.meta.insert(APPLIED, index.to_be_bytes().to_vec())?;
        Ok(())
    }
}
