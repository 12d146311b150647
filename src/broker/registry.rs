use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::broker::replicator::ReplicatorHandle;
use crate::error::{BrokerError, Result};
use crate::log::Log;
use crate::protocol::{BrokerId, LeaderAndIsrPartitionState};

/// Leadership metadata of a locally hosted partition replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionMeta {
    pub topic: String,
    pub partition: i32,
    pub replicas: Vec<BrokerId>,
    pub isr: Vec<BrokerId>,
    pub leader: BrokerId,
    pub leader_epoch: i32,
}

impl From<&LeaderAndIsrPartitionState> for PartitionMeta {
    fn from(state: &LeaderAndIsrPartitionState) -> Self {
        Self {
            topic: state.topic_name.clone(),
            partition: state.partition_index,
            replicas: state.replicas.clone(),
            isr: state.isr.clone(),
            leader: state.leader,
            leader_epoch: state.leader_epoch,
        }
    }
}

/// Who currently leads a hosted partition. Appends hold the read side while they check
/// leadership and write; transitions hold the write side while they switch leaders and
/// truncate, so no append lands on a log that has just stopped being the leader's.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Leadership {
    pub leader: BrokerId,
    pub leader_epoch: i32,
}

impl From<&PartitionMeta> for Leadership {
    fn from(meta: &PartitionMeta) -> Self {
        Self {
            leader: meta.leader,
            leader_epoch: meta.leader_epoch,
        }
    }
}

/// A snapshot of one partition handed out to request handlers. The log and leadership are
/// shared; the metadata is a copy and does not follow later leadership changes.
#[derive(Clone)]
pub struct PartitionRef {
    pub meta: PartitionMeta,
    pub log: Arc<dyn Log>,
    pub leadership: Arc<RwLock<Leadership>>,
}

impl Debug for PartitionRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionRef")
            .field("meta", &self.meta)
            .finish()
    }
}

/// Everything the broker holds for a hosted replica.
pub struct PartitionEntry {
    pub meta: PartitionMeta,
    pub log: Arc<dyn Log>,
    pub leadership: Arc<RwLock<Leadership>>,
    pub replicator: Option<ReplicatorHandle>,
    /// Fetch offsets reported by followers, known only on the leader.
    pub progress: HashMap<BrokerId, i64>,
    pub high_watermark: i64,
}

impl PartitionEntry {
    /// Followers start without a high watermark until their leader tells them one.
    fn new(meta: PartitionMeta, log: Arc<dyn Log>, me: BrokerId) -> Self {
        let high_watermark = match meta.leader == me {
            true => log.newest_offset(),
            false => 0,
        };
        Self {
            leadership: Arc::new(RwLock::new(Leadership::from(&meta))),
            meta,
            log,
            replicator: None,
            progress: HashMap::new(),
            high_watermark,
        }
    }

    fn to_ref(&self) -> PartitionRef {
        PartitionRef {
            meta: self.meta.clone(),
            log: self.log.clone(),
            leadership: self.leadership.clone(),
        }
    }

    /// Recomputes the high watermark as the lowest offset known to be held by every ISR
    /// member. An ISR member that has not fetched from this leader yet holds it where it
    /// is; it never moves backwards.
    fn advance_high_watermark(&mut self) -> i64 {
        let newest = self.log.newest_offset();
        let leader = self.meta.leader;
        let current = self.high_watermark;
        let hw = self
            .meta
            .isr
            .iter()
            .filter(|id| **id != leader)
            .map(|id| self.progress.get(id).copied().unwrap_or(current))
            .fold(newest, i64::min);
        self.high_watermark = self.high_watermark.max(hw).min(newest);
        self.high_watermark
    }
}

/// The topic to partitions map of every replica hosted by this broker.
///
/// All access goes through one reader/writer lock that is only held for the duration of a
/// map operation, never across I/O or an await point.
#[derive(Default)]
pub struct Registry {
    topics: RwLock<HashMap<String, Vec<PartitionEntry>>>,
}

impl Debug for Registry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Registry {{ topics: {} }}", self.topics.read().len())
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, topic: &str, partition: i32) -> Option<PartitionRef> {
        let topics = self.topics.read();
        topics
            .get(topic)?
            .iter()
            .find(|p| p.meta.partition == partition)
            .map(PartitionEntry::to_ref)
    }

    pub fn contains(&self, topic: &str, partition: i32) -> bool {
        self.get(topic, partition).is_some()
    }

    /// Registers a new replica hosted by broker `me`. A partition id may only appear once
    /// per topic.
    pub fn insert(&self, meta: PartitionMeta, log: Arc<dyn Log>, me: BrokerId) -> Result<()> {
        let mut topics = self.topics.write();
        let partitions = topics.entry(meta.topic.clone()).or_default();
        if partitions.iter().any(|p| p.meta.partition == meta.partition) {
            return Err(BrokerError::DuplicatePartition {
                topic: meta.topic,
                partition: meta.partition,
            });
        }
        let idx = partitions.partition_point(|p| p.meta.partition < meta.partition);
        partitions.insert(idx, PartitionEntry::new(meta, log, me));
        Ok(())
    }

    /// Runs `f` against the entry under the write lock.
    pub fn update<R>(
        &self,
        topic: &str,
        partition: i32,
        f: impl FnOnce(&mut PartitionEntry) -> R,
    ) -> Option<R> {
        let mut topics = self.topics.write();
        topics
            .get_mut(topic)?
            .iter_mut()
            .find(|p| p.meta.partition == partition)
            .map(f)
    }

    pub fn remove(&self, topic: &str, partition: i32) -> Option<PartitionEntry> {
        let mut topics = self.topics.write();
        let partitions = topics.get_mut(topic)?;
        let idx = partitions
            .iter()
            .position(|p| p.meta.partition == partition)?;
        let entry = partitions.remove(idx);
        if partitions.is_empty() {
            topics.remove(topic);
        }
        Some(entry)
    }

    pub fn remove_topic(&self, topic: &str) -> Vec<PartitionEntry> {
        self.topics.write().remove(topic).unwrap_or_default()
    }

    /// Every hosted topic and partition id.
    pub fn hosted(&self) -> Vec<(String, i32)> {
        self.topics
            .read()
            .iter()
            .flat_map(|(topic, ps)| ps.iter().map(move |p| (topic.clone(), p.meta.partition)))
            .collect()
    }

    /// Empties the registry, handing back every entry for teardown.
    pub fn drain(&self) -> Vec<PartitionEntry> {
        self.topics
            .write()
            .drain()
            .flat_map(|(_, partitions)| partitions)
            .collect()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<_> = self.topics.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn partitions(&self, topic: &str) -> Vec<PartitionMeta> {
        self.topics
            .read()
            .get(topic)
            .map(|ps| ps.iter().map(|p| p.meta.clone()).collect())
            .unwrap_or_default()
    }

    /// Records a follower's fetch position and returns the resulting high watermark.
    pub fn record_progress(
        &self,
        topic: &str,
        partition: i32,
        replica: BrokerId,
        offset: i64,
    ) -> Option<i64> {
        self.update(topic, partition, |p| {
            p.progress.insert(replica, offset);
            p.advance_high_watermark()
        })
    }

    pub fn high_watermark(&self, topic: &str, partition: i32) -> Option<i64> {
        self.update(topic, partition, PartitionEntry::advance_high_watermark)
    }

    /// Followers learn the high watermark from their leader.
    pub fn set_high_watermark(&self, topic: &str, partition: i32, hw: i64) {
        self.update(topic, partition, |p| {
            p.high_watermark = hw.min(p.log.newest_offset());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::CommitLog;
    use crate::protocol::{Record, RecordBatch};

    const ME: BrokerId = BrokerId(1);

    fn meta(topic: &str, partition: i32, isr: &[i32]) -> PartitionMeta {
        let isr: Vec<_> = isr.iter().map(|id| BrokerId(*id)).collect();
        PartitionMeta {
            topic: topic.to_string(),
            partition,
            replicas: isr.clone(),
            leader: isr[0],
            isr,
            leader_epoch: 0,
        }
    }

    fn log(dir: &tempfile::TempDir, name: &str) -> Arc<dyn Log> {
        Arc::new(CommitLog::open(&dir.path().join(name), 1024).unwrap())
    }

    #[test]
    fn duplicate_partition_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        registry.insert(meta("t", 1, &[1]), log(&dir, "t-1"), ME).unwrap();
        registry.insert(meta("t", 0, &[1]), log(&dir, "t-0"), ME).unwrap();
        assert!(matches!(
            registry.insert(meta("t", 1, &[1]), log(&dir, "t-1b"), ME),
            Err(BrokerError::DuplicatePartition { .. })
        ));
        registry.insert(meta("u", 1, &[1]), log(&dir, "u-1"), ME).unwrap();

        let ids: Vec<_> = registry.partitions("t").iter().map(|p| p.partition).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(registry.topics(), vec!["t", "u"]);
    }

    #[test]
    fn removing_last_partition_drops_topic() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        registry.insert(meta("t", 0, &[1]), log(&dir, "t-0"), ME).unwrap();
        assert!(registry.remove("t", 0).is_some());
        assert!(registry.remove("t", 0).is_none());
        assert!(registry.topics().is_empty());
    }

    #[test]
    fn high_watermark_follows_slowest_isr_member() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let l = log(&dir, "t-0");
        registry.insert(meta("t", 0, &[1, 2, 3]), l.clone(), ME).unwrap();
        for _ in 0..3 {
            l.append(RecordBatch::new(vec![Record::new("x")])).unwrap();
        }

        assert_eq!(registry.high_watermark("t", 0), Some(0));
        assert_eq!(registry.record_progress("t", 0, BrokerId(2), 3), Some(0));
        l.append(RecordBatch::new(vec![Record::new("y")])).unwrap();
        assert_eq!(registry.record_progress("t", 0, BrokerId(3), 4), Some(3));
        assert_eq!(registry.record_progress("t", 0, BrokerId(2), 4), Some(4));
        assert_eq!(registry.high_watermark("u", 0), None);
    }

    #[test]
    fn silent_isr_members_hold_the_high_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        let l = log(&dir, "t-0");
        registry.insert(meta("t", 0, &[1, 2]), l.clone(), ME).unwrap();
        l.append(RecordBatch::new(vec![Record::new("a"), Record::new("b")])).unwrap();
        assert_eq!(registry.record_progress("t", 0, BrokerId(2), 2), Some(2));

        // a new leader term forgets follower progress
        registry.update("t", 0, |p| p.progress.clear());
        l.append(RecordBatch::new(vec![Record::new("c")])).unwrap();
        for _ in 0..3 {
            assert_eq!(registry.high_watermark("t", 0), Some(2));
        }
        assert_eq!(registry.record_progress("t", 0, BrokerId(2), 3), Some(3));
    }

    #[test]
    fn followers_start_without_a_high_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let l = log(&dir, "t-0");
        l.append(RecordBatch::new(vec![Record::new("a")])).unwrap();
        let registry = Registry::new();
        registry.insert(meta("t", 0, &[2, 1]), l, ME).unwrap();
        let p = registry.get("t", 0).unwrap();
        assert_eq!(p.leadership.read().leader, BrokerId(2));
        registry.set_high_watermark("t", 0, 5);
        assert_eq!(registry.update("t", 0, |p| p.high_watermark), Some(1));
        registry.set_high_watermark("t", 0, 0);
        assert_eq!(registry.update("t", 0, |p| p.high_watermark), Some(0));
    }
}
