use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::broker::registry::{Leadership, PartitionMeta};
use crate::broker::replicator::{Replicator, ReplicatorHandle};
use crate::broker::Broker;
use crate::error::Result;
use crate::log::{CommitLog, Log};
use crate::protocol::{BrokerId, LeaderAndIsrPartitionState};

impl Broker {
    pub(crate) fn partition_dir(&self, topic: &str, partition: i32) -> PathBuf {
        self.config
            .data_dir
            .join("topics")
            .join(format!("{}-{}", topic, partition))
    }

    fn start_replicator(
        &self,
        topic: &str,
        partition: i32,
        leader: BrokerId,
        log: Arc<dyn Log>,
    ) -> Option<ReplicatorHandle> {
        if leader.is_none() || leader == self.config.id {
            return None;
        }
        let replicator = Replicator::new(self.clone(), topic.to_string(), partition, leader, log);
        Some(replicator.spawn())
    }

    async fn stop_replicator(&self, topic: &str, partition: i32) {
        let handle = self
            .registry
            .update(topic, partition, |p| p.replicator.take())
            .flatten();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Brings the local replica of a partition in line with a leadership decision of the
    /// controller. Decisions carrying an epoch no newer than the one already applied are
    /// ignored, so retransmits and reordered commands are harmless.
    ///
    /// A follower that starts following a different leader drops everything past its high
    /// watermark first; the new leader's log is authoritative beyond it.
    #[tracing::instrument(
        skip(self, state),
        fields(id = %self.config.id, topic = %state.topic_name, partition = state.partition_index)
    )]
    pub(crate) async fn apply_partition_state(&self, state: &LeaderAndIsrPartitionState) -> Result<()> {
        let _transition = self.transitions.lock().await;
        let me = self.config.id;
        let topic = state.topic_name.as_str();
        let partition = state.partition_index;

        if state.leader != me && !state.replicas.contains(&me) {
            self.release(topic, partition, true).await?;
            return Ok(());
        }

        let current = match self.registry.get(topic, partition) {
            Some(current) => current,
            None => {
                let log: Arc<dyn Log> = Arc::new(CommitLog::open(
                    &self.partition_dir(topic, partition),
                    self.config.max_segment_bytes,
                )?);
                self.registry
                    .insert(PartitionMeta::from(state), log.clone(), me)?;
                let replicator = self.start_replicator(topic, partition, state.leader, log);
                self.registry
                    .update(topic, partition, |p| p.replicator = replicator);
                tracing::info!(leader = %state.leader, epoch = state.leader_epoch, "hosting replica");
                return Ok(());
            }
        };
        if state.leader_epoch <= current.meta.leader_epoch {
            tracing::trace!(
                epoch = state.leader_epoch,
                current = current.meta.leader_epoch,
                "ignoring stale leadership"
            );
            return Ok(());
        }

        let was = current.meta.leader;
        let meta = PartitionMeta::from(state);
        let leadership = Leadership::from(&meta);
        if state.leader == me {
            if was != me {
                self.stop_replicator(topic, partition).await;
                tracing::info!(epoch = state.leader_epoch, "became leader");
            }
            *current.leadership.write() = leadership;
            self.registry.update(topic, partition, |p| {
                p.meta = meta;
                p.progress.clear();
            });
            return Ok(());
        }

        if was != state.leader {
            self.stop_replicator(topic, partition).await;
            let hw = self
                .registry
                .update(topic, partition, |p| p.high_watermark)
                .unwrap_or(0);
            {
                let mut guard = current.leadership.write();
                *guard = leadership;
                current.log.truncate(hw)?;
            }
            tracing::info!(
                old = %was,
                new = %state.leader,
                truncated_to = current.log.newest_offset(),
                "following new leader"
            );
        } else {
            *current.leadership.write() = leadership;
        }

        let running = self
            .registry
            .update(topic, partition, |p| {
                p.meta = meta;
                p.progress.clear();
                p.replicator.is_some()
            })
            .unwrap_or(false);
        if !running {
            let replicator =
                self.start_replicator(topic, partition, state.leader, current.log.clone());
            self.registry
                .update(topic, partition, |p| p.replicator = replicator);
        }
        Ok(())
    }

    /// Stops hosting a replica, deleting its log when asked to. Returns whether the replica
    /// was hosted.
    pub(crate) async fn release(&self, topic: &str, partition: i32, delete: bool) -> Result<bool> {
        let entry = match self.registry.remove(topic, partition) {
            Some(entry) => entry,
            None => {
                if delete {
                    let dir = self.partition_dir(topic, partition);
                    if dir.exists() {
                        std::fs::remove_dir_all(&dir).map_err(anyhow::Error::from)?;
                    }
                }
                return Ok(false);
            }
        };
        *entry.leadership.write() = Leadership {
            leader: BrokerId::NONE,
            leader_epoch: entry.meta.leader_epoch,
        };
        if let Some(replicator) = entry.replicator {
            replicator.stop().await;
        }
        if delete {
            entry.log.delete()?;
        }
        tracing::info!(delete, "released replica");
        Ok(true)
    }

    /// Whether the cluster state places a replica of the partition on this broker.
    fn assigned(&self, topic: &str, partition: i32) -> anyhow::Result<bool> {
        let me = self.config.id;
        Ok(self
            .store
            .get_partition(topic, partition)?
            .map_or(false, |p| p.leader == me || p.replicas.contains(&me)))
    }

    /// Releases hosted replicas the cluster state no longer assigns to this broker, as left
    /// behind by a stop command that never arrived. A replica has to be missing on two
    /// sweeps in a row, so one whose partition this broker's state has not caught up with
    /// yet survives.
    #[tracing::instrument(skip(self), fields(id = %self.config.id))]
    pub(crate) async fn release_orphans(&self) -> anyhow::Result<usize> {
        let mut missing = HashSet::new();
        for (topic, partition) in self.registry.hosted() {
            if !self.assigned(&topic, partition)? {
                missing.insert((topic, partition));
            }
        }
        let doomed: Vec<(String, i32)> = {
            let mut orphans = self.orphans.lock();
            let doomed = missing.intersection(&orphans).cloned().collect();
            *orphans = missing;
            doomed
        };

        let mut released = 0;
        for (topic, partition) in doomed {
            let _transition = self.transitions.lock().await;
            if self.assigned(&topic, partition)? {
                continue;
            }
            tracing::info!(%topic, partition, "releasing replica missing from cluster state");
            if self.release(&topic, partition, true).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Re-hosts every replica the cluster state assigns to this broker, reopening logs left
    /// on disk by an earlier run. Logs of partitions the cluster state no longer assigns
    /// here are deleted.
    pub(crate) async fn restore_partitions(&self) -> anyhow::Result<()> {
        self.remove_stale_logs()?;
        let me = self.config.id;
        for partition in self.store.get_all_partitions()? {
            if partition.leader != me && !partition.replicas.contains(&me) {
                continue;
            }
            self.apply_partition_state(&partition.state()).await?;
        }
        Ok(())
    }

    fn remove_stale_logs(&self) -> anyhow::Result<()> {
        let root = self.config.data_dir.join("topics");
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let parsed = name
                .to_str()
                .and_then(|n| n.rsplit_once('-'))
                .and_then(|(topic, idx)| Some((topic.to_string(), idx.parse::<i32>().ok()?)));
            let (topic, partition) = match parsed {
                Some(parsed) => parsed,
                None => continue,
            };
            if !self.assigned(&topic, partition)? {
                tracing::info!(%topic, partition, "removing log of unassigned partition");
                std::fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::broker::handler::test::new_broker;
    use crate::broker::handler::Handler;
    use crate::protocol::{
        BrokerId, CreatableTopic, CreateTopicsRequest, ErrorCode, LeaderAndIsrPartitionState,
        Record, RecordBatch,
    };

    fn state(leader: i32, epoch: i32, replicas: &[i32]) -> LeaderAndIsrPartitionState {
        let replicas: Vec<_> = replicas.iter().map(|id| BrokerId(*id)).collect();
        LeaderAndIsrPartitionState {
            topic_name: "t".into(),
            partition_index: 0,
            leader: BrokerId(leader),
            leader_epoch: epoch,
            isr: replicas.clone(),
            replicas,
        }
    }

    #[tokio::test]
    async fn leader_becomes_follower_and_truncates() -> anyhow::Result<()> {
        let (_dir, broker) = new_broker().await?;
        broker.apply_partition_state(&state(1, 0, &[1, 2])).await?;
        let p = broker.registry.get("t", 0).unwrap();
        p.log.append(RecordBatch::new(vec![Record::new("a")]))?;
        broker.registry.record_progress("t", 0, BrokerId(2), 1);
        p.log.append(RecordBatch::new(vec![Record::new("b")]))?;
        assert_eq!(p.log.newest_offset(), 2);

        broker.apply_partition_state(&state(2, 1, &[1, 2])).await?;
        let p = broker.registry.get("t", 0).unwrap();
        assert_eq!(p.meta.leader, BrokerId(2));
        assert_eq!(p.log.newest_offset(), 1);
        broker.shutdown().await
    }

    #[tokio::test]
    async fn stale_epochs_are_ignored() -> anyhow::Result<()> {
        let (_dir, broker) = new_broker().await?;
        broker.apply_partition_state(&state(1, 3, &[1])).await?;
        broker.apply_partition_state(&state(1, 2, &[1, 2])).await?;
        assert_eq!(broker.registry.get("t", 0).unwrap().meta.replicas, vec![BrokerId(1)]);
        broker.shutdown().await
    }

    #[tokio::test]
    async fn unassigned_replicas_are_released() -> anyhow::Result<()> {
        let (_dir, broker) = new_broker().await?;
        broker.apply_partition_state(&state(1, 0, &[1])).await?;
        let dir = broker.partition_dir("t", 0);
        assert!(dir.exists());

        broker.apply_partition_state(&state(2, 1, &[2])).await?;
        assert!(!broker.registry.contains("t", 0));
        assert!(!dir.exists());
        broker.shutdown().await
    }

    #[tokio::test]
    async fn follower_switching_leader_drops_its_unacknowledged_tail() -> anyhow::Result<()> {
        let (_dir, broker) = new_broker().await?;
        broker.apply_partition_state(&state(2, 0, &[2, 1])).await?;
        let p = broker.registry.get("t", 0).unwrap();
        for value in ["a", "b", "c"] {
            p.log.append(RecordBatch::new(vec![Record::new(value)]))?;
        }
        broker.registry.set_high_watermark("t", 0, 1);
        let leader = |broker: &crate::broker::Broker| {
            broker
                .registry
                .update("t", 0, |p| p.replicator.as_ref().map(|r| r.leader()))
                .flatten()
        };
        assert_eq!(leader(&broker), Some(BrokerId(2)));

        broker.apply_partition_state(&state(3, 1, &[3, 1, 2])).await?;
        let p = broker.registry.get("t", 0).unwrap();
        assert_eq!(p.log.newest_offset(), 1);
        assert_eq!(p.leadership.read().leader, BrokerId(3));
        assert_eq!(leader(&broker), Some(BrokerId(3)));

        // a new epoch under the same leader keeps the log and the replicator
        broker.apply_partition_state(&state(3, 2, &[3, 1])).await?;
        assert_eq!(broker.registry.get("t", 0).unwrap().meta.leader_epoch, 2);
        assert_eq!(leader(&broker), Some(BrokerId(3)));
        broker.shutdown().await
    }

    #[tokio::test]
    async fn replicas_missing_from_cluster_state_are_released() -> anyhow::Result<()> {
        let (_dir, broker) = new_broker().await?;
        let res = broker
            .do_handle(CreateTopicsRequest {
                topics: vec![CreatableTopic::new("kept", 1, 1)],
                timeout_ms: 0,
            })
            .await?;
        assert_eq!(res.topics[0].error_code, ErrorCode::None);
        broker.apply_partition_state(&state(1, 0, &[1])).await?;
        let ghost = broker.partition_dir("t", 0);

        // the first sweep only takes note
        assert_eq!(broker.release_orphans().await?, 0);
        assert!(broker.registry.contains("t", 0));
        assert_eq!(broker.release_orphans().await?, 1);
        assert!(!broker.registry.contains("t", 0));
        assert!(!ghost.exists());
        assert!(broker.registry.contains("kept", 0));
        assert_eq!(broker.release_orphans().await?, 0);
        broker.shutdown().await
    }

    #[tokio::test]
    async fn restore_removes_logs_of_unknown_partitions() -> anyhow::Result<()> {
        let (_dir, broker) = new_broker().await?;
        broker
            .do_handle(CreateTopicsRequest {
                topics: vec![CreatableTopic::new("kept-too", 1, 1)],
                timeout_ms: 0,
            })
            .await?;
        let stale = broker.partition_dir("gone", 4);
        std::fs::create_dir_all(&stale)?;
        let kept = broker.partition_dir("kept-too", 0);
        assert!(kept.exists());

        broker.restore_partitions().await?;
        assert!(!stale.exists());
        assert!(kept.exists());
        assert!(broker.registry.contains("kept-too", 0));
        broker.shutdown().await
    }
}
