use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::broker::transport::Channel;
use crate::broker::Broker;
use crate::log::Log;
use crate::protocol::{
    BrokerId, ErrorCode, FetchPartition, FetchRequest, FetchResponse, FetchTopic,
    ListOffsetsPartition, ListOffsetsRequest, ListOffsetsResponse, ListOffsetsTopic,
    RequestKind, ResponseKind, LATEST_TIMESTAMP,
};

/// Owner's side of a running replicator. Stopping cancels the fetch loop and waits for it
/// to exit, so no append from it can land after `stop` returns.
#[derive(Debug)]
pub struct ReplicatorHandle {
    leader: BrokerId,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ReplicatorHandle {
    pub fn leader(&self) -> BrokerId {
        self.leader
    }

    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(leader = %self.leader, "replicator task failed: {}", e);
        }
    }
}

/// Copies a partition from its leader into the local log.
///
/// Fetches park on the leader for up to `max_wait_ms`, so every replicator talks to its
/// leader over a connection of its own and never holds up consensus or membership traffic.
pub struct Replicator {
    broker: Broker,
    topic: String,
    partition: i32,
    leader: BrokerId,
    log: Arc<dyn Log>,
    channel: Option<Box<dyn Channel>>,
}

impl Replicator {
    pub fn new(
        broker: Broker,
        topic: String,
        partition: i32,
        leader: BrokerId,
        log: Arc<dyn Log>,
    ) -> Self {
        Self {
            broker,
            topic,
            partition,
            leader,
            log,
            channel: None,
        }
    }

    pub fn spawn(self) -> ReplicatorHandle {
        let token = self.broker.token.child_token();
        let leader = self.leader;
        let span = tracing::info_span!(
            "replicator",
            topic = %self.topic,
            partition = self.partition,
            %leader
        );
        let task = tokio::spawn(self.run(token.clone()).instrument(span));
        ReplicatorHandle {
            leader,
            token,
            task,
        }
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        let config = &self.broker.config.replica;
        ExponentialBuilder::default()
            .with_min_delay(config.backoff_min())
            .with_max_delay(config.backoff_max())
            .with_max_times(usize::MAX)
            .with_jitter()
            .build()
    }

    async fn run(mut self, token: CancellationToken) {
        tracing::debug!(offset = self.log.newest_offset(), "replicator started");
        let mut backoff = self.backoff();
        loop {
            let res = tokio::select! {
                _ = token.cancelled() => break,
                res = self.fetch() => res,
            };

            match res {
                Ok(_) => backoff = self.backoff(),
                Err(e) => {
                    let delay = backoff
                        .next()
                        .unwrap_or_else(|| self.broker.config.replica.backoff_max());
                    tracing::warn!(?delay, "replication fetch failed: {:#}", e);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        tracing::debug!(offset = self.log.newest_offset(), "replicator stopped");
    }

    /// Sends to the leader over this replicator's own connection, reconnecting after a
    /// failure.
    async fn request(&mut self, req: RequestKind) -> anyhow::Result<ResponseKind> {
        if self.channel.is_none() {
            let addr = self.broker.node_addr(self.leader)?;
            self.channel = Some(self.broker.transport.open(addr).await?);
        }
        let channel = match &self.channel {
            Some(channel) => channel,
            None => anyhow::bail!("no connection to leader {}", self.leader),
        };
        let res = channel.request(req).await;
        if res.is_err() {
            self.channel = None;
        }
        res
    }

    /// One round trip to the leader. Returns the number of records appended.
    async fn fetch(&mut self) -> anyhow::Result<usize> {
        let epoch = self
            .broker
            .registry
            .get(&self.topic, self.partition)
            .map(|p| p.meta.leader_epoch)
            .ok_or_else(|| anyhow::anyhow!("partition is no longer hosted"))?;
        let offset = self.log.newest_offset();
        let config = &self.broker.config.replica;

        let req = FetchRequest {
            replica_id: self.broker.config.id,
            max_wait_ms: config.max_wait_ms,
            min_bytes: config.min_bytes,
            topics: vec![FetchTopic {
                topic: self.topic.clone(),
                partitions: vec![FetchPartition {
                    partition: self.partition,
                    current_leader_epoch: epoch,
                    fetch_offset: offset,
                    partition_max_bytes: config.max_bytes,
                }],
            }],
        };
        let res = FetchResponse::try_from(self.request(req.into()).await?)?;

        let data = res
            .responses
            .into_iter()
            .filter(|t| t.topic == self.topic)
            .flat_map(|t| t.partitions)
            .find(|p| p.partition_index == self.partition)
            .ok_or_else(|| anyhow::anyhow!("leader response is missing the partition"))?;
        match data.error_code {
            ErrorCode::None => {}
            ErrorCode::OffsetOutOfRange => {
                self.truncate_to_leader().await?;
                return Ok(0);
            }
            code => anyhow::bail!(
                "leader {} answered {}{}",
                self.leader,
                code,
                data.error_message
                    .map(|m| format!(": {}", m))
                    .unwrap_or_default()
            ),
        }

        let mut appended = 0;
        for batch in data.records {
            let count = batch.records.len();
            if self.log.append_replicated(batch)?.is_some() {
                appended += count;
            }
        }
        self.broker
            .registry
            .set_high_watermark(&self.topic, self.partition, data.high_watermark);
        if appended > 0 {
            tracing::trace!(appended, newest = self.log.newest_offset(), "replicated");
        }
        Ok(appended)
    }

    /// Drops the local records past the leader's log end, after the leader refused a fetch
    /// from beyond it.
    async fn truncate_to_leader(&mut self) -> anyhow::Result<()> {
        let req = ListOffsetsRequest {
            replica_id: self.broker.config.id,
            topics: vec![ListOffsetsTopic {
                name: self.topic.clone(),
                partitions: vec![ListOffsetsPartition {
                    partition_index: self.partition,
                    timestamp: LATEST_TIMESTAMP,
                }],
            }],
        };
        let res = ListOffsetsResponse::try_from(self.request(req.into()).await?)?;
        let found = res
            .topics
            .into_iter()
            .filter(|t| t.name == self.topic)
            .flat_map(|t| t.partitions)
            .find(|p| p.partition_index == self.partition)
            .ok_or_else(|| anyhow::anyhow!("leader response is missing the partition"))?;
        if found.error_code != ErrorCode::None {
            anyhow::bail!("leader {} answered {}", self.leader, found.error_code);
        }

        let newest = self.log.newest_offset();
        let end = found.offset.min(newest);
        self.log.truncate(end)?;
        let truncated = self.log.newest_offset();
        self.broker.registry.update(&self.topic, self.partition, |p| {
            p.high_watermark = p.high_watermark.min(truncated);
        });
        tracing::info!(from = newest, to = truncated, leader_end = found.offset, "truncated to leader log end");
        Ok(())
    }
}
