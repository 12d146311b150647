use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::broker::handler::Handler;
use crate::broker::Broker;
use crate::error::{BrokerError, Result};
use crate::protocol::{
    BrokerId, ErrorCode, FetchPartition, FetchRequest, FetchResponse, FetchableTopicResponse,
    PartitionData,
};

impl Broker {
    fn fetch_partition(
        &self,
        topic: &str,
        fp: &FetchPartition,
        replica: BrokerId,
    ) -> Result<PartitionData> {
        let p = self
            .registry
            .get(topic, fp.partition)
            .ok_or_else(|| BrokerError::UnknownTopicOrPartition {
                topic: topic.to_string(),
                partition: fp.partition,
            })?;
        let fenced = fp.current_leader_epoch >= 0 && fp.current_leader_epoch != p.meta.leader_epoch;
        if p.meta.leader != self.config.id || fenced {
            return Err(BrokerError::NotLeaderForPartition {
                topic: topic.to_string(),
                partition: fp.partition,
                broker: self.config.id,
            });
        }

        let records = p
            .log
            .read(fp.fetch_offset, fp.partition_max_bytes.max(0) as usize)?;
        let hw = if replica.is_none() {
            self.registry.high_watermark(topic, fp.partition)
        } else {
            self.registry
                .record_progress(topic, fp.partition, replica, fp.fetch_offset)
        };
        Ok(PartitionData {
            partition_index: fp.partition,
            high_watermark: hw.unwrap_or_else(|| p.log.newest_offset()),
            log_start_offset: p.log.oldest_offset(),
            records,
            ..Default::default()
        })
    }

    /// One pass over every requested partition. Returns the response, the payload bytes it
    /// carries and whether any partition failed.
    fn read_fetch(&self, req: &FetchRequest) -> (FetchResponse, usize, bool) {
        let mut res = FetchResponse::default();
        let mut bytes = 0;
        let mut failed = false;
        for ft in &req.topics {
            let mut topic = FetchableTopicResponse {
                topic: ft.topic.clone(),
                partitions: Vec::with_capacity(ft.partitions.len()),
            };
            for fp in &ft.partitions {
                let data = match self.fetch_partition(&ft.topic, fp, req.replica_id) {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::debug!(topic = %ft.topic, partition = fp.partition, "fetch failed: {}", e);
                        failed = true;
                        PartitionData {
                            partition_index: fp.partition,
                            error_code: e.code(),
                            error_message: e.message(),
                            high_watermark: -1,
                            log_start_offset: -1,
                            records: Vec::new(),
                        }
                    }
                };
                bytes += data.records.iter().map(|b| b.payload_bytes()).sum::<usize>();
                topic.partitions.push(data);
            }
            res.responses.push(topic);
        }
        (res, bytes, failed)
    }
}

#[async_trait]
impl Handler<FetchRequest> for Broker {
    /// Answers once `min_bytes` are available, a partition fails, or `max_wait_ms` elapses.
    async fn handle(&self, req: FetchRequest, _res: FetchResponse) -> anyhow::Result<FetchResponse> {
        let deadline = Instant::now() + Duration::from_millis(req.max_wait_ms.max(0) as u64);
        loop {
            // registered before reading so an append in between still wakes us
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (res, bytes, failed) = self.read_fetch(&req);
            if failed || bytes >= req.min_bytes.max(0) as usize || Instant::now() >= deadline {
                return Ok(res);
            }
            tokio::select! {
                _ = self.token.cancelled() => return Ok(res),
                _ = tokio::time::sleep_until(deadline) => return Ok(res),
                _ = &mut notified => {}
            }
        }
    }
}
