use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::broker::handler::Handler;
use crate::broker::Broker;
use crate::error::{BrokerError, Result};
use crate::protocol::{
    PartitionProduceData, PartitionProduceResponse, ProduceRequest, ProduceResponse, RecordBatch,
    TopicProduceResponse,
};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

impl Broker {
    /// Appends a batch to a partition this broker leads, returning its base offset and the
    /// timestamp it was stored with. Leadership is checked and the batch written under the
    /// partition's leadership lock, so a concurrent transition cannot truncate or replicate
    /// over it.
    fn append(&self, topic: &str, partition: i32, mut batch: RecordBatch) -> Result<(i64, i64)> {
        let p = self
            .registry
            .get(topic, partition)
            .ok_or_else(|| BrokerError::UnknownTopicOrPartition {
                topic: topic.to_string(),
                partition,
            })?;
        let leadership = p.leadership.read();
        if leadership.leader != self.config.id {
            return Err(BrokerError::NotLeaderForPartition {
                topic: topic.to_string(),
                partition,
                broker: self.config.id,
            });
        }
        if !batch.has_timestamp() {
            batch.timestamp = now_ms();
        }
        let timestamp = batch.timestamp;
        let base_offset = p.log.append(batch)?;
        Ok((base_offset, timestamp))
    }
}

#[async_trait]
impl Handler<ProduceRequest> for Broker {
    async fn handle(
        &self,
        req: ProduceRequest,
        mut res: ProduceResponse,
    ) -> anyhow::Result<ProduceResponse> {
        let mut appended = false;
        for td in req.topic_data {
            let mut topic = TopicProduceResponse {
                name: td.name.clone(),
                partition_responses: Vec::with_capacity(td.partition_data.len()),
            };
            for PartitionProduceData { index, records } in td.partition_data {
                let mut pr = PartitionProduceResponse {
                    index,
                    base_offset: -1,
                    log_append_time_ms: -1,
                    ..Default::default()
                };
                match self.append(&td.name, index, records) {
                    Ok((base_offset, timestamp)) => {
                        tracing::trace!(topic = %td.name, partition = index, base_offset, "appended");
                        pr.base_offset = base_offset;
                        pr.log_append_time_ms = timestamp;
                        appended = true;
                    }
                    Err(e) => {
                        tracing::debug!(topic = %td.name, partition = index, "produce failed: {}", e);
                        pr.error_code = e.code();
                        pr.error_message = e.message();
                    }
                }
                topic.partition_responses.push(pr);
            }
            res.responses.push(topic);
        }
        if appended {
            self.appended.notify_waiters();
        }
        Ok(res)
    }
}
