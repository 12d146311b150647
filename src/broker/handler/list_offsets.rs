use async_trait::async_trait;

use crate::broker::handler::Handler;
use crate::broker::Broker;
use crate::error::{BrokerError, Result};
use crate::protocol::{
    ListOffsetsPartitionResponse, ListOffsetsRequest, ListOffsetsResponse,
    ListOffsetsTopicResponse, EARLIEST_TIMESTAMP, LATEST_TIMESTAMP,
};

impl Broker {
    fn offset_for(&self, topic: &str, partition: i32, timestamp: i64) -> Result<i64> {
        let p = self
            .registry
            .get(topic, partition)
            .ok_or_else(|| BrokerError::UnknownTopicOrPartition {
                topic: topic.to_string(),
                partition,
            })?;
        match timestamp {
            LATEST_TIMESTAMP => Ok(p.log.newest_offset()),
            EARLIEST_TIMESTAMP => Ok(p.log.oldest_offset()),
            ts => Err(BrokerError::UnsupportedTimestamp(ts)),
        }
    }
}

#[async_trait]
impl Handler<ListOffsetsRequest> for Broker {
    async fn handle(
        &self,
        req: ListOffsetsRequest,
        mut res: ListOffsetsResponse,
    ) -> anyhow::Result<ListOffsetsResponse> {
        for t in req.topics {
            let partitions = t
                .partitions
                .iter()
                .map(|p| {
                    let mut pr = ListOffsetsPartitionResponse {
                        partition_index: p.partition_index,
                        timestamp: p.timestamp,
                        offset: -1,
                        ..Default::default()
                    };
                    match self.offset_for(&t.name, p.partition_index, p.timestamp) {
                        Ok(offset) => pr.offset = offset,
                        Err(e) => pr.error_code = e.code(),
                    }
                    pr
                })
                .collect();
            res.topics.push(ListOffsetsTopicResponse {
                name: t.name,
                partitions,
            });
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::handler::test::{new_broker, produce};
    use crate::protocol::{
        BrokerId, ErrorCode, LeaderAndIsrPartitionState, ListOffsetsPartition, ListOffsetsTopic,
    };
    use anyhow::Result;

    fn list(timestamps: &[i64]) -> ListOffsetsRequest {
        ListOffsetsRequest {
            topics: vec![ListOffsetsTopic {
                name: "t".into(),
                partitions: timestamps
                    .iter()
                    .map(|ts| ListOffsetsPartition {
                        partition_index: 0,
                        timestamp: *ts,
                    })
                    .collect(),
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn execute() -> Result<()> {
        let (_dir, broker) = new_broker().await?;
        let res = broker.do_handle(list(&[LATEST_TIMESTAMP])).await?;
        assert_eq!(
            res.topics[0].partitions[0].error_code,
            ErrorCode::UnknownTopicOrPartition
        );

        broker
            .apply_partition_state(&LeaderAndIsrPartitionState {
                topic_name: "t".into(),
                partition_index: 0,
                leader: BrokerId(1),
                leader_epoch: 0,
                isr: vec![BrokerId(1)],
                replicas: vec![BrokerId(1)],
            })
            .await?;
        broker.do_handle(produce("t", 0, &["a", "b", "c"])).await?;

        let res = broker
            .do_handle(list(&[LATEST_TIMESTAMP, EARLIEST_TIMESTAMP, 1_000]))
            .await?;
        let partitions = &res.topics[0].partitions;
        assert_eq!(partitions[0].offset, 3);
        assert_eq!(partitions[1].offset, 0);
        assert_eq!(partitions[2].error_code, ErrorCode::InvalidRequest);
        broker.shutdown().await
    }
}
