use async_trait::async_trait;

use crate::broker::handler::Handler;
use crate::broker::Broker;
use crate::protocol::{ErrorCode, StopReplicaPartitionError, StopReplicaRequest, StopReplicaResponse};

#[async_trait]
impl Handler<StopReplicaRequest> for Broker {
    #[tracing::instrument(skip(self, req, res), fields(id = %self.config.id, delete = req.delete_partitions))]
    async fn handle(
        &self,
        req: StopReplicaRequest,
        mut res: StopReplicaResponse,
    ) -> anyhow::Result<StopReplicaResponse> {
        for tp in req.partitions {
            let _transition = self.transitions.lock().await;
            let error_code = match self
                .release(&tp.topic, tp.partition, req.delete_partitions)
                .await
            {
                Ok(true) => ErrorCode::None,
                Ok(false) => ErrorCode::UnknownTopicOrPartition,
                Err(e) => {
                    tracing::warn!(topic = %tp.topic, partition = tp.partition, "stop replica failed: {:#}", e);
                    e.code()
                }
            };
            res.partition_errors.push(StopReplicaPartitionError {
                topic_name: tp.topic,
                partition_index: tp.partition,
                error_code,
            });
        }
        Ok(res)
    }
}
