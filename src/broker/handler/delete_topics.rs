use std::collections::HashMap;

use async_trait::async_trait;

use crate::broker::fsm::Transition;
use crate::broker::handler::Handler;
use crate::broker::Broker;
use crate::protocol::{
    BrokerId, DeletableTopicResult, DeleteTopicsRequest, DeleteTopicsResponse, ErrorCode,
    StopReplicaRequest, TopicPartition,
};

impl Broker {
    #[tracing::instrument(skip(self), fields(id = %self.config.id))]
    async fn delete_topic(&self, name: String) -> anyhow::Result<DeletableTopicResult> {
        let mut res = DeletableTopicResult {
            name: name.clone(),
            ..Default::default()
        };
        if !self.store.topic_exists(&name)? {
            res.error_code = ErrorCode::UnknownTopicOrPartition;
            return Ok(res);
        }

        let partitions = self.store.get_partitions(&name)?;
        if let Err(e) = self
            .consensus
            .apply(Transition::DeregisterTopic(name.clone()).serialize()?)
            .await
        {
            tracing::warn!("delete topic failed: {:#}", e);
            res.error_code = ErrorCode::Unknown;
            res.error_message = Some(e.to_string());
            return Ok(res);
        }

        let mut by_broker: HashMap<BrokerId, Vec<TopicPartition>> = HashMap::new();
        for p in &partitions {
            for replica in &p.replicas {
                by_broker
                    .entry(*replica)
                    .or_default()
                    .push(TopicPartition::new(&p.topic, p.idx));
            }
        }
        for (broker, partitions) in by_broker {
            let req = StopReplicaRequest {
                controller_id: self.config.id,
                delete_partitions: true,
                partitions,
            };
            if let Err(e) = self.send(broker, req).await {
                tracing::warn!(%broker, "stop replica failed: {:#}", e);
            }
        }
        tracing::info!(partitions = partitions.len(), "deleted topic");
        Ok(res)
    }
}

#[async_trait]
impl Handler<DeleteTopicsRequest> for Broker {
    async fn handle(
        &self,
        req: DeleteTopicsRequest,
        mut res: DeleteTopicsResponse,
    ) -> anyhow::Result<DeleteTopicsResponse> {
        for name in req.topic_names {
            let result = if self.is_leader() {
                self.delete_topic(name).await?
            } else {
                DeletableTopicResult {
                    name,
                    error_code: ErrorCode::NotController,
                    error_message: None,
                }
            };
            res.responses.push(result);
        }
        Ok(res)
    }
}
