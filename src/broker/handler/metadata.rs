use async_trait::async_trait;

use crate::broker::handler::Handler;
use crate::broker::Broker;
use crate::protocol::{
    BrokerId, ErrorCode, MetadataRequest, MetadataResponse, MetadataResponseBroker,
    MetadataResponsePartition, MetadataResponseTopic,
};

const CLUSTER_ID: &str = "hedda";

impl Broker {
    fn describe_topic(&self, name: String) -> anyhow::Result<MetadataResponseTopic> {
        let topic = match self.store.get_topic(&name)? {
            Some(topic) => topic,
            None => {
                return Ok(MetadataResponseTopic {
                    error_code: ErrorCode::UnknownTopicOrPartition,
                    name,
                    ..Default::default()
                })
            }
        };
        let partitions = self
            .store
            .get_partitions(&name)?
            .into_iter()
            .map(|p| MetadataResponsePartition {
                error_code: ErrorCode::None,
                partition_index: p.idx,
                leader_id: p.leader,
                leader_epoch: p.leader_epoch,
                replica_nodes: p.replicas,
                isr_nodes: p.isr,
            })
            .collect();
        Ok(MetadataResponseTopic {
            error_code: ErrorCode::None,
            name,
            topic_id: topic.id,
            partitions,
        })
    }
}

#[async_trait]
impl Handler<MetadataRequest> for Broker {
    async fn handle(
        &self,
        req: MetadataRequest,
        mut res: MetadataResponse,
    ) -> anyhow::Result<MetadataResponse> {
        res.cluster_id = Some(CLUSTER_ID.to_string());
        res.controller_id = self.consensus.leader_id().unwrap_or(BrokerId::NONE);
        res.brokers = self
            .store
            .get_alive_nodes()?
            .into_iter()
            .map(|n| MetadataResponseBroker {
                node_id: n.id,
                host: n.addr.ip().to_string(),
                port: n.addr.port() as i32,
            })
            .collect();

        let names = match req.topics {
            Some(names) if !names.is_empty() => names,
            _ => self.store.get_topics()?.into_iter().map(|t| t.name).collect(),
        };
        for name in names {
            res.topics.push(self.describe_topic(name)?);
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::handler::test::new_broker;
    use crate::protocol::{CreatableTopic, CreateTopicsRequest};
    use anyhow::Result;

    #[tokio::test]
    async fn execute() -> Result<()> {
        let (_dir, broker) = new_broker().await?;
        broker
            .do_handle(CreateTopicsRequest {
                topics: vec![CreatableTopic::new("known", 3, 1)],
                timeout_ms: 0,
            })
            .await?;

        let res = broker
            .do_handle(MetadataRequest {
                topics: Some(vec!["known".into(), "unknown".into()]),
            })
            .await?;
        assert_eq!(res.controller_id, BrokerId(1));
        assert_eq!(res.brokers.len(), 1);
        assert_eq!(res.brokers[0].port, broker.addr().port() as i32);

        assert_eq!(res.topics[0].error_code, ErrorCode::None);
        assert_eq!(res.topics[0].partitions.len(), 3);
        assert!(res.topics[0]
            .partitions
            .iter()
            .all(|p| p.leader_id == BrokerId(1) && p.isr_nodes == vec![BrokerId(1)]));
        assert_eq!(res.topics[1].error_code, ErrorCode::UnknownTopicOrPartition);

        let res = broker.do_handle(MetadataRequest { topics: None }).await?;
        let names: Vec<_> = res.topics.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["known"]);
        broker.shutdown().await
    }
}
