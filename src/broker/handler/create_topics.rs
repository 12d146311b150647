use std::collections::HashSet;

use async_trait::async_trait;
use rand::{thread_rng, Rng};

use crate::broker::fsm::Transition;
use crate::broker::handler::Handler;
use crate::broker::state::partition::Partition;
use crate::broker::state::topic::Topic;
use crate::broker::Broker;
use crate::protocol::{
    BrokerId, CreatableTopic, CreatableTopicResult, CreateTopicsRequest, CreateTopicsResponse,
    ErrorCode,
};

/// Spreads `replication_factor` replicas of each partition round-robin over `brokers`,
/// starting at `start`. The first replica of each partition is its preferred leader.
fn assign_replicas(
    brokers: &[BrokerId],
    start: usize,
    num_partitions: i32,
    replication_factor: i16,
) -> Vec<Vec<BrokerId>> {
    (0..num_partitions as usize)
        .map(|p| {
            (0..replication_factor as usize)
                .map(|r| brokers[(start + p + r) % brokers.len()])
                .collect()
        })
        .collect()
}

impl Broker {
    fn validate_topic(
        &self,
        t: &CreatableTopic,
        brokers: &[BrokerId],
    ) -> anyhow::Result<Option<(ErrorCode, String)>> {
        if t.num_partitions < 1 {
            return Ok(Some((
                ErrorCode::InvalidPartitions,
                format!("number of partitions must be positive, got {}", t.num_partitions),
            )));
        }
        if t.replication_factor < 1 || t.replication_factor as usize > brokers.len() {
            return Ok(Some((
                ErrorCode::InvalidReplicationFactor,
                format!(
                    "replication factor {} must be between 1 and {} available brokers",
                    t.replication_factor,
                    brokers.len()
                ),
            )));
        }
        if self.store.topic_exists(&t.name)? {
            return Ok(Some((
                ErrorCode::TopicAlreadyExists,
                format!("topic {} already exists", t.name),
            )));
        }
        Ok(None)
    }

    fn make_partitions(&self, t: &CreatableTopic, brokers: &[BrokerId]) -> Vec<Partition> {
        let start = thread_rng().gen_range(0..brokers.len());
        assign_replicas(brokers, start, t.num_partitions, t.replication_factor)
            .into_iter()
            .enumerate()
            .map(|(idx, replicas)| Partition::new(t.name.clone(), idx as i32, replicas))
            .collect()
    }

    #[tracing::instrument(skip(self, brokers), fields(id = %self.config.id, topic = %t.name))]
    async fn create_topic(
        &self,
        t: CreatableTopic,
        brokers: &[BrokerId],
    ) -> anyhow::Result<CreatableTopicResult> {
        let mut res = CreatableTopicResult {
            name: t.name.clone(),
            num_partitions: t.num_partitions,
            replication_factor: t.replication_factor,
            ..Default::default()
        };
        if let Some((code, message)) = self.validate_topic(&t, brokers)? {
            tracing::debug!(%code, "rejected topic");
            res.error_code = code;
            res.error_message = Some(message);
            return Ok(res);
        }

        let partitions = self.make_partitions(&t, brokers);
        let topic = Topic::new(t.name.clone(), partitions.iter().map(|p| p.idx).collect());
        let transition = Transition::RegisterTopic {
            topic: topic.clone(),
            partitions: partitions.clone(),
        };
        if let Err(e) = self.consensus.apply(transition.serialize()?).await {
            tracing::warn!("create topic failed: {:#}", e);
            res.error_code = ErrorCode::Unknown;
            res.error_message = Some(e.to_string());
            return Ok(res);
        }
        tracing::info!(partitions = partitions.len(), "created topic");

        let alive: HashSet<BrokerId> = brokers.iter().copied().collect();
        self.send_leadership(partitions.iter().map(Partition::state), &alive)
            .await;
        res.topic_id = topic.id;
        Ok(res)
    }
}

#[async_trait]
impl Handler<CreateTopicsRequest> for Broker {
    async fn handle(
        &self,
        req: CreateTopicsRequest,
        mut res: CreateTopicsResponse,
    ) -> anyhow::Result<CreateTopicsResponse> {
        if !self.is_leader() {
            res.topics = req
                .topics
                .into_iter()
                .map(|t| CreatableTopicResult {
                    name: t.name,
                    error_code: ErrorCode::NotController,
                    ..Default::default()
                })
                .collect();
            return Ok(res);
        }

        let brokers: Vec<BrokerId> = self
            .store
            .get_alive_nodes()?
            .into_iter()
            .map(|n| n.id)
            .collect();
        for t in req.topics {
            let result = self.create_topic(t, &brokers).await?;
            res.topics.push(result);
        }
        Ok(res)
    }
}
