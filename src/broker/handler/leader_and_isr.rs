use async_trait::async_trait;

use crate::broker::handler::Handler;
use crate::broker::Broker;
use crate::protocol::{LeaderAndIsrPartitionError, LeaderAndIsrRequest, LeaderAndIsrResponse};

#[async_trait]
impl Handler<LeaderAndIsrRequest> for Broker {
    #[tracing::instrument(skip(self, req, res), fields(id = %self.config.id, controller = %req.controller_id))]
    async fn handle(
        &self,
        req: LeaderAndIsrRequest,
        mut res: LeaderAndIsrResponse,
    ) -> anyhow::Result<LeaderAndIsrResponse> {
        for state in req.partition_states {
            let mut pe = LeaderAndIsrPartitionError {
                topic_name: state.topic_name.clone(),
                partition_index: state.partition_index,
                ..Default::default()
            };
            if let Err(e) = self.apply_partition_state(&state).await {
                tracing::warn!(
                    topic = %state.topic_name,
                    partition = state.partition_index,
                    "leadership transition failed: {:#}",
                    e
                );
                pe.error_code = e.code();
                pe.error_message = Some(e.to_string());
            }
            res.partition_errors.push(pe);
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::handler::test::new_broker;
    use crate::protocol::{BrokerId, ErrorCode, LeaderAndIsrPartitionState};
    use anyhow::Result;

    fn request(epoch: i32) -> LeaderAndIsrRequest {
        LeaderAndIsrRequest {
            controller_id: BrokerId(1),
            partition_states: (0..2)
                .map(|partition| LeaderAndIsrPartitionState {
                    topic_name: "t".into(),
                    partition_index: partition,
                    leader: BrokerId(1),
                    leader_epoch: epoch,
                    isr: vec![BrokerId(1)],
                    replicas: vec![BrokerId(1)],
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn execute() -> Result<()> {
        let (_dir, broker) = new_broker().await?;
        let res = broker.do_handle(request(0)).await?;
        assert_eq!(res.partition_errors.len(), 2);
        assert!(res
            .partition_errors
            .iter()
            .all(|e| e.error_code == ErrorCode::None));
        assert_eq!(broker.registry.partitions("t").len(), 2);

        // retransmits are accepted without changing anything
        let res = broker.do_handle(request(0)).await?;
        assert!(res
            .partition_errors
            .iter()
            .all(|e| e.error_code == ErrorCode::None));
        assert_eq!(broker.registry.get("t", 1).unwrap().meta.leader_epoch, 0);
        broker.shutdown().await
    }
}
