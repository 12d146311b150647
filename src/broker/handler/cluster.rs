//! Consensus and membership traffic between brokers. The broker only routes these to the
//! implementations it was started with.

use async_trait::async_trait;

use crate::broker::handler::Handler;
use crate::broker::Broker;
use crate::protocol::{
    AppendEntriesRequest, AppendEntriesResponse, BrokerHeartbeatRequest, BrokerHeartbeatResponse,
    BrokerRegistrationRequest, BrokerRegistrationResponse, UnregisterBrokerRequest,
    UnregisterBrokerResponse, VoteRequest, VoteResponse,
};

#[async_trait]
impl Handler<VoteRequest> for Broker {
    async fn handle(&self, req: VoteRequest, _res: VoteResponse) -> anyhow::Result<VoteResponse> {
        Ok(self.consensus.handle_vote(req)?)
    }
}

#[async_trait]
impl Handler<AppendEntriesRequest> for Broker {
    async fn handle(
        &self,
        req: AppendEntriesRequest,
        _res: AppendEntriesResponse,
    ) -> anyhow::Result<AppendEntriesResponse> {
        Ok(self.consensus.handle_append_entries(req)?)
    }
}

#[async_trait]
impl Handler<BrokerRegistrationRequest> for Broker {
    async fn handle(
        &self,
        req: BrokerRegistrationRequest,
        _res: BrokerRegistrationResponse,
    ) -> anyhow::Result<BrokerRegistrationResponse> {
        self.membership.handle_registration(req)
    }
}

#[async_trait]
impl Handler<BrokerHeartbeatRequest> for Broker {
    async fn handle(
        &self,
        req: BrokerHeartbeatRequest,
        _res: BrokerHeartbeatResponse,
    ) -> anyhow::Result<BrokerHeartbeatResponse> {
        self.membership.handle_heartbeat(req)
    }
}

#[async_trait]
impl Handler<UnregisterBrokerRequest> for Broker {
    async fn handle(
        &self,
        req: UnregisterBrokerRequest,
        _res: UnregisterBrokerResponse,
    ) -> anyhow::Result<UnregisterBrokerResponse> {
        self.membership.handle_unregistration(req)
    }
}

#[cfg(test)]
mod tests {
    use crate::broker::handler::test::new_broker;
    use crate::membership::Member;
    use crate::protocol::{
        BrokerId, BrokerRegistrationRequest, RequestKind, ResponseKind, VoteRequest,
        VoteResponse,
    };

    #[tokio::test]
    async fn in_process_coordination_refuses_network_peers() -> anyhow::Result<()> {
        let (_dir, broker) = new_broker().await?;

        let res = broker
            .handle_request(RequestKind::Vote(VoteRequest {
                term: 9,
                candidate_id: BrokerId(2),
                ..Default::default()
            }))
            .await;
        // term zero tells the candidate this member took no part
        assert_eq!(res, ResponseKind::Vote(VoteResponse::default()));

        let res = broker
            .handle_request(RequestKind::BrokerRegistration(BrokerRegistrationRequest {
                member: Member::default(),
            }))
            .await;
        assert!(matches!(res, ResponseKind::BrokerRegistration(r) if r.members.is_empty()));
        broker.shutdown().await
    }
}
