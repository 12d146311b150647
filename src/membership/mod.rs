//! Peer discovery and failure detection.

use std::fmt::Debug;
use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use derive_more::Display;
use tokio::sync::broadcast;

use crate::protocol::{
    BrokerHeartbeatRequest, BrokerHeartbeatResponse, BrokerId, BrokerRegistrationRequest,
    BrokerRegistrationResponse, UnregisterBrokerRequest, UnregisterBrokerResponse,
};

pub use gossip::Gossip;
pub use lan::{Lan, LanMember};

mod gossip;
mod lan;

#[derive(Copy, Clone, Debug, Default, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberStatus {
    #[default]
    Alive,
    Failed,
    Left,
}

/// A broker as seen through membership gossip.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: BrokerId,
    pub addr: SocketAddr,
    pub status: MemberStatus,
    /// Set for brokers that must never be admitted as consensus voters.
    pub non_voter: bool,
}

impl Default for Member {
    fn default() -> Self {
        Self {
            id: BrokerId::NONE,
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            status: MemberStatus::Alive,
            non_voter: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberEvent {
    Join(Member),
    Failed(Member),
    Leave(Member),
}

impl From<Member> for MemberEvent {
    /// The event announcing a member in its current status.
    fn from(member: Member) -> Self {
        match member.status {
            MemberStatus::Alive => MemberEvent::Join(member),
            MemberStatus::Failed => MemberEvent::Failed(member),
            MemberStatus::Left => MemberEvent::Leave(member),
        }
    }
}

impl MemberEvent {
    pub fn member(&self) -> &Member {
        match self {
            MemberEvent::Join(m) | MemberEvent::Failed(m) | MemberEvent::Leave(m) => m,
        }
    }
}

#[async_trait]
pub trait Membership: Send + Sync + Debug {
    /// Contacts the given peers and merges their view of the cluster with ours, returning
    /// how many of them were reached.
    async fn join(&self, addrs: &[SocketAddr]) -> anyhow::Result<usize>;

    /// Gracefully announces departure; peers see the member as left rather than failed.
    async fn leave(&self) -> anyhow::Result<()>;

    /// Every member known to this node, including itself and departed members.
    fn members(&self) -> Vec<Member>;

    fn subscribe(&self) -> broadcast::Receiver<MemberEvent>;

    /// Stops gossiping. Without a prior leave, peers see the member as failed.
    async fn shutdown(&self) -> anyhow::Result<()>;

    /// Answers a peer announcing itself, with this node's view of the cluster.
    fn handle_registration(
        &self,
        _req: BrokerRegistrationRequest,
    ) -> anyhow::Result<BrokerRegistrationResponse> {
        anyhow::bail!("membership is not reachable over the network")
    }

    fn handle_heartbeat(
        &self,
        _req: BrokerHeartbeatRequest,
    ) -> anyhow::Result<BrokerHeartbeatResponse> {
        anyhow::bail!("membership is not reachable over the network")
    }

    fn handle_unregistration(
        &self,
        _req: UnregisterBrokerRequest,
    ) -> anyhow::Result<UnregisterBrokerResponse> {
        anyhow::bail!("membership is not reachable over the network")
    }
}
