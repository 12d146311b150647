use std::net::SocketAddr;

use crate::membership::MemberStatus;
use crate::protocol::BrokerId;

/// A broker in the cluster node registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: BrokerId,
    pub addr: SocketAddr,
    pub status: MemberStatus,
}

impl Node {
    pub fn is_alive(&self) -> bool {
        self.status == MemberStatus::Alive
    }
}
