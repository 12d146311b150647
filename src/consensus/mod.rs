//! Replication of cluster metadata commands across brokers.

use std::fmt::Debug;
use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::protocol::{
    AppendEntriesRequest, AppendEntriesResponse, BrokerId, VoteRequest, VoteResponse,
};

pub use group::{Group, GroupMember};
pub use raft::Raft;

mod group;
mod raft;

/// A deterministic state machine fed with committed commands, in commit order, on every
/// member of a consensus group.
pub trait Fsm: Send + Sync + Debug {
    fn transition(&mut self, data: Vec<u8>) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("not the leader, leader is {leader:?}")]
    NotLeader { leader: Option<BrokerId> },

    #[error("unknown server {0}")]
    UnknownServer(BrokerId),

    #[error("server {0} is detached from the group")]
    Detached(BrokerId),

    #[error("state machine rejected command: {0:#}")]
    Fsm(anyhow::Error),

    #[error("entry was not committed within {0:?}")]
    Timeout(std::time::Duration),

    #[error("another membership change is still uncommitted")]
    ChangeInProgress,

    #[error("{0} is not served by this consensus implementation")]
    Unsupported(&'static str),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

/// The broker's view of the consensus group it is a member of.
#[async_trait]
pub trait Consensus: Send + Sync + Debug {
    /// Commits `command` cluster-wide and returns the local state machine's output once it
    /// has been applied. Only the leader accepts commands.
    async fn apply(&self, command: Vec<u8>) -> Result<Vec<u8>>;

    fn is_leader(&self) -> bool;

    fn leader_id(&self) -> Option<BrokerId>;

    fn leader_address(&self) -> Option<SocketAddr>;

    /// Observes leadership changes of the group.
    fn leader_changes(&self) -> watch::Receiver<Option<BrokerId>>;

    /// Admits a member as a voter, making it eligible for leadership.
    async fn add_voter(&self, id: BrokerId, addr: SocketAddr) -> Result<()>;

    /// Makes a member known to the group without letting it vote. Learners receive every
    /// committed command.
    async fn add_learner(&self, id: BrokerId, addr: SocketAddr) -> Result<()>;

    /// Removes a member from the group entirely.
    async fn remove_server(&self, id: BrokerId) -> Result<()>;

    fn voters(&self) -> Vec<BrokerId>;

    /// Stops participating without leaving the group, as a crashed member would.
    async fn shutdown(&self) -> Result<()>;

    /// Answers a candidate asking for this member's vote.
    fn handle_vote(&self, _req: VoteRequest) -> Result<VoteResponse> {
        Err(ConsensusError::Unsupported("vote"))
    }

    /// Appends entries sent by the leader, or reports where this member's log diverges.
    fn handle_append_entries(&self, _req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        Err(ConsensusError::Unsupported("append entries"))
    }
}
