use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::consensus::{Consensus, ConsensusError, Fsm, Result};
use crate::protocol::BrokerId;

/// An in-process consensus group. Every committed command is appended to a shared log and
/// applied, in log order, to the state machine of every attached member; members that
/// attach late replay the log from the start. The leader is the lowest-id attached voter.
#[derive(Clone, Default)]
pub struct Group {
    inner: Arc<Mutex<GroupState>>,
}

impl Debug for Group {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        write!(
            f,
            "Group {{ leader: {:?}, members: {}, entries: {} }}",
            state.leader,
            state.members.len(),
            state.log.len()
        )
    }
}

struct GroupState {
    log: Vec<Vec<u8>>,
    members: BTreeMap<BrokerId, Slot>,
    leader: Option<BrokerId>,
    leader_tx: watch::Sender<Option<BrokerId>>,
}

impl Default for GroupState {
    fn default() -> Self {
        let (leader_tx, _) = watch::channel(None);
        Self {
            log: Vec::new(),
            members: BTreeMap::new(),
            leader: None,
            leader_tx,
        }
    }
}

struct Slot {
    addr: SocketAddr,
    voter: bool,
    applied: usize,
    /// Dropped while the member is detached.
    fsm: Option<Box<dyn Fsm>>,
}

impl Slot {
    fn attached(&self) -> bool {
        self.fsm.is_some()
    }
}

impl GroupState {
    fn elect(&mut self) {
        let current = self
            .leader
            .and_then(|id| self.members.get(&id))
            .map_or(false, |s| s.voter && s.attached());
        if current {
            return;
        }
        let next = self
            .members
            .iter()
            .find(|(_, s)| s.voter && s.attached())
            .map(|(id, _)| *id);
        if next != self.leader {
            tracing::info!(old = ?self.leader, new = ?next, "consensus leader changed");
            self.leader = next;
            self.leader_tx.send_replace(next);
        }
    }

    /// Applies every entry the member has not seen yet, returning the output of the last.
    fn catch_up(log: &[Vec<u8>], id: BrokerId, slot: &mut Slot) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        let fsm = match slot.fsm.as_mut() {
            Some(fsm) => fsm,
            None => return Ok(out),
        };
        while slot.applied < log.len() {
            let entry = log[slot.applied].clone();
            slot.applied += 1;
            match fsm.transition(entry) {
                Ok(res) => out = res,
                Err(e) if slot.applied == log.len() => return Err(e),
                Err(e) => tracing::error!(%id, index = slot.applied, "fsm apply failed: {:#}", e),
            }
        }
        Ok(out)
    }
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a member, replaying the committed log into `fsm`. A bootstrap member is a
    /// voter from the start; others wait for the leader to admit them.
    #[tracing::instrument(skip(self, fsm))]
    pub fn join(
        &self,
        id: BrokerId,
        addr: SocketAddr,
        fsm: Box<dyn Fsm>,
        bootstrap: bool,
    ) -> anyhow::Result<GroupMember> {
        let mut state = self.inner.lock();
        let voter = bootstrap || state.members.get(&id).map_or(false, |s| s.voter);
        let mut slot = Slot {
            addr,
            voter,
            applied: 0,
            fsm: Some(fsm),
        };
        if let Err(e) = GroupState::catch_up(&state.log, id, &mut slot) {
            tracing::error!(%id, "replay failed: {:#}", e);
        }
        state.members.insert(id, slot);
        state.elect();
        tracing::debug!(%id, voter, leader = ?state.leader, "joined consensus group");

        Ok(GroupMember {
            id,
            group: self.clone(),
        })
    }
}

/// One broker's handle onto a [`Group`].
#[derive(Clone)]
pub struct GroupMember {
    id: BrokerId,
    group: Group,
}

impl Debug for GroupMember {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupMember {{ id: {} }}", self.id)
    }
}

#[async_trait]
impl Consensus for GroupMember {
    #[tracing::instrument(skip(self, command), fields(id = %self.id))]
    async fn apply(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        let mut state = self.group.inner.lock();
        if state.leader != Some(self.id) {
            return Err(ConsensusError::NotLeader {
                leader: state.leader,
            });
        }

        let GroupState { log, members, .. } = &mut *state;
        log.push(command);
        tracing::trace!(index = log.len(), "committed entry");

        let mut res = Ok(Vec::new());
        for (id, slot) in members.iter_mut().filter(|(_, s)| s.attached()) {
            let out = GroupState::catch_up(log, *id, slot);
            if *id == self.id {
                res = out.map_err(ConsensusError::Fsm);
            } else if let Err(e) = out {
                tracing::error!(%id, "follower fsm apply failed: {:#}", e);
            }
        }
        res
    }

    fn is_leader(&self) -> bool {
        self.group.inner.lock().leader == Some(self.id)
    }

    fn leader_id(&self) -> Option<BrokerId> {
        self.group.inner.lock().leader
    }

    fn leader_address(&self) -> Option<SocketAddr> {
        let state = self.group.inner.lock();
        state
            .leader
            .and_then(|id| state.members.get(&id))
            .map(|s| s.addr)
    }

    fn leader_changes(&self) -> watch::Receiver<Option<BrokerId>> {
        self.group.inner.lock().leader_tx.subscribe()
    }

    #[tracing::instrument(skip(self), fields(id = %self.id))]
    async fn add_voter(&self, id: BrokerId, addr: SocketAddr) -> Result<()> {
        let mut state = self.group.inner.lock();
        if state.leader != Some(self.id) {
            return Err(ConsensusError::NotLeader {
                leader: state.leader,
            });
        }
        let slot = state
            .members
            .get_mut(&id)
            .ok_or(ConsensusError::UnknownServer(id))?;
        slot.addr = addr;
        if !slot.voter {
            tracing::info!(%id, %addr, "adding voter");
            slot.voter = true;
        }
        state.elect();
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(id = %self.id))]
    async fn add_learner(&self, id: BrokerId, addr: SocketAddr) -> Result<()> {
        let mut state = self.group.inner.lock();
        if state.leader != Some(self.id) {
            return Err(ConsensusError::NotLeader {
                leader: state.leader,
            });
        }
        // members are learners from the moment they attach
        let slot = state
            .members
            .get_mut(&id)
            .ok_or(ConsensusError::UnknownServer(id))?;
        slot.addr = addr;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(id = %self.id))]
    async fn remove_server(&self, id: BrokerId) -> Result<()> {
        let mut state = self.group.inner.lock();
        if state.leader != Some(self.id) {
            return Err(ConsensusError::NotLeader {
                leader: state.leader,
            });
        }
        if state.members.remove(&id).is_some() {
            tracing::info!(%id, "removed server");
        }
        state.elect();
        Ok(())
    }

    fn voters(&self) -> Vec<BrokerId> {
        let state = self.group.inner.lock();
        state
            .members
            .iter()
            .filter(|(_, s)| s.voter)
            .map(|(id, _)| *id)
            .collect()
    }

    #[tracing::instrument(skip(self), fields(id = %self.id))]
    async fn shutdown(&self) -> Result<()> {
        let mut state = self.group.inner.lock();
        match state.members.get_mut(&self.id) {
            Some(slot) => slot.fsm = None,
            None => return Err(ConsensusError::Detached(self.id)),
        }
        state.elect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Counter {
        seen: Vec<u8>,
    }

    impl Fsm for Counter {
        fn transition(&mut self, data: Vec<u8>) -> anyhow::Result<Vec<u8>> {
            if data.is_empty() {
                anyhow::bail!("empty command");
            }
            self.seen.extend_from_slice(&data);
            Ok(vec![self.seen.len() as u8])
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn leader_applies_and_followers_replay() -> anyhow::Result<()> {
        let group = Group::new();
        let a = group.join(BrokerId(1), addr(1), Box::<Counter>::default(), true)?;
        assert!(a.is_leader());
        assert_eq!(a.apply(vec![7]).await?, vec![1]);

        let b = group.join(BrokerId(2), addr(2), Box::<Counter>::default(), false)?;
        assert!(!b.is_leader());
        assert!(matches!(
            b.apply(vec![1]).await,
            Err(ConsensusError::NotLeader { leader: Some(BrokerId(1)) })
        ));
        assert_eq!(a.apply(vec![8]).await?, vec![2]);
        assert_eq!(b.leader_address(), Some(addr(1)));
        Ok(())
    }

    #[tokio::test]
    async fn fsm_errors_are_returned_to_the_proposer() -> anyhow::Result<()> {
        let group = Group::new();
        let a = group.join(BrokerId(1), addr(1), Box::<Counter>::default(), true)?;
        assert!(matches!(a.apply(vec![]).await, Err(ConsensusError::Fsm(_))));
        Ok(())
    }

    #[tokio::test]
    async fn leadership_moves_to_next_voter() -> anyhow::Result<()> {
        let group = Group::new();
        let a = group.join(BrokerId(1), addr(1), Box::<Counter>::default(), true)?;
        let b = group.join(BrokerId(2), addr(2), Box::<Counter>::default(), false)?;
        let c = group.join(BrokerId(3), addr(3), Box::<Counter>::default(), false)?;
        a.add_voter(BrokerId(3), addr(3)).await?;
        assert_eq!(a.voters(), vec![BrokerId(1), BrokerId(3)]);

        let mut changes = b.leader_changes();
        a.shutdown().await?;
        assert!(changes.has_changed()?);
        assert_eq!(*changes.borrow_and_update(), Some(BrokerId(3)));
        assert!(!b.is_leader());
        assert!(c.is_leader());
        assert_eq!(b.leader_id(), Some(BrokerId(3)));

        c.remove_server(BrokerId(1)).await?;
        assert_eq!(c.voters(), vec![BrokerId(3)]);
        Ok(())
    }
}
