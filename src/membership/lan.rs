use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::membership::{Member, MemberEvent, MemberStatus, Membership};
use crate::protocol::BrokerId;

const EVENT_BUFFER: usize = 256;

/// An in-process gossip network. Nodes start in a pool of their own; joining any node of
/// another pool merges the two, and every member learns about every other one.
#[derive(Clone, Default)]
pub struct Lan {
    inner: Arc<Mutex<LanState>>,
}

impl Debug for Lan {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Lan {{ nodes: {} }}", self.inner.lock().nodes.len())
    }
}

#[derive(Default)]
struct LanState {
    next_pool: usize,
    nodes: HashMap<SocketAddr, Node>,
}

struct Node {
    member: Member,
    pool: usize,
    events: broadcast::Sender<MemberEvent>,
}

impl LanState {
    fn pool_of(&self, addr: &SocketAddr) -> Option<usize> {
        self.nodes.get(addr).map(|n| n.pool)
    }

    /// Sends `event` to every node of `pool` except the one at `from`.
    fn broadcast(&self, pool: usize, from: &SocketAddr, event: MemberEvent) {
        for (addr, node) in self.nodes.iter() {
            if node.pool == pool && addr != from && node.member.status == MemberStatus::Alive {
                let _ = node.events.send(event.clone());
            }
        }
    }
}

impl Lan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node to the network as alive, replacing any earlier incarnation at the same
    /// address.
    pub fn register(&self, id: BrokerId, addr: SocketAddr, non_voter: bool) -> LanMember {
        let mut state = self.inner.lock();
        let pool = state.next_pool;
        state.next_pool += 1;
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let member = Member {
            id,
            addr,
            status: MemberStatus::Alive,
            non_voter,
        };
        tracing::debug!(%id, %addr, "registered lan member");
        state.nodes.insert(
            addr,
            Node {
                member,
                pool,
                events: events.clone(),
            },
        );

        LanMember {
            addr,
            lan: self.clone(),
            events,
        }
    }
}

/// One node's handle onto a [`Lan`].
#[derive(Clone)]
pub struct LanMember {
    addr: SocketAddr,
    lan: Lan,
    events: broadcast::Sender<MemberEvent>,
}

impl Debug for LanMember {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LanMember {{ addr: {} }}", self.addr)
    }
}

impl LanMember {
    fn depart(&self, status: MemberStatus) -> anyhow::Result<()> {
        let mut state = self.lan.inner.lock();
        let node = state
            .nodes
            .get_mut(&self.addr)
            .ok_or_else(|| anyhow::anyhow!("{} is not registered", self.addr))?;
        if node.member.status != MemberStatus::Alive {
            return Ok(());
        }
        node.member.status = status;
        let (pool, member) = (node.pool, node.member.clone());
        let event = match status {
            MemberStatus::Left => MemberEvent::Leave(member),
            _ => MemberEvent::Failed(member),
        };
        state.broadcast(pool, &self.addr, event);
        Ok(())
    }
}

#[async_trait]
impl Membership for LanMember {
    #[tracing::instrument(skip(self), fields(addr = %self.addr))]
    async fn join(&self, addrs: &[SocketAddr]) -> anyhow::Result<usize> {
        let mut state = self.lan.inner.lock();
        let mut contacted = 0;
        for addr in addrs.iter().filter(|a| **a != self.addr) {
            let (ours, theirs) = match (state.pool_of(&self.addr), state.pool_of(addr)) {
                (Some(ours), Some(theirs)) => (ours, theirs),
                (None, _) => anyhow::bail!("{} is not registered", self.addr),
                (Some(_), None) => {
                    tracing::warn!(%addr, "no member at address");
                    continue;
                }
            };
            let reachable = state
                .nodes
                .get(addr)
                .map_or(false, |n| n.member.status == MemberStatus::Alive);
            if !reachable {
                tracing::warn!(%addr, "member is not alive");
                continue;
            }
            contacted += 1;
            if ours == theirs {
                continue;
            }

            let (a, b): (Vec<_>, Vec<_>) = state
                .nodes
                .values()
                .filter(|n| n.pool == ours || n.pool == theirs)
                .map(|n| (n.pool, n.member.clone(), n.events.clone()))
                .partition(|(pool, _, _)| *pool == ours);
            for (_, ma, ta) in a.iter() {
                for (_, mb, tb) in b.iter() {
                    if ma.status == MemberStatus::Alive {
                        let _ = ta.send(MemberEvent::from(mb.clone()));
                    }
                    if mb.status == MemberStatus::Alive {
                        let _ = tb.send(MemberEvent::from(ma.clone()));
                    }
                }
            }
            for node in state.nodes.values_mut() {
                if node.pool == theirs {
                    node.pool = ours;
                }
            }
        }

        if contacted == 0 && !addrs.is_empty() && addrs.iter().any(|a| *a != self.addr) {
            anyhow::bail!("could not contact any of {:?}", addrs);
        }
        Ok(contacted)
    }

    #[tracing::instrument(skip(self), fields(addr = %self.addr))]
    async fn leave(&self) -> anyhow::Result<()> {
        self.depart(MemberStatus::Left)
    }

    fn members(&self) -> Vec<Member> {
        let state = self.lan.inner.lock();
        match state.pool_of(&self.addr) {
            Some(pool) => state
                .nodes
                .values()
                .filter(|n| n.pool == pool)
                .map(|n| n.member.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<MemberEvent> {
        self.events.subscribe()
    }

    #[tracing::instrument(skip(self), fields(addr = %self.addr))]
    async fn shutdown(&self) -> anyhow::Result<()> {
        self.depart(MemberStatus::Failed)
    }
}
