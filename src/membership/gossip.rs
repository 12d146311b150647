use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::broker::config::GossipConfig;
use crate::broker::transport::Transport;
use crate::membership::{Member, MemberEvent, MemberStatus, Membership};
use crate::protocol::{
    BrokerHeartbeatRequest, BrokerHeartbeatResponse, BrokerRegistrationRequest,
    BrokerRegistrationResponse, UnregisterBrokerRequest, UnregisterBrokerResponse,
};

const EVENT_BUFFER: usize = 256;

/// Membership over the network.
///
/// Every node heartbeats every peer it knows about. A peer's report about itself is
/// authoritative, and a peer that stays silent for the failure timeout is considered
/// failed. Heartbeats carry the sender's view, so members introduced to one node become
/// known to all of them.
#[derive(Clone)]
pub struct Gossip {
    inner: Arc<GossipInner>,
}

struct GossipInner {
    me: Mutex<Member>,
    config: GossipConfig,
    transport: Arc<dyn Transport>,
    peers: Mutex<HashMap<crate::protocol::BrokerId, Peer>>,
    events: broadcast::Sender<MemberEvent>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Peer {
    member: Member,
    last_seen: Instant,
    /// A heartbeat to the peer is in flight.
    in_flight: bool,
}

impl Debug for Gossip {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Gossip {{ id: {}, peers: {} }}",
            self.inner.me.lock().id,
            self.inner.peers.lock().len()
        )
    }
}

impl Gossip {
    /// Starts heartbeating as `me`. Peers are only known once [`Membership::join`] reaches
    /// one of them or one of them reaches us.
    pub fn start(
        me: Member,
        config: GossipConfig,
        transport: Arc<dyn Transport>,
        token: CancellationToken,
    ) -> Gossip {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let gossip = Gossip {
            inner: Arc::new(GossipInner {
                me: Mutex::new(me),
                config,
                transport,
                peers: Mutex::new(HashMap::new()),
                events,
                token,
                task: Mutex::new(None),
            }),
        };
        let task = tokio::spawn(gossip.clone().run());
        *gossip.inner.task.lock() = Some(task);
        gossip
    }

    fn me(&self) -> Member {
        self.inner.me.lock().clone()
    }

    fn view(&self) -> Vec<Member> {
        let mut members = vec![self.me()];
        members.extend(self.inner.peers.lock().values().map(|p| p.member.clone()));
        members
    }

    fn announce(&self, member: Member) {
        tracing::debug!(id = %member.id, addr = %member.addr, status = %member.status, "member changed");
        let _ = self.inner.events.send(MemberEvent::from(member));
    }

    /// Folds in what a member reports about itself.
    fn observe(&self, member: Member) {
        if member.id.is_none() || member.id == self.inner.me.lock().id {
            return;
        }
        let changed = {
            let mut peers = self.inner.peers.lock();
            let now = Instant::now();
            match peers.get_mut(&member.id) {
                Some(peer) => {
                    let changed = peer.member.status != member.status;
                    peer.member = member.clone();
                    peer.last_seen = now;
                    changed
                }
                None => {
                    peers.insert(
                        member.id,
                        Peer {
                            member: member.clone(),
                            last_seen: now,
                            in_flight: false,
                        },
                    );
                    true
                }
            }
        };
        if changed {
            self.announce(member);
        }
    }

    /// Folds in a member another node told us about. Hearsay only introduces members
    /// never seen before; their status is then tracked first hand.
    fn learn(&self, member: Member) {
        if member.id.is_none() || member.id == self.inner.me.lock().id {
            return;
        }
        {
            let mut peers = self.inner.peers.lock();
            if peers.contains_key(&member.id) {
                return;
            }
            peers.insert(
                member.id,
                Peer {
                    member: member.clone(),
                    last_seen: Instant::now(),
                    in_flight: false,
                },
            );
        }
        self.announce(member);
    }

    async fn run(self) {
        let mut interval = tokio::time::interval(self.inner.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => break,
                _ = interval.tick() => self.round(),
            }
        }
        tracing::debug!("gossip stopped");
    }

    /// Fails peers gone silent and heartbeats every peer without a heartbeat already in flight.
    fn round(&self) {
        let me = self.me();
        if me.status == MemberStatus::Left {
            return;
        }

        let now = Instant::now();
        let timeout = self.inner.config.failure_timeout();
        let mut failed = Vec::new();
        let mut targets = Vec::new();
        {
            let mut peers = self.inner.peers.lock();
            for peer in peers.values_mut() {
                if peer.member.status == MemberStatus::Alive
                    && now.duration_since(peer.last_seen) > timeout
                {
                    peer.member.status = MemberStatus::Failed;
                    failed.push(peer.member.clone());
                }
                if !peer.in_flight {
                    peer.in_flight = true;
                    targets.push(peer.member.clone());
                }
            }
        }
        for member in failed {
            tracing::info!(id = %member.id, "member failed");
            self.announce(member);
        }

        let members = self.view();
        for target in targets {
            let req = BrokerHeartbeatRequest {
                member: me.clone(),
                members: members.clone(),
            };
            tokio::spawn(self.clone().heartbeat(target, req));
        }
    }

    async fn heartbeat(self, target: Member, req: BrokerHeartbeatRequest) {
        let timeout = self.inner.config.failure_timeout();
        let res = tokio::time::timeout(
            timeout,
            self.inner.transport.request(target.addr, req.into()),
        )
        .await;
        match res {
            Ok(Ok(res)) => match BrokerHeartbeatResponse::try_from(res) {
                Ok(res) => {
                    self.observe(res.member);
                    for member in res.members {
                        self.learn(member);
                    }
                }
                Err(e) => tracing::debug!(peer = %target.id, "bad heartbeat response: {:#}", e),
            },
            Ok(Err(e)) => tracing::trace!(peer = %target.id, "heartbeat failed: {:#}", e),
            Err(_) => tracing::trace!(peer = %target.id, "heartbeat timed out"),
        }
        if let Some(peer) = self.inner.peers.lock().get_mut(&target.id) {
            peer.in_flight = false;
        }
    }
}

#[async_trait]
impl Membership for Gossip {
    #[tracing::instrument(skip(self), fields(id = %self.inner.me.lock().id))]
    async fn join(&self, addrs: &[SocketAddr]) -> anyhow::Result<usize> {
        let me = self.me();
        let mut contacted = 0;
        for addr in addrs.iter().filter(|a| **a != me.addr) {
            let req = BrokerRegistrationRequest { member: me.clone() };
            let res = self
                .inner
                .transport
                .request(*addr, req.into())
                .await
                .and_then(BrokerRegistrationResponse::try_from);
            let res = match res {
                Ok(res) => res,
                Err(e) => {
                    tracing::warn!(%addr, "could not register with peer: {:#}", e);
                    continue;
                }
            };
            contacted += 1;
            for member in res.members {
                if member.addr == *addr {
                    self.observe(member);
                } else {
                    self.learn(member);
                }
            }
        }

        if contacted == 0 && addrs.iter().any(|a| *a != me.addr) {
            anyhow::bail!("could not contact any of {:?}", addrs);
        }
        Ok(contacted)
    }

    #[tracing::instrument(skip(self), fields(id = %self.inner.me.lock().id))]
    async fn leave(&self) -> anyhow::Result<()> {
        let me = {
            let mut me = self.inner.me.lock();
            me.status = MemberStatus::Left;
            me.clone()
        };
        let peers: Vec<Member> = self
            .inner
            .peers
            .lock()
            .values()
            .filter(|p| p.member.status != MemberStatus::Left)
            .map(|p| p.member.clone())
            .collect();

        let timeout = self.inner.config.failure_timeout();
        let sends = peers.into_iter().map(|peer| {
            let req = UnregisterBrokerRequest { member: me.clone() };
            let transport = self.inner.transport.clone();
            async move {
                let res = tokio::time::timeout(timeout, transport.request(peer.addr, req.into())).await;
                (peer.id, res)
            }
        });
        for (peer, res) in futures::future::join_all(sends).await {
            match res {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(%peer, "could not announce leave: {:#}", e),
                Err(_) => tracing::warn!(%peer, "announcing leave timed out"),
            }
        }
        Ok(())
    }

    fn members(&self) -> Vec<Member> {
        self.view()
    }

    fn subscribe(&self) -> broadcast::Receiver<MemberEvent> {
        self.inner.events.subscribe()
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.inner.token.cancel();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            task.await?;
        }
        Ok(())
    }

    fn handle_registration(
        &self,
        req: BrokerRegistrationRequest,
    ) -> anyhow::Result<BrokerRegistrationResponse> {
        self.observe(req.member);
        Ok(BrokerRegistrationResponse {
            members: self.view(),
        })
    }

    fn handle_heartbeat(
        &self,
        req: BrokerHeartbeatRequest,
    ) -> anyhow::Result<BrokerHeartbeatResponse> {
        self.observe(req.member);
        for member in req.members {
            self.learn(member);
        }
        Ok(BrokerHeartbeatResponse {
            member: self.me(),
            members: self.view(),
        })
    }

    fn handle_unregistration(
        &self,
        req: UnregisterBrokerRequest,
    ) -> anyhow::Result<UnregisterBrokerResponse> {
        self.observe(req.member);
        Ok(UnregisterBrokerResponse::default())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::transport::test::Switchboard;
    use crate::protocol::{BrokerId, RequestKind};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn config() -> GossipConfig {
        GossipConfig {
            interval_ms: 20,
            failure_timeout_ms: 200,
        }
    }

    fn node(net: &Arc<Switchboard>, id: i32) -> Gossip {
        let me = Member {
            id: BrokerId(id),
            addr: addr(id as u16),
            status: MemberStatus::Alive,
            non_voter: false,
        };
        let gossip = Gossip::start(me, config(), net.port(addr(id as u16)), CancellationToken::new());
        let handle = gossip.clone();
        net.connect(addr(id as u16), move |req| match req {
            RequestKind::BrokerRegistration(req) => Ok(handle.handle_registration(req)?.into()),
            RequestKind::BrokerHeartbeat(req) => Ok(handle.handle_heartbeat(req)?.into()),
            RequestKind::UnregisterBroker(req) => Ok(handle.handle_unregistration(req)?.into()),
            other => anyhow::bail!("unexpected {:?}", other.api_key()),
        });
        gossip
    }

    async fn next_event(events: &mut broadcast::Receiver<MemberEvent>) -> MemberEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no member event")
            .expect("event stream closed")
    }

    fn status(gossip: &Gossip, id: i32) -> Option<MemberStatus> {
        gossip
            .members()
            .into_iter()
            .find(|m| m.id == BrokerId(id))
            .map(|m| m.status)
    }

    #[tokio::test]
    async fn members_introduced_to_one_node_reach_all() -> anyhow::Result<()> {
        let net = Arc::new(Switchboard::default());
        let a = node(&net, 1);
        let b = node(&net, 2);
        let c = node(&net, 3);
        let mut a_events = a.subscribe();

        assert_eq!(b.join(&[addr(1)]).await?, 1);
        assert!(matches!(next_event(&mut a_events).await, MemberEvent::Join(m) if m.id == BrokerId(2)));
        c.join(&[addr(2)]).await?;

        let mut c_events = c.subscribe();
        assert!(matches!(next_event(&mut a_events).await, MemberEvent::Join(m) if m.id == BrokerId(3)));
        assert_eq!(a.members().len(), 3);
        if c.members().len() < 3 {
            assert!(matches!(next_event(&mut c_events).await, MemberEvent::Join(m) if m.id == BrokerId(1)));
        }

        for g in [a, b, c] {
            g.shutdown().await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn silence_is_failure_and_leave_is_announced() -> anyhow::Result<()> {
        let net = Arc::new(Switchboard::default());
        let a = node(&net, 1);
        let b = node(&net, 2);
        let c = node(&net, 3);
        b.join(&[addr(1)]).await?;
        c.join(&[addr(1)]).await?;
        let mut events = a.subscribe();

        net.cut(addr(3));
        let event = next_event(&mut events).await;
        assert!(matches!(&event, MemberEvent::Failed(m) if m.id == BrokerId(3)), "{:?}", event);
        assert_eq!(status(&a, 3), Some(MemberStatus::Failed));

        net.restore(addr(3));
        let event = next_event(&mut events).await;
        assert!(matches!(&event, MemberEvent::Join(m) if m.id == BrokerId(3)), "{:?}", event);

        b.leave().await?;
        let event = next_event(&mut events).await;
        assert!(matches!(&event, MemberEvent::Leave(m) if m.id == BrokerId(2)), "{:?}", event);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(status(&a, 2), Some(MemberStatus::Left));

        for g in [a, b, c] {
            g.shutdown().await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn join_without_reachable_peers_fails() -> anyhow::Result<()> {
        let net = Arc::new(Switchboard::default());
        let a = node(&net, 1);
        assert!(a.join(&[addr(9)]).await.is_err());
        assert_eq!(a.join(&[]).await?, 0);
        a.shutdown().await
    }
}
