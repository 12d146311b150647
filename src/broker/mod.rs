use std::collections::HashSet;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::config::BrokerConfig;
use crate::broker::fsm::BrokerFsm;
use crate::broker::handler::Handler;
use crate::broker::registry::Registry;
use crate::broker::state::Store;
use crate::broker::transport::{LocalTransport, Transport};
use crate::cluster::{Cluster, Coordination};
use crate::consensus::{Consensus, ConsensusError, Raft};
use crate::membership::{Gossip, Member, MemberStatus, Membership};
use crate::protocol::{
    BrokerId, ErrorCode, Request, RequestFrame, RequestKind, ResponseFrame, ResponseKind,
};

pub mod config;
mod controller;
pub mod fsm;
mod handler;
mod reconcile;
pub mod registry;
mod replicator;
pub mod server;
pub mod state;
pub mod transport;

/// A broker: the context every component of the control plane works through.
///
/// Cloning is cheap and yields another handle onto the same broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

pub struct BrokerInner {
    config: BrokerConfig,
    registry: Registry,
    store: Store,
    consensus: Arc<dyn Consensus>,
    membership: Arc<dyn Membership>,
    transport: Arc<dyn Transport>,
    local: Option<Arc<LocalTransport>>,
    /// Serializes leadership transitions.
    transitions: tokio::sync::Mutex<()>,
    /// Woken on every local append, for long-polling fetches.
    appended: Notify,
    /// Hosted partitions found missing from the cluster state on the last sweep.
    orphans: parking_lot::Mutex<HashSet<(String, i32)>>,
    token: CancellationToken,
    ready: AtomicBool,
    monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Deref for Broker {
    type Target = BrokerInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Broker {{ id: {} }}", self.config.id)
    }
}

impl Broker {
    /// Opens the broker's state, attaches it to the cluster's consensus group and gossip
    /// network, restores the replicas it hosts, and joins the configured peers.
    #[tracing::instrument(skip_all, fields(id = %config.id))]
    pub async fn start(config: BrokerConfig, cluster: &Cluster) -> anyhow::Result<Broker> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;
        let db = sled::open(config.data_dir.join("state"))?;
        let store = Store::new(db.clone());
        let token = CancellationToken::new();

        let fsm = Box::new(BrokerFsm::new(store.clone()));
        let (consensus, membership): (Arc<dyn Consensus>, Arc<dyn Membership>) =
            match &cluster.coordination {
                Coordination::InProcess { group, lan } => (
                    Arc::new(group.join(config.id, config.addr(), fsm, config.bootstrap)?),
                    Arc::new(lan.register(config.id, config.addr(), config.non_voter)),
                ),
                Coordination::Network => {
                    let me = Member {
                        id: config.id,
                        addr: config.addr(),
                        status: MemberStatus::Alive,
                        non_voter: config.non_voter,
                    };
                    let raft = Raft::open(
                        config.id,
                        config.addr(),
                        &db,
                        fsm,
                        config.bootstrap,
                        cluster.transport.clone(),
                        config.consensus.clone(),
                        token.child_token(),
                    )?;
                    let gossip = Gossip::start(
                        me,
                        config.gossip.clone(),
                        cluster.transport.clone(),
                        token.child_token(),
                    );
                    (Arc::new(raft), Arc::new(gossip))
                }
            };
        let events = membership.subscribe();
        let leader_changes = consensus.leader_changes();

        let broker = Broker {
            inner: Arc::new(BrokerInner {
                config,
                registry: Registry::new(),
                store,
                consensus,
                membership,
                transport: cluster.transport.clone(),
                local: cluster.local.clone(),
                transitions: tokio::sync::Mutex::new(()),
                appended: Notify::new(),
                orphans: parking_lot::Mutex::new(HashSet::new()),
                token,
                ready: AtomicBool::new(false),
                monitor: parking_lot::Mutex::new(None),
            }),
        };
        if let Some(local) = &broker.local {
            local.register(&broker);
        }

        broker.restore_partitions().await?;
        if broker.is_leader() {
            if let Err(e) = broker.reconcile_all().await {
                tracing::warn!("initial reconcile failed: {:#}", e);
            }
        }
        let monitor = tokio::spawn(broker.clone().monitor(events, leader_changes));
        *broker.monitor.lock() = Some(monitor);

        if !broker.config.join.is_empty() {
            let peers = broker.config.join.clone();
            broker.join_cluster(&peers).await?;
        }
        broker.ready.store(true, Ordering::SeqCst);
        tracing::info!(addr = %broker.config.addr(), leader = broker.is_leader(), "broker started");
        Ok(broker)
    }

    pub fn id(&self) -> BrokerId {
        self.config.id
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn addr(&self) -> SocketAddr {
        self.config.addr()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    #[tracing::instrument(skip(self), fields(id = %self.config.id))]
    pub async fn join_cluster(&self, addrs: &[SocketAddr]) -> anyhow::Result<()> {
        let contacted = self.membership.join(addrs).await?;
        tracing::info!(contacted, "joined cluster");
        Ok(())
    }

    /// Gracefully departs the cluster. Consistent reads stop being served immediately; the
    /// controller hands its partitions and its consensus seat over before leaving.
    #[tracing::instrument(skip(self), fields(id = %self.config.id))]
    pub async fn leave_cluster(&self) -> anyhow::Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        if self.is_leader() {
            let me = Member {
                id: self.config.id,
                addr: self.config.addr(),
                status: MemberStatus::Left,
                non_voter: self.config.non_voter,
            };
            self.reconcile_member(&me).await?;
        }
        self.membership.leave().await?;
        tracing::info!("left cluster");
        Ok(())
    }

    /// Stops every replicator and background task and detaches from the cluster. Peers that
    /// were not told about a leave see this broker as failed.
    #[tracing::instrument(skip(self), fields(id = %self.config.id))]
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.token.is_cancelled() {
            return Ok(());
        }
        self.ready.store(false, Ordering::SeqCst);
        self.token.cancel();

        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.await?;
        }
        for entry in self.registry.drain() {
            if let Some(replicator) = entry.replicator {
                replicator.stop().await;
            }
        }
        if let Some(local) = &self.local {
            local.deregister(self.config.addr());
        }
        self.membership.shutdown().await?;
        match self.consensus.shutdown().await {
            // already removed from the group by a graceful leave
            Err(ConsensusError::Detached(_)) => {}
            res => res?,
        }
        tracing::info!("broker shut down");
        Ok(())
    }

    pub fn is_leader(&self) -> bool {
        self.consensus.is_leader()
    }

    pub fn is_ready_for_consistent_reads(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.token.is_cancelled()
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Serves one session: each request is answered, in order, before the next is read.
    pub async fn run(
        &self,
        mut requests: mpsc::Receiver<RequestFrame>,
        responses: mpsc::Sender<ResponseFrame>,
    ) -> anyhow::Result<()> {
        loop {
            let frame = tokio::select! {
                _ = self.token.cancelled() => break,
                frame = requests.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let res = self.handle_frame(frame).await;
            if responses.send(res).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    pub async fn handle_frame(&self, frame: RequestFrame) -> ResponseFrame {
        let correlation_id = frame.header.correlation_id;
        ResponseFrame::new(correlation_id, self.handle_request(frame.body).await)
    }

    #[tracing::instrument(skip(self, req), fields(id = %self.config.id, api = ?req.api_key()))]
    pub async fn handle_request(&self, req: RequestKind) -> ResponseKind {
        tracing::debug!("handle request");
        match req {
            RequestKind::ApiVersions(req) => self.dispatch(req).await,
            RequestKind::CreateTopics(req) => self.dispatch(req).await,
            RequestKind::DeleteTopics(req) => self.dispatch(req).await,
            RequestKind::Produce(req) => self.dispatch(req).await,
            RequestKind::Fetch(req) => self.dispatch(req).await,
            RequestKind::ListOffsets(req) => self.dispatch(req).await,
            RequestKind::Metadata(req) => self.dispatch(req).await,
            RequestKind::LeaderAndIsr(req) => self.dispatch(req).await,
            RequestKind::StopReplica(req) => self.dispatch(req).await,
            RequestKind::Vote(req) => self.dispatch(req).await,
            RequestKind::AppendEntries(req) => self.dispatch(req).await,
            RequestKind::BrokerRegistration(req) => self.dispatch(req).await,
            RequestKind::BrokerHeartbeat(req) => self.dispatch(req).await,
            RequestKind::UnregisterBroker(req) => self.dispatch(req).await,
        }
    }

    async fn dispatch<R>(&self, req: R) -> ResponseKind
    where
        Self: Handler<R>,
        R: Request,
        R::Response: Into<ResponseKind>,
    {
        let fallback = req.error_response(ErrorCode::Unknown);
        match self.do_handle(req).await {
            Ok(res) => res.into(),
            Err(e) => {
                tracing::error!(api = ?R::KEY, "request failed: {:#}", e);
                fallback.into()
            }
        }
    }

    /// Sends a broker-to-broker request, short-circuiting requests addressed to this broker.
    pub(crate) async fn send<R>(&self, to: BrokerId, req: R) -> anyhow::Result<R::Response>
    where
        Self: Handler<R>,
        R: Request + Into<RequestKind>,
        R::Response: TryFrom<ResponseKind, Error = anyhow::Error>,
    {
        if to == self.config.id {
            return self.do_handle(req).await;
        }
        let addr = self.node_addr(to)?;
        R::Response::try_from(self.transport.request(addr, req.into()).await?)
    }

    pub(crate) fn node_addr(&self, id: BrokerId) -> anyhow::Result<SocketAddr> {
        if id == self.config.id {
            return Ok(self.config.addr());
        }
        self.store
            .get_node(id)?
            .map(|n| n.addr)
            .ok_or_else(|| anyhow::anyhow!("unknown broker {}", id))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::broker::handler::test::{new_broker, produce};
    use crate::protocol::{ApiKey, ProduceRequest, ProduceResponse};

    /// A produce request whose handler always fails as a whole.
    #[derive(Debug, Default)]
    struct Doomed(ProduceRequest);

    impl Request for Doomed {
        const KEY: ApiKey = ApiKey::ProduceKey;
        type Response = ProduceResponse;

        fn error_response(&self, error: ErrorCode) -> ProduceResponse {
            self.0.error_response(error)
        }
    }

    #[async_trait]
    impl Handler<Doomed> for Broker {
        async fn handle(&self, _req: Doomed, _res: ProduceResponse) -> anyhow::Result<ProduceResponse> {
            anyhow::bail!("log directory went away")
        }
    }

    #[tokio::test]
    async fn failed_requests_answer_every_item() -> anyhow::Result<()> {
        let (_dir, broker) = new_broker().await?;
        let mut req = produce("t", 0, &["a"]);
        req.topic_data.extend(produce("u", 3, &["b"]).topic_data);

        let res = match broker.dispatch(Doomed(req)).await {
            ResponseKind::Produce(res) => res,
            other => panic!("unexpected response {:?}", other),
        };
        let slots: Vec<_> = res
            .responses
            .iter()
            .flat_map(|t| {
                t.partition_responses
                    .iter()
                    .map(move |p| (t.name.as_str(), p.index, p.error_code, p.base_offset))
            })
            .collect();
        assert_eq!(
            slots,
            vec![("t", 0, ErrorCode::Unknown, -1), ("u", 3, ErrorCode::Unknown, -1)]
        );
        broker.shutdown().await
    }
}
