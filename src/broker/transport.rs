use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::broker::{Broker, BrokerInner};
use crate::protocol::{BrokerClient, RequestKind, ResponseKind};

/// Carries broker-to-broker requests: consensus and membership traffic, leadership
/// commands, replica removal and follower fetches.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Sends over the connection shared by all traffic to `addr`.
    async fn request(&self, addr: SocketAddr, req: RequestKind) -> anyhow::Result<ResponseKind>;

    /// Opens a connection to `addr` of its own, for requests that park on the peer.
    async fn open(&self, addr: SocketAddr) -> anyhow::Result<Box<dyn Channel>>;
}

/// A connection owned by a single caller.
#[async_trait]
pub trait Channel: Send + Sync + Debug {
    async fn request(&self, req: RequestKind) -> anyhow::Result<ResponseKind>;
}

#[async_trait]
impl Channel for BrokerClient {
    async fn request(&self, req: RequestKind) -> anyhow::Result<ResponseKind> {
        self.send(req).await
    }
}

/// Talks to peers over TCP, keeping one shared connection per peer.
#[derive(Default)]
pub struct TcpTransport {
    clients: Mutex<HashMap<SocketAddr, Arc<BrokerClient>>>,
}

impl Debug for TcpTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TcpTransport {{ clients: {} }}", self.clients.lock().len())
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self, addr: SocketAddr) -> anyhow::Result<Arc<BrokerClient>> {
        if let Some(client) = self.clients.lock().get(&addr) {
            return Ok(client.clone());
        }
        let client = Arc::new(BrokerClient::connect(addr).await?);
        tracing::debug!(%addr, "connected to peer");
        Ok(self
            .clients
            .lock()
            .entry(addr)
            .or_insert(client)
            .clone())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request(&self, addr: SocketAddr, req: RequestKind) -> anyhow::Result<ResponseKind> {
        let client = self.client(addr).await?;
        match client.send(req).await {
            Ok(res) => Ok(res),
            Err(e) => {
                let mut clients = self.clients.lock();
                if clients.get(&addr).map_or(false, |c| Arc::ptr_eq(c, &client)) {
                    clients.remove(&addr);
                }
                Err(e)
            }
        }
    }

    async fn open(&self, addr: SocketAddr) -> anyhow::Result<Box<dyn Channel>> {
        let client = BrokerClient::connect(addr).await?;
        tracing::debug!(%addr, "opened dedicated connection");
        Ok(Box::new(client))
    }
}

/// Delivers requests to brokers running in the same process.
#[derive(Default)]
pub struct LocalTransport {
    brokers: RwLock<HashMap<SocketAddr, Weak<BrokerInner>>>,
}

impl Debug for LocalTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalTransport {{ brokers: {} }}", self.brokers.read().len())
    }
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, broker: &Broker) {
        self.brokers
            .write()
            .insert(broker.config.addr(), Arc::downgrade(&broker.inner));
    }

    pub fn deregister(&self, addr: SocketAddr) {
        self.brokers.write().remove(&addr);
    }

    fn broker(&self, addr: SocketAddr) -> anyhow::Result<Weak<BrokerInner>> {
        self.brokers
            .read()
            .get(&addr)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no broker listening on {}", addr))
    }
}

async fn deliver(
    addr: SocketAddr,
    broker: &Weak<BrokerInner>,
    req: RequestKind,
) -> anyhow::Result<ResponseKind> {
    let inner = broker
        .upgrade()
        .ok_or_else(|| anyhow::anyhow!("broker on {} is gone", addr))?;
    let broker = Broker { inner };
    if broker.is_shut_down() {
        anyhow::bail!("broker on {} is shut down", addr);
    }
    Ok(broker.handle_request(req).await)
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request(&self, addr: SocketAddr, req: RequestKind) -> anyhow::Result<ResponseKind> {
        let broker = self.broker(addr)?;
        deliver(addr, &broker, req).await
    }

    async fn open(&self, addr: SocketAddr) -> anyhow::Result<Box<dyn Channel>> {
        let broker = self.broker(addr)?;
        Ok(Box::new(LocalChannel { addr, broker }))
    }
}

/// Pinned to the broker that was registered on the address when it was opened.
struct LocalChannel {
    addr: SocketAddr,
    broker: Weak<BrokerInner>,
}

impl Debug for LocalChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalChannel {{ addr: {} }}", self.addr)
    }
}

#[async_trait]
impl Channel for LocalChannel {
    async fn request(&self, req: RequestKind) -> anyhow::Result<ResponseKind> {
        deliver(self.addr, &self.broker, req).await
    }
}
