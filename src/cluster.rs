//! The shared infrastructure brokers of one cluster attach to.

use std::sync::Arc;

use crate::broker::transport::{LocalTransport, TcpTransport, Transport};
use crate::consensus::Group;
use crate::membership::Lan;

/// How brokers agree on cluster state and learn about each other.
#[derive(Clone, Debug)]
pub enum Coordination {
    /// A consensus group and gossip network shared in memory. Only brokers of this
    /// process can take part.
    InProcess { group: Group, lan: Lan },
    /// Every broker runs Raft and gossip of its own and talks to its peers over the
    /// transport.
    Network,
}

/// The coordination mode and broker-to-broker transport shared by every broker of a
/// cluster. Clones refer to the same cluster.
#[derive(Clone, Debug)]
pub struct Cluster {
    pub coordination: Coordination,
    pub transport: Arc<dyn Transport>,
    /// Set when brokers are reached in-process rather than over TCP.
    pub local: Option<Arc<LocalTransport>>,
}

impl Cluster {
    /// A cluster whose brokers all live in this process and talk without sockets.
    pub fn in_process() -> Self {
        let local = Arc::new(LocalTransport::new());
        Self {
            coordination: Coordination::InProcess {
                group: Group::new(),
                lan: Lan::new(),
            },
            transport: local.clone(),
            local: Some(local),
        }
    }

    /// Brokers coordinating over the network as separate processes would, but delivered
    /// in-process.
    pub fn local_network() -> Self {
        let local = Arc::new(LocalTransport::new());
        Self {
            coordination: Coordination::Network,
            transport: local.clone(),
            local: Some(local),
        }
    }

    /// A cluster whose brokers reach each other over TCP, each possibly in a process of
    /// its own.
    pub fn tcp() -> Self {
        Self {
            coordination: Coordination::Network,
            transport: Arc::new(TcpTransport::new()),
            local: None,
        }
    }
}
