use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::log::DEFAULT_MAX_SEGMENT_BYTES;
use crate::protocol::BrokerId;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub id: BrokerId,
    pub ip: IpAddr,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Start as the sole voter of a new cluster.
    pub bootstrap: bool,
    /// Never admit this broker as a consensus voter.
    pub non_voter: bool,
    /// Addresses of brokers to join at startup.
    pub join: Vec<SocketAddr>,
    pub reconcile_interval_ms: u64,
    pub max_segment_bytes: u64,
    pub replica: ReplicaConfig,
    pub consensus: ConsensusConfig,
    pub gossip: GossipConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            id: BrokerId(1),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8844,
            data_dir: std::env::temp_dir().join("hedda"),
            bootstrap: true,
            non_voter: false,
            join: Vec::new(),
            reconcile_interval_ms: 60_000,
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            replica: ReplicaConfig::default(),
            consensus: ConsensusConfig::default(),
            gossip: GossipConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.is_none() {
            anyhow::bail!("broker id must be non-negative, got {}", self.id);
        }
        if self.reconcile_interval_ms == 0 {
            anyhow::bail!("reconcile_interval_ms must be positive");
        }
        if self.max_segment_bytes == 0 {
            anyhow::bail!("max_segment_bytes must be positive");
        }
        self.replica.validate()?;
        self.consensus.validate()?;
        self.gossip.validate()
    }
}

/// Tuning of the fetch loop followers run against partition leaders.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    pub max_bytes: i32,
    pub min_bytes: i32,
    pub max_wait_ms: i32,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            min_bytes: 1,
            max_wait_ms: 250,
            backoff_min_ms: 20,
            backoff_max_ms: 2_000,
        }
    }
}

impl ReplicaConfig {
    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.max_bytes <= 0 {
            anyhow::bail!("replica.max_bytes must be positive");
        }
        if self.backoff_min_ms > self.backoff_max_ms {
            anyhow::bail!(
                "replica.backoff_min_ms ({}) exceeds replica.backoff_max_ms ({})",
                self.backoff_min_ms,
                self.backoff_max_ms
            );
        }
        Ok(())
    }
}

/// Timing of the metadata quorum when brokers coordinate over the network.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// How often the leader replicates to, and heartbeats, every other server.
    pub heartbeat_ms: u64,
    /// Followers wait a random time in this range without hearing from a leader before
    /// starting an election.
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// How long a proposal may take to commit before the proposer gives up.
    pub commit_timeout_ms: u64,
    /// Maximum number of entries carried by one append request.
    pub max_append_entries: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 50,
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 600,
            commit_timeout_ms: 5_000,
            max_append_entries: 256,
        }
    }
}

impl ConsensusConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_ms == 0 {
            anyhow::bail!("consensus.heartbeat_ms must be positive");
        }
        if self.election_timeout_min_ms <= self.heartbeat_ms {
            anyhow::bail!("consensus.election_timeout_min_ms must exceed consensus.heartbeat_ms");
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            anyhow::bail!(
                "consensus.election_timeout_min_ms ({}) exceeds consensus.election_timeout_max_ms ({})",
                self.election_timeout_min_ms,
                self.election_timeout_max_ms
            );
        }
        if self.max_append_entries == 0 {
            anyhow::bail!("consensus.max_append_entries must be positive");
        }
        Ok(())
    }
}

/// Timing of membership heartbeats when brokers coordinate over the network.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub interval_ms: u64,
    /// A member not heard from for this long is considered failed.
    pub failure_timeout_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            failure_timeout_ms: 2_000,
        }
    }
}

impl GossipConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn failure_timeout(&self) -> Duration {
        Duration::from_millis(self.failure_timeout_ms)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.interval_ms == 0 || self.failure_timeout_ms <= self.interval_ms {
            anyhow::bail!("gossip.failure_timeout_ms must exceed a positive gossip.interval_ms");
        }
        Ok(())
    }
}
