pub mod node;
pub mod partition;
pub mod topic;

use std::fmt::{Debug, Formatter};

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Db;

use crate::broker::state::node::Node;
use crate::broker::state::partition::Partition;
use crate::broker::state::topic::Topic;
use crate::protocol::BrokerId;

/// The consensus-replicated cluster state: topics, their partition assignments, and the
/// node registry. Written only by the state machine, read by everyone.
#[derive(Clone)]
pub struct Store {
    db: Db,
}

impl Debug for Store {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Store {{}}")
    }
}

fn topic_key(name: &str) -> String {
    format!("topic:{}", name)
}

fn partition_prefix(topic: &str) -> String {
    format!("partition:{}:", topic)
}

fn partition_key(topic: &str, idx: i32) -> String {
    format!("partition:{}:{:010}", topic, idx)
}

fn node_key(id: BrokerId) -> String {
    format!("node:{:010}", id.0)
}

impl Store {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Writes a topic together with all of its partitions in one atomic batch. Re-registering
    /// the same topic id is a no-op; a different topic under the same name is rejected.
    #[tracing::instrument]
    pub fn register_topic(&self, topic: &Topic, partitions: &[Partition]) -> Result<()> {
        if let Some(existing) = self.get_topic(&topic.name)? {
            if existing.id == topic.id {
                return Ok(());
            }
            anyhow::bail!("topic {} already exists", topic.name);
        }

        let mut batch = sled::Batch::default();
        batch.insert(topic_key(&topic.name).as_bytes(), bincode::serialize(topic)?);
        for p in partitions {
            batch.insert(partition_key(&p.topic, p.idx).as_bytes(), bincode::serialize(p)?);
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    #[tracing::instrument]
    pub fn deregister_topic(&self, name: &str) -> Result<Option<Topic>> {
        let topic = self.get_topic(name)?;
        let mut batch = sled::Batch::default();
        batch.remove(topic_key(name).as_bytes());
        for kv in self.db.scan_prefix(partition_prefix(name).as_bytes()) {
            let (k, _) = kv?;
            batch.remove(k);
        }
        self.db.apply_batch(batch)?;
        Ok(topic)
    }

    pub fn topic_exists(&self, name: &str) -> Result<bool> {
        Ok(self.db.contains_key(topic_key(name).as_bytes())?)
    }

    pub fn get_topic(&self, name: &str) -> Result<Option<Topic>> {
        self.get(topic_key(name))
    }

    pub fn get_topics(&self) -> Result<Vec<Topic>> {
        self.scan("topic:")
    }

    pub fn update_partition(&self, partition: &Partition) -> Result<()> {
        if !self.topic_exists(&partition.topic)? {
            anyhow::bail!("topic {} does not exist", partition.topic);
        }
        self.insert(partition_key(&partition.topic, partition.idx), partition)
    }

    pub fn get_partition(&self, topic: &str, idx: i32) -> Result<Option<Partition>> {
        self.get(partition_key(topic, idx))
    }

    /// Partitions of `topic` ordered by id.
    pub fn get_partitions(&self, topic: &str) -> Result<Vec<Partition>> {
        self.scan(&partition_prefix(topic))
    }

    pub fn get_all_partitions(&self) -> Result<Vec<Partition>> {
        self.scan("partition:")
    }

    pub fn register_node(&self, node: &Node) -> Result<()> {
        self.insert(node_key(node.id), node)
    }

    pub fn deregister_node(&self, id: BrokerId) -> Result<Option<Node>> {
        let old = self.get(node_key(id))?;
        self.db.remove(node_key(id).as_bytes())?;
        Ok(old)
    }

    pub fn get_node(&self, id: BrokerId) -> Result<Option<Node>> {
        self.get(node_key(id))
    }

    pub fn get_nodes(&self) -> Result<Vec<Node>> {
        self.scan("node:")
    }

    pub fn get_alive_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.get_nodes()?.into_iter().filter(Node::is_alive).collect())
    }

    fn get<T: DeserializeOwned, K: AsRef<[u8]>>(&self, key: K) -> Result<Option<T>> {
        self.db
            .get(key.as_ref())?
            .map(|x| {
                bincode::deserialize(&x).map_err(|e| anyhow::anyhow!("could not deserialize {}", e))
            })
            .transpose()
    }

    fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        self.db
            .scan_prefix(prefix.as_bytes())
            .map(|kv| -> Result<T> {
                let (_, v) = kv?;
                Ok(bincode::deserialize(&v)?)
            })
            .collect()
    }

    fn insert<T: Serialize, K: AsRef<[u8]>>(&self, key: K, value: &T) -> Result<()> {
        self.db.insert(key.as_ref(), bincode::serialize(&value)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::membership::MemberStatus;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(sled::open(dir.path()).unwrap());
        (dir, store)
    }

    #[test]
    fn topics_are_registered_with_their_partitions() -> Result<()> {
        let (_dir, store) = store();
        let topic = Topic::new("orders", vec![0, 1]);
        let partitions = vec![
            Partition::new("orders", 0, vec![BrokerId(1)]),
            Partition::new("orders", 1, vec![BrokerId(1)]),
        ];
        store.register_topic(&topic, &partitions)?;
        store.register_topic(&topic, &partitions)?;
        assert!(store
            .register_topic(&Topic::new("orders", vec![0]), &partitions[..1])
            .is_err());

        assert_eq!(store.get_partitions("orders")?, partitions);
        assert_eq!(store.get_topics()?, vec![topic]);

        store.deregister_topic("orders")?;
        assert!(!store.topic_exists("orders")?);
        assert!(store.get_all_partitions()?.is_empty());
        Ok(())
    }

    #[test]
    fn prefix_does_not_leak_between_topics() -> Result<()> {
        let (_dir, store) = store();
        store.register_topic(&Topic::new("a", vec![0]), &[Partition::new("a", 0, vec![])])?;
        store.register_topic(&Topic::new("ab", vec![0]), &[Partition::new("ab", 0, vec![])])?;
        assert_eq!(store.get_partitions("a")?.len(), 1);
        store.deregister_topic("a")?;
        assert_eq!(store.get_partitions("ab")?.len(), 1);
        Ok(())
    }

    #[test]
    fn nodes() -> Result<()> {
        let (_dir, store) = store();
        let addr: SocketAddr = "127.0.0.1:9092".parse()?;
        store.register_node(&Node {
            id: BrokerId(1),
            addr,
            status: MemberStatus::Alive,
        })?;
        store.register_node(&Node {
            id: BrokerId(2),
            addr,
            status: MemberStatus::Failed,
        })?;
        assert_eq!(store.get_nodes()?.len(), 2);
        assert_eq!(store.get_alive_nodes()?.len(), 1);
        assert!(store.deregister_node(BrokerId(2))?.is_some());
        assert_eq!(store.get_nodes()?.len(), 1);
        Ok(())
    }
}
