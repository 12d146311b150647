use anyhow::Result;

use crate::broker::state::node::Node;
use crate::broker::state::partition::Partition;
use crate::broker::state::topic::Topic;
use crate::broker::state::Store;
use crate::consensus::Fsm;
use crate::protocol::BrokerId;

// FSM impl

#[derive(Debug)]
pub struct BrokerFsm {
    store: Store,
}

impl BrokerFsm {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn register_node(&mut self, node: Node) -> Result<Vec<u8>> {
        tracing::trace!(%node.id, %node.status, "register node");
        self.store.register_node(&node)?;
        Ok(bincode::serialize(&node)?)
    }

    fn deregister_node(&mut self, id: BrokerId) -> Result<Vec<u8>> {
        tracing::trace!(%id, "deregister node");
        let node = self.store.deregister_node(id)?;
        Ok(bincode::serialize(&node)?)
    }

    fn register_topic(&mut self, topic: Topic, partitions: Vec<Partition>) -> Result<Vec<u8>> {
        tracing::trace!(%topic.name, partitions = partitions.len(), "register topic");
        self.store.register_topic(&topic, &partitions)?;
        Ok(bincode::serialize(&topic)?)
    }

    fn deregister_topic(&mut self, name: String) -> Result<Vec<u8>> {
        tracing::trace!(%name, "deregister topic");
        let topic = self.store.deregister_topic(&name)?;
        Ok(bincode::serialize(&topic)?)
    }

    fn update_partition(&mut self, partition: Partition) -> Result<Vec<u8>> {
        tracing::trace!(%partition.topic, %partition.idx, %partition.leader, "update partition");
        self.store.update_partition(&partition)?;
        Ok(bincode::serialize(&partition)?)
    }
}

impl Fsm for BrokerFsm {
    #[tracing::instrument(skip(input))]
    fn transition(&mut self, input: Vec<u8>) -> Result<Vec<u8>> {
        let t = Transition::deserialize(&input)?;
        match t {
            Transition::RegisterNode(node) => self.register_node(node),
            Transition::DeregisterNode(id) => self.deregister_node(id),
            Transition::RegisterTopic { topic, partitions } => {
                self.register_topic(topic, partitions)
            }
            Transition::DeregisterTopic(name) => self.deregister_topic(name),
            Transition::UpdatePartition(partition) => self.update_partition(partition),
        }
    }
}

// State Transitions

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    RegisterNode(Node),
    DeregisterNode(BrokerId),
    /// A topic and all of its partitions, committed as one command.
    RegisterTopic {
        topic: Topic,
        partitions: Vec<Partition>,
    },
    DeregisterTopic(String),
    UpdatePartition(Partition),
}

impl Transition {
    pub fn serialize(self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self)?)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MemberStatus;

    #[test]
    fn transitions_update_the_store() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::new(sled::open(dir.path())?);
        let mut fsm = BrokerFsm::new(store.clone());

        fsm.transition(
            Transition::RegisterNode(Node {
                id: BrokerId(1),
                addr: "127.0.0.1:9092".parse()?,
                status: MemberStatus::Alive,
            })
            .serialize()?,
        )?;
        let topic = Topic::new("t", vec![0]);
        let mut partition = Partition::new("t", 0, vec![BrokerId(1)]);
        let out = fsm.transition(
            Transition::RegisterTopic {
                topic: topic.clone(),
                partitions: vec![partition.clone()],
            }
            .serialize()?,
        )?;
        assert_eq!(bincode::deserialize::<Topic>(&out)?, topic);

        partition.leader_epoch = 1;
        fsm.transition(Transition::UpdatePartition(partition.clone()).serialize()?)?;
        assert_eq!(store.get_partition("t", 0)?, Some(partition));

        fsm.transition(Transition::DeregisterTopic("t".into()).serialize()?)?;
        assert!(store.get_topic("t")?.is_none());
        assert!(fsm
            .transition(Transition::UpdatePartition(Partition::new("t", 0, vec![])).serialize()?)
            .is_err());

        fsm.transition(Transition::DeregisterNode(BrokerId(1)).serialize()?)?;
        assert!(store.get_nodes()?.is_empty());
        Ok(())
    }
}
