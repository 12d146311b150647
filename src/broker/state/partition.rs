use crate::protocol::{BrokerId, LeaderAndIsrPartitionState};

/// The controller's replica assignment for one partition, as replicated through consensus.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct Partition {
    pub topic: String,
    pub idx: i32,
    pub replicas: Vec<BrokerId>,
    pub isr: Vec<BrokerId>,
    pub leader: BrokerId,
    pub preferred_leader: BrokerId,
    pub leader_epoch: i32,
}

impl Partition {
    /// A fresh assignment led by the first replica, with every replica in sync.
    pub fn new(topic: impl Into<String>, idx: i32, replicas: Vec<BrokerId>) -> Self {
        let leader = replicas.first().copied().unwrap_or(BrokerId::NONE);
        Self {
            topic: topic.into(),
            idx,
            isr: replicas.clone(),
            replicas,
            leader,
            preferred_leader: leader,
            leader_epoch: 0,
        }
    }

    pub fn state(&self) -> LeaderAndIsrPartitionState {
        LeaderAndIsrPartitionState {
            topic_name: self.topic.clone(),
            partition_index: self.idx,
            leader: self.leader,
            leader_epoch: self.leader_epoch,
            isr: self.isr.clone(),
            replicas: self.replicas.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_replica_leads() {
        let p = Partition::new("t", 3, vec![BrokerId(2), BrokerId(1)]);
        assert_eq!(p.leader, BrokerId(2));
        assert_eq!(p.preferred_leader, BrokerId(2));
        assert_eq!(p.isr, p.replicas);

        let state = p.state();
        assert_eq!(state.partition_index, 3);
        assert_eq!(state.leader, BrokerId(2));
    }
}
