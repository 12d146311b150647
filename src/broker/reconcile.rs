use std::collections::{HashMap, HashSet};

use tokio::sync::{broadcast, watch};

use crate::broker::fsm::Transition;
use crate::broker::state::node::Node;
use crate::broker::state::partition::Partition;
use crate::broker::Broker;
use crate::membership::{Member, MemberEvent, MemberStatus};
use crate::protocol::{BrokerId, LeaderAndIsrPartitionState, LeaderAndIsrRequest};

/// Picks the next leader and ISR of a partition given the brokers currently alive, or
/// `None` when the current assignment can stand.
///
/// The current leader is kept while it is alive and in sync. Otherwise the preferred
/// leader, then any other in-sync replica, takes over. When no in-sync replica survives,
/// the first alive replica is elected uncleanly with itself as the only in-sync member.
pub(crate) fn next_assignment(p: &Partition, alive: &HashSet<BrokerId>) -> Option<Partition> {
    let isr: Vec<BrokerId> = p.isr.iter().copied().filter(|id| alive.contains(id)).collect();

    let (leader, isr) = if isr.contains(&p.leader) {
        (p.leader, isr)
    } else if isr.contains(&p.preferred_leader) {
        (p.preferred_leader, isr)
    } else if let Some(first) = isr.first().copied() {
        (first, isr)
    } else {
        let candidate = std::iter::once(p.preferred_leader)
            .chain(p.replicas.iter().copied())
            .find(|id| alive.contains(id) && p.replicas.contains(id));
        match candidate {
            Some(id) => (id, vec![id]),
            None => (BrokerId::NONE, Vec::new()),
        }
    };

    if leader == p.leader && isr == p.isr {
        return None;
    }
    Some(Partition {
        leader,
        isr,
        leader_epoch: p.leader_epoch + 1,
        ..p.clone()
    })
}

impl Broker {
    /// Watches membership and consensus leadership, reconciling the cluster state while this
    /// broker is the controller.
    pub(crate) async fn monitor(
        self,
        mut events: broadcast::Receiver<MemberEvent>,
        mut leader_changes: watch::Receiver<Option<BrokerId>>,
    ) {
        let mut interval = tokio::time::interval(self.config.reconcile_interval());
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        if !self.is_leader() {
                            continue;
                        }
                        tracing::debug!(?event, "member event");
                        if let Err(e) = self.reconcile_member(event.member()).await {
                            tracing::warn!(member = %event.member().id, "reconcile failed: {:#}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "member events lagged");
                        if self.is_leader() {
                            self.reconcile_or_warn().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = leader_changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let leader = *leader_changes.borrow_and_update();
                    if leader == Some(self.config.id) {
                        tracing::info!("gained cluster leadership");
                        self.reconcile_or_warn().await;
                    }
                },
                _ = interval.tick() => {
                    if self.is_leader() {
                        self.reconcile_or_warn().await;
                    }
                    if let Err(e) = self.release_orphans().await {
                        tracing::warn!("releasing orphaned replicas failed: {:#}", e);
                    }
                },
            }
        }
        tracing::debug!("monitor stopped");
    }

    async fn reconcile_or_warn(&self) {
        if let Err(e) = self.reconcile_all().await {
            tracing::warn!("reconcile failed: {:#}", e);
        }
    }

    async fn apply(&self, transition: Transition) -> anyhow::Result<Vec<u8>> {
        Ok(self.consensus.apply(transition.serialize()?).await?)
    }

    async fn register_member(&self, member: &Member) -> anyhow::Result<()> {
        let node = Node {
            id: member.id,
            addr: member.addr,
            status: member.status,
        };
        if self.store.get_node(member.id)?.as_ref() != Some(&node) {
            tracing::info!(id = %node.id, status = %node.status, "registering node");
            self.apply(Transition::RegisterNode(node)).await?;
        }
        Ok(())
    }

    async fn record_member(&self, member: &Member) -> anyhow::Result<()> {
        match member.status {
            MemberStatus::Alive => {
                self.register_member(member).await?;
                if member.non_voter {
                    self.consensus.add_learner(member.id, member.addr).await?;
                } else if !self.consensus.voters().contains(&member.id) {
                    self.consensus.add_voter(member.id, member.addr).await?;
                }
            }
            MemberStatus::Failed => self.register_member(member).await?,
            MemberStatus::Left => {
                if self.store.get_node(member.id)?.is_some() {
                    tracing::info!(id = %member.id, "deregistering node");
                    self.apply(Transition::DeregisterNode(member.id)).await?;
                }
            }
        }
        Ok(())
    }

    /// Folds one membership change into the cluster state.
    #[tracing::instrument(skip(self), fields(id = %self.config.id, member = %member.id, status = %member.status))]
    pub(crate) async fn reconcile_member(&self, member: &Member) -> anyhow::Result<()> {
        self.record_member(member).await?;
        self.rebalance().await?;
        match member.status {
            MemberStatus::Alive => self.announce(Some(member.id)).await?,
            MemberStatus::Left => self.consensus.remove_server(member.id).await?,
            MemberStatus::Failed => {}
        }
        Ok(())
    }

    /// Rebuilds the cluster state from the full membership list.
    #[tracing::instrument(skip(self), fields(id = %self.config.id))]
    pub(crate) async fn reconcile_all(&self) -> anyhow::Result<()> {
        let members = self.membership.members();
        for member in &members {
            if let Err(e) = self.record_member(member).await {
                tracing::warn!(member = %member.id, "reconcile failed: {:#}", e);
            }
        }

        // nodes the membership layer has forgotten entirely
        let known: HashSet<BrokerId> = members.iter().map(|m| m.id).collect();
        for node in self.store.get_nodes()? {
            if !known.contains(&node.id) && node.is_alive() {
                let failed = Node {
                    status: MemberStatus::Failed,
                    ..node
                };
                self.apply(Transition::RegisterNode(failed)).await?;
            }
        }

        self.rebalance().await?;
        for member in members.iter().filter(|m| m.status == MemberStatus::Left) {
            if member.id != self.config.id && self.consensus.voters().contains(&member.id) {
                self.consensus.remove_server(member.id).await?;
            }
        }
        self.announce(None).await
    }

    /// Re-elects leaders of partitions whose leader or in-sync replicas are gone and tells
    /// the affected replicas.
    async fn rebalance(&self) -> anyhow::Result<()> {
        let alive: HashSet<BrokerId> = self
            .store
            .get_alive_nodes()?
            .into_iter()
            .map(|n| n.id)
            .collect();

        let mut changed = Vec::new();
        for partition in self.store.get_all_partitions()? {
            if let Some(next) = next_assignment(&partition, &alive) {
                tracing::info!(
                    topic = %next.topic,
                    partition = next.idx,
                    old = %partition.leader,
                    new = %next.leader,
                    epoch = next.leader_epoch,
                    "partition leadership changed"
                );
                self.apply(Transition::UpdatePartition(next.clone())).await?;
                changed.push(next);
            }
        }
        self.send_leadership(changed.iter().map(Partition::state), &alive)
            .await;
        Ok(())
    }

    /// Sends the current leadership of every partition to its alive replicas, or only to
    /// `to` when given.
    async fn announce(&self, to: Option<BrokerId>) -> anyhow::Result<()> {
        let mut alive: HashSet<BrokerId> = self
            .store
            .get_alive_nodes()?
            .into_iter()
            .map(|n| n.id)
            .collect();
        if let Some(to) = to {
            alive.retain(|id| *id == to);
        }
        let states = self
            .store
            .get_all_partitions()?
            .into_iter()
            .map(|p| p.state());
        self.send_leadership(states, &alive).await;
        Ok(())
    }

    /// Groups partition states by the alive brokers replicating them and sends each broker
    /// one LeaderAndIsr request. Delivery failures are logged; the periodic reconcile
    /// retries them.
    pub(crate) async fn send_leadership(
        &self,
        states: impl IntoIterator<Item = LeaderAndIsrPartitionState>,
        alive: &HashSet<BrokerId>,
    ) {
        let mut by_broker: HashMap<BrokerId, Vec<LeaderAndIsrPartitionState>> = HashMap::new();
        for state in states {
            for replica in state.replicas.iter().filter(|id| alive.contains(id)) {
                by_broker.entry(*replica).or_default().push(state.clone());
            }
        }

        for (broker, partition_states) in by_broker {
            let req = LeaderAndIsrRequest {
                controller_id: self.config.id,
                partition_states,
            };
            match self.send(broker, req).await {
                Ok(res) => {
                    for err in res.partition_errors.iter().filter(|e| !e.error_code.is_ok()) {
                        tracing::warn!(
                            %broker,
                            topic = %err.topic_name,
                            partition = err.partition_index,
                            code = %err.error_code,
                            "replica rejected leadership"
                        );
                    }
                }
                Err(e) => tracing::warn!(%broker, "leader and isr failed: {:#}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ids: &[i32]) -> Vec<BrokerId> {
        ids.iter().map(|id| BrokerId(*id)).collect()
    }

    fn alive(alive: &[i32]) -> HashSet<BrokerId> {
        ids(alive).into_iter().collect()
    }

    #[test]
    fn healthy_partition_is_left_alone() {
        let p = Partition::new("t", 0, ids(&[1, 2, 3]));
        assert_eq!(next_assignment(&p, &alive(&[1, 2, 3])), None);
    }

    #[test]
    fn follower_loss_shrinks_isr() {
        let p = Partition::new("t", 0, ids(&[1, 2, 3]));
        let next = next_assignment(&p, &alive(&[1, 2])).unwrap();
        assert_eq!(next.leader, BrokerId(1));
        assert_eq!(next.isr, ids(&[1, 2]));
        assert_eq!(next.leader_epoch, 1);
    }

    #[test]
    fn leader_loss_elects_in_sync_replica() {
        let p = Partition::new("t", 0, ids(&[1, 2, 3]));
        let next = next_assignment(&p, &alive(&[2, 3])).unwrap();
        assert_eq!(next.leader, BrokerId(2));
        assert_eq!(next.isr, ids(&[2, 3]));
    }

    #[test]
    fn preferred_leader_is_restored_while_in_sync() {
        let mut p = Partition::new("t", 0, ids(&[1, 2]));
        p.leader = BrokerId(2);
        let next = next_assignment(&p, &alive(&[1])).unwrap();
        assert_eq!(next.leader, BrokerId(1));
        assert_eq!(next.isr, ids(&[1]));
    }

    #[test]
    fn empty_isr_elects_alive_replica_uncleanly() {
        let mut p = Partition::new("t", 0, ids(&[1, 2, 3]));
        p.isr = ids(&[1]);
        let next = next_assignment(&p, &alive(&[3])).unwrap();
        assert_eq!(next.leader, BrokerId(3));
        assert_eq!(next.isr, ids(&[3]));

        let next = next_assignment(&p, &alive(&[])).unwrap();
        assert_eq!(next.leader, BrokerId::NONE);
        assert!(next.isr.is_empty());
        assert_eq!(next_assignment(&next, &alive(&[])), None);
    }
}
