use std::collections::HashMap;

use crate::protocol::BrokerId;

/// What the leader knows about one follower's log.
#[derive(Debug)]
pub(crate) struct Progress {
    /// The next index to send.
    pub next: u64,
    /// The highest index known to match the leader's log.
    pub matched: u64,
    /// An append request is outstanding.
    pub inflight: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ReplicationProgress {
    peers: HashMap<BrokerId, Progress>,
}

impl ReplicationProgress {
    /// Tracks `id`, optimistically starting right after the leader's last entry.
    pub fn insert(&mut self, id: BrokerId, last_index: u64) {
        self.peers.entry(id).or_insert(Progress {
            next: last_index + 1,
            matched: 0,
            inflight: false,
        });
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&BrokerId) -> bool) {
        self.peers.retain(|id, _| keep(id));
    }

    pub fn get_mut(&mut self, id: BrokerId) -> Option<&mut Progress> {
        self.peers.get_mut(&id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&BrokerId, &mut Progress)> {
        self.peers.iter_mut()
    }

    /// The highest index stored by a majority of `voters`. The leader itself counts with
    /// `own` when it is one of them.
    pub fn committed_index(&self, voters: &[BrokerId], leader: BrokerId, own: u64) -> u64 {
        let mut indices: Vec<u64> = voters
            .iter()
            .map(|id| match *id == leader {
                true => own,
                false => self.peers.get(id).map_or(0, |p| p.matched),
            })
            .collect();
        if indices.is_empty() {
            return 0;
        }
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices[indices.len() / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_needs_a_majority_of_voters() {
        let mut progress = ReplicationProgress::default();
        let voters = [BrokerId(1), BrokerId(2), BrokerId(3)];
        for id in &voters[1..] {
            progress.insert(*id, 10);
        }
        // learner progress never counts
        progress.insert(BrokerId(4), 10);
        progress.get_mut(BrokerId(4)).unwrap().matched = 10;
        assert_eq!(progress.committed_index(&voters, BrokerId(1), 10), 0);

        progress.get_mut(BrokerId(3)).unwrap().matched = 7;
        assert_eq!(progress.committed_index(&voters, BrokerId(1), 10), 7);
        assert_eq!(progress.committed_index(&voters[..2], BrokerId(1), 10), 0);

        // a leader removing itself commits on the remaining voters alone
        assert_eq!(progress.committed_index(&voters[1..], BrokerId(1), 10), 0);
        progress.get_mut(BrokerId(2)).unwrap().matched = 9;
        assert_eq!(progress.committed_index(&voters[1..], BrokerId(1), 10), 7);
    }
}
