use std::collections::HashSet;

use crate::protocol::BrokerId;

/// Votes collected by a candidate for one term.
#[derive(Debug)]
pub(crate) struct Election {
    voters: Vec<BrokerId>,
    granted: HashSet<BrokerId>,
}

impl Election {
    pub fn new(voters: Vec<BrokerId>) -> Election {
        Election {
            voters,
            granted: HashSet::new(),
        }
    }

    pub fn vote(&mut self, id: BrokerId) {
        if self.voters.contains(&id) {
            self.granted.insert(id);
        }
    }

    pub fn voters(&self) -> &[BrokerId] {
        &self.voters
    }

    pub fn won(&self) -> bool {
        self.granted.len() >= self.voters.len() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_wins() {
        let mut election = Election::new(vec![BrokerId(1), BrokerId(2), BrokerId(3)]);
        election.vote(BrokerId(1));
        election.vote(BrokerId(9));
        assert!(!election.won());
        election.vote(BrokerId(1));
        assert!(!election.won());
        election.vote(BrokerId(3));
        assert!(election.won());

        let mut alone = Election::new(vec![BrokerId(1)]);
        alone.vote(BrokerId(1));
        assert!(alone.won());
    }
}
