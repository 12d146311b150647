//! Raft over the broker transport: leader election, log replication and single-server
//! membership changes. The log lives in the broker's state database.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::broker::config::ConsensusConfig;
use crate::broker::transport::Transport;
use crate::consensus::raft::election::Election;
use crate::consensus::raft::log::RaftLog;
use crate::consensus::raft::progress::ReplicationProgress;
use crate::consensus::{Consensus, ConsensusError, Fsm, Result};
use crate::protocol::{
    AppendEntriesRequest, AppendEntriesResponse, BrokerId, EntryPayload, LogEntry,
    QuorumServer, VoteRequest, VoteResponse,
};

mod election;
mod log;
mod progress;

#[derive(Debug)]
enum Role {
    Follower { leader: Option<BrokerId> },
    Candidate(Election),
    Leader(ReplicationProgress),
}

struct Pending {
    term: u64,
    tx: oneshot::Sender<Result<Vec<u8>>>,
}

struct RaftState {
    term: u64,
    vote: Option<BrokerId>,
    role: Role,
    log: RaftLog,
    commit: u64,
    applied: u64,
    servers: BTreeMap<BrokerId, QuorumServer>,
    /// Index of the entry `servers` was read from.
    config_index: u64,
    fsm: Box<dyn Fsm>,
    /// Proposals of this leader waiting for their entry to be applied, by index.
    pending: HashMap<u64, Pending>,
    election_deadline: Instant,
    /// When a leader of the current term was last heard from.
    heard_from_leader: Option<Instant>,
}

impl RaftState {
    fn voters(&self) -> Vec<BrokerId> {
        self.servers
            .values()
            .filter(|s| s.voter)
            .map(|s| s.id)
            .collect()
    }

    fn is_voter(&self, id: BrokerId) -> bool {
        self.servers.get(&id).map_or(false, |s| s.voter)
    }

    fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    fn set_config(&mut self, index: u64, servers: Vec<QuorumServer>, me: BrokerId) {
        self.servers = servers.into_iter().map(|s| (s.id, s)).collect();
        self.config_index = index;
        let last = self.log.last_index();
        if let Role::Leader(progress) = &mut self.role {
            let servers = &self.servers;
            progress.retain(|id| servers.contains_key(id));
            for id in servers.keys().filter(|id| **id != me) {
                progress.insert(*id, last);
            }
        }
    }
}

/// Requests a tick decided to send, carried out once the state lock is released.
enum Outbound {
    Append {
        to: BrokerId,
        addr: SocketAddr,
        req: AppendEntriesRequest,
    },
    Vote {
        to: BrokerId,
        addr: SocketAddr,
        req: VoteRequest,
    },
}

/// One broker's seat in a Raft group whose members reach each other over a [`Transport`].
#[derive(Clone)]
pub struct Raft {
    inner: Arc<RaftInner>,
}

struct RaftInner {
    id: BrokerId,
    addr: SocketAddr,
    config: ConsensusConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<RaftState>,
    leader_tx: watch::Sender<Option<BrokerId>>,
    /// Wakes the tick loop early, e.g. when a proposal awaits replication.
    kick: Notify,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for Raft {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        write!(
            f,
            "Raft {{ id: {}, term: {}, commit: {}, last: {} }}",
            self.inner.id,
            state.term,
            state.commit,
            state.log.last_index()
        )
    }
}

impl Raft {
    /// Opens the log kept in `db` and starts taking part in the group. A bootstrap member
    /// with an empty log founds a group with itself as the only voter; others wait for a
    /// leader to add them.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(skip(db, fsm, transport, config, token))]
    pub fn open(
        id: BrokerId,
        addr: SocketAddr,
        db: &sled::Db,
        fsm: Box<dyn Fsm>,
        bootstrap: bool,
        transport: Arc<dyn Transport>,
        config: ConsensusConfig,
        token: CancellationToken,
    ) -> anyhow::Result<Raft> {
        let mut log = RaftLog::open(db)?;
        let mut term = log.term()?;
        let mut vote = log.vote()?;
        if bootstrap && log.last_index() == 0 {
            term = term.max(1);
            vote = Some(id);
            log.save_election(term, vote)?;
            log.append(LogEntry {
                term,
                payload: EntryPayload::Config(vec![QuorumServer {
                    id,
                    addr,
                    voter: true,
                }]),
            })?;
            tracing::info!(term, "bootstrapped consensus group");
        }
        let (config_index, servers) = log.latest_config()?.unwrap_or_default();
        let applied = log.applied()?;

        let (leader_tx, _) = watch::channel(None);
        let mut state = RaftState {
            term,
            vote,
            role: Role::Follower { leader: None },
            log,
            commit: applied,
            applied,
            servers: BTreeMap::new(),
            config_index: 0,
            fsm,
            pending: HashMap::new(),
            election_deadline: Instant::now(),
            heard_from_leader: None,
        };
        state.set_config(config_index, servers, id);

        let raft = Raft {
            inner: Arc::new(RaftInner {
                id,
                addr,
                config,
                transport,
                state: Mutex::new(state),
                leader_tx,
                kick: Notify::new(),
                token,
                task: Mutex::new(None),
            }),
        };
        {
            let mut state = raft.inner.state.lock();
            raft.inner.reset_election_deadline(&mut state);
            // a lone voter needs nobody's vote
            if state.voters() == vec![id] {
                raft.inner.campaign(&mut state)?;
            }
        }
        let task = tokio::spawn(raft.clone().run());
        *raft.inner.task.lock() = Some(task);
        Ok(raft)
    }

    async fn run(self) {
        let mut interval = tokio::time::interval(self.inner.config.heartbeat());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.inner.kick.notified() => {}
            }
            let outbound = {
                let mut state = self.inner.state.lock();
                self.inner.tick(&mut state)
            };
            match outbound {
                Ok(outbound) => {
                    for out in outbound {
                        tokio::spawn(self.clone().send(out));
                    }
                }
                Err(e) => tracing::error!(id = %self.inner.id, "consensus tick failed: {:#}", e),
            }
        }
        tracing::debug!(id = %self.inner.id, "consensus stopped");
    }

    async fn send(self, out: Outbound) {
        let timeout = self.inner.rpc_timeout();
        match out {
            Outbound::Append { to, addr, req } => {
                let (term, prev) = (req.term, req.prev_log_index);
                let res = tokio::time::timeout(timeout, self.inner.transport.request(addr, req.into()))
                    .await
                    .map_err(|_| anyhow::anyhow!("append to {} timed out", to))
                    .and_then(|res| res)
                    .and_then(AppendEntriesResponse::try_from);
                let mut state = self.inner.state.lock();
                if let Err(e) = self.inner.on_append_response(&mut state, to, term, prev, res) {
                    tracing::error!(id = %self.inner.id, peer = %to, "append response failed: {:#}", e);
                }
            }
            Outbound::Vote { to, addr, req } => {
                let term = req.term;
                let res = tokio::time::timeout(timeout, self.inner.transport.request(addr, req.into()))
                    .await
                    .map_err(|_| anyhow::anyhow!("vote request to {} timed out", to))
                    .and_then(|res| res)
                    .and_then(VoteResponse::try_from);
                let mut state = self.inner.state.lock();
                if let Err(e) = self.inner.on_vote_response(&mut state, to, term, res) {
                    tracing::error!(id = %self.inner.id, peer = %to, "vote response failed: {:#}", e);
                }
            }
        }
    }

    /// Proposes `payload` and waits for it to be applied locally.
    async fn propose(&self, payload: EntryPayload) -> Result<Vec<u8>> {
        let rx = {
            let mut state = self.inner.state.lock();
            self.inner.propose(&mut state, payload)?
        };
        self.inner.kick.notify_one();
        self.wait(rx).await
    }

    async fn wait(&self, rx: oneshot::Receiver<Result<Vec<u8>>>) -> Result<Vec<u8>> {
        let timeout = self.inner.config.commit_timeout();
        tokio::select! {
            _ = self.inner.token.cancelled() => Err(ConsensusError::Detached(self.inner.id)),
            res = tokio::time::timeout(timeout, rx) => match res {
                Ok(Ok(res)) => res,
                Ok(Err(_)) => Err(ConsensusError::NotLeader { leader: self.leader_id() }),
                Err(_) => Err(ConsensusError::Timeout(timeout)),
            },
        }
    }

    /// Appends a new server set computed by `edit`, which returns false when nothing
    /// changes, and waits for it to commit. Only one change is in flight at a time; a
    /// change made while another is uncommitted waits for it up to the commit timeout.
    async fn change_config(
        &self,
        mut edit: impl FnMut(&mut BTreeMap<BrokerId, QuorumServer>) -> bool,
    ) -> Result<()> {
        let deadline = Instant::now() + self.inner.config.commit_timeout();
        let rx = loop {
            {
                let mut state = self.inner.state.lock();
                if !state.is_leader() {
                    return Err(ConsensusError::NotLeader {
                        leader: self.leader_id(),
                    });
                }
                if state.config_index <= state.commit {
                    let mut servers = state.servers.clone();
                    if !edit(&mut servers) {
                        return Ok(());
                    }
                    let servers: Vec<QuorumServer> = servers.into_values().collect();
                    let index = state.log.last_index() + 1;
                    state.set_config(index, servers.clone(), self.inner.id);
                    break self.inner.propose(&mut state, EntryPayload::Config(servers))?;
                }
            }
            if Instant::now() >= deadline {
                return Err(ConsensusError::ChangeInProgress);
            }
            tokio::select! {
                _ = self.inner.token.cancelled() => return Err(ConsensusError::Detached(self.inner.id)),
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        };
        self.inner.kick.notify_one();
        self.wait(rx).await.map(|_| ())
    }
}

impl RaftInner {
    fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.config.election_timeout_max_ms)
    }

    fn reset_election_deadline(&self, state: &mut RaftState) {
        let timeout = thread_rng().gen_range(
            self.config.election_timeout_min_ms..=self.config.election_timeout_max_ms,
        );
        state.election_deadline = Instant::now() + Duration::from_millis(timeout);
    }

    fn set_leader(&self, leader: Option<BrokerId>) {
        if *self.leader_tx.borrow() != leader {
            tracing::info!(id = %self.id, ?leader, "consensus leader changed");
            self.leader_tx.send_replace(leader);
        }
    }

    fn leader_id(&self) -> Option<BrokerId> {
        *self.leader_tx.borrow()
    }

    fn save_term(&self, state: &mut RaftState, term: u64) -> anyhow::Result<()> {
        if term > state.term {
            state.term = term;
            state.vote = None;
            state.log.save_election(term, None)?;
        }
        Ok(())
    }

    fn become_follower(
        &self,
        state: &mut RaftState,
        term: u64,
        leader: Option<BrokerId>,
    ) -> anyhow::Result<()> {
        self.save_term(state, term)?;
        if state.is_leader() {
            tracing::info!(id = %self.id, term, "stepping down");
            for (_, p) in state.pending.drain() {
                let _ = p.tx.send(Err(ConsensusError::NotLeader { leader }));
            }
        }
        state.role = Role::Follower { leader };
        self.set_leader(leader);
        self.reset_election_deadline(state);
        Ok(())
    }

    fn become_leader(&self, state: &mut RaftState) -> anyhow::Result<()> {
        tracing::info!(id = %self.id, term = state.term, "won election");
        let mut progress = ReplicationProgress::default();
        let last = state.log.last_index();
        for id in state.servers.keys().filter(|id| **id != self.id) {
            progress.insert(*id, last);
        }
        state.role = Role::Leader(progress);
        state.heard_from_leader = None;
        self.set_leader(Some(self.id));
        // entries of earlier terms commit only through one of the new term
        state.log.append(LogEntry {
            term: state.term,
            payload: EntryPayload::Noop,
        })?;
        self.advance_commit(state)?;
        self.kick.notify_one();
        Ok(())
    }

    fn campaign(&self, state: &mut RaftState) -> anyhow::Result<Vec<Outbound>> {
        state.term += 1;
        state.vote = Some(self.id);
        state.log.save_election(state.term, state.vote)?;
        state.heard_from_leader = None;
        self.reset_election_deadline(state);
        self.set_leader(None);
        tracing::debug!(id = %self.id, term = state.term, "starting election");

        let mut election = Election::new(state.voters());
        election.vote(self.id);
        if election.won() {
            self.become_leader(state)?;
            return Ok(Vec::new());
        }

        let req = VoteRequest {
            term: state.term,
            candidate_id: self.id,
            last_log_index: state.log.last_index(),
            last_log_term: state.log.last_term(),
        };
        let outbound = election
            .voters()
            .iter()
            .filter(|id| **id != self.id)
            .filter_map(|id| state.servers.get(id))
            .map(|s| Outbound::Vote {
                to: s.id,
                addr: s.addr,
                req: req.clone(),
            })
            .collect();
        state.role = Role::Candidate(election);
        Ok(outbound)
    }

    fn tick(&self, state: &mut RaftState) -> anyhow::Result<Vec<Outbound>> {
        if state.is_leader() {
            return self.appends(state);
        }
        if Instant::now() >= state.election_deadline {
            if state.is_voter(self.id) {
                return self.campaign(state);
            }
            self.reset_election_deadline(state);
        }
        Ok(Vec::new())
    }

    /// An append request for every follower without one in flight. Up to date followers
    /// get an empty one, which doubles as the heartbeat.
    fn appends(&self, state: &mut RaftState) -> anyhow::Result<Vec<Outbound>> {
        let RaftState {
            role,
            log,
            servers,
            term,
            commit,
            ..
        } = state;
        let progress = match role {
            Role::Leader(progress) => progress,
            _ => return Ok(Vec::new()),
        };

        let mut outbound = Vec::new();
        for (id, p) in progress.iter_mut() {
            let addr = match servers.get(id) {
                Some(s) => s.addr,
                None => continue,
            };
            if p.inflight {
                continue;
            }
            let prev_log_index = p.next - 1;
            let prev_log_term = log.term_at(prev_log_index)?.ok_or_else(|| {
                anyhow::anyhow!("entry {} for {} is missing", prev_log_index, id)
            })?;
            let entries = log.range(p.next, self.config.max_append_entries)?;
            p.inflight = true;
            outbound.push(Outbound::Append {
                to: *id,
                addr,
                req: AppendEntriesRequest {
                    term: *term,
                    leader_id: self.id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit: *commit,
                },
            });
        }
        Ok(outbound)
    }

    fn on_append_response(
        &self,
        state: &mut RaftState,
        from: BrokerId,
        term: u64,
        prev: u64,
        res: anyhow::Result<AppendEntriesResponse>,
    ) -> anyhow::Result<()> {
        if let Role::Leader(progress) = &mut state.role {
            if let Some(p) = progress.get_mut(from) {
                p.inflight = false;
            }
        }
        let res = match res {
            Ok(res) if res.term > 0 => res,
            Ok(_) => return Ok(()),
            Err(e) => {
                tracing::trace!(id = %self.id, peer = %from, "append failed: {:#}", e);
                return Ok(());
            }
        };
        if res.term > state.term {
            return self.become_follower(state, res.term, None);
        }
        if state.term != term {
            return Ok(());
        }

        let last = state.log.last_index();
        let p = match &mut state.role {
            Role::Leader(progress) => match progress.get_mut(from) {
                Some(p) => p,
                None => return Ok(()),
            },
            _ => return Ok(()),
        };
        if res.success {
            p.matched = p.matched.max(res.match_index);
            p.next = p.matched + 1;
            if p.next <= last {
                self.kick.notify_one();
            }
            self.advance_commit(state)?;
        } else {
            p.next = prev.min(res.match_index + 1).max(1);
            tracing::trace!(id = %self.id, peer = %from, next = p.next, "follower log diverges");
            self.kick.notify_one();
        }
        Ok(())
    }

    fn on_vote_response(
        &self,
        state: &mut RaftState,
        from: BrokerId,
        term: u64,
        res: anyhow::Result<VoteResponse>,
    ) -> anyhow::Result<()> {
        let res = match res {
            Ok(res) if res.term > 0 => res,
            Ok(_) => return Ok(()),
            Err(e) => {
                tracing::trace!(id = %self.id, peer = %from, "vote request failed: {:#}", e);
                return Ok(());
            }
        };
        if res.term > state.term {
            return self.become_follower(state, res.term, None);
        }
        if state.term != term || !res.vote_granted {
            return Ok(());
        }
        let won = match &mut state.role {
            Role::Candidate(election) => {
                election.vote(from);
                election.won()
            }
            _ => false,
        };
        if won {
            self.become_leader(state)?;
        }
        Ok(())
    }

    /// Commits what a majority of voters stores, provided it includes an entry of the
    /// current term, and applies it.
    fn advance_commit(&self, state: &mut RaftState) -> anyhow::Result<()> {
        let voters = state.voters();
        let index = match &state.role {
            Role::Leader(progress) => {
                progress.committed_index(&voters, self.id, state.log.last_index())
            }
            _ => return Ok(()),
        };
        if index <= state.commit || state.log.term_at(index)? != Some(state.term) {
            return Ok(());
        }
        state.commit = index;
        tracing::trace!(id = %self.id, commit = index, "committed");
        self.apply_committed(state)?;

        if state.config_index <= state.commit && !state.is_voter(self.id) {
            tracing::info!(id = %self.id, "removed from the voters, stepping down");
            self.become_follower(state, state.term, None)?;
        }
        Ok(())
    }

    fn apply_committed(&self, state: &mut RaftState) -> anyhow::Result<()> {
        while state.applied < state.commit {
            let index = state.applied + 1;
            let entry = state
                .log
                .get(index)?
                .ok_or_else(|| anyhow::anyhow!("committed entry {} is missing", index))?;
            let out = match entry.payload {
                EntryPayload::Command(data) => state.fsm.transition(data).map_err(ConsensusError::Fsm),
                EntryPayload::Noop | EntryPayload::Config(_) => Ok(Vec::new()),
            };
            state.applied = index;
            state.log.save_applied(index)?;

            match state.pending.remove(&index) {
                Some(p) if p.term == entry.term => {
                    let _ = p.tx.send(out);
                }
                Some(p) => {
                    let _ = p.tx.send(Err(ConsensusError::NotLeader {
                        leader: self.leader_id(),
                    }));
                }
                None => {
                    if let Err(e) = out {
                        tracing::error!(id = %self.id, index, "fsm apply failed: {:#}", e);
                    }
                }
            }
        }
        Ok(())
    }

    fn propose(
        &self,
        state: &mut RaftState,
        payload: EntryPayload,
    ) -> Result<oneshot::Receiver<Result<Vec<u8>>>> {
        if !state.is_leader() {
            return Err(ConsensusError::NotLeader {
                leader: self.leader_id(),
            });
        }
        let term = state.term;
        let index = state.log.append(LogEntry { term, payload })?;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(index, Pending { term, tx });
        self.advance_commit(state)?;
        Ok(rx)
    }

    /// A leader that is still heartbeating keeps its followers from being disrupted by a
    /// server it no longer replicates to.
    fn leader_is_live(&self, state: &RaftState) -> bool {
        let min = Duration::from_millis(self.config.election_timeout_min_ms);
        state.is_leader() || state.heard_from_leader.map_or(false, |t| t.elapsed() < min)
    }

    fn handle_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        if self.token.is_cancelled() {
            return Err(ConsensusError::Detached(self.id));
        }
        let mut state = self.state.lock();
        if req.term < state.term || (req.term > state.term && self.leader_is_live(&state)) {
            return Ok(VoteResponse {
                term: state.term,
                vote_granted: false,
            });
        }
        if req.term > state.term {
            self.become_follower(&mut state, req.term, None)?;
        }

        let up_to_date = (req.last_log_term, req.last_log_index)
            >= (state.log.last_term(), state.log.last_index());
        let grant = up_to_date && state.vote.map_or(true, |v| v == req.candidate_id);
        if grant {
            state.vote = Some(req.candidate_id);
            state.log.save_election(state.term, state.vote)?;
            self.reset_election_deadline(&mut state);
        }
        tracing::debug!(id = %self.id, candidate = %req.candidate_id, term = state.term, grant, "vote");
        Ok(VoteResponse {
            term: state.term,
            vote_granted: grant,
        })
    }

    fn handle_append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        if self.token.is_cancelled() {
            return Err(ConsensusError::Detached(self.id));
        }
        let mut state = self.state.lock();
        if req.term < state.term {
            return Ok(AppendEntriesResponse {
                term: state.term,
                success: false,
                match_index: state.log.last_index(),
            });
        }
        let following = matches!(state.role, Role::Follower { leader: Some(l) } if l == req.leader_id);
        if req.term > state.term || !following {
            self.become_follower(&mut state, req.term, Some(req.leader_id))?;
        }
        state.heard_from_leader = Some(Instant::now());
        self.reset_election_deadline(&mut state);

        let failed = |state: &RaftState, hint: u64| AppendEntriesResponse {
            term: state.term,
            success: false,
            match_index: hint,
        };
        match state.log.term_at(req.prev_log_index)? {
            Some(term) if term == req.prev_log_term => {}
            Some(_) => {
                let hint = state.commit.min(req.prev_log_index.saturating_sub(1));
                return Ok(failed(&*state, hint));
            }
            None => {
                let hint = state.log.last_index();
                return Ok(failed(&*state, hint));
            }
        }

        let last_new = req.prev_log_index + req.entries.len() as u64;
        let mut index = req.prev_log_index;
        for entry in req.entries {
            index += 1;
            match state.log.term_at(index)? {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if index <= state.commit {
                        return Err(anyhow::anyhow!(
                            "leader {} conflicts with committed entry {}",
                            req.leader_id,
                            index
                        )
                        .into());
                    }
                    tracing::debug!(id = %self.id, index, "truncating divergent entries");
                    state.log.truncate_from(index)?;
                    if state.config_index >= index {
                        let (config_index, servers) = state.log.latest_config()?.unwrap_or_default();
                        state.set_config(config_index, servers, self.id);
                    }
                }
                None => {}
            }
            if let EntryPayload::Config(servers) = &entry.payload {
                state.set_config(index, servers.clone(), self.id);
            }
            state.log.append(entry)?;
        }

        if req.leader_commit > state.commit {
            state.commit = state.commit.max(req.leader_commit.min(last_new));
            self.apply_committed(&mut state)?;
        }
        Ok(AppendEntriesResponse {
            term: state.term,
            success: true,
            match_index: last_new,
        })
    }
}

#[async_trait]
impl Consensus for Raft {
    #[tracing::instrument(skip(self, command), fields(id = %self.inner.id))]
    async fn apply(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        self.propose(EntryPayload::Command(command)).await
    }

    fn is_leader(&self) -> bool {
        self.inner.state.lock().is_leader()
    }

    fn leader_id(&self) -> Option<BrokerId> {
        self.inner.leader_id()
    }

    fn leader_address(&self) -> Option<SocketAddr> {
        let leader = self.inner.leader_id()?;
        if leader == self.inner.id {
            return Some(self.inner.addr);
        }
        self.inner.state.lock().servers.get(&leader).map(|s| s.addr)
    }

    fn leader_changes(&self) -> watch::Receiver<Option<BrokerId>> {
        self.inner.leader_tx.subscribe()
    }

    #[tracing::instrument(skip(self), fields(id = %self.inner.id))]
    async fn add_voter(&self, id: BrokerId, addr: SocketAddr) -> Result<()> {
        self.change_config(|servers| match servers.get(&id) {
            Some(s) if s.voter && s.addr == addr => false,
            _ => {
                tracing::info!(%id, %addr, "adding voter");
                servers.insert(id, QuorumServer { id, addr, voter: true });
                true
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(id = %self.inner.id))]
    async fn add_learner(&self, id: BrokerId, addr: SocketAddr) -> Result<()> {
        self.change_config(|servers| match servers.get_mut(&id) {
            Some(s) if s.addr == addr => false,
            Some(s) => {
                s.addr = addr;
                true
            }
            None => {
                tracing::info!(%id, %addr, "adding learner");
                servers.insert(id, QuorumServer { id, addr, voter: false });
                true
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(id = %self.inner.id))]
    async fn remove_server(&self, id: BrokerId) -> Result<()> {
        self.change_config(|servers| {
            let removed = servers.remove(&id).is_some();
            if removed {
                tracing::info!(%id, "removing server");
            }
            removed
        })
        .await
    }

    fn voters(&self) -> Vec<BrokerId> {
        self.inner.state.lock().voters()
    }

    #[tracing::instrument(skip(self), fields(id = %self.inner.id))]
    async fn shutdown(&self) -> Result<()> {
        let task = self.inner.task.lock().take();
        let task = match task {
            Some(task) => task,
            None => return Err(ConsensusError::Detached(self.inner.id)),
        };
        self.inner.token.cancel();
        if let Err(e) = task.await {
            tracing::warn!("consensus task failed: {}", e);
        }
        self.inner.state.lock().pending.clear();
        Ok(())
    }

    fn handle_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        self.inner.handle_vote(req)
    }

    fn handle_append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.inner.handle_append_entries(req)
    }
}
