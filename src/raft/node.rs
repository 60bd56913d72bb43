use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::error::{BallotError, Result};
use crate::member::{Member, MemberId, Membership};
use crate::message::{
    AppendRequest, AppendResponse, HeartbeatRequest, HeartbeatResponse, Request, Response,
    VoteRequest, VoteResponse,
};
use crate::raft::log::{Command, Log, LogEntry, StateMachine};
use crate::raft::rpc::{handle_append, handle_heartbeat, handle_vote};
use crate::raft::state::{RaftRole, RaftState, RaftStatus};
use crate::raft::timer::ElectionTimer;
use crate::transport::Transport;

/// Message types for the Raft node event loop
#[derive(Debug)]
pub enum RaftMessage {
    /// Inbound RPC from another member
    Request {
        request: Request,
        response_tx: oneshot::Sender<Result<Response>>,
    },
    /// Outcome of a VoteRequest sent in `term`
    VoteReply {
        term: u64,
        from: String,
        result: Result<VoteResponse>,
    },
    /// Outcome of an AppendRequest sent in `term` starting after `prev_log_index`
    AppendReply {
        term: u64,
        from: String,
        prev_log_index: u64,
        result: Result<AppendResponse>,
    },
    /// Outcome of a leadership confirmation heartbeat sent in `term`
    HeartbeatReply {
        term: u64,
        from: String,
        result: Result<HeartbeatResponse>,
    },
    /// Request to append a command to the log (leader only)
    Propose {
        command: Vec<u8>,
        response_tx: oneshot::Sender<Result<u64>>,
    },
    /// Check that a majority still recognizes this leader
    ConfirmLeadership {
        response_tx: oneshot::Sender<Result<bool>>,
    },
    LastContact {
        member: MemberId,
        response_tx: oneshot::Sender<Option<Duration>>,
    },
}

struct PendingConfirmation {
    term: u64,
    acks: HashSet<String>,
    responded: HashSet<String>,
    deadline: Instant,
    response_tx: oneshot::Sender<Result<bool>>,
}

/// The Raft consensus engine.
///
/// A single task owns the state, the log and the state machine; everything
/// else talks to it through its mailbox (`ConsensusHandle`) or reads the
/// published `RaftStatus`. Outbound RPCs run on spawned tasks that post their
/// outcome back to the mailbox, so the loop never waits on the network.
pub struct RaftNode {
    uri: String,
    member_id: MemberId,
    config: ClusterConfig,
    state: RaftState,
    log: Box<dyn Log>,
    state_machine: Box<dyn StateMachine>,
    transport: Arc<dyn Transport>,
    membership: watch::Receiver<Arc<Membership>>,
    status_tx: watch::Sender<RaftStatus>,
    message_tx: mpsc::Sender<RaftMessage>,
    timer: ElectionTimer,
    confirmations: Vec<PendingConfirmation>,
}

impl RaftNode {
    pub fn new(
        config: ClusterConfig,
        log: Box<dyn Log>,
        state_machine: Box<dyn StateMachine>,
        transport: Arc<dyn Transport>,
        membership: watch::Receiver<Arc<Membership>>,
    ) -> Result<(Self, mpsc::Receiver<RaftMessage>)> {
        let member_id = MemberId::new(config.member_id)?;
        let (message_tx, message_rx) = mpsc::channel(config.mailbox_capacity);

        let state = RaftState::new();
        let (status_tx, _) = watch::channel(state.status(log.last_index(), log.last_term()));

        let node = Self {
            uri: config.uri.clone(),
            member_id,
            timer: ElectionTimer::new(config.election_timeout_min_ms, config.election_timeout_max_ms),
            config,
            state,
            log,
            state_machine,
            transport,
            membership,
            status_tx,
            message_tx,
            confirmations: Vec::new(),
        };

        Ok((node, message_rx))
    }

    /// Handle for queries and requests to this node
    pub fn handle(&self) -> ConsensusHandle {
        ConsensusHandle {
            uri: self.uri.clone(),
            message_tx: self.message_tx.clone(),
            status: self.status_tx.subscribe(),
        }
    }

    /// Run the Raft node main loop until `shutdown` is cancelled
    pub async fn run(mut self, mut message_rx: mpsc::Receiver<RaftMessage>, shutdown: CancellationToken) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(member = %self.uri, "Consensus engine started");

        let mut membership_open = true;
        loop {
            let role = self.state.role;

            tokio::select! {
                _ = shutdown.cancelled() => break,

                msg = message_rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg),
                    None => break,
                },

                // Election timeout (for followers and candidates)
                _ = tokio::time::sleep_until(self.timer.deadline()), if role != RaftRole::Leader => {
                    self.start_election();
                }

                // Heartbeat interval (for leaders)
                _ = heartbeat.tick(), if role == RaftRole::Leader => {
                    self.on_heartbeat_tick();
                }

                changed = self.membership.changed(), if membership_open => match changed {
                    Ok(()) => self.on_membership_change(),
                    Err(_) => membership_open = false,
                },
            }

            if role != RaftRole::Leader && self.state.role == RaftRole::Leader {
                heartbeat.reset();
            }
        }

        self.fail_confirmations(|| BallotError::Shutdown);
        tracing::info!(member = %self.uri, term = self.state.current_term, "Consensus engine stopped");
    }

    fn handle_message(&mut self, msg: RaftMessage) {
        match msg {
            RaftMessage::Request {
                request,
                response_tx,
            } => {
                let result = self.handle_request(request);
                self.publish_status();
                let _ = response_tx.send(result);
            }
            RaftMessage::VoteReply { term, from, result } => {
                self.on_vote_reply(term, from, result);
            }
            RaftMessage::AppendReply {
                term,
                from,
                prev_log_index,
                result,
            } => {
                self.on_append_reply(term, from, prev_log_index, result);
            }
            RaftMessage::HeartbeatReply { term, from, result } => {
                self.on_heartbeat_reply(term, from, result);
            }
            RaftMessage::Propose {
                command,
                response_tx,
            } => {
                let result = self.propose(command);
                self.publish_status();
                let _ = response_tx.send(result);
            }
            RaftMessage::ConfirmLeadership { response_tx } => {
                self.confirm_leadership(response_tx);
            }
            RaftMessage::LastContact {
                member,
                response_tx,
            } => {
                let elapsed = self.state.last_contact.get(&member).map(|t| t.elapsed());
                let _ = response_tx.send(elapsed);
            }
        }
        self.publish_status();
    }

    fn membership(&self) -> Arc<Membership> {
        self.membership.borrow().clone()
    }

    /// Forget per-member records of departed members
    fn on_membership_change(&mut self) {
        let membership = self.membership();
        self.state
            .last_contact
            .retain(|id, _| membership.by_id(*id).is_some());
        self.state
            .next_index
            .retain(|uri, _| membership.get(uri).is_some());
        self.state
            .match_index
            .retain(|uri, _| membership.get(uri).is_some());
        tracing::debug!(member = %self.uri, members = membership.len(), "Membership changed");

        // A smaller quorum may already hold uncommitted entries
        self.advance_commit();
        self.publish_status();
    }

    fn handle_request(&mut self, request: Request) -> Result<Response> {
        let previous_role = self.state.role;
        let (response, reset) = match request {
            Request::Heartbeat(req) => {
                let membership = self.membership();
                let handled = handle_heartbeat(&mut self.state, &membership, &req, Instant::now());
                (Response::Heartbeat(handled.response), handled.reset_election_timer)
            }
            Request::Vote(req) => {
                let handled = handle_vote(&mut self.state, self.log.as_ref(), &req);
                (Response::Vote(handled.response), handled.reset_election_timer)
            }
            Request::Append(req) => {
                let handled = handle_append(&mut self.state, self.log.as_mut(), &req).map_err(|e| {
                    tracing::error!(member = %self.uri, error = %e, "Failed to write log");
                    e
                })?;
                self.apply_committed();
                (Response::Append(handled.response), handled.reset_election_timer)
            }
        };

        // A demoted leader or candidate waits a full timeout before campaigning
        let demoted = previous_role != RaftRole::Follower && self.state.role == RaftRole::Follower;
        if reset || demoted {
            self.timer.reset();
        }
        Ok(response)
    }

    /// Start a new election
    fn start_election(&mut self) {
        self.state.become_candidate(&self.uri);
        self.timer.reset();

        self.publish_status();

        let term = self.state.current_term;
        let membership = self.membership();

        tracing::info!(member = %self.uri, term, "Starting election");

        if self.count_votes(&membership) >= membership.quorum() {
            self.become_leader();
            return;
        }

        let request = match VoteRequest::new(term, &self.uri, self.log.last_index(), self.log.last_term()) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(member = %self.uri, error = %e, "Failed to build VoteRequest");
                return;
            }
        };

        for peer in membership.remotes() {
            let from = peer.uri().to_string();
            self.spawn_rpc(peer.clone(), Request::Vote(request.clone()), move |result| {
                RaftMessage::VoteReply {
                    term,
                    from,
                    result: result.and_then(VoteResponse::try_from),
                }
            });
        }
    }

    fn count_votes(&self, membership: &Membership) -> usize {
        self.state
            .votes
            .iter()
            .filter(|uri| membership.contains(uri))
            .count()
    }

    fn on_vote_reply(&mut self, term: u64, from: String, result: Result<VoteResponse>) {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(peer = %from, term, error = %e, "Vote request lost");
                return;
            }
        };

        if response.term() > self.state.current_term {
            self.step_down(response.term());
            return;
        }
        if self.state.role != RaftRole::Candidate || term != self.state.current_term {
            return;
        }
        if !response.voted() {
            return;
        }

        self.state.votes.insert(from.clone());
        let membership = self.membership();
        let votes = self.count_votes(&membership);
        tracing::debug!(member = %self.uri, peer = %from, term, votes, "Received vote");

        if votes >= membership.quorum() {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        let membership = self.membership();
        let peers: Vec<&str> = membership.remotes().map(|m| m.uri()).collect();
        self.state.become_leader(&self.uri, peers, self.log.last_index());

        let term = self.state.current_term;
        tracing::info!(member = %self.uri, term, "Became leader");

        // Entries from earlier terms only commit behind one from this term
        let noop = LogEntry::new(term, self.log.last_index() + 1, Command::Noop);
        if let Err(e) = self.log.append(vec![noop]) {
            tracing::error!(member = %self.uri, error = %e, "Failed to append leader no-op");
        }

        self.publish_status();
        self.replicate_all();
        self.advance_commit();
    }

    /// Adopt a higher term observed in a response
    fn step_down(&mut self, term: u64) {
        tracing::info!(
            member = %self.uri,
            term,
            previous_term = self.state.current_term,
            "Observed higher term, stepping down"
        );
        self.state.become_follower(term);
        self.timer.reset();
        self.publish_status();
    }

    fn on_heartbeat_tick(&mut self) {
        self.replicate_all();
        self.expire_confirmations();
    }

    /// Send every follower the entries from its next index (possibly none)
    fn replicate_all(&mut self) {
        let membership = self.membership();
        for peer in membership.remotes() {
            self.replicate_to(peer);
        }
    }

    fn replicate_to(&mut self, peer: &Member) {
        if self.state.role != RaftRole::Leader {
            return;
        }
        let last_index = self.log.last_index();
        let uri = peer.uri().to_string();

        // Members that joined after the election start from the end of the log
        let next_index = *self
            .state
            .next_index
            .entry(uri.clone())
            .or_insert(last_index + 1);
        self.state.match_index.entry(uri.clone()).or_insert(0);

        let prev_log_index = next_index.saturating_sub(1);
        let prev_log_term = match self.log.term_at(prev_log_index) {
            Some(term) => term,
            None => {
                self.state.next_index.insert(uri, last_index + 1);
                return;
            }
        };

        let entries = self.log.entries(next_index, self.config.max_entries_per_append);
        let term = self.state.current_term;
        let request = match AppendRequest::new(
            term,
            &self.uri,
            prev_log_index,
            prev_log_term,
            entries,
            self.state.commit_index,
        ) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(member = %self.uri, peer = %uri, error = %e, "Failed to build AppendRequest");
                return;
            }
        };

        tracing::trace!(
            peer = %uri,
            term,
            prev_log_index,
            entries = request.entries().len(),
            "Sending AppendRequest"
        );

        self.spawn_rpc(peer.clone(), Request::Append(request), move |result| {
            RaftMessage::AppendReply {
                term,
                from: uri,
                prev_log_index,
                result: result.and_then(AppendResponse::try_from),
            }
        });
    }

    fn on_append_reply(
        &mut self,
        term: u64,
        from: String,
        prev_log_index: u64,
        result: Result<AppendResponse>,
    ) {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::trace!(peer = %from, error = %e, "AppendRequest lost");
                return;
            }
        };

        if response.term() > self.state.current_term {
            self.step_down(response.term());
            return;
        }
        // Replies to an earlier term or a former leadership are stale
        if self.state.role != RaftRole::Leader || term != self.state.current_term {
            return;
        }
        let membership = self.membership();
        let Some(peer) = membership.get(&from) else {
            return;
        };

        // A peer cannot hold more than this log; clamp what it reports
        let reported = response.log_index().min(self.log.last_index());

        if response.succeeded() {
            let matched = {
                let entry = self.state.match_index.entry(from.clone()).or_insert(0);
                *entry = (*entry).max(reported);
                *entry
            };
            self.state.next_index.insert(from, matched + 1);
            self.advance_commit();

            if matched == reported && matched < self.log.last_index() {
                self.replicate_to(peer);
            }
        } else {
            let next_index = self
                .state
                .next_index
                .get(&from)
                .copied()
                .unwrap_or(self.log.last_index() + 1);
            // Only the reply to the current cursor moves it
            if prev_log_index.checked_add(1) != Some(next_index) {
                return;
            }
            let retry = next_index.saturating_sub(1).min(reported + 1).max(1);
            tracing::debug!(peer = %from, next_index = retry, "AppendRequest rejected, backing off");
            self.state.next_index.insert(from, retry);
            self.replicate_to(peer);
        }
    }

    /// Commit the highest current-term index stored on a majority
    fn advance_commit(&mut self) {
        if self.state.role != RaftRole::Leader {
            return;
        }
        let membership = self.membership();
        let mut matched: Vec<u64> = membership
            .remotes()
            .map(|m| self.state.match_index.get(m.uri()).copied().unwrap_or(0))
            .collect();
        matched.push(self.log.last_index()); // Include self
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matched[membership.quorum() - 1];
        if candidate > self.state.commit_index
            && self.log.term_at(candidate) == Some(self.state.current_term)
        {
            self.state.advance_commit(candidate);
            tracing::debug!(member = %self.uri, commit_index = candidate, "Updated commit index");
            self.apply_committed();
        }
    }

    /// Feed committed but unapplied entries to the state machine
    fn apply_committed(&mut self) {
        while self.state.last_applied < self.state.commit_index {
            let index = self.state.last_applied + 1;
            match self.log.entry(index) {
                Some(entry) => {
                    self.state_machine.apply(&entry);
                    self.state.last_applied = index;
                }
                None => {
                    tracing::error!(member = %self.uri, index, "Committed entry missing from log");
                    return;
                }
            }
        }
    }

    fn propose(&mut self, command: Vec<u8>) -> Result<u64> {
        if self.state.role != RaftRole::Leader {
            return Err(BallotError::NotLeader(self.state.leader.clone()));
        }

        let index = self.log.last_index() + 1;
        let entry = LogEntry::new(self.state.current_term, index, Command::Apply(command));
        self.log.append(vec![entry])?;
        tracing::debug!(member = %self.uri, index, term = self.state.current_term, "Appended command to log");

        self.replicate_all();
        self.advance_commit();
        Ok(index)
    }

    fn confirm_leadership(&mut self, response_tx: oneshot::Sender<Result<bool>>) {
        if self.state.role != RaftRole::Leader {
            let _ = response_tx.send(Err(BallotError::NotLeader(self.state.leader.clone())));
            return;
        }

        let membership = self.membership();
        let term = self.state.current_term;
        let mut acks = HashSet::new();
        acks.insert(self.uri.clone());

        if acks.len() >= membership.quorum() {
            let _ = response_tx.send(Ok(true));
            return;
        }

        let request = match HeartbeatRequest::new(self.member_id.get(), term) {
            Ok(request) => request,
            Err(e) => {
                let _ = response_tx.send(Err(e));
                return;
            }
        };

        self.confirmations.push(PendingConfirmation {
            term,
            acks,
            responded: HashSet::new(),
            deadline: Instant::now() + Duration::from_millis(self.config.election_timeout_max_ms),
            response_tx,
        });

        for peer in membership.remotes() {
            let from = peer.uri().to_string();
            self.spawn_rpc(peer.clone(), Request::Heartbeat(request.clone()), move |result| {
                RaftMessage::HeartbeatReply {
                    term,
                    from,
                    result: result.and_then(HeartbeatResponse::try_from),
                }
            });
        }
    }

    fn on_heartbeat_reply(&mut self, term: u64, from: String, result: Result<HeartbeatResponse>) {
        let recognized = match result {
            Ok(response) => {
                if response.term() > self.state.current_term {
                    self.step_down(response.term());
                    return;
                }
                response.recognized() && response.term() == term
            }
            Err(e) => {
                tracing::trace!(peer = %from, error = %e, "Heartbeat lost");
                false
            }
        };

        for pending in self.confirmations.iter_mut().filter(|p| p.term == term) {
            pending.responded.insert(from.clone());
            if recognized {
                pending.acks.insert(from.clone());
            }
        }
        self.resolve_confirmations();
    }

    fn resolve_confirmations(&mut self) {
        let membership = self.membership();
        let quorum = membership.quorum();
        let remotes = membership.remotes().count();

        let (done, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.confirmations)
                .into_iter()
                .partition(|p| {
                    let outstanding = remotes.saturating_sub(p.responded.len());
                    p.acks.len() >= quorum || p.acks.len() + outstanding < quorum
                });
        self.confirmations = pending;

        for confirmation in done {
            let confirmed = confirmation.acks.len() >= quorum;
            tracing::debug!(member = %self.uri, term = confirmation.term, confirmed, "Leadership confirmation");
            let _ = confirmation.response_tx.send(Ok(confirmed));
        }
    }

    fn expire_confirmations(&mut self) {
        let now = Instant::now();
        let (expired, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.confirmations)
            .into_iter()
            .partition(|p| p.deadline <= now);
        self.confirmations = pending;
        for confirmation in expired {
            let _ = confirmation.response_tx.send(Ok(false));
        }
    }

    fn fail_confirmations(&mut self, err: impl Fn() -> BallotError) {
        for confirmation in self.confirmations.drain(..) {
            let _ = confirmation.response_tx.send(Err(err()));
        }
    }

    /// Send a request on a spawned task and post the outcome to the mailbox
    fn spawn_rpc<F>(&self, peer: Member, request: Request, reply: F)
    where
        F: FnOnce(Result<Response>) -> RaftMessage + Send + 'static,
    {
        let transport = self.transport.clone();
        let message_tx = self.message_tx.clone();
        let rpc_timeout = self.config.rpc_timeout();

        tokio::spawn(async move {
            let result = match timeout(rpc_timeout, transport.send(&peer, request)).await {
                Ok(result) => result,
                Err(_) => Err(BallotError::Timeout(peer.uri().to_string())),
            };
            // The engine may have stopped in the meantime
            let _ = message_tx.send(reply(result)).await;
        });
    }

    /// Publish the current status and react to losing leadership
    fn publish_status(&mut self) {
        let status = self
            .state
            .status(self.log.last_index(), self.log.last_term());
        let previous_role = self.status_tx.borrow().role;

        if previous_role != status.role {
            tracing::info!(
                member = %self.uri,
                term = status.term,
                from = %previous_role,
                to = %status.role,
                "Role changed"
            );
            if previous_role == RaftRole::Leader {
                let leader = self.state.leader.clone();
                self.fail_confirmations(|| BallotError::NotLeader(leader.clone()));
            }
        }

        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }
}

/// Cloneable handle to a running `RaftNode`.
///
/// Status queries read the last published snapshot and never block. Requests
/// go through the engine's mailbox and fail with `Shutdown` once it stops.
#[derive(Clone)]
pub struct ConsensusHandle {
    uri: String,
    message_tx: mpsc::Sender<RaftMessage>,
    status: watch::Receiver<RaftStatus>,
}

impl ConsensusHandle {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn status(&self) -> RaftStatus {
        self.status.borrow().clone()
    }

    pub fn role(&self) -> RaftRole {
        self.status.borrow().role
    }

    pub fn term(&self) -> u64 {
        self.status.borrow().term
    }

    pub fn leader(&self) -> Option<String> {
        self.status.borrow().leader.clone()
    }

    pub fn commit_index(&self) -> u64 {
        self.status.borrow().commit_index
    }

    pub fn is_leader(&self) -> bool {
        self.status.borrow().is_leader()
    }

    /// Receiver notified whenever the published status changes
    pub fn subscribe(&self) -> watch::Receiver<RaftStatus> {
        self.status.clone()
    }

    /// Append a command to the replicated log. Returns its index.
    ///
    /// # Errors
    ///
    /// Returns `NotLeader` with the known leader if this member is not leading.
    pub async fn propose(&self, command: impl Into<Vec<u8>>) -> Result<u64> {
        let command = command.into();
        self.call(|response_tx| RaftMessage::Propose {
            command,
            response_tx,
        })
        .await?
    }

    /// Whether a majority of members still recognizes this leader for its term.
    pub async fn confirm_leadership(&self) -> Result<bool> {
        self.call(|response_tx| RaftMessage::ConfirmLeadership { response_tx })
            .await?
    }

    /// Time since the last heartbeat received from `member`
    pub async fn last_contact(&self, member: MemberId) -> Result<Option<Duration>> {
        self.call(|response_tx| RaftMessage::LastContact {
            member,
            response_tx,
        })
        .await
    }

    /// Process an inbound RPC
    pub async fn handle(&self, request: Request) -> Result<Response> {
        self.call(|response_tx| RaftMessage::Request {
            request,
            response_tx,
        })
        .await?
    }

    async fn call<T>(&self, message: impl FnOnce(oneshot::Sender<T>) -> RaftMessage) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.message_tx
            .send(message(response_tx))
            .await
            .map_err(|_| BallotError::Shutdown)?;
        response_rx.await.map_err(|_| BallotError::Shutdown)
    }
}
