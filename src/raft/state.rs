use std::collections::{HashMap, HashSet};

use tokio::time::Instant;

use crate::member::MemberId;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Acknowledgements (self included) needed out of `members`: strictly more
/// than half.
pub fn quorum(members: usize) -> usize {
    members / 2 + 1
}

/// Whether a candidate whose log ends at (`last_log_index`, `last_log_term`)
/// is at least as up-to-date as a log ending at (`our_index`, `our_term`).
pub fn is_log_up_to_date(
    our_index: u64,
    our_term: u64,
    last_log_index: u64,
    last_log_term: u64,
) -> bool {
    // Higher last term wins; on equal terms the longer log wins
    last_log_term > our_term || (last_log_term == our_term && last_log_index >= our_index)
}

/// Consensus state of one member. The log itself lives behind the `Log` trait.
///
/// # Raft Safety Invariants
///
/// ## Election Safety
/// At most one leader can be elected in a given term. Enforced by:
/// - Each node votes for at most one candidate per term (`voted_for`, checked
///   by `record_vote`)
/// - `voted_for` is cleared only when the term advances
/// - A candidate needs votes from a majority of the current membership
///
/// ## Leader Append-Only
/// A leader only appends; truncation happens on followers during conflict
/// resolution and never below `commit_index`.
///
/// ## Log Matching
/// Enforced by the AppendRequest consistency check on
/// (`prev_log_index`, `prev_log_term`) and truncation of conflicting suffixes.
///
/// ## Leader Completeness
/// - Votes require an up-to-date candidate log (`is_log_up_to_date`)
/// - Leaders only count replicas for entries from their own term
///
/// ## State Machine Safety
/// Entries are applied only once committed (`last_applied <= commit_index`)
/// and `commit_index` never decreases.
#[derive(Debug)]
pub struct RaftState {
    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<String>,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,
    pub role: RaftRole,
    pub leader: Option<String>,

    // Last heartbeat received from each member
    pub last_contact: HashMap<MemberId, Instant>,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<String, u64>,
    pub match_index: HashMap<String, u64>,

    // Votes received in current election (for candidates)
    pub votes: HashSet<String>,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            commit_index: 0,
            last_applied: 0,
            role: RaftRole::Follower,
            leader: None,
            last_contact: HashMap::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: HashSet::new(),
        }
    }

    /// Transition to follower state in `term`.
    ///
    /// A higher term clears the vote and the known leader. Staying in the
    /// same term keeps the vote so no second vote can be cast in it.
    pub fn become_follower(&mut self, term: u64) {
        assert!(
            term >= self.current_term,
            "term regression from {} to {}",
            self.current_term,
            term
        );
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader = None;
        }
        self.role = RaftRole::Follower;
        self.votes.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self, my_uri: &str) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_uri.to_string());
        self.leader = None;
        self.votes.clear();
        self.votes.insert(my_uri.to_string()); // Vote for self
    }

    /// Transition to leader state
    pub fn become_leader<'a>(
        &mut self,
        my_uri: &str,
        peers: impl IntoIterator<Item = &'a str>,
        last_log_index: u64,
    ) {
        self.role = RaftRole::Leader;
        self.leader = Some(my_uri.to_string());
        self.votes.clear();

        // Initialize next_index and match_index for all peers
        self.next_index.clear();
        self.match_index.clear();
        for peer in peers {
            self.next_index.insert(peer.to_string(), last_log_index + 1);
            self.match_index.insert(peer.to_string(), 0);
        }
    }

    /// Whether a vote for `candidate` is still possible in the current term
    pub fn can_vote_for(&self, candidate: &str) -> bool {
        self.voted_for.as_deref().map_or(true, |v| v == candidate)
    }

    /// Record a vote in the current term.
    ///
    /// # Panics
    ///
    /// Panics if a different candidate already holds this term's vote.
    pub fn record_vote(&mut self, candidate: &str) {
        assert!(
            self.can_vote_for(candidate),
            "second vote in term {}: voted for {:?}, asked for {}",
            self.current_term,
            self.voted_for,
            candidate
        );
        self.voted_for = Some(candidate.to_string());
    }

    /// Move the commit index forward. Returns true if it changed; lower
    /// values are ignored so the commit index never decreases.
    pub fn advance_commit(&mut self, index: u64) -> bool {
        if index > self.commit_index {
            self.commit_index = index;
            true
        } else {
            false
        }
    }

    pub fn status(&self, last_log_index: u64, last_log_term: u64) -> RaftStatus {
        RaftStatus {
            term: self.current_term,
            role: self.role,
            leader: self.leader.clone(),
            voted_for: self.voted_for.clone(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index,
            last_log_term,
        }
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a node's consensus state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftStatus {
    pub term: u64,
    pub role: RaftRole,
    pub leader: Option<String>,
    pub voted_for: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

impl RaftStatus {
    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }
}

impl Default for RaftStatus {
    fn default() -> Self {
        RaftState::new().status(0, 0)
    }
}
