use tokio::time::Instant;

use crate::error::Result;
use crate::member::Membership;
use crate::message::{
    AppendRequest, AppendResponse, HeartbeatRequest, HeartbeatResponse, VoteRequest, VoteResponse,
};
use crate::raft::log::Log;
use crate::raft::state::{is_log_up_to_date, RaftRole, RaftState};

/// Response to an inbound RPC plus whether the election timer must restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handled<R> {
    pub response: R,
    pub reset_election_timer: bool,
}

impl<R> Handled<R> {
    fn new(response: R, reset_election_timer: bool) -> Self {
        Self {
            response,
            reset_election_timer,
        }
    }
}

/// Handle HeartbeatRequest RPC
pub fn handle_heartbeat(
    state: &mut RaftState,
    membership: &Membership,
    req: &HeartbeatRequest,
    now: Instant,
) -> Handled<HeartbeatResponse> {
    if membership.by_id(req.member()).is_some() {
        state.last_contact.insert(req.member(), now);
    }

    if req.term() > state.current_term {
        state.become_follower(req.term());
    }

    let sender = membership
        .by_id(req.member())
        .filter(|m| !m.is_local())
        .map(|m| m.uri().to_string());

    let recognized = match &sender {
        Some(uri) if req.term() == state.current_term => {
            state.leader.as_deref().map_or(true, |leader| leader == uri)
        }
        _ => false,
    };

    if recognized {
        if state.role != RaftRole::Follower {
            state.become_follower(req.term());
        }
        state.leader = sender;
    }

    tracing::trace!(
        member = %req.member(),
        term = req.term(),
        recognized,
        "Heartbeat"
    );

    Handled::new(
        HeartbeatResponse::new(state.current_term, state.leader.clone(), recognized),
        recognized,
    )
}

/// Handle VoteRequest RPC
pub fn handle_vote(state: &mut RaftState, log: &dyn Log, req: &VoteRequest) -> Handled<VoteResponse> {
    // If request term is greater, update our term and become follower
    if req.term() > state.current_term {
        state.become_follower(req.term());
    } else if state.role == RaftRole::Candidate
        && req.term() == state.current_term
        && state.voted_for.as_deref() != Some(req.candidate())
    {
        // A rival campaigning in our term; the self-vote stays, so it is denied
        state.become_follower(req.term());
    }

    let voted = if req.term() < state.current_term {
        // Stale candidate
        false
    } else if !state.can_vote_for(req.candidate()) {
        // Already voted for someone else in this term
        false
    } else if !is_log_up_to_date(
        log.last_index(),
        log.last_term(),
        req.last_log_index(),
        req.last_log_term(),
    ) {
        // Candidate's log is behind ours
        false
    } else {
        state.record_vote(req.candidate());
        true
    };

    tracing::debug!(
        candidate = req.candidate(),
        term = req.term(),
        voted,
        "VoteRequest"
    );

    Handled::new(VoteResponse::new(state.current_term, voted), voted)
}

/// Handle AppendRequest RPC
///
/// Advances the commit index on success; the caller applies newly committed
/// entries.
///
/// # Panics
///
/// Panics if the request would truncate a committed entry.
pub fn handle_append(
    state: &mut RaftState,
    log: &mut dyn Log,
    req: &AppendRequest,
) -> Result<Handled<AppendResponse>> {
    if req.term() > state.current_term {
        state.become_follower(req.term());
    }

    if req.term() < state.current_term {
        return Ok(Handled::new(
            AppendResponse::new(state.current_term, false, log.last_index()),
            false,
        ));
    }

    // Valid request from the current leader
    if state.role != RaftRole::Follower {
        state.become_follower(req.term());
    }
    state.leader = Some(req.leader().to_string());

    match log.term_at(req.prev_log_index()) {
        None => {
            // Missing the previous entry: everything we have may still match
            let hint = log.last_index();
            tracing::debug!(
                prev_log_index = req.prev_log_index(),
                hint,
                "AppendRequest rejected, log too short"
            );
            return Ok(Handled::new(
                AppendResponse::new(state.current_term, false, hint),
                true,
            ));
        }
        Some(term) if term != req.prev_log_term() => {
            let hint = conflict_hint(log, req.prev_log_index(), term);
            tracing::debug!(
                prev_log_index = req.prev_log_index(),
                expected_term = req.prev_log_term(),
                found_term = term,
                hint,
                "AppendRequest rejected, term mismatch"
            );
            return Ok(Handled::new(
                AppendResponse::new(state.current_term, false, hint),
                true,
            ));
        }
        Some(_) => {}
    }

    // Skip entries we already hold, truncate from the first conflict
    let entries = req.entries();
    let first_new = entries
        .iter()
        .position(|e| log.term_at(e.index) != Some(e.term));

    if let Some(pos) = first_new {
        let start = entries[pos].index;
        if log.last_index() >= start {
            assert!(
                start > state.commit_index,
                "truncating committed entry {} (commit index {})",
                start,
                state.commit_index
            );
            log.truncate(start)?;
        }
        log.append(entries[pos..].to_vec())?;

        tracing::debug!(
            appended = entries.len() - pos,
            last_index = log.last_index(),
            "Appended entries"
        );
    }

    let matched = req.last_index();
    state.advance_commit(req.leader_commit().min(matched));

    Ok(Handled::new(
        AppendResponse::new(state.current_term, true, matched),
        true,
    ))
}

/// Last index before the run of `term` entries that ends at `index`.
fn conflict_hint(log: &dyn Log, index: u64, term: u64) -> u64 {
    let mut first = index;
    while first > 1 && log.term_at(first - 1) == Some(term) {
        first -= 1;
    }
    first - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::Member;
    use crate::raft::log::{Command, LogEntry, MemoryLog};

    fn log_with_terms(terms: &[u64]) -> MemoryLog {
        let mut log = MemoryLog::new();
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, &term)| LogEntry::new(term, i as u64 + 1, Command::Noop))
            .collect();
        log.append(entries).unwrap();
        log
    }

    fn entries(from: u64, terms: &[u64]) -> Vec<LogEntry> {
        terms
            .iter()
            .enumerate()
            .map(|(i, &term)| LogEntry::new(term, from + i as u64, Command::Noop))
            .collect()
    }

    fn membership() -> Membership {
        Membership::new(
            Member::local(1, "a:1").unwrap(),
            vec![
                Member::remote(2, "b:1").unwrap(),
                Member::remote(3, "c:1").unwrap(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_vote_granted_once_per_term() {
        let mut state = RaftState::new();
        let log = MemoryLog::new();

        let first = handle_vote(&mut state, &log, &VoteRequest::new(1, "b:1", 0, 0).unwrap());
        assert!(first.response.voted());
        assert!(first.reset_election_timer);

        // Repeated request from the same candidate is idempotent
        let again = handle_vote(&mut state, &log, &VoteRequest::new(1, "b:1", 0, 0).unwrap());
        assert!(again.response.voted());

        let rival = handle_vote(&mut state, &log, &VoteRequest::new(1, "c:1", 0, 0).unwrap());
        assert!(!rival.response.voted());
        assert!(!rival.reset_election_timer);
    }

    #[test]
    fn test_vote_rejected_for_stale_term() {
        let mut state = RaftState::new();
        state.become_follower(5);
        let log = MemoryLog::new();

        let result = handle_vote(&mut state, &log, &VoteRequest::new(4, "b:1", 0, 0).unwrap());
        assert!(!result.response.voted());
        assert_eq!(result.response.term(), 5);
    }

    #[test]
    fn test_vote_denied_for_older_last_log_term() {
        let mut state = RaftState::new();
        state.become_follower(3);
        let log = log_with_terms(&[1, 3]);

        // Higher request term, longer log, but older last term
        let req = VoteRequest::new(7, "b:1", 5, 2).unwrap();
        let result = handle_vote(&mut state, &log, &req);
        assert!(!result.response.voted());
        assert_eq!(state.current_term, 7);
        assert_eq!(result.response.term(), 7);
        assert_eq!(state.voted_for, None);
    }

    #[test]
    fn test_rival_vote_request_demotes_candidate_without_vote() {
        let mut state = RaftState::new();
        state.become_candidate("a:1");
        let log = MemoryLog::new();

        let result = handle_vote(&mut state, &log, &VoteRequest::new(1, "b:1", 0, 0).unwrap());
        assert!(!result.response.voted());
        assert_eq!(result.response.term(), 1);
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for.as_deref(), Some("a:1"));
    }

    #[test]
    fn test_leader_ignores_equal_term_vote_request() {
        let mut state = RaftState::new();
        state.become_candidate("a:1");
        state.become_leader("a:1", ["b:1", "c:1"], 0);
        let log = MemoryLog::new();

        let result = handle_vote(&mut state, &log, &VoteRequest::new(1, "b:1", 0, 0).unwrap());
        assert!(!result.response.voted());
        assert_eq!(state.role, RaftRole::Leader);
    }

    #[test]
    fn test_higher_term_vote_demotes_leader() {
        let mut state = RaftState::new();
        state.become_candidate("a:1");
        state.become_leader("a:1", ["b:1", "c:1"], 0);
        let log = MemoryLog::new();

        let result = handle_vote(&mut state, &log, &VoteRequest::new(2, "b:1", 0, 0).unwrap());
        assert!(result.response.voted());
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.leader, None);
    }

    #[test]
    fn test_heartbeat_recognizes_known_leader() {
        let mut state = RaftState::new();
        let members = membership();
        let now = Instant::now();

        let result = handle_heartbeat(&mut state, &members, &HeartbeatRequest::new(2, 1).unwrap(), now);
        assert!(result.response.recognized());
        assert!(result.reset_election_timer);
        assert_eq!(result.response.leader(), Some("b:1"));
        assert_eq!(state.current_term, 1);
        assert_eq!(state.last_contact.get(&members.get("b:1").unwrap().id()), Some(&now));

        // Another member claiming the same term is not recognized
        let rival = handle_heartbeat(&mut state, &members, &HeartbeatRequest::new(3, 1).unwrap(), now);
        assert!(!rival.response.recognized());
        assert_eq!(rival.response.leader(), Some("b:1"));
    }

    #[test]
    fn test_heartbeat_from_unknown_member_is_ignored() {
        let mut state = RaftState::new();
        let members = membership();

        let result = handle_heartbeat(
            &mut state,
            &members,
            &HeartbeatRequest::new(9, 2).unwrap(),
            Instant::now(),
        );
        assert!(!result.response.recognized());
        assert_eq!(state.current_term, 2);
        assert_eq!(state.leader, None);
        assert!(state.last_contact.is_empty());
    }

    #[test]
    fn test_heartbeat_demotes_candidate() {
        let mut state = RaftState::new();
        state.become_candidate("a:1");

        let result = handle_heartbeat(
            &mut state,
            &membership(),
            &HeartbeatRequest::new(2, 1).unwrap(),
            Instant::now(),
        );
        assert!(result.response.recognized());
        assert_eq!(state.role, RaftRole::Follower);
        // The vote cast in this term survives the step-down
        assert_eq!(state.voted_for.as_deref(), Some("a:1"));
    }

    #[test]
    fn test_stale_heartbeat_not_recognized() {
        let mut state = RaftState::new();
        state.become_follower(4);

        let result = handle_heartbeat(
            &mut state,
            &membership(),
            &HeartbeatRequest::new(2, 3).unwrap(),
            Instant::now(),
        );
        assert!(!result.response.recognized());
        assert_eq!(result.response.term(), 4);
    }

    #[test]
    fn test_append_rejects_stale_term() {
        let mut state = RaftState::new();
        state.become_follower(3);
        let mut log = MemoryLog::new();

        let req = AppendRequest::new(2, "b:1", 0, 0, entries(1, &[2]), 0).unwrap();
        let result = handle_append(&mut state, &mut log, &req).unwrap();
        assert!(!result.response.succeeded());
        assert!(!result.reset_election_timer);
        assert_eq!(result.response.term(), 3);
        assert!(log.is_empty());
    }

    #[test]
    fn test_append_rejects_missing_prev_entry() {
        let mut state = RaftState::new();
        let mut log = log_with_terms(&[1, 1]);

        let req = AppendRequest::new(2, "b:1", 5, 2, entries(6, &[2]), 0).unwrap();
        let result = handle_append(&mut state, &mut log, &req).unwrap();
        assert!(!result.response.succeeded());
        assert_eq!(result.response.log_index(), 2);
        assert_eq!(state.leader.as_deref(), Some("b:1"));
    }

    #[test]
    fn test_append_term_mismatch_returns_conflict_hint() {
        let mut state = RaftState::new();
        state.become_follower(3);
        // Indices 3..=5 hold a stale term 2 run
        let mut log = log_with_terms(&[1, 1, 2, 2, 2]);

        let req = AppendRequest::new(3, "b:1", 5, 3, entries(6, &[3]), 0).unwrap();
        let result = handle_append(&mut state, &mut log, &req).unwrap();
        assert!(!result.response.succeeded());
        assert_eq!(result.response.log_index(), 2);
        // Nothing is truncated on rejection
        assert_eq!(log.last_index(), 5);
    }

    #[test]
    fn test_append_truncates_conflicting_suffix() {
        let mut state = RaftState::new();
        let mut log = log_with_terms(&[1, 1, 2, 2]);

        let req = AppendRequest::new(3, "b:1", 2, 1, entries(3, &[3]), 0).unwrap();
        let result = handle_append(&mut state, &mut log, &req).unwrap();
        assert!(result.response.succeeded());
        assert_eq!(result.response.log_index(), 3);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(3), Some(3));
    }

    #[test]
    fn test_append_duplicate_keeps_longer_log() {
        let mut state = RaftState::new();
        let mut log = log_with_terms(&[1, 1, 1, 1]);

        // A delayed request covering a prefix must not drop later entries
        let req = AppendRequest::new(1, "b:1", 1, 1, entries(2, &[1]), 0).unwrap();
        let result = handle_append(&mut state, &mut log, &req).unwrap();
        assert!(result.response.succeeded());
        assert_eq!(result.response.log_index(), 2);
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn test_append_advances_commit_to_matched_index() {
        let mut state = RaftState::new();
        let mut log = MemoryLog::new();

        let req = AppendRequest::new(1, "b:1", 0, 0, entries(1, &[1, 1]), 5).unwrap();
        handle_append(&mut state, &mut log, &req).unwrap();
        assert_eq!(state.commit_index, 2);

        // A lower leader commit never moves the index back
        let req = AppendRequest::new(1, "b:1", 2, 1, Vec::new(), 1).unwrap();
        handle_append(&mut state, &mut log, &req).unwrap();
        assert_eq!(state.commit_index, 2);
    }

    #[test]
    fn test_append_demotes_candidate_of_same_term() {
        let mut state = RaftState::new();
        state.become_candidate("a:1");
        let mut log = MemoryLog::new();

        let req = AppendRequest::new(1, "b:1", 0, 0, Vec::new(), 0).unwrap();
        let result = handle_append(&mut state, &mut log, &req).unwrap();
        assert!(result.response.succeeded());
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.leader.as_deref(), Some("b:1"));
    }

    #[test]
    #[should_panic(expected = "truncating committed entry")]
    fn test_append_never_truncates_committed_entries() {
        let mut state = RaftState::new();
        state.become_follower(2);
        let mut log = log_with_terms(&[1, 1]);
        state.advance_commit(2);

        let req = AppendRequest::new(2, "b:1", 1, 1, entries(2, &[2]), 0).unwrap();
        let _ = handle_append(&mut state, &mut log, &req);
    }
}
