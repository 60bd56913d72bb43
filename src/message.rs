//! Consensus RPC messages.
//!
//! Every message is a plain value built through a validating constructor, so
//! an invalid message can neither be sent nor decoded. Requests and responses
//! are grouped into `Request`/`Response` for the transport and unified in
//! `RpcMessage` for the codec.

use std::fmt;

use crate::error::{BallotError, Result};
use crate::member::MemberId;
use crate::raft::log::LogEntry;

/// Stable wire identifier of each message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    AppendRequest,
    AppendResponse,
    VoteRequest,
    VoteResponse,
    HeartbeatRequest,
    HeartbeatResponse,
}

impl MessageType {
    pub const ALL: [MessageType; 6] = [
        MessageType::AppendRequest,
        MessageType::AppendResponse,
        MessageType::VoteRequest,
        MessageType::VoteResponse,
        MessageType::HeartbeatRequest,
        MessageType::HeartbeatResponse,
    ];

    pub fn id(self) -> u32 {
        match self {
            MessageType::AppendRequest => 256,
            MessageType::AppendResponse => 257,
            MessageType::VoteRequest => 258,
            MessageType::VoteResponse => 259,
            MessageType::HeartbeatRequest => 260,
            MessageType::HeartbeatResponse => 261,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.id() == id)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::AppendRequest => "AppendRequest",
            MessageType::AppendResponse => "AppendResponse",
            MessageType::VoteRequest => "VoteRequest",
            MessageType::VoteResponse => "VoteResponse",
            MessageType::HeartbeatRequest => "HeartbeatRequest",
            MessageType::HeartbeatResponse => "HeartbeatResponse",
        };
        write!(f, "{}({})", name, self.id())
    }
}

fn require_uri(field: &str, uri: &str) -> Result<()> {
    if uri.trim().is_empty() {
        return Err(BallotError::InvalidMessage(format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// Liveness ping from a member that claims leadership for `term`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRequest {
    member: MemberId,
    term: u64,
}

impl HeartbeatRequest {
    /// # Errors
    ///
    /// Returns `InvalidMessage` if `member` is 0.
    pub fn new(member: u32, term: u64) -> Result<Self> {
        Ok(Self {
            member: MemberId::new(member)?,
            term,
        })
    }

    pub fn member(&self) -> MemberId {
        self.member
    }

    pub fn term(&self) -> u64 {
        self.term
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatResponse {
    term: u64,
    leader: Option<String>,
    recognized: bool,
}

impl HeartbeatResponse {
    pub fn new(term: u64, leader: Option<String>, recognized: bool) -> Self {
        Self {
            term,
            leader,
            recognized,
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Leader the responder recognizes for its term.
    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    /// Whether the responder accepted the sender as leader.
    pub fn recognized(&self) -> bool {
        self.recognized
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    term: u64,
    candidate: String,
    last_log_index: u64,
    last_log_term: u64,
}

impl VoteRequest {
    /// # Errors
    ///
    /// Returns `InvalidMessage` if the candidate uri is empty, if the last
    /// log term is ahead of the request term, or if an empty log claims a
    /// non-zero term.
    pub fn new(
        term: u64,
        candidate: impl Into<String>,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Result<Self> {
        let candidate = candidate.into();
        require_uri("candidate", &candidate)?;
        if last_log_term > term {
            return Err(BallotError::InvalidMessage(format!(
                "last log term {} is ahead of term {}",
                last_log_term, term
            )));
        }
        if last_log_index == 0 && last_log_term != 0 {
            return Err(BallotError::InvalidMessage(
                "empty log cannot have a last term".to_string(),
            ));
        }
        Ok(Self {
            term,
            candidate,
            last_log_index,
            last_log_term,
        })
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    pub fn last_log_index(&self) -> u64 {
        self.last_log_index
    }

    pub fn last_log_term(&self) -> u64 {
        self.last_log_term
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteResponse {
    term: u64,
    voted: bool,
}

impl VoteResponse {
    pub fn new(term: u64, voted: bool) -> Self {
        Self { term, voted }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn voted(&self) -> bool {
        self.voted
    }
}

/// Log replication request. An empty entry list is a plain heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    term: u64,
    leader: String,
    prev_log_index: u64,
    prev_log_term: u64,
    entries: Vec<LogEntry>,
    leader_commit: u64,
}

impl AppendRequest {
    /// # Errors
    ///
    /// Returns `InvalidMessage` if:
    /// - the leader uri is empty
    /// - the previous entry term is ahead of the request term, or index 0
    ///   claims a non-zero term
    /// - entries do not continue at `prev_log_index + 1` without gaps
    /// - an entry term falls outside `prev_log_term..=term` or decreases
    pub fn new(
        term: u64,
        leader: impl Into<String>,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> Result<Self> {
        let leader = leader.into();
        require_uri("leader", &leader)?;
        if prev_log_term > term {
            return Err(BallotError::InvalidMessage(format!(
                "previous log term {} is ahead of term {}",
                prev_log_term, term
            )));
        }
        if prev_log_index == 0 && prev_log_term != 0 {
            return Err(BallotError::InvalidMessage(
                "index 0 cannot have a term".to_string(),
            ));
        }

        if prev_log_index.checked_add(entries.len() as u64 + 1).is_none() {
            return Err(BallotError::InvalidMessage(format!(
                "{} entries after index {} overflow the log",
                entries.len(),
                prev_log_index
            )));
        }

        let mut expected_index = prev_log_index + 1;
        let mut min_term = prev_log_term;
        for entry in &entries {
            if entry.index != expected_index {
                return Err(BallotError::InvalidMessage(format!(
                    "entry index {} does not follow {}",
                    entry.index,
                    expected_index - 1
                )));
            }
            if entry.term < min_term || entry.term > term {
                return Err(BallotError::InvalidMessage(format!(
                    "entry {} has term {} outside {}..={}",
                    entry.index, entry.term, min_term, term
                )));
            }
            expected_index += 1;
            min_term = entry.term;
        }

        Ok(Self {
            term,
            leader,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        })
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn leader(&self) -> &str {
        &self.leader
    }

    pub fn prev_log_index(&self) -> u64 {
        self.prev_log_index
    }

    pub fn prev_log_term(&self) -> u64 {
        self.prev_log_term
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }

    pub fn leader_commit(&self) -> u64 {
        self.leader_commit
    }

    /// Index of the last entry this request covers.
    pub fn last_index(&self) -> u64 {
        self.prev_log_index + self.entries.len() as u64
    }

    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResponse {
    term: u64,
    succeeded: bool,
    log_index: u64,
}

impl AppendResponse {
    pub fn new(term: u64, succeeded: bool, log_index: u64) -> Self {
        Self {
            term,
            succeeded,
            log_index,
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    /// Matched index on success; on rejection, the last index that may still
    /// match the leader's log.
    pub fn log_index(&self) -> u64 {
        self.log_index
    }
}

/// Inbound request dispatched to a consensus engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Heartbeat(HeartbeatRequest),
    Vote(VoteRequest),
    Append(AppendRequest),
}

impl Request {
    pub fn term(&self) -> u64 {
        match self {
            Request::Heartbeat(r) => r.term(),
            Request::Vote(r) => r.term(),
            Request::Append(r) => r.term(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Heartbeat(_) => MessageType::HeartbeatRequest,
            Request::Vote(_) => MessageType::VoteRequest,
            Request::Append(_) => MessageType::AppendRequest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Heartbeat(HeartbeatResponse),
    Vote(VoteResponse),
    Append(AppendResponse),
}

impl Response {
    pub fn term(&self) -> u64 {
        match self {
            Response::Heartbeat(r) => r.term(),
            Response::Vote(r) => r.term(),
            Response::Append(r) => r.term(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Response::Heartbeat(_) => MessageType::HeartbeatResponse,
            Response::Vote(_) => MessageType::VoteResponse,
            Response::Append(_) => MessageType::AppendResponse,
        }
    }
}

macro_rules! response_variant {
    ($variant:ident, $ty:ty) => {
        impl TryFrom<Response> for $ty {
            type Error = BallotError;

            fn try_from(response: Response) -> Result<Self> {
                match response {
                    Response::$variant(r) => Ok(r),
                    other => Err(BallotError::InvalidMessage(format!(
                        "expected {}, got {}",
                        stringify!($ty),
                        other.message_type()
                    ))),
                }
            }
        }
    };
}

response_variant!(Heartbeat, HeartbeatResponse);
response_variant!(Vote, VoteResponse);
response_variant!(Append, AppendResponse);

/// Any consensus message, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMessage {
    HeartbeatRequest(HeartbeatRequest),
    HeartbeatResponse(HeartbeatResponse),
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendRequest(AppendRequest),
    AppendResponse(AppendResponse),
}

impl RpcMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            RpcMessage::HeartbeatRequest(_) => MessageType::HeartbeatRequest,
            RpcMessage::HeartbeatResponse(_) => MessageType::HeartbeatResponse,
            RpcMessage::VoteRequest(_) => MessageType::VoteRequest,
            RpcMessage::VoteResponse(_) => MessageType::VoteResponse,
            RpcMessage::AppendRequest(_) => MessageType::AppendRequest,
            RpcMessage::AppendResponse(_) => MessageType::AppendResponse,
        }
    }

    pub fn term(&self) -> u64 {
        match self {
            RpcMessage::HeartbeatRequest(m) => m.term(),
            RpcMessage::HeartbeatResponse(m) => m.term(),
            RpcMessage::VoteRequest(m) => m.term(),
            RpcMessage::VoteResponse(m) => m.term(),
            RpcMessage::AppendRequest(m) => m.term(),
            RpcMessage::AppendResponse(m) => m.term(),
        }
    }
}

impl From<Request> for RpcMessage {
    fn from(request: Request) -> Self {
        match request {
            Request::Heartbeat(r) => RpcMessage::HeartbeatRequest(r),
            Request::Vote(r) => RpcMessage::VoteRequest(r),
            Request::Append(r) => RpcMessage::AppendRequest(r),
        }
    }
}

impl From<Response> for RpcMessage {
    fn from(response: Response) -> Self {
        match response {
            Response::Heartbeat(r) => RpcMessage::HeartbeatResponse(r),
            Response::Vote(r) => RpcMessage::VoteResponse(r),
            Response::Append(r) => RpcMessage::AppendResponse(r),
        }
    }
}

impl TryFrom<RpcMessage> for Request {
    type Error = BallotError;

    fn try_from(message: RpcMessage) -> Result<Self> {
        match message {
            RpcMessage::HeartbeatRequest(r) => Ok(Request::Heartbeat(r)),
            RpcMessage::VoteRequest(r) => Ok(Request::Vote(r)),
            RpcMessage::AppendRequest(r) => Ok(Request::Append(r)),
            other => Err(BallotError::InvalidMessage(format!(
                "expected a request, got {}",
                other.message_type()
            ))),
        }
    }
}

impl TryFrom<RpcMessage> for Response {
    type Error = BallotError;

    fn try_from(message: RpcMessage) -> Result<Self> {
        match message {
            RpcMessage::HeartbeatResponse(r) => Ok(Response::Heartbeat(r)),
            RpcMessage::VoteResponse(r) => Ok(Response::Vote(r)),
            RpcMessage::AppendResponse(r) => Ok(Response::Append(r)),
            other => Err(BallotError::InvalidMessage(format!(
                "expected a response, got {}",
                other.message_type()
            ))),
        }
    }
}
