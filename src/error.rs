use thiserror::Error;

#[derive(Error, Debug)]
pub enum BallotError {
    #[error("Not the leader, current leader is {0:?}")]
    NotLeader(Option<String>),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown member: {0}")]
    UnknownMember(String),

    #[error("Member unreachable: {0}")]
    Unreachable(String),

    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Log error: {0}")]
    Log(String),

    #[error("{0} is already open")]
    AlreadyOpen(&'static str),

    #[error("{0} is not open")]
    NotOpen(&'static str),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("Routes have been destroyed")]
    RoutesClosed,

    #[error("Consensus engine has shut down")]
    Shutdown,

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("Decode error: {0}")]
    DecodeError(#[from] prost::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BallotError {
    /// Whether this error reports misuse of an open/close lifecycle rather
    /// than a protocol or transport failure.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            BallotError::AlreadyOpen(_)
                | BallotError::NotOpen(_)
                | BallotError::Closed(_)
                | BallotError::RoutesClosed
        )
    }
}

impl From<BallotError> for tonic::Status {
    fn from(err: BallotError) -> Self {
        let message = err.to_string();
        match err {
            BallotError::GrpcError(status) => status,
            BallotError::InvalidMessage(_) | BallotError::Codec(_) | BallotError::DecodeError(_) => {
                tonic::Status::invalid_argument(message)
            }
            BallotError::NotLeader(_) => tonic::Status::failed_precondition(message),
            BallotError::RoutesClosed | BallotError::Shutdown | BallotError::Closed(_) => {
                tonic::Status::unavailable(message)
            }
            BallotError::Timeout(_) => tonic::Status::deadline_exceeded(message),
            _ => tonic::Status::internal(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, BallotError>;
