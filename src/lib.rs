pub mod cluster;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod member;
pub mod message;
pub mod raft;
pub mod router;
pub mod shutdown;
pub mod transport;

pub use cluster::Cluster;
pub use config::{ClusterConfig, MemberConfig};
pub use coordinator::{ClusterCoordinator, MemberInfo, MembershipEvent, StaticCoordinator};
pub use election::{Election, ElectionEvent};
pub use error::{BallotError, Result};
pub use member::{LocalMember, Member, MemberId, MemberKind, Membership};
pub use raft::{Command, ConsensusHandle, Log, LogEntry, MemoryLog, RaftRole, RaftStatus, StateMachine};

// Generated gRPC service carrying codec envelopes
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/ballot.rpc.RaftTransport.rs"));
}
