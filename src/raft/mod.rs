pub mod log;
pub mod node;
pub mod rpc;
pub mod state;
pub mod timer;

pub use log::{Command, Log, LogEntry, MemoryLog, StateMachine};
pub use node::{ConsensusHandle, RaftMessage, RaftNode};
pub use state::{RaftRole, RaftState, RaftStatus};
