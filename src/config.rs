use std::time::Duration;

use crate::error::{BallotError, Result};

/// Configuration for one cluster member's consensus engine.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Local member ID. Must be at least 1.
    pub member_id: u32,
    /// Local member address (host:port), also its identity in the cluster.
    pub uri: String,
    /// Remote members known at startup.
    pub members: Vec<MemberConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Per-RPC deadline. A request with no reply by then counts as lost.
    pub rpc_timeout_ms: u64,
    /// Upper bound on entries carried by a single AppendRequest.
    pub max_entries_per_append: usize,
    /// Capacity of the consensus engine's mailbox.
    pub mailbox_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberConfig {
    pub id: u32,
    pub uri: String, // host:port format, supports both IP and hostnames
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            member_id: 1,
            uri: "127.0.0.1:50051".to_string(),
            members: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            max_entries_per_append: 64,
            mailbox_capacity: 256,
        }
    }
}

impl ClusterConfig {
    pub fn new(member_id: u32, uri: impl Into<String>) -> Self {
        Self {
            member_id,
            uri: uri.into(),
            ..Default::default()
        }
    }

    pub fn with_member(mut self, id: u32, uri: impl Into<String>) -> Self {
        self.members.push(MemberConfig {
            id,
            uri: uri.into(),
        });
        self
    }

    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Check the configuration for values the consensus engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if:
    /// - the member ID is 0 or the uri is empty
    /// - the election timeout range is empty or inverted
    /// - the heartbeat interval is not shorter than the minimum election timeout
    /// - a remote member reuses the local ID or uri
    pub fn validate(&self) -> Result<()> {
        if self.member_id == 0 {
            return Err(BallotError::InvalidConfig(
                "member_id must be positive".to_string(),
            ));
        }
        if self.uri.trim().is_empty() {
            return Err(BallotError::InvalidConfig("uri cannot be empty".to_string()));
        }
        if self.election_timeout_min_ms == 0
            || self.election_timeout_min_ms > self.election_timeout_max_ms
        {
            return Err(BallotError::InvalidConfig(format!(
                "invalid election timeout range {}..={}ms",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(BallotError::InvalidConfig(format!(
                "heartbeat interval {}ms must be positive and below the election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        if self.max_entries_per_append == 0 || self.mailbox_capacity == 0 {
            return Err(BallotError::InvalidConfig(
                "max_entries_per_append and mailbox_capacity must be positive".to_string(),
            ));
        }
        for member in &self.members {
            if member.id == self.member_id || member.uri == self.uri {
                return Err(BallotError::InvalidConfig(format!(
                    "remote member {} at {} collides with the local member",
                    member.id, member.uri
                )));
            }
        }
        Ok(())
    }
}
