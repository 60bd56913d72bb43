//! Cluster members and the membership map shared across a node's components.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{BallotError, Result};
use crate::raft::state::quorum;
use crate::transport::Transport;

/// Positive member identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(u32);

impl MemberId {
    pub fn new(id: u32) -> Result<Self> {
        if id == 0 {
            return Err(BallotError::InvalidMessage(
                "member must be positive".to_string(),
            ));
        }
        Ok(Self(id))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Local,
    Remote,
}

/// Identity and address of one cluster participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    id: MemberId,
    uri: String,
    kind: MemberKind,
}

impl Member {
    pub fn new(id: MemberId, uri: impl Into<String>, kind: MemberKind) -> Result<Self> {
        let uri = uri.into();
        if uri.trim().is_empty() {
            return Err(BallotError::InvalidMessage(
                "member uri cannot be empty".to_string(),
            ));
        }
        Ok(Self { id, uri, kind })
    }

    pub fn local(id: u32, uri: impl Into<String>) -> Result<Self> {
        Self::new(MemberId::new(id)?, uri, MemberKind::Local)
    }

    pub fn remote(id: u32, uri: impl Into<String>) -> Result<Self> {
        Self::new(MemberId::new(id)?, uri, MemberKind::Remote)
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn kind(&self) -> MemberKind {
        self.kind
    }

    pub fn is_local(&self) -> bool {
        self.kind == MemberKind::Local
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.uri)
    }
}

/// Members keyed by uri. Holds exactly one local member.
///
/// Shared between components as an immutable `Arc<Membership>` snapshot;
/// only the owning `Cluster` publishes new snapshots.
#[derive(Debug, Clone)]
pub struct Membership {
    local_uri: String,
    members: BTreeMap<String, Member>,
}

impl Membership {
    /// Build a membership map from the local member and its remote peers.
    ///
    /// Entries whose uri equals the local uri are skipped, so a coordinator
    /// listing that includes the local member is accepted as is.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `local` is not a local member, or if two
    /// members share an ID or a uri.
    pub fn new(local: Member, remotes: impl IntoIterator<Item = Member>) -> Result<Self> {
        if !local.is_local() {
            return Err(BallotError::InvalidConfig(format!(
                "{} is not a local member",
                local
            )));
        }
        let mut membership = Self {
            local_uri: local.uri.clone(),
            members: BTreeMap::new(),
        };
        membership.members.insert(local.uri.clone(), local);

        for member in remotes {
            if member.uri == membership.local_uri {
                continue;
            }
            if !membership.insert(member.clone()) {
                return Err(BallotError::InvalidConfig(format!(
                    "duplicate member {}",
                    member
                )));
            }
        }
        Ok(membership)
    }

    pub fn get(&self, uri: &str) -> Option<&Member> {
        self.members.get(uri)
    }

    pub fn by_id(&self, id: MemberId) -> Option<&Member> {
        self.members.values().find(|m| m.id == id)
    }

    pub fn local(&self) -> Option<&Member> {
        self.members.get(&self.local_uri)
    }

    pub fn local_uri(&self) -> &str {
        &self.local_uri
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.members.contains_key(uri)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn remotes(&self) -> impl Iterator<Item = &Member> {
        self.members.values().filter(|m| !m.is_local())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Number of acknowledgements (self included) that form a majority.
    pub fn quorum(&self) -> usize {
        quorum(self.members.len())
    }

    /// Add a remote member. Returns false if its ID or uri is already taken;
    /// existing identities are never overwritten.
    pub(crate) fn insert(&mut self, member: Member) -> bool {
        if self.members.contains_key(&member.uri) || self.by_id(member.id).is_some() {
            return false;
        }
        let member = Member {
            kind: MemberKind::Remote,
            ..member
        };
        self.members.insert(member.uri.clone(), member);
        true
    }

    /// Remove a remote member. The local member cannot be removed.
    pub(crate) fn remove(&mut self, uri: &str) -> Option<Member> {
        if uri == self.local_uri {
            return None;
        }
        self.members.remove(uri)
    }
}

/// Open/close state shared by the lifecycle-bearing components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Open,
    Closed,
}

/// The local member together with its network endpoint.
pub struct LocalMember {
    member: Member,
    transport: Arc<dyn Transport>,
    lifecycle: Mutex<Lifecycle>,
}

impl LocalMember {
    pub fn new(member: Member, transport: Arc<dyn Transport>) -> Self {
        Self {
            member,
            transport,
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    /// Open the local endpoint. Returns once the transport is accepting
    /// requests for this member's uri.
    pub async fn open(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Open => Err(BallotError::AlreadyOpen("local member")),
            Lifecycle::Closed => Err(BallotError::Closed("local member")),
            Lifecycle::Created => {
                self.transport.listen(self.member.uri()).await?;
                *lifecycle = Lifecycle::Open;
                tracing::info!(member = %self.member, "Local member endpoint open");
                Ok(())
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Created => Err(BallotError::NotOpen("local member")),
            Lifecycle::Closed => Err(BallotError::Closed("local member")),
            Lifecycle::Open => {
                *lifecycle = Lifecycle::Closed;
                self.transport.shutdown(self.member.uri()).await?;
                tracing::info!(member = %self.member, "Local member endpoint closed");
                Ok(())
            }
        }
    }

    pub async fn is_open(&self) -> bool {
        *self.lifecycle.lock().await == Lifecycle::Open
    }

    pub async fn is_closed(&self) -> bool {
        *self.lifecycle.lock().await == Lifecycle::Closed
    }
}
