//! Membership source consumed by a `Cluster`.
//!
//! A coordinator knows the local identity and every member of the cluster and
//! announces joins and departures. Discovery itself is outside this crate;
//! `StaticCoordinator` serves a fixed list that callers update explicitly.

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::config::ClusterConfig;

/// Raw identity of a member as reported by a coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: u32,
    pub uri: String,
}

impl MemberInfo {
    pub fn new(id: u32, uri: impl Into<String>) -> Self {
        Self {
            id,
            uri: uri.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(MemberInfo),
    Left { uri: String },
}

pub trait ClusterCoordinator: Send + Sync + 'static {
    /// Identity of the local member.
    fn member(&self) -> MemberInfo;

    /// Every member currently known, possibly including the local one.
    fn members(&self) -> Vec<MemberInfo>;

    /// Subscribe to membership changes made after this call.
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// Coordinator over an explicit member list.
pub struct StaticCoordinator {
    local: MemberInfo,
    members: RwLock<Vec<MemberInfo>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl StaticCoordinator {
    pub fn new(local: MemberInfo, members: Vec<MemberInfo>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            local,
            members: RwLock::new(members),
            events,
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        let local = MemberInfo::new(config.member_id, config.uri.clone());
        let mut members = vec![local.clone()];
        members.extend(
            config
                .members
                .iter()
                .map(|m| MemberInfo::new(m.id, m.uri.clone())),
        );
        Self::new(local, members)
    }

    /// Add a member and notify subscribers. Returns false if the uri is
    /// already listed.
    pub fn join(&self, member: MemberInfo) -> bool {
        {
            let mut members = self.members.write();
            if members.iter().any(|m| m.uri == member.uri) {
                return false;
            }
            members.push(member.clone());
        }
        tracing::info!(id = member.id, uri = %member.uri, "Member joined");
        // No subscribers is fine: the list above is still updated.
        let _ = self.events.send(MembershipEvent::Joined(member));
        true
    }

    /// Remove a member and notify subscribers. Returns false if the uri is
    /// unknown or names the local member.
    pub fn leave(&self, uri: &str) -> bool {
        if uri == self.local.uri {
            return false;
        }
        {
            let mut members = self.members.write();
            let before = members.len();
            members.retain(|m| m.uri != uri);
            if members.len() == before {
                return false;
            }
        }
        tracing::info!(uri, "Member left");
        let _ = self.events.send(MembershipEvent::Left {
            uri: uri.to_string(),
        });
        true
    }
}

impl ClusterCoordinator for StaticCoordinator {
    fn member(&self) -> MemberInfo {
        self.local.clone()
    }

    fn members(&self) -> Vec<MemberInfo> {
        self.members.read().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_lists_local_and_remotes() {
        let config = ClusterConfig::new(1, "127.0.0.1:50051").with_member(2, "127.0.0.1:50052");
        let coordinator = StaticCoordinator::from_config(&config);
        assert_eq!(coordinator.member(), MemberInfo::new(1, "127.0.0.1:50051"));
        assert_eq!(coordinator.members().len(), 2);
    }

    #[tokio::test]
    async fn join_and_leave_notify_subscribers() {
        let coordinator = StaticCoordinator::new(MemberInfo::new(1, "a:1"), Vec::new());
        let mut events = coordinator.subscribe();

        assert!(coordinator.join(MemberInfo::new(2, "b:1")));
        assert!(!coordinator.join(MemberInfo::new(3, "b:1")));
        assert!(coordinator.leave("b:1"));
        assert!(!coordinator.leave("b:1"));
        assert!(!coordinator.leave("a:1"));

        assert_eq!(
            events.recv().await.unwrap(),
            MembershipEvent::Joined(MemberInfo::new(2, "b:1"))
        );
        assert_eq!(
            events.recv().await.unwrap(),
            MembershipEvent::Left {
                uri: "b:1".to_string()
            }
        );
    }
}
