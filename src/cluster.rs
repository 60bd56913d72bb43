use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClusterConfig;
use crate::coordinator::{ClusterCoordinator, MemberInfo, MembershipEvent};
use crate::election::Election;
use crate::error::{BallotError, Result};
use crate::member::{Lifecycle, LocalMember, Member, Membership};
use crate::raft::{ConsensusHandle, Log, RaftMessage, RaftNode, StateMachine};
use crate::router::Router;
use crate::transport::Transport;

struct Running {
    shutdown: CancellationToken,
    engine: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

/// A member's view of the cluster: the local member, the membership map, the
/// consensus engine and the leadership view over it.
///
/// The cluster is the only writer of the membership map. It follows the
/// coordinator's join/leave events while open.
pub struct Cluster {
    config: ClusterConfig,
    coordinator: Arc<dyn ClusterCoordinator>,
    local: LocalMember,
    membership: Arc<watch::Sender<Arc<Membership>>>,
    consensus: ConsensusHandle,
    election: Election,
    router: Router,
    engine: Mutex<Option<(RaftNode, mpsc::Receiver<RaftMessage>)>>,
    running: Mutex<Option<Running>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl Cluster {
    /// Assemble a cluster from the coordinator's current member list.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration is invalid, if the
    /// coordinator's local identity differs from the configured one, or if
    /// the member list holds a zero ID or duplicate IDs or uris.
    pub fn new(
        config: ClusterConfig,
        coordinator: Arc<dyn ClusterCoordinator>,
        transport: Arc<dyn Transport>,
        log: Box<dyn Log>,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<Self> {
        config.validate()?;

        let info = coordinator.member();
        if info.id != config.member_id || info.uri != config.uri {
            return Err(BallotError::InvalidConfig(format!(
                "coordinator identity {}@{} does not match configured {}@{}",
                info.id, info.uri, config.member_id, config.uri
            )));
        }

        let local = Member::local(info.id, info.uri).map_err(invalid_config)?;
        let remotes = coordinator
            .members()
            .into_iter()
            .filter(|m| m.uri != config.uri)
            .map(|m| Member::remote(m.id, m.uri).map_err(invalid_config))
            .collect::<Result<Vec<_>>>()?;
        let membership = Membership::new(local.clone(), remotes)?;

        let (membership_tx, membership_rx) = watch::channel(Arc::new(membership));
        let (node, message_rx) = RaftNode::new(
            config.clone(),
            log,
            state_machine,
            transport.clone(),
            membership_rx.clone(),
        )?;
        let consensus = node.handle();

        Ok(Self {
            election: Election::new(consensus.clone(), membership_rx),
            router: Router::new(transport.clone()),
            local: LocalMember::new(local, transport),
            config,
            coordinator,
            membership: Arc::new(membership_tx),
            consensus,
            engine: Mutex::new(Some((node, message_rx))),
            running: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::Created),
        })
    }

    /// Start the consensus engine and open the local endpoint. Returns once
    /// the local member accepts requests.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyOpen` if the cluster is open and `Closed` after
    /// `close`. If the local endpoint cannot be opened, everything started
    /// so far is stopped and the cluster is closed.
    pub async fn open(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Open => return Err(BallotError::AlreadyOpen("cluster")),
            Lifecycle::Closed => return Err(BallotError::Closed("cluster")),
            Lifecycle::Created => {}
        }

        let (node, message_rx) = self
            .engine
            .lock()
            .take()
            .ok_or(BallotError::Closed("consensus engine"))?;
        let shutdown = CancellationToken::new();
        let engine = tokio::spawn(node.run(message_rx, shutdown.clone()));

        // Subscribe before the resync so no event falls between the two
        let events = self.coordinator.subscribe();
        sync_membership(&self.membership, self.coordinator.as_ref());
        let watcher = tokio::spawn(follow_coordinator(
            events,
            self.coordinator.clone(),
            self.membership.clone(),
            shutdown.clone(),
        ));
        *self.running.lock() = Some(Running {
            shutdown,
            engine,
            watcher,
        });

        let opened = match self.router.create_routes(&self.config.uri, self.consensus.clone()) {
            Ok(()) => match self.election.open() {
                Ok(()) => self.local.open().await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = opened {
            tracing::warn!(member = %self.local.member(), error = %e, "Failed to open cluster");
            *lifecycle = Lifecycle::Closed;
            self.teardown().await;
            return Err(e);
        }

        *lifecycle = Lifecycle::Open;
        tracing::info!(
            member = %self.local.member(),
            members = self.members().len(),
            "Cluster open"
        );
        Ok(())
    }

    /// Close the local member, the routes, the election and the engine.
    ///
    /// Failures along the way are logged and do not stop the remaining
    /// steps.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` before `open` and `Closed` on a second call.
    pub async fn close(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Created => return Err(BallotError::NotOpen("cluster")),
            Lifecycle::Closed => return Err(BallotError::Closed("cluster")),
            Lifecycle::Open => {}
        }
        *lifecycle = Lifecycle::Closed;

        if let Err(e) = self.local.close().await {
            tracing::warn!(member = %self.local.member(), error = %e, "Failed to close local member");
        }
        self.teardown().await;

        tracing::info!(member = %self.local.member(), "Cluster closed");
        Ok(())
    }

    async fn teardown(&self) {
        if self.router.is_open() {
            if let Err(e) = self.router.destroy_routes() {
                tracing::warn!(error = %e, "Failed to destroy routes");
            }
        }
        if self.election.is_open() {
            if let Err(e) = self.election.close().await {
                tracing::warn!(error = %e, "Failed to close election");
            }
        }

        let running = self.running.lock().take();
        if let Some(running) = running {
            running.shutdown.cancel();
            if let Err(e) = running.engine.await {
                tracing::warn!(error = %e, "Consensus engine ended abnormally");
            }
            if let Err(e) = running.watcher.await {
                tracing::warn!(error = %e, "Membership watcher ended abnormally");
            }
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Member with the given uri, if currently part of the cluster.
    pub fn member(&self, uri: &str) -> Option<Member> {
        self.membership.borrow().get(uri).cloned()
    }

    pub fn local_member(&self) -> &LocalMember {
        &self.local
    }

    /// Snapshot of the current membership.
    pub fn members(&self) -> Arc<Membership> {
        self.membership.borrow().clone()
    }

    pub fn leader(&self) -> Option<Member> {
        self.election.leader()
    }

    pub fn term(&self) -> u64 {
        self.consensus.term()
    }

    pub fn election(&self) -> &Election {
        &self.election
    }

    pub fn consensus(&self) -> &ConsensusHandle {
        &self.consensus
    }

    pub async fn is_open(&self) -> bool {
        *self.lifecycle.lock().await == Lifecycle::Open
    }

    pub async fn is_closed(&self) -> bool {
        *self.lifecycle.lock().await == Lifecycle::Closed
    }
}

fn invalid_config(err: BallotError) -> BallotError {
    BallotError::InvalidConfig(err.to_string())
}

fn remote_member(info: &MemberInfo) -> Option<Member> {
    match Member::remote(info.id, info.uri.clone()) {
        Ok(member) => Some(member),
        Err(e) => {
            tracing::warn!(id = info.id, uri = %info.uri, error = %e, "Ignoring invalid member");
            None
        }
    }
}

fn add_member(membership: &watch::Sender<Arc<Membership>>, member: Member) {
    membership.send_if_modified(|current| {
        let mut next = (**current).clone();
        if !next.insert(member.clone()) {
            return false;
        }
        tracing::info!(member = %member, "Member added");
        *current = Arc::new(next);
        true
    });
}

fn remove_member(membership: &watch::Sender<Arc<Membership>>, uri: &str) {
    membership.send_if_modified(|current| {
        let mut next = (**current).clone();
        match next.remove(uri) {
            Some(member) => {
                tracing::info!(member = %member, "Member removed");
                *current = Arc::new(next);
                true
            }
            None => false,
        }
    });
}

/// Bring the membership map in line with the coordinator's member list.
fn sync_membership(membership: &watch::Sender<Arc<Membership>>, coordinator: &dyn ClusterCoordinator) {
    let listed = coordinator.members();
    let local_uri = membership.borrow().local_uri().to_string();
    let listed_uris: HashSet<&str> = listed.iter().map(|m| m.uri.as_str()).collect();

    let stale: Vec<String> = membership
        .borrow()
        .remotes()
        .filter(|m| !listed_uris.contains(m.uri()))
        .map(|m| m.uri().to_string())
        .collect();
    for uri in stale {
        remove_member(membership, &uri);
    }

    for info in listed.iter().filter(|m| m.uri != local_uri) {
        if let Some(member) = remote_member(info) {
            add_member(membership, member);
        }
    }
}

async fn follow_coordinator(
    mut events: broadcast::Receiver<MembershipEvent>,
    coordinator: Arc<dyn ClusterCoordinator>,
    membership: Arc<watch::Sender<Arc<Membership>>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(MembershipEvent::Joined(info)) => {
                    if let Some(member) = remote_member(&info) {
                        add_member(&membership, member);
                    }
                }
                Ok(MembershipEvent::Left { uri }) => remove_member(&membership, &uri),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed membership events, resynchronizing");
                    sync_membership(&membership, coordinator.as_ref());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
