//! Read-only view of leadership, resolved against the current membership.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BallotError, Result};
use crate::member::{Member, Membership};
use crate::raft::ConsensusHandle;

/// Published whenever the (term, leader) pair changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionEvent {
    pub term: u64,
    /// `None` while no leader is known, or when the leader is not a current
    /// member.
    pub leader: Option<Member>,
}

enum Publisher {
    Created,
    Open {
        token: CancellationToken,
        task: JoinHandle<()>,
    },
    Closed,
}

pub struct Election {
    consensus: ConsensusHandle,
    membership: watch::Receiver<Arc<Membership>>,
    events: broadcast::Sender<ElectionEvent>,
    publisher: Mutex<Publisher>,
}

impl Election {
    pub fn new(consensus: ConsensusHandle, membership: watch::Receiver<Arc<Membership>>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            consensus,
            membership,
            events,
            publisher: Mutex::new(Publisher::Created),
        }
    }

    /// Current leader, if known and still a member.
    pub fn leader(&self) -> Option<Member> {
        let uri = self.consensus.leader()?;
        self.membership.borrow().get(&uri).cloned()
    }

    pub fn term(&self) -> u64 {
        self.consensus.term()
    }

    /// Leadership changes published after this call. Only delivered while
    /// the election is open.
    pub fn subscribe(&self) -> broadcast::Receiver<ElectionEvent> {
        self.events.subscribe()
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.publisher.lock(), Publisher::Open { .. })
    }

    /// Start publishing leadership changes.
    pub fn open(&self) -> Result<()> {
        let mut publisher = self.publisher.lock();
        match *publisher {
            Publisher::Open { .. } => return Err(BallotError::AlreadyOpen("election")),
            Publisher::Closed => return Err(BallotError::Closed("election")),
            Publisher::Created => {}
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(publish_changes(
            self.consensus.subscribe(),
            self.membership.clone(),
            self.events.clone(),
            token.clone(),
        ));
        *publisher = Publisher::Open { token, task };
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.publisher.lock(), Publisher::Closed);
        match previous {
            Publisher::Created => {
                *self.publisher.lock() = Publisher::Created;
                Err(BallotError::NotOpen("election"))
            }
            Publisher::Closed => Err(BallotError::Closed("election")),
            Publisher::Open { token, task } => {
                token.cancel();
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "Election publisher ended abnormally");
                }
                Ok(())
            }
        }
    }
}

async fn publish_changes(
    mut status: watch::Receiver<crate::raft::RaftStatus>,
    membership: watch::Receiver<Arc<Membership>>,
    events: broadcast::Sender<ElectionEvent>,
    shutdown: CancellationToken,
) {
    let mut last = {
        let status = status.borrow_and_update();
        (status.term, status.leader.clone())
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    // Engine stopped
                    break;
                }
                let current = {
                    let status = status.borrow_and_update();
                    (status.term, status.leader.clone())
                };
                if current == last {
                    continue;
                }
                last = current.clone();

                let (term, leader) = current;
                let leader = leader.and_then(|uri| membership.borrow().get(&uri).cloned());
                tracing::info!(
                    term,
                    leader = leader.as_ref().map(|m| m.to_string()).unwrap_or_default(),
                    "Leadership changed"
                );
                // No subscribers is fine
                let _ = events.send(ElectionEvent { term, leader });
            }
        }
    }
}
