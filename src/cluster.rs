//! Cluster flush coordination.
//!
//! A member asks its peers to drain their write-behind queues through a
//! [`ClusterCoordinator`]. [`InProcessCluster`] connects several caching
//! providers living in one process, which is how multi-member behavior is
//! exercised without a network transport.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::NodeIdentity;

/// Work a member can be asked to perform on behalf of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterTask {
    /// Flush one node, or everything when `node` is `None`. Always executed
    /// as a local-only flush on the receiving member.
    Flush { node: Option<NodeIdentity> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("cluster task not acknowledged within {0:?}")]
    Timeout(Duration),
    #[error("cluster member {0} is no longer available")]
    MemberUnavailable(u64),
    #[error("cluster member {0} is still running an earlier task")]
    MemberBusy(u64),
    #[error("{0}")]
    Message(String),
}

/// Executes tasks received from peers.
pub trait ClusterTaskHandler: Send + Sync {
    fn execute_cluster_task(&self, task: &ClusterTask);
}

/// Dispatches tasks to the other members of a cluster.
pub trait ClusterCoordinator: Send + Sync {
    /// Runs `task` on every other member. With `wait`, blocks until all of
    /// them acknowledged or the coordinator's timeout expired.
    fn run_on_all_members(&self, task: &ClusterTask, wait: bool) -> Result<(), ClusterError>;
}

struct MemberSlot {
    id: u64,
    handler: Option<Weak<dyn ClusterTaskHandler>>,
    /// Set while a task runs on this member. At most one runs at a time.
    busy: Arc<AtomicBool>,
}

struct Peer {
    id: u64,
    handler: Arc<dyn ClusterTaskHandler>,
    busy: Arc<AtomicBool>,
}

/// Clears a member's busy flag when its task thread ends or never starts.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Hub {
    members: RwLock<Vec<MemberSlot>>,
    next_id: AtomicU64,
    timeout: Duration,
}

/// Cluster of members that share one process.
#[derive(Clone)]
pub struct InProcessCluster {
    hub: Arc<Hub>,
}

impl InProcessCluster {
    /// `timeout` bounds every synchronous task round-trip.
    pub fn new(timeout: Duration) -> Self {
        Self {
            hub: Arc::new(Hub {
                members: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                timeout,
            }),
        }
    }

    /// Registers a new member. Attach its task handler once it exists.
    pub fn join(&self) -> Arc<ClusterMember> {
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        self.hub.members.write().push(MemberSlot {
            id,
            handler: None,
            busy: Arc::new(AtomicBool::new(false)),
        });
        Arc::new(ClusterMember {
            hub: Arc::clone(&self.hub),
            id,
        })
    }

    pub fn member_count(&self) -> usize {
        self.hub.members.read().len()
    }
}

/// One member's view of an [`InProcessCluster`].
pub struct ClusterMember {
    hub: Arc<Hub>,
    id: u64,
}

impl ClusterMember {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Routes tasks addressed to this member to `handler`. Only a weak
    /// reference is kept.
    pub fn attach<H: ClusterTaskHandler + 'static>(&self, handler: &Arc<H>) {
        let weak: Weak<dyn ClusterTaskHandler> = Arc::downgrade(handler) as Weak<dyn ClusterTaskHandler>;
        let mut members = self.hub.members.write();
        if let Some(slot) = members.iter_mut().find(|slot| slot.id == self.id) {
            slot.handler = Some(weak);
        }
    }

    pub fn leave(&self) {
        self.hub.members.write().retain(|slot| slot.id != self.id);
    }

    fn peers(&self) -> (Vec<Peer>, Option<u64>) {
        let members = self.hub.members.read();
        let mut live = Vec::new();
        let mut unavailable = None;
        for slot in members.iter().filter(|slot| slot.id != self.id) {
            match slot.handler.as_ref().and_then(Weak::upgrade) {
                Some(handler) => live.push(Peer {
                    id: slot.id,
                    handler,
                    busy: Arc::clone(&slot.busy),
                }),
                None => unavailable = Some(slot.id),
            }
        }
        (live, unavailable)
    }
}

impl ClusterCoordinator for ClusterMember {
    /// Each peer runs the task on its own thread. A peer still busy with an
    /// earlier task is skipped and reported as [`ClusterError::MemberBusy`].
    /// Threads that outlive the timeout are left to finish and keep their
    /// peer marked busy until they do.
    fn run_on_all_members(&self, task: &ClusterTask, wait: bool) -> Result<(), ClusterError> {
        let (peers, unavailable) = self.peers();
        debug!(member = self.id, peers = peers.len(), ?task, wait, "dispatching cluster task");

        let (done_tx, done_rx) = mpsc::channel::<u64>();
        let mut outstanding = Vec::new();
        let mut busy = Vec::new();
        for peer in peers {
            if peer.busy.swap(true, Ordering::AcqRel) {
                busy.push(peer.id);
                continue;
            }
            let guard = BusyGuard(Arc::clone(&peer.busy));
            let done_tx = done_tx.clone();
            let task = task.clone();
            let handler = peer.handler;
            let peer_id = peer.id;
            let spawned = thread::Builder::new()
                .name(format!("cluster-task-{peer_id}"))
                .spawn(move || {
                    let _guard = guard;
                    handler.execute_cluster_task(&task);
                    let _ = done_tx.send(peer_id);
                });
            match spawned {
                Ok(_) => outstanding.push(peer_id),
                Err(err) => {
                    warn!(member = self.id, peer = peer_id, error = %err, "could not start cluster task");
                    return Err(ClusterError::Message(format!(
                        "could not start a task for member {peer_id}: {err}"
                    )));
                }
            }
        }
        drop(done_tx);

        if wait {
            let deadline = Instant::now() + self.hub.timeout;
            while !outstanding.is_empty() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match done_rx.recv_timeout(remaining) {
                    Ok(peer) => outstanding.retain(|id| *id != peer),
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(member = self.id, peers = ?outstanding, "cluster task timed out; peers left running");
                        return Err(ClusterError::Timeout(self.hub.timeout));
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(ClusterError::Message(
                            "a member stopped before acknowledging".to_string(),
                        ));
                    }
                }
            }
        }

        if let Some(&id) = busy.first() {
            warn!(member = self.id, peers = ?busy, "cluster peers still busy; task not started");
            return Err(ClusterError::MemberBusy(id));
        }
        match unavailable {
            Some(id) => {
                warn!(member = self.id, peer = id, "cluster peer dropped without leaving");
                Err(ClusterError::MemberUnavailable(id))
            }
            None => Ok(()),
        }
    }
}
