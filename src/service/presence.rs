use crate::types::{Jid, NodeIdentity};

/// Receives presence interest changes for presence-based nodes.
///
/// Presence routing lives outside this crate; the service only reports
/// which entities a node starts or stops caring about.
pub trait PresenceTracker: Send + Sync {
    fn presence_required(&self, node: &NodeIdentity, jid: &Jid);
    fn presence_not_required(&self, node: &NodeIdentity, jid: &Jid);
}

/// Tracker that ignores every change.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPresenceTracker;

impl PresenceTracker for NoopPresenceTracker {
    fn presence_required(&self, _node: &NodeIdentity, _jid: &Jid) {}

    fn presence_not_required(&self, _node: &NodeIdentity, _jid: &Jid) {}
}
