//! Cache event stream payloads.

use crate::{op::NodeAction, types::NodeIdentity};

/// Events emitted by the write-behind coordinator.
///
/// Asynchronous write failures never reach the caller that enqueued the
/// write; this stream is where they surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Pending operations of a node were applied to the store.
    NodeFlushed {
        node: NodeIdentity,
        /// Operations attempted, including failed ones.
        operations: usize,
    },
    /// An item batch for a node reached the store.
    ItemsWritten {
        node: NodeIdentity,
        added: usize,
        deleted: usize,
    },
    /// An item batch was rolled back and dropped.
    ItemBatchLost {
        node: NodeIdentity,
        lost_adds: usize,
        lost_deletes: usize,
        reason: String,
    },
    /// A node, affiliation or subscription write failed.
    StoreWriteFailed {
        node: NodeIdentity,
        action: NodeAction,
        reason: String,
    },
    /// Peers did not confirm a cluster-wide flush; the local flush went ahead.
    ClusterFlushFailed {
        node: Option<NodeIdentity>,
        reason: String,
    },
}
