//! Published item record and publisher draft.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};

use crate::types::{ItemIdentity, Jid, NodeIdentity};

/// Length of item ids generated for drafts without one.
pub const ITEM_ID_LEN: usize = 24;

/// One item published to a leaf node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedItem {
    /// Leaf node the item belongs to.
    pub node: NodeIdentity,
    /// Item id, unique within the node.
    pub item_id: String,
    /// Entity that published the item.
    pub publisher: Jid,
    /// Creation time in milliseconds since epoch.
    pub created_ms: u64,
    /// Opaque payload; absent for notification-only items.
    pub payload: Option<String>,
}

impl PublishedItem {
    /// Creates an item stamped with the current time.
    pub fn new(
        node: NodeIdentity,
        item_id: impl Into<String>,
        publisher: Jid,
        payload: Option<String>,
    ) -> Self {
        Self {
            node,
            item_id: item_id.into(),
            publisher,
            created_ms: now_ms(),
            payload,
        }
    }

    /// Identity used by the pending queues and the read cache.
    pub fn identity(&self) -> ItemIdentity {
        self.node.item(self.item_id.clone())
    }
}

/// Publish request for one item. A missing id is generated by the service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemDraft {
    /// Requested item id.
    pub item_id: Option<String>,
    /// Opaque payload.
    pub payload: Option<String>,
}

impl ItemDraft {
    /// Draft with an explicit id and payload.
    pub fn new(item_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            item_id: Some(item_id.into()),
            payload: Some(payload.into()),
        }
    }
}

/// Random alphanumeric item id.
pub fn generate_item_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ITEM_ID_LEN)
        .map(char::from)
        .collect()
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
