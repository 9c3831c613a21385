//! Node, affiliation and subscription model.
//!
//! The model is purely in-memory. Every mutating method returns the list of
//! [`NodeChange`] records it produced; the service turns those into pending
//! store operations when the node is already persisted, and forwards presence
//! changes to its presence collaborator.

use thiserror::Error;

use crate::{op::NodeOperation, types::Jid};

pub mod affiliate;
pub mod codec;
pub mod config;
pub mod indices;
pub mod node;
pub mod subscription;

pub use affiliate::{Affiliation, NodeAffiliate};
pub use subscription::{NodeSubscription, SubscriptionForm, SubscriptionState};

/// Protocol-visible rejection of a model operation. Node state is unchanged
/// whenever one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("node {0} not found")]
    NodeNotFound(String),
    #[error("node {0} already exists")]
    NodeExists(String),
    #[error("node {0} is not a collection node")]
    NotACollection(String),
    #[error("node {0} is not a leaf node")]
    NotALeaf(String),
    #[error("configuration rejected: {0}")]
    ConfigurationRejected(String),
    #[error("{jid} already has a subscription pending authorization")]
    PendingSubscriptionConflict { jid: Jid },
    #[error("{jid} already holds a subscription of that type")]
    DuplicateSubscriptionType { jid: Jid },
    #[error("subscription {0} not found")]
    SubscriptionNotFound(String),
    #[error("multiple subscriptions are enabled; a subscription id is required")]
    SubscriptionIdRequired,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("collection {0} reached its maximum number of leaf children")]
    MaxChildrenReached(String),
    #[error("payload of {size} bytes exceeds the node limit of {max}")]
    PayloadTooLarge { size: usize, max: u32 },
    #[error("the root collection node cannot be deleted")]
    CannotDeleteRoot,
    #[error("moving {0} would create a cycle")]
    HierarchyCycle(String),
    #[error("subscriptions to this node are disabled")]
    SubscriptionsDisabled,
}

/// A state change produced by a model mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeChange {
    AffiliateCreated(NodeAffiliate),
    AffiliateUpdated(NodeAffiliate),
    AffiliateRemoved(NodeAffiliate),
    SubscriptionCreated(NodeSubscription),
    SubscriptionUpdated(NodeSubscription),
    SubscriptionRemoved(NodeSubscription),
    /// The node row itself changed.
    NodeUpdated,
    /// The node needs presence updates from this entity.
    PresenceRequired(Jid),
    /// The node no longer needs presence updates from this entity.
    PresenceNotRequired(Jid),
}

impl NodeChange {
    /// Store operation for this change, if it touches the store.
    pub fn to_operation(&self, node: &node::Node) -> Option<NodeOperation> {
        match self {
            Self::AffiliateCreated(a) => Some(NodeOperation::create_affiliation(a)),
            Self::AffiliateUpdated(a) => Some(NodeOperation::update_affiliation(a)),
            Self::AffiliateRemoved(a) => Some(NodeOperation::remove_affiliation(a)),
            Self::SubscriptionCreated(s) => Some(NodeOperation::create_subscription(s)),
            Self::SubscriptionUpdated(s) => Some(NodeOperation::update_subscription(s)),
            Self::SubscriptionRemoved(s) => Some(NodeOperation::remove_subscription(s)),
            Self::NodeUpdated => Some(NodeOperation::update(node)),
            Self::PresenceRequired(_) | Self::PresenceNotRequired(_) => None,
        }
    }
}
