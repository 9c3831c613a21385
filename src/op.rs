//! Pending node mutation model.
//!
//! Every mutating node, affiliation or subscription call produces one
//! [`NodeOperation`]. Operations are buffered by the write-behind cache and
//! applied to the durable store in enqueue order when the node is flushed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    model::{NodeAffiliate, NodeSubscription, node::Node},
    types::{Jid, NodeIdentity},
};

/// Kind of a pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeAction {
    /// Insert the node row.
    Create,
    /// Rewrite the node row.
    Update,
    /// Delete the node and everything attached to it.
    Remove,
    /// Insert an affiliation.
    CreateAffiliation,
    /// Rewrite an affiliation.
    UpdateAffiliation,
    /// Delete an affiliation.
    RemoveAffiliation,
    /// Insert a subscription.
    CreateSubscription,
    /// Rewrite a subscription.
    UpdateSubscription,
    /// Delete a subscription.
    RemoveSubscription,
}

impl NodeAction {
    /// True for the three affiliation actions.
    pub fn is_affiliation_change(self) -> bool {
        matches!(
            self,
            Self::CreateAffiliation | Self::UpdateAffiliation | Self::RemoveAffiliation
        )
    }

    /// True for the three subscription actions.
    pub fn is_subscription_change(self) -> bool {
        matches!(
            self,
            Self::CreateSubscription | Self::UpdateSubscription | Self::RemoveSubscription
        )
    }

    /// True for create/update/remove of the node itself.
    pub fn is_node_change(self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Remove)
    }

    /// True for the actions that insert a row.
    pub fn is_insert(self) -> bool {
        matches!(
            self,
            Self::Create | Self::CreateAffiliation | Self::CreateSubscription
        )
    }

    /// True for the actions that delete a row.
    pub fn is_delete(self) -> bool {
        matches!(
            self,
            Self::Remove | Self::RemoveAffiliation | Self::RemoveSubscription
        )
    }

    /// Insert action of the same kind.
    pub fn as_insert(self) -> Self {
        match self {
            Self::Update | Self::Remove => Self::Create,
            Self::UpdateAffiliation | Self::RemoveAffiliation => Self::CreateAffiliation,
            Self::UpdateSubscription | Self::RemoveSubscription => Self::CreateSubscription,
            insert => insert,
        }
    }

    /// Update action of the same kind.
    pub fn as_update(self) -> Self {
        match self {
            Self::Create | Self::Remove => Self::Update,
            Self::CreateAffiliation | Self::RemoveAffiliation => Self::UpdateAffiliation,
            Self::CreateSubscription | Self::RemoveSubscription => Self::UpdateSubscription,
            update => update,
        }
    }
}

/// Data carried by an operation. The variant must agree with the action.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationPayload {
    /// Snapshot of the node taken at enqueue time.
    Node(Box<Node>),
    /// Snapshot of an affiliate.
    Affiliate(NodeAffiliate),
    /// Snapshot of a subscription.
    Subscription(NodeSubscription),
}

/// Rejected operation construction. Always a programming error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// A required field was empty or the payload does not match the action.
    #[error("invalid node operation arguments: {0}")]
    InvalidOperationArgs(String),
}

/// A pending, not-yet-durable mutation of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOperation {
    identity: NodeIdentity,
    action: NodeAction,
    payload: OperationPayload,
}

impl NodeOperation {
    /// Validating constructor.
    ///
    /// Fails when the service id or a payload key is empty, when the payload
    /// kind does not match `action`, or when the payload belongs to another
    /// node.
    pub fn new(
        identity: NodeIdentity,
        action: NodeAction,
        payload: OperationPayload,
    ) -> Result<Self, OperationError> {
        if identity.service.as_str().is_empty() {
            return Err(OperationError::InvalidOperationArgs(
                "service id cannot be empty".to_string(),
            ));
        }

        let payload_node = match &payload {
            OperationPayload::Node(node) if action.is_node_change() => node.identity(),
            OperationPayload::Affiliate(affiliate) if action.is_affiliation_change() => {
                if affiliate.jid.as_str().is_empty() {
                    return Err(OperationError::InvalidOperationArgs(format!(
                        "affiliate jid cannot be empty when action is {action:?}"
                    )));
                }
                &affiliate.node
            }
            OperationPayload::Subscription(sub) if action.is_subscription_change() => {
                if sub.id.is_empty() {
                    return Err(OperationError::InvalidOperationArgs(format!(
                        "subscription id cannot be empty when action is {action:?}"
                    )));
                }
                &sub.node
            }
            _ => {
                return Err(OperationError::InvalidOperationArgs(format!(
                    "payload does not match action {action:?}"
                )));
            }
        };

        if *payload_node != identity {
            return Err(OperationError::InvalidOperationArgs(format!(
                "payload belongs to {payload_node}, not {identity}"
            )));
        }

        Ok(Self {
            identity,
            action,
            payload,
        })
    }

    /// `Create` for a node snapshot.
    pub fn create(node: &Node) -> Self {
        Self::for_node(NodeAction::Create, node)
    }

    /// `Update` for a node snapshot.
    pub fn update(node: &Node) -> Self {
        Self::for_node(NodeAction::Update, node)
    }

    /// `Remove` for a node snapshot.
    pub fn remove(node: &Node) -> Self {
        Self::for_node(NodeAction::Remove, node)
    }

    /// `CreateAffiliation` for an affiliate snapshot.
    pub fn create_affiliation(affiliate: &NodeAffiliate) -> Self {
        Self::for_affiliate(NodeAction::CreateAffiliation, affiliate)
    }

    /// `UpdateAffiliation` for an affiliate snapshot.
    pub fn update_affiliation(affiliate: &NodeAffiliate) -> Self {
        Self::for_affiliate(NodeAction::UpdateAffiliation, affiliate)
    }

    /// `RemoveAffiliation` for an affiliate snapshot.
    pub fn remove_affiliation(affiliate: &NodeAffiliate) -> Self {
        Self::for_affiliate(NodeAction::RemoveAffiliation, affiliate)
    }

    /// `CreateSubscription` for a subscription snapshot.
    pub fn create_subscription(subscription: &NodeSubscription) -> Self {
        Self::for_subscription(NodeAction::CreateSubscription, subscription)
    }

    /// `UpdateSubscription` for a subscription snapshot.
    pub fn update_subscription(subscription: &NodeSubscription) -> Self {
        Self::for_subscription(NodeAction::UpdateSubscription, subscription)
    }

    /// `RemoveSubscription` for a subscription snapshot.
    pub fn remove_subscription(subscription: &NodeSubscription) -> Self {
        Self::for_subscription(NodeAction::RemoveSubscription, subscription)
    }

    /// Same payload under another action of the same kind.
    pub(crate) fn with_action(mut self, action: NodeAction) -> Self {
        debug_assert_eq!(
            (action.is_node_change(), action.is_affiliation_change()),
            (self.action.is_node_change(), self.action.is_affiliation_change())
        );
        self.action = action;
        self
    }

    /// Node this operation mutates.
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Operation kind.
    pub fn action(&self) -> NodeAction {
        self.action
    }

    /// Operation payload.
    pub fn payload(&self) -> &OperationPayload {
        &self.payload
    }

    /// Node snapshot, for node-level actions.
    pub fn node(&self) -> Option<&Node> {
        match &self.payload {
            OperationPayload::Node(node) => Some(node),
            _ => None,
        }
    }

    /// Affiliate snapshot, for affiliation actions.
    pub fn affiliate(&self) -> Option<&NodeAffiliate> {
        match &self.payload {
            OperationPayload::Affiliate(affiliate) => Some(affiliate),
            _ => None,
        }
    }

    /// Subscription snapshot, for subscription actions.
    pub fn subscription(&self) -> Option<&NodeSubscription> {
        match &self.payload {
            OperationPayload::Subscription(sub) => Some(sub),
            _ => None,
        }
    }

    /// Coalescing key of an affiliation change.
    pub fn affiliation_key(&self) -> Option<&Jid> {
        self.affiliate().map(|a| &a.jid)
    }

    /// Coalescing key of a subscription change.
    pub fn subscription_key(&self) -> Option<&str> {
        self.subscription().map(|s| s.id.as_str())
    }

    fn for_node(action: NodeAction, node: &Node) -> Self {
        Self {
            identity: node.identity().clone(),
            action,
            payload: OperationPayload::Node(Box::new(node.clone())),
        }
    }

    fn for_affiliate(action: NodeAction, affiliate: &NodeAffiliate) -> Self {
        Self {
            identity: affiliate.node.clone(),
            action,
            payload: OperationPayload::Affiliate(affiliate.clone()),
        }
    }

    fn for_subscription(action: NodeAction, subscription: &NodeSubscription) -> Self {
        Self {
            identity: subscription.node.clone(),
            action,
            payload: OperationPayload::Subscription(subscription.clone()),
        }
    }
}
