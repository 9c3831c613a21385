//! Shared identifiers, addresses, and node policy enums.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one pub/sub service (the main service or a personal one).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    /// Wraps a raw service identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `node` belongs to this service.
    pub fn owns(&self, node: &NodeIdentity) -> bool {
        node.service == *self
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique key of a node: `(serviceId, nodeId)`. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Owning service.
    pub service: ServiceId,
    /// Node id, unique within the service.
    pub node_id: String,
}

impl NodeIdentity {
    /// Builds an identity from its two parts.
    pub fn new(service: ServiceId, node_id: impl Into<String>) -> Self {
        Self {
            service,
            node_id: node_id.into(),
        }
    }

    /// True when `item` was published to this node.
    pub fn owns(&self, item: &ItemIdentity) -> bool {
        item.node == *self
    }

    /// Identity of an item published to this node.
    pub fn item(&self, item_id: impl Into<String>) -> ItemIdentity {
        ItemIdentity {
            node: self.clone(),
            item_id: item_id.into(),
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.node_id)
    }
}

/// Unique key of a published item: `(serviceId, nodeId, itemId)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemIdentity {
    /// Node the item was published to.
    pub node: NodeIdentity,
    /// Item id, unique within the node.
    pub item_id: String,
}

impl fmt::Display for ItemIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node, self.item_id)
    }
}

/// An entity address of the form `node@domain/resource`.
///
/// Only the split between bare and full address is interpreted; the rest is
/// kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(String);

impl Jid {
    /// Wraps a raw address.
    pub fn new(jid: impl Into<String>) -> Self {
        Self(jid.into())
    }

    /// Returns the raw address.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the address without its resource part.
    pub fn bare(&self) -> Jid {
        match self.0.split_once('/') {
            Some((bare, _)) => Jid(bare.to_string()),
            None => self.clone(),
        }
    }

    /// Resource part, if any.
    pub fn resource(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, res)| res)
    }

    /// True when the address carries no resource.
    pub fn is_bare(&self) -> bool {
        self.resource().is_none()
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Jid {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Jid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Who may subscribe to a node and retrieve its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessModel {
    /// Anyone.
    Open,
    /// Entities subscribed to the owner's presence.
    Presence,
    /// Entities in an allowed roster group.
    Roster,
    /// Anyone, subject to owner approval.
    Authorize,
    /// Only whitelisted affiliates.
    Whitelist,
}

impl AccessModel {
    /// True when new subscriptions need an owner's approval.
    pub fn requires_authorization(self) -> bool {
        matches!(self, Self::Authorize)
    }
}

/// Who may publish items to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherModel {
    /// Anyone.
    Open,
    /// Owners and publishers.
    Publishers,
    /// Owners, publishers and subscribers.
    Subscribers,
}

/// Who receives replies to published items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemReplyPolicy {
    /// Node owners.
    Owner,
    /// The item publisher.
    Publisher,
}

/// Who may attach child nodes to a collection node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssociationPolicy {
    /// Anyone.
    All,
    /// Node admins only.
    Owners,
    /// Node admins and whitelisted entities.
    Whitelist,
}

/// What a subscription to a collection node delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    /// Items published to descendant leaves.
    Items,
    /// Child node creation and deletion events.
    Nodes,
}
