use serde::{Deserialize, Serialize};

use crate::types::{Jid, NodeIdentity};

/// An entity's administrative standing on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Affiliation {
    /// Full control of the node.
    Owner,
    /// May publish items.
    Publisher,
    /// Only present to anchor subscriptions.
    None,
    /// Banned from publishing and subscribing.
    Outcast,
}

impl Affiliation {
    /// Storage/wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Publisher => "publisher",
            Self::None => "none",
            Self::Outcast => "outcast",
        }
    }

    /// Parses a storage name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "owner" => Some(Self::Owner),
            "publisher" => Some(Self::Publisher),
            "none" => Some(Self::None),
            "outcast" => Some(Self::Outcast),
            _ => None,
        }
    }
}

/// One entity's affiliation with one node.
///
/// The back-reference to the node is the node identity, resolved through the
/// owning service when needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAffiliate {
    pub node: NodeIdentity,
    pub jid: Jid,
    pub affiliation: Affiliation,
}

impl NodeAffiliate {
    pub fn new(node: NodeIdentity, jid: Jid, affiliation: Affiliation) -> Self {
        Self {
            node,
            jid,
            affiliation,
        }
    }
}
