//! Versioned node-state encoding, shared by the store and cluster peers.

use serde::{Deserialize, Serialize};

use crate::persist::{PersistError, PersistResult};

use super::node::Node;

pub const NODE_STATE_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeStateEnvelope {
    format_version: u16,
    node: Node,
}

/// Encodes `node` inside a versioned envelope.
///
/// Transient state (the saved flag, collection children and the cached last
/// item) is not part of the encoding.
pub fn encode_node(node: &Node) -> PersistResult<Vec<u8>> {
    let env = NodeStateEnvelope {
        format_version: NODE_STATE_FORMAT_VERSION,
        node: node.clone(),
    };
    Ok(serde_json::to_vec(&env)?)
}

pub fn decode_node(payload: &[u8]) -> PersistResult<Node> {
    let env: NodeStateEnvelope = serde_json::from_slice(payload)?;
    if env.format_version != NODE_STATE_FORMAT_VERSION {
        return Err(PersistError::UnsupportedFormat(env.format_version));
    }
    Ok(env.node)
}
