//! Pending node operations and pending item queues.

use std::mem;

use hashbrown::HashMap;

use crate::{
    item::PublishedItem,
    op::{NodeAction, NodeOperation},
    types::{ItemIdentity, NodeIdentity},
};

/// Ordered, coalesced list of not-yet-durable operations for one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingOperations {
    ops: Vec<NodeOperation>,
}

impl PendingOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `op` after dropping the entries it makes redundant.
    ///
    /// An `Update` replaces the trailing run of updates. Affiliation and
    /// subscription changes replace entries with the same key inside the
    /// trailing run of their own kind. A `Remove` replaces everything.
    ///
    /// A replaced entry may have been the row's insert. The appended change
    /// then keeps the row's store state straight: an update becomes the
    /// insert, a delete cancels the insert and is dropped. When the replaced
    /// entries started from a stored row, a re-insert becomes an update.
    pub fn push(&mut self, op: NodeOperation) {
        let action = op.action();
        let first_replaced = match action {
            NodeAction::Update => {
                while self
                    .ops
                    .last()
                    .is_some_and(|last| last.action() == NodeAction::Update)
                {
                    self.ops.pop();
                }
                None
            }
            NodeAction::Remove => {
                self.ops.clear();
                None
            }
            NodeAction::Create => None,
            _ if action.is_affiliation_change() => {
                let key = op.affiliation_key().cloned();
                self.discard_in_trailing_run(NodeAction::is_affiliation_change, |existing| {
                    existing.affiliation_key() == key.as_ref()
                })
            }
            _ => {
                let key = op.subscription_key().map(str::to_string);
                self.discard_in_trailing_run(NodeAction::is_subscription_change, |existing| {
                    existing.subscription_key() == key.as_deref()
                })
            }
        };

        let action = match first_replaced {
            None => action,
            Some(first) if first.is_insert() => {
                if action.is_delete() {
                    return;
                }
                action.as_insert()
            }
            Some(_) if action.is_insert() => action.as_update(),
            Some(_) => action,
        };
        self.ops.push(op.with_action(action));
    }

    /// Drops same-key entries from the trailing run and returns the action
    /// of the first one dropped.
    fn discard_in_trailing_run(
        &mut self,
        in_run: impl Fn(NodeAction) -> bool,
        same_key: impl Fn(&NodeOperation) -> bool,
    ) -> Option<NodeAction> {
        let start = self
            .ops
            .iter()
            .rposition(|op| !in_run(op.action()))
            .map_or(0, |pos| pos + 1);
        let run = self.ops.split_off(start);
        let mut first = None;
        for op in run {
            if same_key(&op) {
                first.get_or_insert(op.action());
            } else {
                self.ops.push(op);
            }
        }
        first
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn as_slice(&self) -> &[NodeOperation] {
        &self.ops
    }

    pub fn actions(&self) -> Vec<NodeAction> {
        self.ops.iter().map(NodeOperation::action).collect()
    }

    pub fn into_vec(self) -> Vec<NodeOperation> {
        self.ops
    }
}

/// Item adds and deletes waiting for the next bulk write.
///
/// `in_flight` holds the current version of every queued add, keyed by
/// identity; it is what the size threshold counts.
#[derive(Debug, Default)]
pub struct PendingItems {
    to_add: Vec<PublishedItem>,
    to_delete: Vec<ItemIdentity>,
    in_flight: HashMap<ItemIdentity, PublishedItem>,
}

impl PendingItems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `item` for insertion, replacing a queued add of the same id
    /// and cancelling a queued delete of it.
    pub fn save(&mut self, item: PublishedItem) {
        let id = item.identity();
        if self.in_flight.contains_key(&id) {
            self.to_add.retain(|queued| queued.identity() != id);
        }
        self.to_delete.retain(|queued| *queued != id);
        self.to_add.push(item.clone());
        self.in_flight.insert(id, item);
    }

    /// Queues a delete and cancels any queued add of the same id.
    pub fn remove(&mut self, id: ItemIdentity) {
        if self.in_flight.remove(&id).is_some() {
            self.to_add.retain(|queued| queued.identity() != id);
        }
        if !self.to_delete.contains(&id) {
            self.to_delete.push(id);
        }
    }

    /// Drops everything queued for `node`.
    pub fn purge_node(&mut self, node: &NodeIdentity) {
        self.to_add.retain(|item| item.node != *node);
        self.to_delete.retain(|id| id.node != *node);
        self.in_flight.retain(|id, _| id.node != *node);
    }

    /// Removes and returns the queued adds and deletes of `node`, leaving
    /// every other node's entries in place.
    pub fn take_node(&mut self, node: &NodeIdentity) -> (Vec<PublishedItem>, Vec<ItemIdentity>) {
        let (adds, keep): (Vec<_>, Vec<_>) = mem::take(&mut self.to_add)
            .into_iter()
            .partition(|item| item.node == *node);
        self.to_add = keep;
        let (deletes, keep): (Vec<_>, Vec<_>) = mem::take(&mut self.to_delete)
            .into_iter()
            .partition(|id| id.node == *node);
        self.to_delete = keep;
        for item in &adds {
            self.in_flight.remove(&item.identity());
        }
        (adds, deletes)
    }

    /// Swaps out both queues so new writes accumulate in fresh ones.
    pub fn take_all(&mut self) -> (Vec<PublishedItem>, Vec<ItemIdentity>) {
        self.in_flight.clear();
        (mem::take(&mut self.to_add), mem::take(&mut self.to_delete))
    }

    pub fn in_flight(&self, id: &ItemIdentity) -> Option<&PublishedItem> {
        self.in_flight.get(id)
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn pending_adds(&self) -> &[PublishedItem] {
        &self.to_add
    }

    pub fn pending_deletes(&self) -> &[ItemIdentity] {
        &self.to_delete
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_delete.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{
            Affiliation, NodeAffiliate, config::DefaultNodeConfiguration, node::Node,
        },
        types::{Jid, ServiceId},
    };

    fn node(id: &str) -> Node {
        Node::new_leaf(
            NodeIdentity::new(ServiceId::new("svc"), id),
            None,
            Jid::new("owner@x"),
            &DefaultNodeConfiguration::leaf(),
        )
    }

    fn affiliation(node: &Node, jid: &str) -> NodeOperation {
        NodeOperation::update_affiliation(&NodeAffiliate::new(
            node.identity().clone(),
            Jid::new(jid),
            Affiliation::Publisher,
        ))
    }

    fn item(node: &str, id: &str, payload: &str) -> PublishedItem {
        PublishedItem::new(
            NodeIdentity::new(ServiceId::new("svc"), node),
            id,
            Jid::new("p@x"),
            Some(payload.to_string()),
        )
    }

    #[test]
    fn update_stops_at_first_other_action() {
        let n = node("n");
        let mut ops = PendingOperations::new();
        ops.push(NodeOperation::update(&n));
        ops.push(affiliation(&n, "a@x"));
        ops.push(NodeOperation::update(&n));
        ops.push(NodeOperation::update(&n));
        assert_eq!(
            ops.actions(),
            vec![
                NodeAction::Update,
                NodeAction::UpdateAffiliation,
                NodeAction::Update
            ]
        );
    }

    #[test]
    fn affiliation_run_drops_only_same_jid() {
        let n = node("n");
        let mut ops = PendingOperations::new();
        ops.push(affiliation(&n, "a@x"));
        ops.push(affiliation(&n, "b@x"));
        ops.push(affiliation(&n, "a@x"));
        let keys: Vec<_> = ops
            .as_slice()
            .iter()
            .filter_map(|op| op.affiliation_key().map(Jid::as_str))
            .collect();
        assert_eq!(keys, vec!["b@x", "a@x"]);
    }

    #[test]
    fn affiliation_scan_stops_at_node_update() {
        let n = node("n");
        let mut ops = PendingOperations::new();
        ops.push(affiliation(&n, "a@x"));
        ops.push(NodeOperation::update(&n));
        ops.push(affiliation(&n, "a@x"));
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn resave_replaces_queued_add_and_cancels_delete() {
        let mut pending = PendingItems::new();
        pending.save(item("n", "a", "v1"));
        pending.remove(item("n", "b", "").identity());
        pending.save(item("n", "a", "v2"));
        pending.save(item("n", "b", "v3"));

        assert_eq!(pending.pending_adds().len(), 2);
        assert!(pending.pending_deletes().is_empty());
        let a = item("n", "a", "").identity();
        assert_eq!(
            pending.in_flight(&a).and_then(|i| i.payload.as_deref()),
            Some("v2")
        );
    }

    #[test]
    fn remove_cancels_queued_add() {
        let mut pending = PendingItems::new();
        let a = item("n", "a", "v1");
        pending.save(a.clone());
        pending.remove(a.identity());
        assert!(pending.pending_adds().is_empty());
        assert_eq!(pending.pending_deletes(), &[a.identity()]);
        assert_eq!(pending.in_flight_len(), 0);
    }

    #[test]
    fn take_node_leaves_other_nodes_queued() {
        let mut pending = PendingItems::new();
        pending.save(item("x", "1", "v"));
        pending.save(item("y", "2", "v"));
        pending.remove(item("y", "3", "").identity());

        let x = NodeIdentity::new(ServiceId::new("svc"), "x");
        let (adds, deletes) = pending.take_node(&x);
        assert_eq!(adds.len(), 1);
        assert!(deletes.is_empty());
        assert_eq!(pending.pending_adds().len(), 1);
        assert_eq!(pending.pending_deletes().len(), 1);
        assert_eq!(pending.in_flight_len(), 1);
    }
}
