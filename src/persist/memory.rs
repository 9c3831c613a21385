//! Process-local store, for tests and for services that need no durability.

use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    item::PublishedItem,
    model::{
        NodeAffiliate, NodeSubscription, SubscriptionState, config::DefaultNodeConfiguration,
        node::Node,
    },
    types::{ItemIdentity, Jid, NodeIdentity, ServiceId},
};

use super::{
    BulkWriteOutcome, ItemBatch, ItemWriter, PersistError, PersistResult, PubSubStore,
    delivers_directly_to, write_items_with_retry,
};

#[derive(Debug, Default)]
struct MemoryState {
    nodes: HashMap<NodeIdentity, Node>,
    affiliations: HashMap<NodeIdentity, Vec<NodeAffiliate>>,
    subscriptions: HashMap<NodeIdentity, Vec<NodeSubscription>>,
    items: HashMap<ItemIdentity, PublishedItem>,
    defaults: HashMap<(ServiceId, bool), DefaultNodeConfiguration>,
}

impl MemoryState {
    fn hydrate(&self, node: &Node) -> Node {
        let mut node = node.clone();
        let id = node.identity().clone();
        node.restore_membership(
            self.affiliations.get(&id).cloned().unwrap_or_default(),
            self.subscriptions.get(&id).cloned().unwrap_or_default(),
        );
        node.set_saved_to_db(true);
        node
    }
}

/// In-memory implementation of [`crate::persist::PubSubStore`] with the
/// same key constraints as the SQLite schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items across all nodes.
    pub fn item_count(&self) -> usize {
        self.state.lock().items.len()
    }
}

fn duplicate(what: String) -> PersistError {
    PersistError::Message(format!("duplicate {what}"))
}

fn missing(what: String) -> PersistError {
    PersistError::Message(format!("{what} not found"))
}

impl PubSubStore for MemoryStore {
    fn create_node(&self, node: &Node) -> PersistResult<()> {
        let mut state = self.state.lock();
        let id = node.identity().clone();
        if state.nodes.contains_key(&id) {
            return Err(duplicate(format!("node {id}")));
        }
        state.nodes.insert(id, node.clone());
        Ok(())
    }

    fn update_node(&self, node: &Node) -> PersistResult<()> {
        let mut state = self.state.lock();
        let id = node.identity();
        let slot = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| missing(format!("node {id}")))?;
        *slot = node.clone();
        Ok(())
    }

    fn remove_node(&self, id: &NodeIdentity) -> PersistResult<()> {
        let mut state = self.state.lock();
        state.nodes.remove(id);
        state.affiliations.remove(id);
        state.subscriptions.remove(id);
        state.items.retain(|key, _| key.node != *id);
        Ok(())
    }

    fn create_affiliation(&self, affiliate: &NodeAffiliate) -> PersistResult<()> {
        let mut state = self.state.lock();
        let rows = state.affiliations.entry(affiliate.node.clone()).or_default();
        if rows.iter().any(|a| a.jid == affiliate.jid) {
            return Err(duplicate(format!("affiliation of {}", affiliate.jid)));
        }
        rows.push(affiliate.clone());
        Ok(())
    }

    fn update_affiliation(&self, affiliate: &NodeAffiliate) -> PersistResult<()> {
        let mut state = self.state.lock();
        let row = state
            .affiliations
            .get_mut(&affiliate.node)
            .and_then(|rows| rows.iter_mut().find(|a| a.jid == affiliate.jid))
            .ok_or_else(|| missing(format!("affiliation of {}", affiliate.jid)))?;
        row.affiliation = affiliate.affiliation;
        Ok(())
    }

    fn remove_affiliation(&self, affiliate: &NodeAffiliate) -> PersistResult<()> {
        if let Some(rows) = self.state.lock().affiliations.get_mut(&affiliate.node) {
            rows.retain(|a| a.jid != affiliate.jid);
        }
        Ok(())
    }

    fn create_subscription(&self, sub: &NodeSubscription) -> PersistResult<()> {
        let mut state = self.state.lock();
        let rows = state.subscriptions.entry(sub.node.clone()).or_default();
        if rows.iter().any(|s| s.id == sub.id) {
            return Err(duplicate(format!("subscription {}", sub.id)));
        }
        rows.push(sub.clone());
        Ok(())
    }

    fn update_subscription(&self, sub: &NodeSubscription) -> PersistResult<()> {
        let mut state = self.state.lock();
        let row = state
            .subscriptions
            .get_mut(&sub.node)
            .and_then(|rows| rows.iter_mut().find(|s| s.id == sub.id))
            .ok_or_else(|| missing(format!("subscription {}", sub.id)))?;
        *row = sub.clone();
        Ok(())
    }

    fn remove_subscription(&self, sub: &NodeSubscription) -> PersistResult<()> {
        if let Some(rows) = self.state.lock().subscriptions.get_mut(&sub.node) {
            rows.retain(|s| s.id != sub.id);
        }
        Ok(())
    }

    fn bulk_write_items(&self, batch: &ItemBatch) -> BulkWriteOutcome {
        let mut writer = MemoryItemWriter {
            state: self.state.lock(),
            undo: Vec::new(),
        };
        write_items_with_retry(&mut writer, batch)
    }

    fn load_nodes(&self, service: &ServiceId) -> PersistResult<Vec<Node>> {
        let state = self.state.lock();
        let mut nodes: Vec<Node> = state
            .nodes
            .values()
            .filter(|node| service.owns(node.identity()))
            .map(|node| state.hydrate(node))
            .collect();
        nodes.sort_by_key(|node| node.created_ms());
        Ok(nodes)
    }

    fn load_node(&self, id: &NodeIdentity) -> PersistResult<Option<Node>> {
        let state = self.state.lock();
        Ok(state.nodes.get(id).map(|node| state.hydrate(node)))
    }

    fn load_subscription(
        &self,
        node: &NodeIdentity,
        sub_id: &str,
    ) -> PersistResult<Option<NodeSubscription>> {
        Ok(self
            .state
            .lock()
            .subscriptions
            .get(node)
            .and_then(|rows| rows.iter().find(|s| s.id == sub_id).cloned()))
    }

    fn find_directly_subscribed_nodes(&self, address: &Jid) -> PersistResult<Vec<NodeIdentity>> {
        let state = self.state.lock();
        let mut out: Vec<NodeIdentity> = state
            .subscriptions
            .iter()
            .filter(|(_, rows)| {
                rows.iter().any(|s| {
                    s.state == SubscriptionState::Subscribed && delivers_directly_to(&s.jid, address)
                })
            })
            .map(|(id, _)| id.clone())
            .collect();
        out.sort();
        Ok(out)
    }

    fn get_published_item(&self, id: &ItemIdentity) -> PersistResult<Option<PublishedItem>> {
        Ok(self.state.lock().items.get(id).cloned())
    }

    fn get_published_items(
        &self,
        node: &NodeIdentity,
        max_rows: usize,
    ) -> PersistResult<Vec<PublishedItem>> {
        let state = self.state.lock();
        let mut items: Vec<PublishedItem> = state
            .items
            .values()
            .filter(|item| item.node == *node)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            b.created_ms
                .cmp(&a.created_ms)
                .then_with(|| b.item_id.cmp(&a.item_id))
        });
        items.truncate(max_rows);
        Ok(items)
    }

    fn get_last_published_item(
        &self,
        node: &NodeIdentity,
    ) -> PersistResult<Option<PublishedItem>> {
        Ok(self.get_published_items(node, 1)?.into_iter().next())
    }

    fn purge_node(&self, node: &NodeIdentity) -> PersistResult<()> {
        self.state.lock().items.retain(|key, _| key.node != *node);
        Ok(())
    }

    fn load_default_configuration(
        &self,
        service: &ServiceId,
        leaf: bool,
    ) -> PersistResult<Option<DefaultNodeConfiguration>> {
        Ok(self
            .state
            .lock()
            .defaults
            .get(&(service.clone(), leaf))
            .cloned())
    }

    fn create_default_configuration(
        &self,
        service: &ServiceId,
        config: &DefaultNodeConfiguration,
    ) -> PersistResult<()> {
        let mut state = self.state.lock();
        let key = (service.clone(), config.leaf);
        if state.defaults.contains_key(&key) {
            return Err(duplicate(format!("default configuration for {service}")));
        }
        state.defaults.insert(key, config.clone());
        Ok(())
    }

    fn update_default_configuration(
        &self,
        service: &ServiceId,
        config: &DefaultNodeConfiguration,
    ) -> PersistResult<()> {
        let mut state = self.state.lock();
        let slot = state
            .defaults
            .get_mut(&(service.clone(), config.leaf))
            .ok_or_else(|| missing(format!("default configuration for {service}")))?;
        *slot = config.clone();
        Ok(())
    }
}

enum Undo {
    Restore(PublishedItem),
    Remove(ItemIdentity),
}

/// Applies writes directly and keeps an undo log for rollback.
struct MemoryItemWriter<'a> {
    state: MutexGuard<'a, MemoryState>,
    undo: Vec<Undo>,
}

impl ItemWriter for MemoryItemWriter<'_> {
    fn delete_item(&mut self, id: &ItemIdentity) -> PersistResult<()> {
        if let Some(prev) = self.state.items.remove(id) {
            self.undo.push(Undo::Restore(prev));
        }
        Ok(())
    }

    fn insert_item(&mut self, item: &PublishedItem) -> PersistResult<()> {
        let id = item.identity();
        if self.state.items.contains_key(&id) {
            return Err(duplicate(format!("item {id}")));
        }
        self.state.items.insert(id.clone(), item.clone());
        self.undo.push(Undo::Remove(id));
        Ok(())
    }

    fn commit(&mut self) -> PersistResult<()> {
        self.undo.clear();
        Ok(())
    }

    fn rollback(&mut self) -> PersistResult<()> {
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Restore(item) => {
                    self.state.items.insert(item.identity(), item);
                }
                Undo::Remove(id) => {
                    self.state.items.remove(&id);
                }
            }
        }
        Ok(())
    }
}
