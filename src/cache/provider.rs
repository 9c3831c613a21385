//! Write-behind caching provider.
//!
//! Mutations are queued per node and coalesced, published items are queued
//! for one bulk write per node, and recently seen items are kept in a
//! read-through cache. Reads flush the node they touch before asking the
//! store, so the store always reflects every write enqueued before the read.
//!
//! Lock order: node flush stripe, then the pending-items mutex, then cache
//! shards. Item read stripes are never held together with a flush stripe.
//! No lock is held across a cluster round-trip.

use std::{
    collections::BTreeMap,
    ops::AddAssign,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};

use crate::{
    cluster::{ClusterCoordinator, ClusterTask, ClusterTaskHandler},
    config::CacheConfig,
    item::PublishedItem,
    model::{NodeAffiliate, NodeSubscription, config::DefaultNodeConfiguration, node::Node},
    op::{NodeAction, NodeOperation, OperationPayload},
    persist::{BulkWriteOutcome, ItemBatch, PersistError, PersistResult, PubSubStore},
    types::{ItemIdentity, Jid, NodeIdentity, ServiceId},
};

use super::{
    events::CacheEvent,
    pending::{PendingItems, PendingOperations},
    stripes::{LOCK_STRIPES, LockStripes},
    worker::FlushTrigger,
};

/// What one flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Node, affiliation and subscription operations applied.
    pub operations: usize,
    /// Operations the store rejected. They are not retried.
    pub failed_operations: usize,
    pub items_added: usize,
    pub items_deleted: usize,
    /// Adds dropped with a rolled-back batch.
    pub items_lost: usize,
}

impl AddAssign for FlushReport {
    fn add_assign(&mut self, rhs: Self) {
        self.operations += rhs.operations;
        self.failed_operations += rhs.failed_operations;
        self.items_added += rhs.items_added;
        self.items_deleted += rhs.items_deleted;
        self.items_lost += rhs.items_lost;
    }
}

/// Write-behind coordinator in front of a [`PubSubStore`].
pub struct CachingProvider {
    store: Arc<dyn PubSubStore>,
    config: CacheConfig,
    cluster: Option<Arc<dyn ClusterCoordinator>>,
    nodes_to_process: DashMap<NodeIdentity, PendingOperations>,
    items: Mutex<PendingItems>,
    item_cache: DashMap<ItemIdentity, PublishedItem>,
    flush_locks: LockStripes,
    item_locks: LockStripes,
    /// Bumped under the item stripe whenever a cached item is removed.
    item_removals: [AtomicU64; LOCK_STRIPES],
    events_tx: broadcast::Sender<CacheEvent>,
    flush_trigger: OnceLock<FlushTrigger>,
    flush_scheduled: AtomicBool,
}

impl CachingProvider {
    pub fn new(store: Arc<dyn PubSubStore>, config: CacheConfig) -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            store,
            config,
            cluster: None,
            nodes_to_process: DashMap::new(),
            items: Mutex::new(PendingItems::new()),
            item_cache: DashMap::new(),
            flush_locks: LockStripes::new(),
            item_locks: LockStripes::new(),
            item_removals: std::array::from_fn(|_| AtomicU64::new(0)),
            events_tx,
            flush_trigger: OnceLock::new(),
            flush_scheduled: AtomicBool::new(false),
        }
    }

    /// Provider whose reads and explicit flushes reach the other members of
    /// `cluster` first.
    pub fn with_cluster(
        store: Arc<dyn PubSubStore>,
        config: CacheConfig,
        cluster: Arc<dyn ClusterCoordinator>,
    ) -> Self {
        Self {
            cluster: Some(cluster),
            ..Self::new(store, config)
        }
    }

    pub fn store(&self) -> &Arc<dyn PubSubStore> {
        &self.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_clustered(&self) -> bool {
        self.cluster.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events_tx.subscribe()
    }

    pub(crate) fn attach_flush_trigger(&self, trigger: FlushTrigger) -> bool {
        self.flush_trigger.set(trigger).is_ok()
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Queues `op` behind the node's other pending operations.
    pub fn enqueue(&self, op: NodeOperation) {
        debug!(node = %op.identity(), action = ?op.action(), "enqueue node operation");
        self.nodes_to_process
            .entry(op.identity().clone())
            .or_default()
            .push(op);
    }

    /// Queues a node insert. A parentless collection is the root of a
    /// service and is written immediately.
    pub fn create_node(&self, node: &Node) {
        self.enqueue(NodeOperation::create(node));
        if node.is_collection() && node.parent().is_none() {
            self.flush_node_operations(node.identity());
        }
    }

    pub fn update_node(&self, node: &Node) {
        self.enqueue(NodeOperation::update(node));
    }

    /// Queues a node delete. Items still waiting for the node are dropped.
    pub fn remove_node(&self, node: &Node) {
        if node.is_leaf() {
            self.drop_pending_items(node.identity());
        }
        self.enqueue(NodeOperation::remove(node));
    }

    pub fn create_affiliation(&self, affiliate: &NodeAffiliate) {
        self.enqueue(NodeOperation::create_affiliation(affiliate));
    }

    pub fn update_affiliation(&self, affiliate: &NodeAffiliate) {
        self.enqueue(NodeOperation::update_affiliation(affiliate));
    }

    pub fn remove_affiliation(&self, affiliate: &NodeAffiliate) {
        self.enqueue(NodeOperation::remove_affiliation(affiliate));
    }

    pub fn create_subscription(&self, sub: &NodeSubscription) {
        self.enqueue(NodeOperation::create_subscription(sub));
    }

    pub fn update_subscription(&self, sub: &NodeSubscription) {
        self.enqueue(NodeOperation::update_subscription(sub));
    }

    pub fn remove_subscription(&self, sub: &NodeSubscription) {
        self.enqueue(NodeOperation::remove_subscription(sub));
    }

    /// Snapshot of the operations waiting for `node`.
    pub fn pending_operations(&self, node: &NodeIdentity) -> Option<PendingOperations> {
        self.nodes_to_process.get(node).map(|ops| ops.clone())
    }

    /// Nodes that currently have pending operations.
    pub fn pending_nodes(&self) -> Vec<NodeIdentity> {
        let mut nodes: Vec<NodeIdentity> = self
            .nodes_to_process
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        nodes.sort();
        nodes
    }

    pub fn pending_item_adds(&self) -> Vec<PublishedItem> {
        self.items.lock().pending_adds().to_vec()
    }

    pub fn pending_item_deletes(&self) -> Vec<ItemIdentity> {
        self.items.lock().pending_deletes().to_vec()
    }

    /// Items queued for insertion, counted once per identity.
    pub fn pending_item_count(&self) -> usize {
        self.items.lock().in_flight_len()
    }

    /// Cache lookup without touching the store.
    pub fn cached_item(&self, id: &ItemIdentity) -> Option<PublishedItem> {
        self.item_cache.get(id).map(|item| item.clone())
    }

    /// Makes `item` visible to readers at once and queues it for the store.
    pub fn save_published_item(&self, item: PublishedItem) {
        let id = item.identity();
        debug!(item = %id, "save published item");
        self.item_cache.insert(id, item.clone());

        let pending = {
            let mut items = self.items.lock();
            items.save(item);
            items.in_flight_len()
        };
        if self.config.max_items_flush > 0 && pending > self.config.max_items_flush {
            self.schedule_full_flush(pending);
        }
    }

    /// Hides the item from readers and queues its delete.
    pub fn remove_published_item(&self, id: &ItemIdentity) {
        debug!(item = %id, "remove published item");
        let _guard = self.item_locks.lock(id);
        self.item_removals[self.item_locks.stripe_of(id)].fetch_add(1, Ordering::AcqRel);
        self.item_cache.remove(id);
        self.items.lock().remove(id.clone());
    }

    /// Drops pending and cached items of `node` and deletes its stored items.
    pub fn purge_node(&self, node: &NodeIdentity) -> PersistResult<()> {
        debug!(node = %node, "purge node items");
        self.drop_pending_items(node);
        self.store.purge_node(node)
    }

    fn drop_pending_items(&self, node: &NodeIdentity) {
        let _guards = self.item_locks.lock_all();
        for removals in &self.item_removals {
            removals.fetch_add(1, Ordering::AcqRel);
        }
        self.items.lock().purge_node(node);
        self.item_cache.retain(|id, _| id.node != *node);
    }

    fn schedule_full_flush(&self, pending: usize) {
        if self.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.flush_trigger.get() {
            Some(trigger) if trigger.request() => {
                debug!(pending, "pending item threshold reached; full flush scheduled");
            }
            _ => {
                debug!(pending, "pending item threshold reached; no flush worker, flushing inline");
                self.flush_pending_changes(false);
            }
        }
    }

    /// Flushes one node: its pending operations in order, then its pending
    /// items. Other nodes' queues are left alone. With `send_to_cluster`
    /// the other members flush the node first.
    pub fn flush_pending_node_changes(
        &self,
        node: &NodeIdentity,
        send_to_cluster: bool,
    ) -> FlushReport {
        if send_to_cluster {
            self.flush_cluster(Some(node));
        }

        let _guard = self.flush_locks.lock(node);
        let mut report = self.apply_pending_operations(node);
        let (adds, deletes) = {
            let mut items = self.items.lock();
            let (adds, deletes) = items.take_node(node);
            self.prime_cache(&adds);
            (adds, deletes)
        };
        report += self.write_items(node, adds, deletes);
        report
    }

    /// Flushes everything. With `send_to_cluster` the other members flush
    /// first. A second pass picks up writes enqueued during the first.
    pub fn flush_pending_changes(&self, send_to_cluster: bool) -> FlushReport {
        self.flush_scheduled.store(false, Ordering::Release);
        if send_to_cluster {
            self.flush_cluster(None);
        }
        let mut report = self.drain_all();
        report += self.drain_all();
        debug!(?report, "full flush finished");
        report
    }

    /// Applies pending operations of every node owned by `service`. Items
    /// stay queued.
    pub fn flush_service(&self, service: &ServiceId) -> FlushReport {
        trace!(service = %service, "flush service operations");
        let mut report = FlushReport::default();
        for node in self.pending_nodes() {
            if service.owns(&node) {
                report += self.flush_node_operations(&node);
            }
        }
        report
    }

    fn drain_all(&self) -> FlushReport {
        let mut report = FlushReport::default();
        for node in self.pending_nodes() {
            report += self.flush_node_operations(&node);
        }

        let guards = self.flush_locks.lock_all();
        let (adds, deletes) = {
            let mut items = self.items.lock();
            if items.is_empty() {
                return report;
            }
            let (adds, deletes) = items.take_all();
            self.prime_cache(&adds);
            (adds, deletes)
        };

        let mut by_node: BTreeMap<NodeIdentity, (Vec<PublishedItem>, Vec<ItemIdentity>)> =
            BTreeMap::new();
        for item in adds {
            by_node.entry(item.node.clone()).or_default().0.push(item);
        }
        for id in deletes {
            by_node.entry(id.node.clone()).or_default().1.push(id);
        }

        let mut by_stripe: Vec<Vec<(NodeIdentity, Vec<PublishedItem>, Vec<ItemIdentity>)>> =
            guards.iter().map(|_| Vec::new()).collect();
        for (node, (adds, deletes)) in by_node {
            by_stripe[self.flush_locks.stripe_of(&node)].push((node, adds, deletes));
        }
        for (guard, batches) in guards.into_iter().zip(by_stripe) {
            for (node, adds, deletes) in batches {
                report += self.write_items(&node, adds, deletes);
            }
            drop(guard);
        }
        report
    }

    fn flush_node_operations(&self, node: &NodeIdentity) -> FlushReport {
        let _guard = self.flush_locks.lock(node);
        self.apply_pending_operations(node)
    }

    /// Caller holds the node's flush stripe.
    fn apply_pending_operations(&self, node: &NodeIdentity) -> FlushReport {
        let Some((_, ops)) = self.nodes_to_process.remove(node) else {
            return FlushReport::default();
        };
        trace!(node = %node, count = ops.len(), "applying pending operations");

        let mut report = FlushReport::default();
        for op in ops.into_vec() {
            report.operations += 1;
            if let Err(err) = self.apply(&op) {
                report.failed_operations += 1;
                error!(node = %node, action = ?op.action(), error = %err, "store write failed");
                self.emit(CacheEvent::StoreWriteFailed {
                    node: node.clone(),
                    action: op.action(),
                    reason: err.to_string(),
                });
            }
        }
        self.emit(CacheEvent::NodeFlushed {
            node: node.clone(),
            operations: report.operations,
        });
        report
    }

    fn apply(&self, op: &NodeOperation) -> PersistResult<()> {
        match (op.action(), op.payload()) {
            (NodeAction::Create, OperationPayload::Node(node)) => self.store.create_node(node),
            (NodeAction::Update, OperationPayload::Node(node)) => self.store.update_node(node),
            (NodeAction::Remove, OperationPayload::Node(node)) => {
                self.store.remove_node(node.identity())
            }
            (NodeAction::CreateAffiliation, OperationPayload::Affiliate(a)) => {
                self.store.create_affiliation(a)
            }
            (NodeAction::UpdateAffiliation, OperationPayload::Affiliate(a)) => {
                self.store.update_affiliation(a)
            }
            (NodeAction::RemoveAffiliation, OperationPayload::Affiliate(a)) => {
                self.store.remove_affiliation(a)
            }
            (NodeAction::CreateSubscription, OperationPayload::Subscription(s)) => {
                self.store.create_subscription(s)
            }
            (NodeAction::UpdateSubscription, OperationPayload::Subscription(s)) => {
                self.store.update_subscription(s)
            }
            (NodeAction::RemoveSubscription, OperationPayload::Subscription(s)) => {
                self.store.remove_subscription(s)
            }
            (action, _) => Err(PersistError::Message(format!(
                "payload does not match action {action:?}"
            ))),
        }
    }

    /// Keeps adds readable while they are written. Caller holds the
    /// pending-items mutex.
    fn prime_cache(&self, adds: &[PublishedItem]) {
        let mut copied = 0usize;
        for item in adds {
            self.item_cache.entry(item.identity()).or_insert_with(|| {
                copied += 1;
                item.clone()
            });
        }
        if copied > 0 {
            trace!(copied, "pending items copied to the item cache");
        }
    }

    fn write_items(
        &self,
        node: &NodeIdentity,
        adds: Vec<PublishedItem>,
        deletes: Vec<ItemIdentity>,
    ) -> FlushReport {
        let mut report = FlushReport::default();
        if adds.is_empty() && deletes.is_empty() {
            return report;
        }
        let batch = ItemBatch::plan(adds, deletes);
        match self.store.bulk_write_items(&batch) {
            BulkWriteOutcome::Empty => {}
            BulkWriteOutcome::Batched { deleted, added }
            | BulkWriteOutcome::Individually { deleted, added } => {
                debug!(node = %node, added, deleted, "item batch written");
                report.items_added = added;
                report.items_deleted = deleted;
                self.emit(CacheEvent::ItemsWritten {
                    node: node.clone(),
                    added,
                    deleted,
                });
            }
            BulkWriteOutcome::RolledBack {
                lost_adds,
                lost_deletes,
                reason,
            } => {
                report.items_lost = lost_adds;
                self.emit(CacheEvent::ItemBatchLost {
                    node: node.clone(),
                    lost_adds,
                    lost_deletes,
                    reason,
                });
            }
        }
        report
    }

    fn flush_cluster(&self, node: Option<&NodeIdentity>) {
        let Some(cluster) = &self.cluster else {
            return;
        };
        let task = ClusterTask::Flush {
            node: node.cloned(),
        };
        if let Err(err) = cluster.run_on_all_members(&task, true) {
            warn!(node = ?node, error = %err, "cluster flush not confirmed; flushing locally");
            self.emit(CacheEvent::ClusterFlushFailed {
                node: node.cloned(),
                reason: err.to_string(),
            });
        }
    }

    /// Loads every node of `service` after applying its pending operations.
    pub fn load_nodes(&self, service: &ServiceId) -> PersistResult<Vec<Node>> {
        self.flush_service(service);
        self.store.load_nodes(service)
    }

    pub fn load_node(&self, id: &NodeIdentity) -> PersistResult<Option<Node>> {
        self.flush_node_operations(id);
        self.store.load_node(id)
    }

    pub fn load_subscription(
        &self,
        node: &NodeIdentity,
        sub_id: &str,
    ) -> PersistResult<Option<NodeSubscription>> {
        self.flush_node_operations(node);
        self.store.load_subscription(node, sub_id)
    }

    pub fn find_directly_subscribed_nodes(&self, address: &Jid) -> PersistResult<Vec<NodeIdentity>> {
        for node in self.pending_nodes() {
            self.flush_node_operations(&node);
        }
        self.store.find_directly_subscribed_nodes(address)
    }

    /// Newest first, at most `max_rows`.
    pub fn get_published_items(
        &self,
        node: &NodeIdentity,
        max_rows: usize,
    ) -> PersistResult<Vec<PublishedItem>> {
        self.flush_pending_node_changes(node, self.is_clustered());
        self.store.get_published_items(node, max_rows)
    }

    pub fn get_last_published_item(
        &self,
        node: &NodeIdentity,
    ) -> PersistResult<Option<PublishedItem>> {
        self.flush_pending_node_changes(node, self.is_clustered());
        self.store.get_last_published_item(node)
    }

    /// Cached item, or the stored one which is then cached.
    ///
    /// The miss path re-checks the cache under the item's stripe before
    /// going to the store, and does not overwrite an entry a writer primed
    /// while the store was being read. If an item on the stripe was removed
    /// during the read, the stored copy is discarded and the cache decides.
    pub fn get_published_item(&self, id: &ItemIdentity) -> PersistResult<Option<PublishedItem>> {
        self.flush_pending_node_changes(&id.node, self.is_clustered());

        if let Some(item) = self.cached_item(id) {
            trace!(item = %id, "item cache hit");
            return Ok(Some(item));
        }
        let stripe = self.item_locks.stripe_of(id);
        let removals = {
            let _guard = self.item_locks.lock(id);
            if let Some(item) = self.cached_item(id) {
                trace!(item = %id, "item cache hit after lock");
                return Ok(Some(item));
            }
            self.item_removals[stripe].load(Ordering::Acquire)
        };

        trace!(item = %id, "item cache miss");
        let Some(item) = self.store.get_published_item(id)? else {
            return Ok(None);
        };
        let _guard = self.item_locks.lock(id);
        if self.item_removals[stripe].load(Ordering::Acquire) != removals {
            debug!(item = %id, "item removed during store read; not caching");
            return Ok(self.cached_item(id));
        }
        Ok(Some(
            self.item_cache
                .entry(id.clone())
                .or_insert(item)
                .value()
                .clone(),
        ))
    }

    pub fn load_default_configuration(
        &self,
        service: &ServiceId,
        leaf: bool,
    ) -> PersistResult<Option<DefaultNodeConfiguration>> {
        self.store.load_default_configuration(service, leaf)
    }

    pub fn create_default_configuration(
        &self,
        service: &ServiceId,
        config: &DefaultNodeConfiguration,
    ) -> PersistResult<()> {
        self.store.create_default_configuration(service, config)
    }

    pub fn update_default_configuration(
        &self,
        service: &ServiceId,
        config: &DefaultNodeConfiguration,
    ) -> PersistResult<()> {
        self.store.update_default_configuration(service, config)
    }

    /// Local full flush, for orderly shutdown.
    pub fn shutdown(&self) -> FlushReport {
        debug!("flushing pending changes before shutdown");
        self.flush_pending_changes(false)
    }
}

impl ClusterTaskHandler for CachingProvider {
    fn execute_cluster_task(&self, task: &ClusterTask) {
        trace!(?task, "executing cluster task");
        match task {
            ClusterTask::Flush { node: Some(node) } => {
                self.flush_pending_node_changes(node, false);
            }
            ClusterTask::Flush { node: None } => {
                self.flush_pending_changes(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::memory::MemoryStore;

    fn provider() -> (Arc<MemoryStore>, CachingProvider) {
        let store = Arc::new(MemoryStore::new());
        let provider = CachingProvider::new(store.clone(), CacheConfig::default());
        (store, provider)
    }

    fn leaf(id: &str) -> Node {
        Node::new_leaf(
            NodeIdentity::new(ServiceId::new("svc"), id),
            None,
            Jid::new("owner@x"),
            &DefaultNodeConfiguration::leaf(),
        )
    }

    #[test]
    fn root_collection_is_written_immediately() {
        let (store, provider) = provider();
        let root = Node::new_collection(
            NodeIdentity::new(ServiceId::new("svc"), ""),
            None,
            Jid::new("svc"),
            &DefaultNodeConfiguration::collection(),
        );
        provider.create_node(&root);
        assert!(provider.pending_operations(root.identity()).is_none());
        assert!(store.load_node(root.identity()).unwrap().is_some());
    }

    #[test]
    fn failed_operation_is_reported_not_retried() {
        let (_store, provider) = provider();
        let n = leaf("n");
        let mut events = provider.subscribe();
        provider.update_node(&n);

        let report = provider.flush_pending_node_changes(n.identity(), false);
        assert_eq!(report.failed_operations, 1);
        assert!(provider.pending_operations(n.identity()).is_none());
        assert!(matches!(
            events.try_recv().unwrap(),
            CacheEvent::StoreWriteFailed {
                action: NodeAction::Update,
                ..
            }
        ));
    }

    #[test]
    fn removing_a_leaf_drops_its_pending_items() {
        let (_store, provider) = provider();
        let n = leaf("n");
        provider.create_node(&n);
        let item = PublishedItem::new(n.identity().clone(), "a", Jid::new("p@x"), None);
        provider.save_published_item(item.clone());
        provider.remove_node(&n);

        assert!(provider.pending_item_adds().is_empty());
        assert!(provider.cached_item(&item.identity()).is_none());
        assert_eq!(
            provider.pending_operations(n.identity()).unwrap().actions(),
            vec![NodeAction::Remove]
        );
    }
}
