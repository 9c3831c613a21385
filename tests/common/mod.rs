#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use pubsubcache::{
    cache::CachingProvider,
    config::{CacheConfig, ServiceConfig},
    item::PublishedItem,
    model::{NodeAffiliate, NodeSubscription, config::DefaultNodeConfiguration, node::Node},
    persist::{
        BulkWriteOutcome, ItemBatch, PersistError, PersistResult, PubSubStore,
        memory::MemoryStore,
    },
    service::{PresenceTracker, PubSubService},
    types::{ItemIdentity, Jid, NodeIdentity, ServiceId},
};

pub const SERVICE: &str = "pubsub.example.org";

pub fn service_id() -> ServiceId {
    ServiceId::new(SERVICE)
}

pub fn node_id(node: &str) -> NodeIdentity {
    NodeIdentity::new(service_id(), node)
}

pub fn item(node: &str, item_id: &str, payload: &str) -> PublishedItem {
    PublishedItem::new(
        node_id(node),
        item_id,
        Jid::new("alice@example.org"),
        Some(payload.to_string()),
    )
}

/// Memory store that records every write call and can be told to fail.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    calls: Mutex<Vec<String>>,
    pub item_reads: AtomicUsize,
    pub fail_item_writes: AtomicBool,
    pub fail_node_writes: AtomicBool,
    pub bulk_delay_ms: AtomicUsize,
    pub item_read_delay_ms: AtomicUsize,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().expect("lock").clear();
    }

    pub fn item_count(&self) -> usize {
        self.inner.item_count()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("lock").push(call);
    }

    fn node_write(&self, call: String) -> PersistResult<()> {
        self.record(call);
        if self.fail_node_writes.load(Ordering::SeqCst) {
            return Err(PersistError::Message("injected failure".to_string()));
        }
        Ok(())
    }
}

impl PubSubStore for RecordingStore {
    fn create_node(&self, node: &Node) -> PersistResult<()> {
        self.node_write(format!("create_node {}", node.identity()))?;
        self.inner.create_node(node)
    }

    fn update_node(&self, node: &Node) -> PersistResult<()> {
        self.node_write(format!("update_node {}", node.identity()))?;
        self.inner.update_node(node)
    }

    fn remove_node(&self, node: &NodeIdentity) -> PersistResult<()> {
        self.node_write(format!("remove_node {node}"))?;
        self.inner.remove_node(node)
    }

    fn create_affiliation(&self, affiliate: &NodeAffiliate) -> PersistResult<()> {
        self.node_write(format!("create_affiliation {} {}", affiliate.node, affiliate.jid))?;
        self.inner.create_affiliation(affiliate)
    }

    fn update_affiliation(&self, affiliate: &NodeAffiliate) -> PersistResult<()> {
        self.node_write(format!("update_affiliation {} {}", affiliate.node, affiliate.jid))?;
        self.inner.update_affiliation(affiliate)
    }

    fn remove_affiliation(&self, affiliate: &NodeAffiliate) -> PersistResult<()> {
        self.node_write(format!("remove_affiliation {} {}", affiliate.node, affiliate.jid))?;
        self.inner.remove_affiliation(affiliate)
    }

    fn create_subscription(&self, sub: &NodeSubscription) -> PersistResult<()> {
        self.node_write(format!("create_subscription {} {}", sub.node, sub.jid))?;
        self.inner.create_subscription(sub)
    }

    fn update_subscription(&self, sub: &NodeSubscription) -> PersistResult<()> {
        self.node_write(format!("update_subscription {} {}", sub.node, sub.jid))?;
        self.inner.update_subscription(sub)
    }

    fn remove_subscription(&self, sub: &NodeSubscription) -> PersistResult<()> {
        self.node_write(format!("remove_subscription {} {}", sub.node, sub.jid))?;
        self.inner.remove_subscription(sub)
    }

    fn bulk_write_items(&self, batch: &ItemBatch) -> BulkWriteOutcome {
        let node = batch
            .deletes
            .first()
            .map(|id| id.node.to_string())
            .unwrap_or_default();
        self.record(format!(
            "bulk_write_items {node} adds={} deletes={}",
            batch.adds.len(),
            batch.deletes.len()
        ));
        let delay = self.bulk_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay as u64));
        }
        if self.fail_item_writes.load(Ordering::SeqCst) {
            return BulkWriteOutcome::RolledBack {
                lost_adds: batch.adds.len(),
                lost_deletes: batch.deletes.len(),
                reason: "injected failure".to_string(),
            };
        }
        self.inner.bulk_write_items(batch)
    }

    fn load_nodes(&self, service: &ServiceId) -> PersistResult<Vec<Node>> {
        self.inner.load_nodes(service)
    }

    fn load_node(&self, id: &NodeIdentity) -> PersistResult<Option<Node>> {
        self.inner.load_node(id)
    }

    fn load_subscription(
        &self,
        node: &NodeIdentity,
        sub_id: &str,
    ) -> PersistResult<Option<NodeSubscription>> {
        self.inner.load_subscription(node, sub_id)
    }

    fn find_directly_subscribed_nodes(&self, address: &Jid) -> PersistResult<Vec<NodeIdentity>> {
        self.inner.find_directly_subscribed_nodes(address)
    }

    fn get_published_item(&self, id: &ItemIdentity) -> PersistResult<Option<PublishedItem>> {
        self.item_reads.fetch_add(1, Ordering::SeqCst);
        let found = self.inner.get_published_item(id);
        let delay = self.item_read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay as u64));
        }
        found
    }

    fn get_published_items(
        &self,
        node: &NodeIdentity,
        max_rows: usize,
    ) -> PersistResult<Vec<PublishedItem>> {
        self.inner.get_published_items(node, max_rows)
    }

    fn get_last_published_item(
        &self,
        node: &NodeIdentity,
    ) -> PersistResult<Option<PublishedItem>> {
        self.inner.get_last_published_item(node)
    }

    fn purge_node(&self, node: &NodeIdentity) -> PersistResult<()> {
        self.record(format!("purge_node {node}"));
        self.inner.purge_node(node)
    }

    fn load_default_configuration(
        &self,
        service: &ServiceId,
        leaf: bool,
    ) -> PersistResult<Option<DefaultNodeConfiguration>> {
        self.inner.load_default_configuration(service, leaf)
    }

    fn create_default_configuration(
        &self,
        service: &ServiceId,
        config: &DefaultNodeConfiguration,
    ) -> PersistResult<()> {
        self.inner.create_default_configuration(service, config)
    }

    fn update_default_configuration(
        &self,
        service: &ServiceId,
        config: &DefaultNodeConfiguration,
    ) -> PersistResult<()> {
        self.inner.update_default_configuration(service, config)
    }
}

/// Presence tracker that remembers what it was told.
#[derive(Default)]
pub struct RecordingPresence {
    events: Mutex<Vec<(bool, String, Jid)>>,
}

impl RecordingPresence {
    /// `(required, node id, jid)` in arrival order.
    pub fn events(&self) -> Vec<(bool, String, Jid)> {
        self.events.lock().expect("lock").clone()
    }
}

impl PresenceTracker for RecordingPresence {
    fn presence_required(&self, node: &NodeIdentity, jid: &Jid) {
        self.events
            .lock()
            .expect("lock")
            .push((true, node.node_id.clone(), jid.clone()));
    }

    fn presence_not_required(&self, node: &NodeIdentity, jid: &Jid) {
        self.events
            .lock()
            .expect("lock")
            .push((false, node.node_id.clone(), jid.clone()));
    }
}

/// Provider with the periodic timer and threshold disabled.
pub fn quiet_config() -> CacheConfig {
    CacheConfig {
        max_items_flush: 0,
        ..CacheConfig::default()
    }
}

pub struct Harness {
    pub store: Arc<RecordingStore>,
    pub provider: Arc<CachingProvider>,
    pub presence: Arc<RecordingPresence>,
    pub service: PubSubService,
}

pub fn harness_with(config: ServiceConfig, cache: CacheConfig) -> Harness {
    let store = Arc::new(RecordingStore::new());
    let provider = Arc::new(CachingProvider::new(store.clone(), cache));
    let presence = Arc::new(RecordingPresence::default());
    let service = PubSubService::start(service_id(), config, provider.clone(), presence.clone())
        .expect("start service");
    Harness {
        store,
        provider,
        presence,
        service,
    }
}

pub fn harness() -> Harness {
    harness_with(ServiceConfig::default(), quiet_config())
}
