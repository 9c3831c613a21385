mod common;

use std::{
    sync::{Arc, atomic::Ordering},
    thread,
    time::Duration,
};

use pubsubcache::{
    cache::{CacheEvent, CachingProvider},
    config::CacheConfig,
    model::{Affiliation, NodeAffiliate, config::DefaultNodeConfiguration, node::Node},
    op::NodeAction,
    persist::PubSubStore,
    types::Jid,
};

use common::{RecordingStore, item, node_id, quiet_config};

fn setup(config: CacheConfig) -> (Arc<RecordingStore>, CachingProvider) {
    let store = Arc::new(RecordingStore::new());
    let provider = CachingProvider::new(store.clone(), config);
    (store, provider)
}

fn leaf(name: &str) -> Node {
    Node::new_leaf(
        node_id(name),
        Some(node_id("")),
        Jid::new("owner@x"),
        &DefaultNodeConfiguration::leaf(),
    )
}

#[test]
fn republished_item_replaces_pending_add_and_is_readable() {
    let (store, provider) = setup(quiet_config());
    provider.save_published_item(item("L", "A", "v1"));
    provider.save_published_item(item("L", "A", "v2"));

    let adds = provider.pending_item_adds();
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].payload.as_deref(), Some("v2"));
    assert_eq!(provider.pending_item_count(), 1);

    let cached = provider
        .cached_item(&node_id("L").item("A"))
        .expect("cached");
    assert_eq!(cached.payload.as_deref(), Some("v2"));
    assert_eq!(store.item_count(), 0);
}

#[test]
fn item_read_flushes_the_node_first() {
    let (store, provider) = setup(quiet_config());
    provider.save_published_item(item("L", "A", "v2"));

    let read = provider
        .get_published_item(&node_id("L").item("A"))
        .expect("read")
        .expect("present");
    assert_eq!(read.payload.as_deref(), Some("v2"));
    assert_eq!(store.item_count(), 1);
    assert!(provider.pending_item_adds().is_empty());
}

#[test]
fn create_then_three_updates_keeps_one_update() {
    let (_store, provider) = setup(quiet_config());
    let n = leaf("N");
    provider.create_node(&n);
    for _ in 0..3 {
        provider.update_node(&n);
    }
    assert_eq!(
        provider.pending_operations(n.identity()).expect("pending").actions(),
        vec![NodeAction::Create, NodeAction::Update]
    );
}

#[test]
fn create_affiliate_then_remove_node_leaves_only_remove() {
    let (store, provider) = setup(quiet_config());
    let n = leaf("N");
    provider.create_node(&n);
    provider.create_affiliation(&NodeAffiliate::new(
        n.identity().clone(),
        Jid::new("owner@x"),
        Affiliation::Owner,
    ));
    provider.remove_node(&n);
    assert_eq!(
        provider.pending_operations(n.identity()).expect("pending").actions(),
        vec![NodeAction::Remove]
    );

    provider.flush_pending_node_changes(n.identity(), false);
    assert_eq!(store.calls(), vec![format!("remove_node {}", n.identity())]);
}

#[test]
fn flushing_one_node_leaves_others_queued() {
    let (store, provider) = setup(quiet_config());
    let x = leaf("X");
    let y = leaf("Y");
    provider.create_node(&x);
    provider.create_node(&y);
    provider.save_published_item(item("X", "1", "x"));
    provider.save_published_item(item("Y", "1", "y"));
    provider.remove_published_item(&node_id("Y").item("old"));

    let report = provider.flush_pending_node_changes(x.identity(), false);
    assert_eq!(report.operations, 1);
    assert_eq!(report.items_added, 1);

    assert!(provider.pending_operations(x.identity()).is_none());
    assert_eq!(
        provider.pending_operations(y.identity()).expect("y pending").actions(),
        vec![NodeAction::Create]
    );
    assert_eq!(provider.pending_item_adds().len(), 1);
    assert_eq!(provider.pending_item_adds()[0].node, node_id("Y"));
    assert_eq!(provider.pending_item_deletes(), vec![node_id("Y").item("old")]);

    let report = provider.flush_pending_node_changes(y.identity(), false);
    assert_eq!(report.operations, 1);
    assert_eq!(report.items_added, 1);
    assert_eq!(store.item_count(), 2);
}

#[test]
fn operations_reach_the_store_in_enqueue_order() {
    let (store, provider) = setup(quiet_config());
    let n = leaf("N");
    let owner = NodeAffiliate::new(n.identity().clone(), Jid::new("o@x"), Affiliation::Owner);
    provider.create_node(&n);
    provider.create_affiliation(&owner);
    provider.update_node(&n);

    provider.flush_pending_changes(false);
    assert_eq!(
        store.calls(),
        vec![
            format!("create_node {}", n.identity()),
            format!("create_affiliation {} o@x", n.identity()),
            format!("update_node {}", n.identity()),
        ]
    );
}

#[test]
fn delete_wins_over_pending_add_and_republish_cancels_delete() {
    let (store, provider) = setup(quiet_config());
    provider.save_published_item(item("L", "A", "v1"));
    provider.remove_published_item(&node_id("L").item("A"));
    assert!(provider.pending_item_adds().is_empty());
    assert_eq!(provider.pending_item_count(), 0);
    assert!(provider.cached_item(&node_id("L").item("A")).is_none());

    provider.save_published_item(item("L", "A", "v3"));
    assert!(provider.pending_item_deletes().is_empty());

    provider.flush_pending_changes(false);
    let stored = store
        .get_published_item(&node_id("L").item("A"))
        .expect("read")
        .expect("stored");
    assert_eq!(stored.payload.as_deref(), Some("v3"));
}

#[test]
fn purge_drops_pending_and_stored_items() {
    let (store, provider) = setup(quiet_config());
    provider.save_published_item(item("L", "A", "stored"));
    provider.flush_pending_changes(false);
    provider.save_published_item(item("L", "B", "pending"));

    provider.purge_node(&node_id("L")).expect("purge");
    assert!(provider.pending_item_adds().is_empty());
    assert!(provider.cached_item(&node_id("L").item("A")).is_none());
    assert_eq!(store.item_count(), 0);
}

#[test]
fn cache_miss_reads_the_store_once() {
    let (store, provider) = setup(quiet_config());
    store
        .bulk_write_items(&pubsubcache::persist::ItemBatch::plan(
            vec![item("L", "A", "old")],
            Vec::new(),
        ));

    for _ in 0..3 {
        let read = provider
            .get_published_item(&node_id("L").item("A"))
            .expect("read");
        assert_eq!(read.and_then(|i| i.payload).as_deref(), Some("old"));
    }
    assert_eq!(store.item_reads.load(Ordering::SeqCst), 1);

    let missing = provider
        .get_published_item(&node_id("L").item("nope"))
        .expect("read");
    assert!(missing.is_none());
}

#[test]
fn threshold_without_worker_flushes_inline() {
    let (store, provider) = setup(CacheConfig {
        max_items_flush: 2,
        ..CacheConfig::default()
    });
    provider.save_published_item(item("L", "1", "a"));
    provider.save_published_item(item("L", "2", "b"));
    assert_eq!(store.item_count(), 0);

    provider.save_published_item(item("L", "3", "c"));
    assert_eq!(store.item_count(), 3);
    assert_eq!(provider.pending_item_count(), 0);
}

#[test]
fn rolled_back_batch_is_reported_and_dropped() {
    let (store, provider) = setup(quiet_config());
    let mut events = provider.subscribe();
    store.fail_item_writes.store(true, Ordering::SeqCst);
    provider.save_published_item(item("L", "A", "lost"));

    let report = provider.flush_pending_changes(false);
    assert_eq!(report.items_lost, 1);
    assert!(provider.pending_item_adds().is_empty());

    let lost = std::iter::from_fn(|| events.try_recv().ok())
        .find(|e| matches!(e, CacheEvent::ItemBatchLost { .. }))
        .expect("loss event");
    match lost {
        CacheEvent::ItemBatchLost {
            node, lost_adds, ..
        } => {
            assert_eq!(node, node_id("L"));
            assert_eq!(lost_adds, 1);
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Nothing is retried on the next flush.
    store.fail_item_writes.store(false, Ordering::SeqCst);
    provider.flush_pending_changes(false);
    assert_eq!(store.item_count(), 0);
}

#[test]
fn failed_node_write_is_not_retried() {
    let (store, provider) = setup(quiet_config());
    let mut events = provider.subscribe();
    let n = leaf("N");
    store.fail_node_writes.store(true, Ordering::SeqCst);
    provider.create_node(&n);

    let report = provider.flush_pending_changes(false);
    assert_eq!(report.failed_operations, 1);
    assert!(provider.pending_nodes().is_empty());
    assert!(
        std::iter::from_fn(|| events.try_recv().ok()).any(|e| matches!(
            e,
            CacheEvent::StoreWriteFailed {
                action: NodeAction::Create,
                ..
            }
        ))
    );
}

#[test]
fn concurrent_writers_and_full_flushes_lose_nothing() {
    let (store, provider) = setup(quiet_config());
    let provider = Arc::new(provider);

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let provider = Arc::clone(&provider);
            thread::spawn(move || {
                for i in 0..50 {
                    provider.save_published_item(item(&format!("N{w}"), &i.to_string(), "p"));
                    if i % 10 == 0 {
                        provider.flush_pending_changes(false);
                    }
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer");
    }
    provider.flush_pending_changes(false);

    assert_eq!(store.item_count(), 200);
    assert_eq!(provider.pending_item_count(), 0);
}

#[test]
fn item_retracted_during_a_store_read_is_not_cached() {
    let store = Arc::new(RecordingStore::new());
    let writer = CachingProvider::new(store.clone(), quiet_config());
    writer.save_published_item(item("L", "A", "v1"));
    writer.flush_pending_changes(false);
    assert_eq!(store.item_count(), 1);

    let provider = Arc::new(CachingProvider::new(store.clone(), quiet_config()));
    let id = node_id("L").item("A");
    store.item_read_delay_ms.store(200, Ordering::SeqCst);
    let reader = {
        let provider = Arc::clone(&provider);
        let id = id.clone();
        thread::spawn(move || provider.get_published_item(&id).expect("read"))
    };
    thread::sleep(Duration::from_millis(50));
    provider.remove_published_item(&id);

    assert!(reader.join().expect("reader").is_none());
    assert!(provider.cached_item(&id).is_none());
    store.item_read_delay_ms.store(0, Ordering::SeqCst);
    assert!(provider.get_published_item(&id).expect("read").is_none());
    assert_eq!(store.item_count(), 0);
}
