mod common;

use std::{sync::Arc, thread, time::Duration};

use pubsubcache::{
    cache::{CacheEvent, CachingProvider},
    cluster::{ClusterError, ClusterTask, ClusterTaskHandler, InProcessCluster},
    model::{config::DefaultNodeConfiguration, node::Node},
    types::Jid,
};

use common::{RecordingStore, item, node_id, quiet_config};

fn leaf(name: &str) -> Node {
    Node::new_leaf(
        node_id(name),
        Some(node_id("")),
        Jid::new("owner@x"),
        &DefaultNodeConfiguration::leaf(),
    )
}

struct Member {
    store: Arc<RecordingStore>,
    provider: Arc<CachingProvider>,
}

fn member(cluster: &InProcessCluster, store: Arc<RecordingStore>) -> Member {
    let handle = cluster.join();
    let provider = Arc::new(CachingProvider::with_cluster(
        store.clone(),
        quiet_config(),
        handle.clone(),
    ));
    handle.attach(&provider);
    Member { store, provider }
}

#[test]
fn peers_drain_before_the_local_flush_returns() {
    let cluster = InProcessCluster::new(Duration::from_secs(5));
    let a = member(&cluster, Arc::new(RecordingStore::new()));
    let b = member(&cluster, Arc::new(RecordingStore::new()));

    let n = leaf("n");
    b.provider.create_node(&n);
    b.provider.save_published_item(item("n", "1", "from b"));
    a.provider.update_node(&n);

    a.provider.flush_pending_node_changes(n.identity(), true);

    assert!(b.provider.pending_operations(n.identity()).is_none());
    assert_eq!(b.provider.pending_item_count(), 0);
    assert_eq!(b.store.calls()[0], format!("create_node {}", n.identity()));
    assert_eq!(b.store.item_count(), 1);
    assert_eq!(a.store.calls(), vec![format!("update_node {}", n.identity())]);
}

#[test]
fn peer_flush_stays_local_on_the_peer() {
    let cluster = InProcessCluster::new(Duration::from_secs(5));
    let a = member(&cluster, Arc::new(RecordingStore::new()));
    let b = member(&cluster, Arc::new(RecordingStore::new()));
    let c = member(&cluster, Arc::new(RecordingStore::new()));

    for (i, m) in [&a, &b, &c].into_iter().enumerate() {
        m.provider.save_published_item(item(&format!("n{i}"), "1", "x"));
    }
    a.provider.flush_pending_changes(true);

    for m in [&a, &b, &c] {
        assert_eq!(m.provider.pending_item_count(), 0);
        assert_eq!(m.store.item_count(), 1);
    }
}

#[test]
fn clustered_item_read_sees_a_peers_pending_write() {
    let shared = Arc::new(RecordingStore::new());
    let cluster = InProcessCluster::new(Duration::from_secs(5));
    let a = member(&cluster, shared.clone());
    let b = member(&cluster, shared);

    b.provider.save_published_item(item("n", "1", "written on b"));
    let read = a
        .provider
        .get_published_item(&node_id("n").item("1"))
        .expect("read")
        .expect("visible through the shared store");
    assert_eq!(read.payload.as_deref(), Some("written on b"));
}

struct SlowPeer {
    delay: Duration,
}

impl ClusterTaskHandler for SlowPeer {
    fn execute_cluster_task(&self, _task: &ClusterTask) {
        thread::sleep(self.delay);
    }
}

#[test]
fn timed_out_peer_does_not_block_the_local_flush() {
    let cluster = InProcessCluster::new(Duration::from_millis(50));
    let a = member(&cluster, Arc::new(RecordingStore::new()));
    let slow = Arc::new(SlowPeer {
        delay: Duration::from_millis(500),
    });
    cluster.join().attach(&slow);

    let mut events = a.provider.subscribe();
    a.provider.save_published_item(item("n", "1", "x"));
    let report = a.provider.flush_pending_node_changes(&node_id("n"), true);

    assert_eq!(report.items_added, 1);
    assert_eq!(a.store.item_count(), 1);
    let failure = std::iter::from_fn(|| events.try_recv().ok())
        .find(|e| matches!(e, CacheEvent::ClusterFlushFailed { .. }))
        .expect("cluster failure event");
    match failure {
        CacheEvent::ClusterFlushFailed { node, reason } => {
            assert_eq!(node, Some(node_id("n")));
            assert_eq!(
                reason,
                ClusterError::Timeout(Duration::from_millis(50)).to_string()
            );
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn dropped_peer_is_reported_and_skipped() {
    let cluster = InProcessCluster::new(Duration::from_secs(1));
    let a = member(&cluster, Arc::new(RecordingStore::new()));
    {
        let _gone = member(&cluster, Arc::new(RecordingStore::new()));
    }

    let mut events = a.provider.subscribe();
    a.provider.save_published_item(item("n", "1", "x"));
    a.provider.flush_pending_changes(true);

    assert_eq!(a.store.item_count(), 1);
    assert!(
        std::iter::from_fn(|| events.try_recv().ok())
            .any(|e| matches!(e, CacheEvent::ClusterFlushFailed { node: None, .. }))
    );
}
