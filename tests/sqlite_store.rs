mod common;

use std::{path::Path, sync::Arc};

use pubsubcache::{
    cache::CachingProvider,
    config::ServiceConfig,
    item::ItemDraft,
    model::{Affiliation, SubscriptionForm, SubscriptionState, config::NodeConfigForm},
    persist::{PubSubStore, sqlite::SqliteStore},
    service::{NoopPresenceTracker, PubSubService},
    types::{AccessModel, Jid},
};
use tempfile::tempdir;

use common::{node_id, quiet_config, service_id};

fn alice() -> Jid {
    Jid::new("alice@example.org/desk")
}

fn open(path: &Path) -> (Arc<CachingProvider>, PubSubService) {
    let store = Arc::new(SqliteStore::open(path).expect("open sqlite"));
    let provider = Arc::new(CachingProvider::new(store, quiet_config()));
    let service = PubSubService::start(
        service_id(),
        ServiceConfig::default(),
        provider.clone(),
        Arc::new(NoopPresenceTracker),
    )
    .expect("start");
    (provider, service)
}

#[test]
fn service_state_survives_reopening_the_database() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("pubsub.db");
    let phone = Jid::new("u@x/phone");

    {
        let (provider, service) = open(&path);
        let mut defaults = service.leaf_defaults();
        defaults.max_items = 5;
        service
            .update_default_configuration(defaults)
            .expect("defaults");

        service
            .create_node(&alice(), "c", false, None, None)
            .expect("collection");
        service
            .create_node(
                &alice(),
                "l",
                true,
                Some("c"),
                Some(&NodeConfigForm {
                    persist_items: Some(true),
                    ..NodeConfigForm::default()
                }),
            )
            .expect("leaf");
        service.subscribe("l", &phone, &phone, None).expect("subscribe");
        service
            .publish(
                "l",
                &alice(),
                vec![ItemDraft::new("A", "first"), ItemDraft::new("B", "second")],
            )
            .expect("publish");
        service
            .configure_node(
                "l",
                &NodeConfigForm {
                    title: Some("Weather".to_string()),
                    ..NodeConfigForm::default()
                },
            )
            .expect("configure");

        let report = provider.shutdown();
        assert_eq!(report.items_added, 2);
    }

    let (_provider, service) = open(&path);
    assert_eq!(service.node_ids(), vec!["", "c", "l"]);
    assert_eq!(service.leaf_defaults().max_items, 5);

    let leaf = service.node("l").expect("leaf");
    assert_eq!(leaf.parent(), Some(&node_id("c")));
    assert_eq!(leaf.settings().title, "Weather");
    assert_eq!(leaf.leaf().expect("leaf settings").max_items, 5);
    assert_eq!(leaf.owners(), vec![alice().bare()]);
    assert_eq!(leaf.subscriptions().by_jid(&phone).len(), 1);
    assert_eq!(
        service.node("c").expect("collection").children(),
        vec![node_id("l")]
    );

    let items = service.get_published_items("l", None).expect("items");
    let ids: Vec<_> = items.iter().map(|item| item.item_id.as_str()).collect();
    assert_eq!(ids, vec!["B", "A"]);
    assert_eq!(
        service
            .get_last_published_item("l")
            .expect("last")
            .map(|item| item.item_id),
        Some("B".to_string())
    );

    assert_eq!(
        service.find_directly_subscribed_nodes(&phone).expect("find"),
        vec![node_id("l")]
    );
    assert!(
        service
            .find_directly_subscribed_nodes(&Jid::new("u@x/laptop"))
            .expect("find")
            .is_empty()
    );
}

#[test]
fn deleted_node_takes_its_rows_with_it() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("pubsub.db");

    {
        let (provider, service) = open(&path);
        service
            .create_node(
                &alice(),
                "l",
                true,
                None,
                Some(&NodeConfigForm {
                    persist_items: Some(true),
                    ..NodeConfigForm::default()
                }),
            )
            .expect("leaf");
        service
            .publish("l", &alice(), vec![ItemDraft::new("A", "x")])
            .expect("publish");
        provider.flush_pending_changes(false);

        service.delete_node("l").expect("delete");
        provider.shutdown();
    }

    let store = SqliteStore::open(&path).expect("reopen");
    assert!(store.load_node(&node_id("l")).expect("load").is_none());
    assert!(
        store
            .get_published_items(&node_id("l"), 10)
            .expect("items")
            .is_empty()
    );
    assert_eq!(store.load_nodes(&service_id()).expect("nodes").len(), 1);
}

#[test]
fn republished_item_replaces_its_stored_row() {
    let store = Arc::new(SqliteStore::open_in_memory().expect("open"));
    let provider = CachingProvider::new(store.clone(), quiet_config());

    provider.save_published_item(common::item("l", "A", "v1"));
    provider.flush_pending_changes(false);
    provider.save_published_item(common::item("l", "A", "v2"));
    provider.flush_pending_changes(false);

    let items = store.get_published_items(&node_id("l"), 10).expect("items");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].payload.as_deref(), Some("v2"));
}

#[test]
fn changes_to_a_stored_node_apply_cleanly() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("pubsub.db");
    let user = Jid::new("u@x");
    let watcher = Jid::new("w@x");

    let (approved, configured) = {
        let (provider, service) = open(&path);
        service
            .create_node(
                &alice(),
                "l",
                true,
                None,
                Some(&NodeConfigForm {
                    access_model: Some(AccessModel::Authorize),
                    ..NodeConfigForm::default()
                }),
            )
            .expect("leaf");
        provider.flush_pending_changes(false);

        let approved = service.subscribe("l", &user, &user, None).expect("subscribe");
        service
            .approve_subscription("l", &approved.id, true)
            .expect("approve");
        service.add_outcast("l", &watcher).expect("outcast");
        service.add_publisher("l", &watcher).expect("publisher");
        let configured = service
            .subscription_for("l", &watcher)
            .expect("lookup")
            .expect("publisher subscription");
        service
            .configure_subscription(
                "l",
                &configured.id,
                &SubscriptionForm {
                    keyword: Some("storm".to_string()),
                    ..SubscriptionForm::default()
                },
            )
            .expect("configure");

        let report = provider.shutdown();
        assert_eq!(report.failed_operations, 0);
        (approved.id, configured.id)
    };

    let store = SqliteStore::open(&path).expect("reopen");
    let stored = store
        .load_subscription(&node_id("l"), &approved)
        .expect("load")
        .expect("approved subscription");
    assert_eq!(stored.state, SubscriptionState::Subscribed);

    let stored = store
        .load_subscription(&node_id("l"), &configured)
        .expect("load")
        .expect("configured subscription");
    assert_eq!(stored.options.keyword.as_deref(), Some("storm"));

    let node = store.load_node(&node_id("l")).expect("load").expect("node");
    assert_eq!(
        node.affiliate(&watcher).map(|a| a.affiliation),
        Some(Affiliation::Publisher)
    );
}
