//! Durable store contract, item bulk-write policy, and store implementations.

pub mod memory;
pub mod sqlite;

use hashbrown::HashSet;
use thiserror::Error;
use tracing::{error, warn};

use crate::{
    item::PublishedItem,
    model::{NodeAffiliate, NodeSubscription, config::DefaultNodeConfiguration, node::Node},
    types::{ItemIdentity, Jid, NodeIdentity, ServiceId},
};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unsupported node state format version {0}")]
    UnsupportedFormat(u16),
    #[error("{0}")]
    Message(String),
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Authoritative persistent backend.
///
/// Every call is independently transactional. Node rows carry the full node
/// state; affiliation and subscription rows are kept separately so they can
/// be changed without rewriting the node.
pub trait PubSubStore: Send + Sync {
    fn create_node(&self, node: &Node) -> PersistResult<()>;
    fn update_node(&self, node: &Node) -> PersistResult<()>;
    /// Deletes the node with its affiliations, subscriptions and items.
    fn remove_node(&self, node: &NodeIdentity) -> PersistResult<()>;

    fn create_affiliation(&self, affiliate: &NodeAffiliate) -> PersistResult<()>;
    fn update_affiliation(&self, affiliate: &NodeAffiliate) -> PersistResult<()>;
    fn remove_affiliation(&self, affiliate: &NodeAffiliate) -> PersistResult<()>;

    fn create_subscription(&self, sub: &NodeSubscription) -> PersistResult<()>;
    fn update_subscription(&self, sub: &NodeSubscription) -> PersistResult<()>;
    fn remove_subscription(&self, sub: &NodeSubscription) -> PersistResult<()>;

    /// Writes one planned item batch using [`write_items_with_retry`].
    fn bulk_write_items(&self, batch: &ItemBatch) -> BulkWriteOutcome;

    /// Loads every node of `service`, marked as saved, with affiliations
    /// and subscriptions attached. Collection children are not linked.
    fn load_nodes(&self, service: &ServiceId) -> PersistResult<Vec<Node>>;
    fn load_node(&self, id: &NodeIdentity) -> PersistResult<Option<Node>>;
    fn load_subscription(
        &self,
        node: &NodeIdentity,
        sub_id: &str,
    ) -> PersistResult<Option<NodeSubscription>>;
    /// Nodes holding a `subscribed` subscription delivered to `address`,
    /// either to its bare JID or to exactly this full JID.
    fn find_directly_subscribed_nodes(&self, address: &Jid) -> PersistResult<Vec<NodeIdentity>>;

    fn get_published_item(&self, id: &ItemIdentity) -> PersistResult<Option<PublishedItem>>;
    /// Newest first, at most `max_rows`.
    fn get_published_items(
        &self,
        node: &NodeIdentity,
        max_rows: usize,
    ) -> PersistResult<Vec<PublishedItem>>;
    fn get_last_published_item(&self, node: &NodeIdentity)
    -> PersistResult<Option<PublishedItem>>;
    /// Deletes every stored item of `node`.
    fn purge_node(&self, node: &NodeIdentity) -> PersistResult<()>;

    fn load_default_configuration(
        &self,
        service: &ServiceId,
        leaf: bool,
    ) -> PersistResult<Option<DefaultNodeConfiguration>>;
    fn create_default_configuration(
        &self,
        service: &ServiceId,
        config: &DefaultNodeConfiguration,
    ) -> PersistResult<()>;
    fn update_default_configuration(
        &self,
        service: &ServiceId,
        config: &DefaultNodeConfiguration,
    ) -> PersistResult<()>;
}

/// Whether a subscription delivered to `subscriber` reaches `address`
/// directly: the bare JID matches and the subscription is not bound to a
/// different resource.
pub(crate) fn delivers_directly_to(subscriber: &Jid, address: &Jid) -> bool {
    subscriber.bare() == address.bare() && (subscriber.is_bare() || subscriber == address)
}

/// Item writes ready for the store: deletes first, then inserts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemBatch {
    pub deletes: Vec<ItemIdentity>,
    pub adds: Vec<PublishedItem>,
}

impl ItemBatch {
    /// Plans a batch from pending queues.
    ///
    /// An explicit delete wins over an add of the same identity. Every
    /// remaining add is also deleted first so a re-published id replaces its
    /// stored row instead of duplicating it.
    pub fn plan(adds: Vec<PublishedItem>, deletes: Vec<ItemIdentity>) -> Self {
        let deleted: HashSet<ItemIdentity> = deletes.iter().cloned().collect();
        let adds: Vec<PublishedItem> = adds
            .into_iter()
            .filter(|item| !deleted.contains(&item.identity()))
            .collect();

        let mut seen: HashSet<ItemIdentity> = HashSet::new();
        let mut all_deletes = Vec::with_capacity(deletes.len() + adds.len());
        for id in deletes.into_iter().chain(adds.iter().map(PublishedItem::identity)) {
            if seen.insert(id.clone()) {
                all_deletes.push(id);
            }
        }
        Self {
            deletes: all_deletes,
            adds,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.adds.is_empty()
    }
}

/// Result of one bulk item write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkWriteOutcome {
    /// Nothing to write.
    Empty,
    /// The single batched write succeeded.
    Batched { deleted: usize, added: usize },
    /// The batch failed but every item succeeded individually.
    Individually { deleted: usize, added: usize },
    /// Both attempts failed; the batch was rolled back and dropped.
    RolledBack {
        lost_adds: usize,
        lost_deletes: usize,
        reason: String,
    },
}

/// One open write transaction against the item table.
pub trait ItemWriter {
    fn delete_item(&mut self, id: &ItemIdentity) -> PersistResult<()>;
    fn insert_item(&mut self, item: &PublishedItem) -> PersistResult<()>;

    fn delete_batch(&mut self, ids: &[ItemIdentity]) -> PersistResult<()> {
        for id in ids {
            self.delete_item(id)?;
        }
        Ok(())
    }

    fn insert_batch(&mut self, items: &[PublishedItem]) -> PersistResult<()> {
        for item in items {
            self.insert_item(item)?;
        }
        Ok(())
    }

    fn commit(&mut self) -> PersistResult<()>;
    fn rollback(&mut self) -> PersistResult<()>;
}

/// Applies `batch` through `writer`.
///
/// First one batched write of all deletes then all adds. If that fails,
/// every item is retried as its own statement inside the same transaction.
/// If that fails too the transaction is rolled back and the batch is lost.
pub fn write_items_with_retry<W: ItemWriter + ?Sized>(
    writer: &mut W,
    batch: &ItemBatch,
) -> BulkWriteOutcome {
    if batch.is_empty() {
        return BulkWriteOutcome::Empty;
    }
    let deleted = batch.deletes.len();
    let added = batch.adds.len();

    let batched = writer
        .delete_batch(&batch.deletes)
        .and_then(|()| writer.insert_batch(&batch.adds))
        .and_then(|()| writer.commit());
    let err = match batched {
        Ok(()) => return BulkWriteOutcome::Batched { deleted, added },
        Err(err) => err,
    };
    warn!(error = %err, deleted, added, "batched item write failed; retrying items individually");

    let individually = (|| {
        for id in &batch.deletes {
            writer.delete_item(id)?;
        }
        for item in &batch.adds {
            writer.insert_item(item)?;
        }
        writer.commit()
    })();
    let err = match individually {
        Ok(()) => return BulkWriteOutcome::Individually { deleted, added },
        Err(err) => err,
    };

    if let Err(rollback_err) = writer.rollback() {
        error!(error = %rollback_err, "item batch rollback failed");
    }
    error!(
        error = %err,
        lost_adds = added,
        lost_deletes = deleted,
        "item batch rolled back; pending items dropped"
    );
    BulkWriteOutcome::RolledBack {
        lost_adds: added,
        lost_deletes: deleted,
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, payload: &str) -> PublishedItem {
        PublishedItem::new(
            NodeIdentity::new(ServiceId::new("svc"), "n"),
            id,
            Jid::new("p@x"),
            Some(payload.to_string()),
        )
    }

    #[test]
    fn delete_wins_over_add_of_same_identity() {
        let a = item("a", "1");
        let b = item("b", "2");
        let batch = ItemBatch::plan(vec![a.clone(), b.clone()], vec![a.identity()]);
        assert_eq!(batch.adds, vec![b.clone()]);
        assert_eq!(batch.deletes, vec![a.identity(), b.identity()]);
    }

    #[derive(Default)]
    struct ScriptedWriter {
        fail_batch: bool,
        fail_single: bool,
        log: Vec<String>,
    }

    impl ItemWriter for ScriptedWriter {
        fn delete_item(&mut self, id: &ItemIdentity) -> PersistResult<()> {
            self.log.push(format!("delete {}", id.item_id));
            if self.fail_single {
                return Err(PersistError::Message("row rejected".to_string()));
            }
            Ok(())
        }

        fn insert_item(&mut self, item: &PublishedItem) -> PersistResult<()> {
            self.log.push(format!("insert {}", item.item_id));
            Ok(())
        }

        fn delete_batch(&mut self, ids: &[ItemIdentity]) -> PersistResult<()> {
            self.log.push(format!("delete_batch {}", ids.len()));
            Ok(())
        }

        fn insert_batch(&mut self, items: &[PublishedItem]) -> PersistResult<()> {
            self.log.push(format!("insert_batch {}", items.len()));
            if self.fail_batch {
                return Err(PersistError::Message("batch rejected".to_string()));
            }
            Ok(())
        }

        fn commit(&mut self) -> PersistResult<()> {
            self.log.push("commit".to_string());
            Ok(())
        }

        fn rollback(&mut self) -> PersistResult<()> {
            self.log.push("rollback".to_string());
            Ok(())
        }
    }

    fn batch() -> ItemBatch {
        ItemBatch::plan(vec![item("a", "1")], Vec::new())
    }

    #[test]
    fn batched_write_commits_once() {
        let mut writer = ScriptedWriter::default();
        let outcome = write_items_with_retry(&mut writer, &batch());
        assert_eq!(outcome, BulkWriteOutcome::Batched { deleted: 1, added: 1 });
        assert_eq!(writer.log, vec!["delete_batch 1", "insert_batch 1", "commit"]);
    }

    #[test]
    fn failed_batch_is_retried_item_by_item() {
        let mut writer = ScriptedWriter {
            fail_batch: true,
            ..ScriptedWriter::default()
        };
        let outcome = write_items_with_retry(&mut writer, &batch());
        assert_eq!(outcome, BulkWriteOutcome::Individually { deleted: 1, added: 1 });
        assert_eq!(
            writer.log,
            vec!["delete_batch 1", "insert_batch 1", "delete a", "insert a", "commit"]
        );
    }

    #[test]
    fn second_failure_rolls_back_and_drops_the_batch() {
        let mut writer = ScriptedWriter {
            fail_batch: true,
            fail_single: true,
            ..ScriptedWriter::default()
        };
        match write_items_with_retry(&mut writer, &batch()) {
            BulkWriteOutcome::RolledBack {
                lost_adds,
                lost_deletes,
                reason,
            } => {
                assert_eq!((lost_adds, lost_deletes), (1, 1));
                assert!(reason.contains("row rejected"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(writer.log.last().map(String::as_str), Some("rollback"));
        assert!(!writer.log.iter().any(|entry| entry == "insert a"));
    }

    #[test]
    fn empty_batch_touches_nothing() {
        let mut writer = ScriptedWriter::default();
        let outcome = write_items_with_retry(&mut writer, &ItemBatch::default());
        assert_eq!(outcome, BulkWriteOutcome::Empty);
        assert!(writer.log.is_empty());
    }

    #[test]
    fn direct_delivery_ignores_other_resources() {
        let address = Jid::new("u@x/phone");
        assert!(delivers_directly_to(&Jid::new("u@x"), &address));
        assert!(delivers_directly_to(&Jid::new("u@x/phone"), &address));
        assert!(!delivers_directly_to(&Jid::new("u@x/desk"), &address));
        assert!(!delivers_directly_to(&Jid::new("v@x"), &address));
    }
}
