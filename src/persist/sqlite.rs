//! SQLite-backed durable store.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::{
    item::PublishedItem,
    model::{
        Affiliation, NodeAffiliate, NodeSubscription, SubscriptionState,
        codec::{decode_node, encode_node},
        config::DefaultNodeConfiguration,
        node::Node,
    },
    types::{ItemIdentity, Jid, NodeIdentity, ServiceId},
};

use super::{
    BulkWriteOutcome, ItemBatch, ItemWriter, PersistError, PersistResult, PubSubStore,
    delivers_directly_to, write_items_with_retry,
};

/// SQLite implementation of [`crate::persist::PubSubStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates a SQLite store at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite store.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load_affiliations(conn: &Connection, id: &NodeIdentity) -> PersistResult<Vec<NodeAffiliate>> {
        let mut stmt = conn.prepare_cached(
            "SELECT jid, affiliation FROM affiliations WHERE service_id = ?1 AND node_id = ?2 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![id.service.as_str(), id.node_id], |row| {
            let jid: String = row.get(0)?;
            let affiliation: String = row.get(1)?;
            Ok((jid, affiliation))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (jid, affiliation) = row?;
            let affiliation = Affiliation::parse(&affiliation).ok_or_else(|| {
                PersistError::Message(format!("unknown affiliation {affiliation:?}"))
            })?;
            out.push(NodeAffiliate::new(id.clone(), Jid::new(jid), affiliation));
        }
        Ok(out)
    }

    fn load_subscriptions(
        conn: &Connection,
        id: &NodeIdentity,
        sub_id: Option<&str>,
    ) -> PersistResult<Vec<NodeSubscription>> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, owner, jid, state, options FROM subscriptions \
             WHERE service_id = ?1 AND node_id = ?2 AND (?3 IS NULL OR id = ?3) ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![id.service.as_str(), id.node_id, sub_id], |row| {
            let sub_id: String = row.get(0)?;
            let owner: String = row.get(1)?;
            let jid: String = row.get(2)?;
            let state: String = row.get(3)?;
            let options: Vec<u8> = row.get(4)?;
            Ok((sub_id, owner, jid, state, options))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (sub_id, owner, jid, state, options) = row?;
            let state = SubscriptionState::parse(&state)
                .ok_or_else(|| PersistError::Message(format!("unknown subscription state {state:?}")))?;
            out.push(NodeSubscription {
                node: id.clone(),
                id: sub_id,
                owner: Jid::new(owner),
                jid: Jid::new(jid),
                state,
                options: serde_json::from_slice(&options)?,
            });
        }
        Ok(out)
    }

    fn hydrate(conn: &Connection, payload: &[u8]) -> PersistResult<Node> {
        let mut node = decode_node(payload)?;
        let affiliates = Self::load_affiliations(conn, node.identity())?;
        let subscriptions = Self::load_subscriptions(conn, node.identity(), None)?;
        node.restore_membership(affiliates, subscriptions);
        node.set_saved_to_db(true);
        Ok(node)
    }
}

fn item_from_row(node: &NodeIdentity, row: &Row<'_>) -> rusqlite::Result<PublishedItem> {
    let created_ms: i64 = row.get(2)?;
    Ok(PublishedItem {
        node: node.clone(),
        item_id: row.get(0)?,
        publisher: Jid::new(row.get::<_, String>(1)?),
        created_ms: created_ms as u64,
        payload: row.get(3)?,
    })
}

fn write_subscription(conn: &Connection, sql: &str, sub: &NodeSubscription) -> PersistResult<usize> {
    let options = serde_json::to_vec(&sub.options)?;
    Ok(conn.execute(
        sql,
        params![
            sub.node.service.as_str(),
            sub.node.node_id,
            sub.id,
            sub.owner.as_str(),
            sub.jid.as_str(),
            sub.state.as_str(),
            options,
        ],
    )?)
}

fn expect_row(changed: usize, what: &str) -> PersistResult<()> {
    if changed == 0 {
        return Err(PersistError::Message(format!("{what} not found")));
    }
    Ok(())
}

impl PubSubStore for SqliteStore {
    fn create_node(&self, node: &Node) -> PersistResult<()> {
        let payload = encode_node(node)?;
        let id = node.identity();
        self.conn.lock().execute(
            "INSERT INTO nodes(service_id, node_id, leaf, parent_id, state) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.service.as_str(),
                id.node_id,
                node.is_leaf(),
                node.parent().map(|p| p.node_id.as_str()),
                payload,
            ],
        )?;
        Ok(())
    }

    fn update_node(&self, node: &Node) -> PersistResult<()> {
        let payload = encode_node(node)?;
        let id = node.identity();
        let changed = self.conn.lock().execute(
            "UPDATE nodes SET parent_id = ?3, state = ?4 WHERE service_id = ?1 AND node_id = ?2",
            params![
                id.service.as_str(),
                id.node_id,
                node.parent().map(|p| p.node_id.as_str()),
                payload,
            ],
        )?;
        expect_row(changed, &format!("node {id}"))
    }

    fn remove_node(&self, id: &NodeIdentity) -> PersistResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for table in ["items", "subscriptions", "affiliations", "nodes"] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE service_id = ?1 AND node_id = ?2"),
                params![id.service.as_str(), id.node_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn create_affiliation(&self, affiliate: &NodeAffiliate) -> PersistResult<()> {
        self.conn.lock().execute(
            "INSERT INTO affiliations(service_id, node_id, jid, affiliation) VALUES (?1, ?2, ?3, ?4)",
            params![
                affiliate.node.service.as_str(),
                affiliate.node.node_id,
                affiliate.jid.as_str(),
                affiliate.affiliation.as_str(),
            ],
        )?;
        Ok(())
    }

    fn update_affiliation(&self, affiliate: &NodeAffiliate) -> PersistResult<()> {
        let changed = self.conn.lock().execute(
            "UPDATE affiliations SET affiliation = ?4 WHERE service_id = ?1 AND node_id = ?2 AND jid = ?3",
            params![
                affiliate.node.service.as_str(),
                affiliate.node.node_id,
                affiliate.jid.as_str(),
                affiliate.affiliation.as_str(),
            ],
        )?;
        expect_row(changed, &format!("affiliation of {}", affiliate.jid))
    }

    fn remove_affiliation(&self, affiliate: &NodeAffiliate) -> PersistResult<()> {
        self.conn.lock().execute(
            "DELETE FROM affiliations WHERE service_id = ?1 AND node_id = ?2 AND jid = ?3",
            params![
                affiliate.node.service.as_str(),
                affiliate.node.node_id,
                affiliate.jid.as_str(),
            ],
        )?;
        Ok(())
    }

    fn create_subscription(&self, sub: &NodeSubscription) -> PersistResult<()> {
        write_subscription(
            &self.conn.lock(),
            "INSERT INTO subscriptions(service_id, node_id, id, owner, jid, state, options) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            sub,
        )?;
        Ok(())
    }

    fn update_subscription(&self, sub: &NodeSubscription) -> PersistResult<()> {
        let changed = write_subscription(
            &self.conn.lock(),
            "UPDATE subscriptions SET owner = ?4, jid = ?5, state = ?6, options = ?7 \
             WHERE service_id = ?1 AND node_id = ?2 AND id = ?3",
            sub,
        )?;
        expect_row(changed, &format!("subscription {}", sub.id))
    }

    fn remove_subscription(&self, sub: &NodeSubscription) -> PersistResult<()> {
        self.conn.lock().execute(
            "DELETE FROM subscriptions WHERE service_id = ?1 AND node_id = ?2 AND id = ?3",
            params![sub.node.service.as_str(), sub.node.node_id, sub.id],
        )?;
        Ok(())
    }

    fn bulk_write_items(&self, batch: &ItemBatch) -> BulkWriteOutcome {
        if batch.is_empty() {
            return BulkWriteOutcome::Empty;
        }
        let conn = self.conn.lock();
        if let Err(err) = conn.execute_batch("BEGIN IMMEDIATE") {
            tracing::error!(error = %err, "could not open item transaction; pending items dropped");
            return BulkWriteOutcome::RolledBack {
                lost_adds: batch.adds.len(),
                lost_deletes: batch.deletes.len(),
                reason: err.to_string(),
            };
        }
        let mut writer = SqliteItemWriter { conn: &conn };
        write_items_with_retry(&mut writer, batch)
    }

    fn load_nodes(&self, service: &ServiceId) -> PersistResult<Vec<Node>> {
        let conn = self.conn.lock();
        let payloads = {
            let mut stmt = conn.prepare_cached(
                "SELECT state FROM nodes WHERE service_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![service.as_str()], |row| row.get::<_, Vec<u8>>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        payloads
            .iter()
            .map(|payload| Self::hydrate(&conn, payload))
            .collect()
    }

    fn load_node(&self, id: &NodeIdentity) -> PersistResult<Option<Node>> {
        let conn = self.conn.lock();
        let payload: Option<Vec<u8>> = conn
            .query_row(
                "SELECT state FROM nodes WHERE service_id = ?1 AND node_id = ?2",
                params![id.service.as_str(), id.node_id],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|payload| Self::hydrate(&conn, &payload))
            .transpose()
    }

    fn load_subscription(
        &self,
        node: &NodeIdentity,
        sub_id: &str,
    ) -> PersistResult<Option<NodeSubscription>> {
        let conn = self.conn.lock();
        Ok(Self::load_subscriptions(&conn, node, Some(sub_id))?
            .into_iter()
            .next())
    }

    fn find_directly_subscribed_nodes(&self, address: &Jid) -> PersistResult<Vec<NodeIdentity>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT service_id, node_id, jid FROM subscriptions \
             WHERE (jid = ?1 OR jid LIKE ?1 || '/%') AND state = ?2 ORDER BY service_id, node_id",
        )?;
        let bare = address.bare();
        let rows = stmt.query_map(
            params![bare.as_str(), SubscriptionState::Subscribed.as_str()],
            |row| {
                let service: String = row.get(0)?;
                let node_id: String = row.get(1)?;
                let jid: String = row.get(2)?;
                Ok((service, node_id, jid))
            },
        )?;

        let mut out: Vec<NodeIdentity> = Vec::new();
        for row in rows {
            let (service, node_id, jid) = row?;
            if !delivers_directly_to(&Jid::new(jid), address) {
                continue;
            }
            let id = NodeIdentity::new(ServiceId::new(service), node_id);
            if !out.contains(&id) {
                out.push(id);
            }
        }
        Ok(out)
    }

    fn get_published_item(&self, id: &ItemIdentity) -> PersistResult<Option<PublishedItem>> {
        let item = self
            .conn
            .lock()
            .query_row(
                "SELECT id, publisher, created_ms, payload FROM items \
                 WHERE service_id = ?1 AND node_id = ?2 AND id = ?3",
                params![id.node.service.as_str(), id.node.node_id, id.item_id],
                |row| item_from_row(&id.node, row),
            )
            .optional()?;
        Ok(item)
    }

    fn get_published_items(
        &self,
        node: &NodeIdentity,
        max_rows: usize,
    ) -> PersistResult<Vec<PublishedItem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, publisher, created_ms, payload FROM items \
             WHERE service_id = ?1 AND node_id = ?2 ORDER BY created_ms DESC, rowid DESC LIMIT ?3",
        )?;
        let limit = i64::try_from(max_rows).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![node.service.as_str(), node.node_id, limit], |row| {
            item_from_row(node, row)
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn get_last_published_item(
        &self,
        node: &NodeIdentity,
    ) -> PersistResult<Option<PublishedItem>> {
        Ok(self.get_published_items(node, 1)?.into_iter().next())
    }

    fn purge_node(&self, node: &NodeIdentity) -> PersistResult<()> {
        self.conn.lock().execute(
            "DELETE FROM items WHERE service_id = ?1 AND node_id = ?2",
            params![node.service.as_str(), node.node_id],
        )?;
        Ok(())
    }

    fn load_default_configuration(
        &self,
        service: &ServiceId,
        leaf: bool,
    ) -> PersistResult<Option<DefaultNodeConfiguration>> {
        let payload: Option<Vec<u8>> = self
            .conn
            .lock()
            .query_row(
                "SELECT payload FROM default_configs WHERE service_id = ?1 AND leaf = ?2",
                params![service.as_str(), leaf],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|payload| serde_json::from_slice(&payload).map_err(PersistError::from))
            .transpose()
    }

    fn create_default_configuration(
        &self,
        service: &ServiceId,
        config: &DefaultNodeConfiguration,
    ) -> PersistResult<()> {
        let payload = serde_json::to_vec(config)?;
        self.conn.lock().execute(
            "INSERT INTO default_configs(service_id, leaf, payload) VALUES (?1, ?2, ?3)",
            params![service.as_str(), config.leaf, payload],
        )?;
        Ok(())
    }

    fn update_default_configuration(
        &self,
        service: &ServiceId,
        config: &DefaultNodeConfiguration,
    ) -> PersistResult<()> {
        let payload = serde_json::to_vec(config)?;
        let changed = self.conn.lock().execute(
            "UPDATE default_configs SET payload = ?3 WHERE service_id = ?1 AND leaf = ?2",
            params![service.as_str(), config.leaf, payload],
        )?;
        expect_row(changed, "default configuration")
    }
}

/// Item writer over an open `BEGIN IMMEDIATE` transaction.
struct SqliteItemWriter<'a> {
    conn: &'a Connection,
}

impl ItemWriter for SqliteItemWriter<'_> {
    fn delete_item(&mut self, id: &ItemIdentity) -> PersistResult<()> {
        self.conn.execute(
            "DELETE FROM items WHERE service_id = ?1 AND node_id = ?2 AND id = ?3",
            params![id.node.service.as_str(), id.node.node_id, id.item_id],
        )?;
        Ok(())
    }

    fn insert_item(&mut self, item: &PublishedItem) -> PersistResult<()> {
        self.conn.execute(
            "INSERT INTO items(service_id, node_id, id, publisher, created_ms, payload) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                item.node.service.as_str(),
                item.node.node_id,
                item.item_id,
                item.publisher.as_str(),
                item.created_ms as i64,
                item.payload,
            ],
        )?;
        Ok(())
    }

    fn delete_batch(&mut self, ids: &[ItemIdentity]) -> PersistResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM items WHERE service_id = ?1 AND node_id = ?2 AND id = ?3")?;
        for id in ids {
            stmt.execute(params![id.node.service.as_str(), id.node.node_id, id.item_id])?;
        }
        Ok(())
    }

    fn insert_batch(&mut self, items: &[PublishedItem]) -> PersistResult<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO items(service_id, node_id, id, publisher, created_ms, payload) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for item in items {
            stmt.execute(params![
                item.node.service.as_str(),
                item.node.node_id,
                item.item_id,
                item.publisher.as_str(),
                item.created_ms as i64,
                item.payload,
            ])?;
        }
        Ok(())
    }

    fn commit(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}
