use tracing::debug;

use crate::{
    item::{ItemDraft, PublishedItem, generate_item_id},
    model::{ModelError, config::UNLIMITED},
    types::{Jid, NodeIdentity},
};

use super::{PubSubError, PubSubService};

impl PubSubService {
    /// Publishes `drafts` to a leaf node and returns the stored items.
    ///
    /// Nothing is kept when the node neither persists items nor delivers
    /// payloads. Drafts without an id get a generated one.
    pub fn publish(
        &self,
        node_id: &str,
        publisher: &Jid,
        drafts: Vec<ItemDraft>,
    ) -> Result<Vec<PublishedItem>, PubSubError> {
        self.mutate(node_id, |node| {
            let Some(leaf) = node.leaf() else {
                return Err(ModelError::NotALeaf(node_id.to_string()));
            };
            let max = leaf.max_payload_size;
            let persist = leaf.persist_items;
            if !node.can_publish(publisher, &self.config) {
                return Err(ModelError::Forbidden(format!(
                    "{publisher} may not publish to {node_id}"
                )));
            }
            if let Some(size) = drafts
                .iter()
                .filter_map(|draft| draft.payload.as_ref().map(String::len))
                .find(|&size| size > max as usize)
            {
                return Err(ModelError::PayloadTooLarge { size, max });
            }
            if !node.is_item_required() {
                return Ok((Vec::new(), Vec::new()));
            }

            let mut published = Vec::with_capacity(drafts.len());
            for draft in drafts {
                let item_id = draft.item_id.unwrap_or_else(generate_item_id);
                let item = PublishedItem::new(
                    node.identity().clone(),
                    item_id,
                    publisher.clone(),
                    draft.payload,
                );
                node.set_last_published(item.clone());
                if persist {
                    self.provider.save_published_item(item.clone());
                }
                published.push(item);
            }
            debug!(node = %node.identity(), count = published.len(), persist, "items published");
            Ok((published, Vec::new()))
        })
    }

    /// Deletes items from a leaf node.
    pub fn retract(&self, node_id: &str, item_ids: &[String]) -> Result<(), PubSubError> {
        self.mutate(node_id, |node| {
            if !node.is_leaf() {
                return Err(ModelError::NotALeaf(node_id.to_string()));
            }
            for item_id in item_ids {
                self.provider
                    .remove_published_item(&node.identity().item(item_id.clone()));
            }
            node.forget_last_published(item_ids);
            Ok(((), Vec::new()))
        })
    }

    /// Deletes every stored and pending item of a leaf node. The node's
    /// last published item is kept.
    pub fn purge(&self, node_id: &str) -> Result<(), PubSubError> {
        let identity = self.leaf_identity(node_id)?;
        self.provider.purge_node(&identity)?;
        Ok(())
    }

    fn leaf_identity(&self, node_id: &str) -> Result<NodeIdentity, ModelError> {
        let entry = self.entry(node_id)?;
        let node = entry.node.lock();
        if !node.is_leaf() {
            return Err(ModelError::NotALeaf(node_id.to_string()));
        }
        Ok(node.identity().clone())
    }

    /// One item, answered from the node's last published item when it
    /// matches.
    pub fn get_published_item(
        &self,
        node_id: &str,
        item_id: &str,
    ) -> Result<Option<PublishedItem>, PubSubError> {
        let entry = self.entry(node_id)?;
        let identity = {
            let node = entry.node.lock();
            if !node.is_leaf() {
                return Err(ModelError::NotALeaf(node_id.to_string()).into());
            }
            if !node.is_item_required() {
                return Ok(None);
            }
            if let Some(last) = node.last_published().filter(|last| last.item_id == item_id) {
                return Ok(Some(last.clone()));
            }
            node.identity().clone()
        };
        Ok(self.provider.get_published_item(&identity.item(item_id))?)
    }

    /// Newest items first.
    ///
    /// The limit is the smallest of `requested`, the node's item bound and
    /// the provider's row cap. A last published item the store does not
    /// return yet is merged at the head.
    pub fn get_published_items(
        &self,
        node_id: &str,
        requested: Option<usize>,
    ) -> Result<Vec<PublishedItem>, PubSubError> {
        let entry = self.entry(node_id)?;
        let (identity, max_items, last) = {
            let node = entry.node.lock();
            let Some(leaf) = node.leaf() else {
                return Err(ModelError::NotALeaf(node_id.to_string()).into());
            };
            if !node.is_item_required() {
                return Ok(Vec::new());
            }
            (
                node.identity().clone(),
                leaf.max_items,
                leaf.last_published.clone(),
            )
        };

        let max_rows = self.provider.config().max_rows_fetch;
        let node_limit = if max_items == UNLIMITED {
            max_rows
        } else {
            max_items.max(0) as usize
        };
        let limit = requested.map_or(node_limit, |r| r.min(node_limit)).min(max_rows);

        let mut items = self.provider.get_published_items(&identity, limit)?;
        if let Some(last) = last {
            if !items.iter().any(|item| item.item_id == last.item_id) {
                items.insert(0, last);
            }
        }
        items.truncate(limit);
        Ok(items)
    }

    /// Most recent item of a leaf node, loaded from the store on first use.
    pub fn get_last_published_item(
        &self,
        node_id: &str,
    ) -> Result<Option<PublishedItem>, PubSubError> {
        let entry = self.entry(node_id)?;
        let identity = {
            let node = entry.node.lock();
            if !node.is_leaf() {
                return Err(ModelError::NotALeaf(node_id.to_string()).into());
            }
            if let Some(last) = node.last_published() {
                return Ok(Some(last.clone()));
            }
            node.identity().clone()
        };

        let Some(loaded) = self.provider.get_last_published_item(&identity)? else {
            return Ok(None);
        };
        let mut node = entry.node.lock();
        node.set_last_published(loaded);
        Ok(node.last_published().cloned())
    }
}
