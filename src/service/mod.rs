//! Pub/sub service: the node registry of one service and the operations a
//! protocol engine drives against it.
//!
//! Model mutations run under the node's mutex and their [`NodeChange`]s are
//! turned into pending store operations before the mutex is released, so a
//! node's queue always follows the order of its mutations.
//!
//! Lock order: hierarchy mutex, then the registry, then one node mutex. No
//! path holds two node mutexes at once.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    cache::CachingProvider,
    config::ServiceConfig,
    model::{
        Affiliation, ModelError, NodeChange, NodeSubscription, SubscriptionForm,
        config::{DefaultNodeConfiguration, NodeConfigForm},
        node::Node,
    },
    op::OperationError,
    persist::{PersistError, PersistResult},
    types::{Jid, NodeIdentity, ServiceId, SubscriptionType},
};

mod items;
pub mod presence;

pub use presence::{NoopPresenceTracker, PresenceTracker};

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Operation(#[from] OperationError),
}

#[derive(Clone)]
struct NodeEntry {
    leaf: bool,
    node: Arc<Mutex<Node>>,
}

impl NodeEntry {
    fn new(node: Node) -> Self {
        Self {
            leaf: node.is_leaf(),
            node: Arc::new(Mutex::new(node)),
        }
    }
}

/// One pub/sub service backed by a [`CachingProvider`].
pub struct PubSubService {
    id: ServiceId,
    config: ServiceConfig,
    provider: Arc<CachingProvider>,
    presence: Arc<dyn PresenceTracker>,
    nodes: RwLock<HashMap<String, NodeEntry>>,
    hierarchy: Mutex<()>,
    leaf_defaults: RwLock<DefaultNodeConfiguration>,
    collection_defaults: RwLock<DefaultNodeConfiguration>,
}

impl PubSubService {
    /// Loads the service's default configurations and nodes, and creates the
    /// root collection node when the store has none.
    pub fn start(
        id: ServiceId,
        config: ServiceConfig,
        provider: Arc<CachingProvider>,
        presence: Arc<dyn PresenceTracker>,
    ) -> Result<Self, PubSubError> {
        if id.as_str().is_empty() {
            return Err(OperationError::InvalidOperationArgs(
                "service id cannot be empty".to_string(),
            )
            .into());
        }

        let leaf_defaults = load_defaults(&provider, &id, true)?;
        let collection_defaults = load_defaults(&provider, &id, false)?;
        let service = Self {
            id,
            config,
            provider,
            presence,
            nodes: RwLock::new(HashMap::new()),
            hierarchy: Mutex::new(()),
            leaf_defaults: RwLock::new(leaf_defaults),
            collection_defaults: RwLock::new(collection_defaults),
        };

        let loaded = service.provider.load_nodes(&service.id)?;
        info!(service = %service.id, nodes = loaded.len(), "loaded nodes");
        service.register_loaded(loaded);

        if !service.nodes.read().contains_key(&service.config.root_node_id) {
            service.create_root();
        }
        Ok(service)
    }

    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<CachingProvider> {
        &self.provider
    }

    pub fn root_id(&self) -> &str {
        &self.config.root_node_id
    }

    fn root_identity(&self) -> NodeIdentity {
        NodeIdentity::new(self.id.clone(), self.config.root_node_id.clone())
    }

    /// Snapshot of a node.
    pub fn node(&self, node_id: &str) -> Option<Node> {
        self.entry(node_id).ok().map(|entry| entry.node.lock().clone())
    }

    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn leaf_defaults(&self) -> DefaultNodeConfiguration {
        self.leaf_defaults.read().clone()
    }

    pub fn collection_defaults(&self) -> DefaultNodeConfiguration {
        self.collection_defaults.read().clone()
    }

    /// Replaces the template for new nodes of one kind and writes it through
    /// to the store.
    pub fn update_default_configuration(
        &self,
        defaults: DefaultNodeConfiguration,
    ) -> Result<(), PubSubError> {
        self.provider
            .update_default_configuration(&self.id, &defaults)?;
        let slot = if defaults.leaf {
            &self.leaf_defaults
        } else {
            &self.collection_defaults
        };
        *slot.write() = defaults;
        Ok(())
    }

    fn entry(&self, node_id: &str) -> Result<NodeEntry, ModelError> {
        self.nodes
            .read()
            .get(node_id)
            .cloned()
            .ok_or_else(|| ModelError::NodeNotFound(node_id.to_string()))
    }

    fn register_loaded(&self, loaded: Vec<Node>) {
        let mut registry = self.nodes.write();
        let mut links = Vec::new();
        for mut node in loaded {
            node.set_saved_to_db(true);
            if let Some(parent) = node.parent() {
                links.push((parent.node_id.clone(), node.identity().clone()));
            }
            registry.insert(node.node_id().to_string(), NodeEntry::new(node));
        }
        for (parent_id, child) in links {
            match registry.get(&parent_id) {
                Some(parent) => parent.node.lock().add_child(child),
                None => warn!(node = %child, parent = %parent_id, "parent of loaded node is missing"),
            }
        }
    }

    fn create_root(&self) {
        let creator = self
            .config
            .root_creator
            .clone()
            .unwrap_or_else(|| Jid::new(self.id.as_str()));
        let mut root = Node::new_collection(
            self.root_identity(),
            None,
            creator.clone(),
            &self.collection_defaults.read(),
        );
        let changes = root.add_owner(&creator, &self.config);
        info!(node = %root.identity(), owner = %creator, "creating root collection node");
        let mut registry = self.nodes.write();
        self.save_new_node(&mut registry, root, &changes);
    }

    /// Persists a transient node with its affiliates and subscriptions and
    /// registers it.
    fn save_new_node(
        &self,
        registry: &mut HashMap<String, NodeEntry>,
        mut node: Node,
        changes: &[NodeChange],
    ) {
        self.forward_presence(node.identity(), changes);
        self.provider.create_node(&node);
        for affiliate in node.affiliates() {
            self.provider.create_affiliation(affiliate);
        }
        for sub in node.subscriptions().iter() {
            self.provider.create_subscription(sub);
        }
        node.set_saved_to_db(true);
        registry.insert(node.node_id().to_string(), NodeEntry::new(node));
    }

    fn forward_presence(&self, node: &NodeIdentity, changes: &[NodeChange]) {
        for change in changes {
            match change {
                NodeChange::PresenceRequired(jid) => self.presence.presence_required(node, jid),
                NodeChange::PresenceNotRequired(jid) => {
                    self.presence.presence_not_required(node, jid)
                }
                _ => {}
            }
        }
    }

    /// Forwards presence changes and, once the node is persisted, queues the
    /// store operations for the rest.
    fn process_changes(&self, node: &Node, changes: &[NodeChange]) {
        self.forward_presence(node.identity(), changes);
        if !node.saved_to_db() {
            return;
        }
        for change in changes {
            if let Some(op) = change.to_operation(node) {
                self.provider.enqueue(op);
            }
        }
    }

    /// Runs `f` on the node under its mutex and processes the changes it
    /// reports.
    fn mutate<R>(
        &self,
        node_id: &str,
        f: impl FnOnce(&mut Node) -> Result<(R, Vec<NodeChange>), ModelError>,
    ) -> Result<R, PubSubError> {
        let entry = self.entry(node_id)?;
        let mut node = entry.node.lock();
        let (out, changes) = f(&mut node)?;
        self.process_changes(&node, &changes);
        Ok(out)
    }

    /// Creates a leaf or collection node under `parent`, or under the root
    /// when no parent is given. The bare creator becomes the first owner.
    pub fn create_node(
        &self,
        creator: &Jid,
        node_id: &str,
        leaf: bool,
        parent: Option<&str>,
        form: Option<&NodeConfigForm>,
    ) -> Result<Node, PubSubError> {
        if !self.config.can_create_node(creator) {
            return Err(ModelError::Forbidden(format!("{creator} may not create nodes")).into());
        }

        let _hierarchy = self.hierarchy.lock();
        let mut registry = self.nodes.write();
        if registry.contains_key(node_id) {
            return Err(ModelError::NodeExists(node_id.to_string()).into());
        }
        let parent_id = parent.unwrap_or(&self.config.root_node_id);
        let parent_entry = registry
            .get(parent_id)
            .cloned()
            .ok_or_else(|| ModelError::NodeNotFound(parent_id.to_string()))?;
        if parent_entry.leaf {
            return Err(ModelError::NotACollection(parent_id.to_string()).into());
        }

        let mut parent_node = parent_entry.node.lock();
        if !parent_node.is_association_allowed(creator, &self.config) {
            return Err(ModelError::Forbidden(format!(
                "{creator} may not add children to {parent_id}"
            ))
            .into());
        }
        let leaf_children = parent_node
            .children()
            .iter()
            .filter(|child| registry.get(&child.node_id).is_some_and(|e| e.leaf))
            .count();
        if parent_node.is_max_leaf_nodes_reached(leaf_children) {
            return Err(ModelError::MaxChildrenReached(parent_id.to_string()).into());
        }

        let identity = NodeIdentity::new(self.id.clone(), node_id);
        let parent_identity = Some(parent_node.identity().clone());
        let mut node = if leaf {
            Node::new_leaf(
                identity.clone(),
                parent_identity,
                creator.clone(),
                &self.leaf_defaults.read(),
            )
        } else {
            Node::new_collection(
                identity.clone(),
                parent_identity,
                creator.clone(),
                &self.collection_defaults.read(),
            )
        };
        let mut changes = node.add_owner(&creator.bare(), &self.config);
        if let Some(form) = form {
            changes.extend(node.configure(form, &self.config)?);
        }

        parent_node.add_child(identity);
        drop(parent_node);

        debug!(node = %node.identity(), leaf, creator = %creator, "node created");
        let snapshot = node.clone();
        self.save_new_node(&mut registry, node, &changes);
        Ok(snapshot)
    }

    /// Deletes a node. Its children move to its former parent.
    pub fn delete_node(&self, node_id: &str) -> Result<(), PubSubError> {
        if node_id == self.config.root_node_id {
            return Err(ModelError::CannotDeleteRoot.into());
        }

        let _hierarchy = self.hierarchy.lock();
        let entry = self
            .nodes
            .write()
            .remove(node_id)
            .ok_or_else(|| ModelError::NodeNotFound(node_id.to_string()))?;

        let (identity, parent, children) = {
            let mut node = entry.node.lock();
            self.provider.remove_node(&node);
            let releases = node.presence_release_on_delete();
            self.forward_presence(node.identity(), &releases);
            let out = (node.identity().clone(), node.parent().cloned(), node.children());
            node.clear_membership();
            node.set_saved_to_db(false);
            out
        };
        debug!(node = %identity, children = children.len(), "node deleted");

        if let Some(parent) = &parent {
            if let Ok(parent_entry) = self.entry(&parent.node_id) {
                parent_entry.node.lock().remove_child(&identity);
            }
        }
        for child in children {
            self.move_node(&child.node_id, parent.clone())?;
        }
        Ok(())
    }

    /// Moves a node under another collection node.
    pub fn change_parent(&self, node_id: &str, new_parent: &str) -> Result<(), PubSubError> {
        let _hierarchy = self.hierarchy.lock();
        self.entry(node_id)?;
        let parent = self.validate_new_parent(node_id, new_parent)?;
        self.move_node(node_id, Some(parent))?;
        Ok(())
    }

    fn validate_new_parent(
        &self,
        node_id: &str,
        parent_id: &str,
    ) -> Result<NodeIdentity, ModelError> {
        if node_id == self.config.root_node_id {
            return Err(ModelError::Forbidden(
                "the root node cannot be moved".to_string(),
            ));
        }
        let parent = self.entry(parent_id)?;
        if parent.leaf {
            return Err(ModelError::NotACollection(parent_id.to_string()));
        }
        if self.is_ancestor_or_self(node_id, parent_id) {
            return Err(ModelError::HierarchyCycle(node_id.to_string()));
        }
        Ok(NodeIdentity::new(self.id.clone(), parent_id))
    }

    /// True when `candidate` is `start` or one of its ancestors. A parent
    /// chain longer than the registry counts as a cycle.
    fn is_ancestor_or_self(&self, candidate: &str, start: &str) -> bool {
        let limit = self.nodes.read().len();
        let mut cursor = Some(start.to_string());
        for _ in 0..=limit {
            let Some(id) = cursor else {
                return false;
            };
            if id == candidate {
                return true;
            }
            cursor = self
                .entry(&id)
                .ok()
                .and_then(|entry| entry.node.lock().parent().map(|p| p.node_id.clone()));
        }
        true
    }

    fn move_node(&self, node_id: &str, new_parent: Option<NodeIdentity>) -> Result<(), ModelError> {
        let entry = self.entry(node_id)?;
        let (identity, old_parent) = {
            let mut node = entry.node.lock();
            if node.parent() == new_parent.as_ref() {
                return Ok(());
            }
            let old = node.parent().cloned();
            node.set_parent(new_parent.clone());
            if node.saved_to_db() {
                self.provider.update_node(&node);
            }
            (node.identity().clone(), old)
        };
        debug!(node = %identity, from = ?old_parent, to = ?new_parent, "node moved");

        if let Some(old) = old_parent {
            if let Ok(parent) = self.entry(&old.node_id) {
                parent.node.lock().remove_child(&identity);
            }
        }
        if let Some(new) = new_parent {
            if let Ok(parent) = self.entry(&new.node_id) {
                parent.node.lock().add_child(identity);
            }
        }
        Ok(())
    }

    /// Applies a configuration form, including parent and child changes.
    ///
    /// Children dropped from an explicit child list are moved to the root.
    pub fn configure_node(&self, node_id: &str, form: &NodeConfigForm) -> Result<(), PubSubError> {
        let _hierarchy = self.hierarchy.lock();
        let entry = self.entry(node_id)?;

        let new_parent = match &form.parent {
            Some(parent_id) => {
                let current = entry.node.lock().parent().map(|p| p.node_id.clone());
                if current.as_deref() == Some(parent_id.as_str()) {
                    None
                } else {
                    Some(self.validate_new_parent(node_id, parent_id)?)
                }
            }
            None => None,
        };
        if let Some(children) = &form.children {
            if entry.leaf {
                return Err(ModelError::NotACollection(node_id.to_string()).into());
            }
            for child in children {
                self.entry(child)?;
                if self.is_ancestor_or_self(child, node_id) {
                    return Err(ModelError::HierarchyCycle(child.clone()).into());
                }
            }
        }

        {
            let mut node = entry.node.lock();
            let changes = node.configure(form, &self.config)?;
            self.process_changes(&node, &changes);
        }

        if new_parent.is_some() {
            self.move_node(node_id, new_parent)?;
        }
        if let Some(children) = &form.children {
            let this = NodeIdentity::new(self.id.clone(), node_id);
            let root = self.root_identity();
            let current = entry.node.lock().children();
            for old in current.iter().filter(|c| !children.contains(&c.node_id)) {
                self.move_node(&old.node_id, Some(root.clone()))?;
            }
            for child in children {
                self.move_node(child, Some(this.clone()))?;
            }
        }
        Ok(())
    }

    pub fn add_owner(&self, node_id: &str, jid: &Jid) -> Result<(), PubSubError> {
        self.mutate(node_id, |node| Ok(((), node.add_owner(jid, &self.config))))
    }

    pub fn remove_owner(&self, node_id: &str, jid: &Jid) -> Result<(), PubSubError> {
        self.mutate(node_id, |node| Ok(((), node.remove_owner(jid))))
    }

    pub fn add_publisher(&self, node_id: &str, jid: &Jid) -> Result<(), PubSubError> {
        self.mutate(node_id, |node| Ok(((), node.add_publisher(jid, &self.config))))
    }

    pub fn remove_publisher(&self, node_id: &str, jid: &Jid) -> Result<(), PubSubError> {
        self.mutate(node_id, |node| Ok(((), node.remove_publisher(jid))))
    }

    pub fn add_none_affiliation(&self, node_id: &str, jid: &Jid) -> Result<(), PubSubError> {
        self.mutate(node_id, |node| Ok(((), node.add_none_affiliation(jid))))
    }

    /// Bans `jid` from the node and cancels its subscriptions.
    pub fn add_outcast(&self, node_id: &str, jid: &Jid) -> Result<(), PubSubError> {
        self.mutate(node_id, |node| Ok(((), node.add_outcast(jid))))
    }

    pub fn remove_outcast(&self, node_id: &str, jid: &Jid) -> Result<(), PubSubError> {
        self.mutate(node_id, |node| Ok(((), node.remove_outcast(jid))))
    }

    /// Subscribes `jid` on behalf of `subscriber`, whose bare address owns
    /// the subscription.
    ///
    /// With multiple subscriptions disabled an existing subscription for
    /// `jid` is returned unchanged.
    pub fn subscribe(
        &self,
        node_id: &str,
        subscriber: &Jid,
        jid: &Jid,
        options: Option<&SubscriptionForm>,
    ) -> Result<NodeSubscription, PubSubError> {
        let owner = subscriber.bare();
        let multiple = self.config.multiple_subscriptions_enabled;
        self.mutate(node_id, |node| {
            if node
                .affiliate(&owner)
                .is_some_and(|a| a.affiliation == Affiliation::Outcast)
            {
                return Err(ModelError::Forbidden(format!("{owner} is banned from {node_id}")));
            }
            if !node.settings().subscription_enabled && !node.is_admin(subscriber, &self.config) {
                return Err(ModelError::SubscriptionsDisabled);
            }

            let existing = node.subscriptions().by_jid(jid);
            if existing.iter().any(|s| s.is_authorization_pending()) {
                return Err(ModelError::PendingSubscriptionConflict { jid: jid.clone() });
            }
            if !multiple {
                if let Some(sub) = existing.first() {
                    return Ok(((*sub).clone(), Vec::new()));
                }
            }
            if node.is_collection() {
                let wanted = options
                    .and_then(|form| form.subscription_type)
                    .unwrap_or(SubscriptionType::Nodes);
                if existing
                    .iter()
                    .any(|s| s.options.subscription_type == wanted)
                {
                    return Err(ModelError::DuplicateSubscriptionType { jid: jid.clone() });
                }
            }

            let authorization = node.settings().access_model.requires_authorization();
            node.create_subscription(&owner, jid, authorization, options, &self.config)
        })
    }

    pub fn cancel_subscription(&self, node_id: &str, sub_id: &str) -> Result<(), PubSubError> {
        self.mutate(node_id, |node| {
            if node.subscription(sub_id).is_none() {
                return Err(ModelError::SubscriptionNotFound(sub_id.to_string()));
            }
            Ok(((), node.cancel_subscription(sub_id)))
        })
    }

    pub fn approve_subscription(
        &self,
        node_id: &str,
        sub_id: &str,
        approved: bool,
    ) -> Result<(), PubSubError> {
        self.mutate(node_id, |node| {
            Ok(((), node.approve_subscription(sub_id, approved)?))
        })
    }

    pub fn configure_subscription(
        &self,
        node_id: &str,
        sub_id: &str,
        form: &SubscriptionForm,
    ) -> Result<NodeSubscription, PubSubError> {
        self.mutate(node_id, |node| {
            let changes = node.configure_subscription(sub_id, form, &self.config)?;
            let sub = node
                .subscription(sub_id)
                .cloned()
                .ok_or_else(|| ModelError::SubscriptionNotFound(sub_id.to_string()))?;
            Ok((sub, changes))
        })
    }

    pub fn subscription(
        &self,
        node_id: &str,
        sub_id: &str,
    ) -> Result<Option<NodeSubscription>, PubSubError> {
        let entry = self.entry(node_id)?;
        let node = entry.node.lock();
        Ok(node.subscription(sub_id).cloned())
    }

    /// Subscription of a delivery address. Fails when multiple subscriptions
    /// are enabled and the address holds more than one.
    pub fn subscription_for(
        &self,
        node_id: &str,
        jid: &Jid,
    ) -> Result<Option<NodeSubscription>, PubSubError> {
        let entry = self.entry(node_id)?;
        let node = entry.node.lock();
        Ok(node
            .subscription_by_jid(jid, self.config.multiple_subscriptions_enabled)?
            .cloned())
    }

    pub fn pending_subscriptions(&self, node_id: &str) -> Result<Vec<NodeSubscription>, PubSubError> {
        let entry = self.entry(node_id)?;
        let node = entry.node.lock();
        Ok(node.pending_subscriptions().into_iter().cloned().collect())
    }

    /// Nodes with an active subscription delivered straight to `address`.
    pub fn find_directly_subscribed_nodes(&self, address: &Jid) -> Result<Vec<NodeIdentity>, PubSubError> {
        Ok(self.provider.find_directly_subscribed_nodes(address)?)
    }
}

fn load_defaults(
    provider: &CachingProvider,
    service: &ServiceId,
    leaf: bool,
) -> PersistResult<DefaultNodeConfiguration> {
    if let Some(stored) = provider.load_default_configuration(service, leaf)? {
        return Ok(stored);
    }
    let defaults = if leaf {
        DefaultNodeConfiguration::leaf()
    } else {
        DefaultNodeConfiguration::collection()
    };
    debug!(service = %service, leaf, "storing built-in default node configuration");
    provider.create_default_configuration(service, &defaults)?;
    Ok(defaults)
}
