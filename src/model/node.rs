//! Leaf and collection nodes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    config::ServiceConfig,
    item::{PublishedItem, now_ms},
    types::{AssociationPolicy, Jid, NodeIdentity, PublisherModel},
};

use super::{
    ModelError, NodeChange,
    affiliate::{Affiliation, NodeAffiliate},
    config::{DefaultNodeConfiguration, NodeConfigForm, NodeSettings, UNLIMITED},
    indices::SubscriptionIndex,
    subscription::{NodeSubscription, SubscriptionForm, SubscriptionState},
};

/// Kind-specific state of a leaf node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafSettings {
    pub persist_items: bool,
    /// Item read bound; `-1` for unlimited.
    pub max_items: i32,
    pub max_payload_size: u32,
    pub send_item_subscribe: bool,
    /// Rebuilt lazily from the store; never persisted.
    #[serde(skip)]
    pub last_published: Option<PublishedItem>,
}

/// Kind-specific state of a collection node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSettings {
    pub association_policy: AssociationPolicy,
    pub association_trusted: Vec<Jid>,
    /// Limit on leaf children; `-1` for unlimited.
    pub max_leaf_nodes: i32,
    /// Direct children, rebuilt from parent links when nodes load.
    #[serde(skip)]
    pub children: BTreeSet<NodeIdentity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeKind {
    Leaf(LeafSettings),
    Collection(CollectionSettings),
}

/// A pub/sub topic.
///
/// The parent is held by identity only and resolved through the owning
/// service, so nodes never reference each other directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    identity: NodeIdentity,
    parent: Option<NodeIdentity>,
    creator: Jid,
    created_ms: u64,
    modified_ms: u64,
    settings: NodeSettings,
    affiliates: Vec<NodeAffiliate>,
    subscriptions: SubscriptionIndex,
    kind: NodeKind,
    #[serde(skip)]
    saved_to_db: bool,
}

impl Node {
    /// New transient leaf node built from the service's leaf template.
    pub fn new_leaf(
        identity: NodeIdentity,
        parent: Option<NodeIdentity>,
        creator: Jid,
        defaults: &DefaultNodeConfiguration,
    ) -> Self {
        let mut leaf = LeafSettings {
            persist_items: defaults.persist_items,
            max_items: defaults.max_items,
            max_payload_size: defaults.max_payload_size,
            send_item_subscribe: defaults.send_item_subscribe,
            last_published: None,
        };
        if !leaf.persist_items {
            leaf.max_items = 1;
        }
        Self::with_kind(identity, parent, creator, defaults, NodeKind::Leaf(leaf))
    }

    /// New transient collection node built from the service's collection template.
    pub fn new_collection(
        identity: NodeIdentity,
        parent: Option<NodeIdentity>,
        creator: Jid,
        defaults: &DefaultNodeConfiguration,
    ) -> Self {
        let collection = CollectionSettings {
            association_policy: defaults.association_policy,
            association_trusted: Vec::new(),
            max_leaf_nodes: defaults.max_leaf_nodes,
            children: BTreeSet::new(),
        };
        Self::with_kind(
            identity,
            parent,
            creator,
            defaults,
            NodeKind::Collection(collection),
        )
    }

    fn with_kind(
        identity: NodeIdentity,
        parent: Option<NodeIdentity>,
        creator: Jid,
        defaults: &DefaultNodeConfiguration,
        kind: NodeKind,
    ) -> Self {
        let now = now_ms();
        Self {
            identity,
            parent,
            creator,
            created_ms: now,
            modified_ms: now,
            settings: NodeSettings::from_defaults(defaults),
            affiliates: Vec::new(),
            subscriptions: SubscriptionIndex::new(),
            kind,
            saved_to_db: false,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    pub fn parent(&self) -> Option<&NodeIdentity> {
        self.parent.as_ref()
    }

    pub fn creator(&self) -> &Jid {
        &self.creator
    }

    pub fn created_ms(&self) -> u64 {
        self.created_ms
    }

    pub fn modified_ms(&self) -> u64 {
        self.modified_ms
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, NodeKind::Collection(_))
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none() && self.is_collection()
    }

    pub fn leaf(&self) -> Option<&LeafSettings> {
        match &self.kind {
            NodeKind::Leaf(leaf) => Some(leaf),
            NodeKind::Collection(_) => None,
        }
    }

    pub fn collection(&self) -> Option<&CollectionSettings> {
        match &self.kind {
            NodeKind::Collection(collection) => Some(collection),
            NodeKind::Leaf(_) => None,
        }
    }

    fn leaf_mut(&mut self) -> Option<&mut LeafSettings> {
        match &mut self.kind {
            NodeKind::Leaf(leaf) => Some(leaf),
            NodeKind::Collection(_) => None,
        }
    }

    fn collection_mut(&mut self) -> Option<&mut CollectionSettings> {
        match &mut self.kind {
            NodeKind::Collection(collection) => Some(collection),
            NodeKind::Leaf(_) => None,
        }
    }

    pub fn saved_to_db(&self) -> bool {
        self.saved_to_db
    }

    pub(crate) fn set_saved_to_db(&mut self, saved: bool) {
        self.saved_to_db = saved;
    }

    pub(crate) fn set_parent(&mut self, parent: Option<NodeIdentity>) {
        self.parent = parent;
    }

    pub(crate) fn touch(&mut self) {
        self.modified_ms = now_ms();
    }

    pub fn affiliates(&self) -> &[NodeAffiliate] {
        &self.affiliates
    }

    pub fn affiliate(&self, jid: &Jid) -> Option<&NodeAffiliate> {
        self.affiliates.iter().find(|a| a.jid == *jid)
    }

    pub fn owners(&self) -> Vec<Jid> {
        self.with_affiliation(Affiliation::Owner)
    }

    pub fn publishers(&self) -> Vec<Jid> {
        self.with_affiliation(Affiliation::Publisher)
    }

    fn with_affiliation(&self, affiliation: Affiliation) -> Vec<Jid> {
        self.affiliates
            .iter()
            .filter(|a| a.affiliation == affiliation)
            .map(|a| a.jid.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> &SubscriptionIndex {
        &self.subscriptions
    }

    pub fn subscription(&self, id: &str) -> Option<&NodeSubscription> {
        self.subscriptions.get(id)
    }

    /// Subscription lookup by delivery address.
    ///
    /// Ambiguous when multiple subscriptions are enabled and the address
    /// holds more than one; callers must then go by id.
    pub fn subscription_by_jid(
        &self,
        jid: &Jid,
        multiple_enabled: bool,
    ) -> Result<Option<&NodeSubscription>, ModelError> {
        let subs = self.subscriptions.by_jid(jid);
        if multiple_enabled && subs.len() > 1 {
            return Err(ModelError::SubscriptionIdRequired);
        }
        Ok(subs.into_iter().next())
    }

    /// Pending subscriptions; always empty unless the access model needs
    /// authorization.
    pub fn pending_subscriptions(&self) -> Vec<&NodeSubscription> {
        if !self.settings.access_model.requires_authorization() {
            return Vec::new();
        }
        self.subscriptions
            .iter()
            .filter(|s| s.is_authorization_pending())
            .collect()
    }

    /// Owners and service admins, retried with the bare address.
    pub fn is_admin(&self, jid: &Jid, service: &ServiceConfig) -> bool {
        if self.owners().contains(jid) || service.is_service_admin(jid) {
            return true;
        }
        !jid.is_bare() && self.is_admin(&jid.bare(), service)
    }

    /// Publisher-model check. Admins may always publish.
    pub fn can_publish(&self, jid: &Jid, service: &ServiceConfig) -> bool {
        if self.is_admin(jid, service) {
            return true;
        }
        let bare = jid.bare();
        let affiliation = self
            .affiliate(jid)
            .or_else(|| self.affiliate(&bare))
            .map(|a| a.affiliation);
        match self.settings.publisher_model {
            PublisherModel::Open => affiliation != Some(Affiliation::Outcast),
            PublisherModel::Publishers => affiliation == Some(Affiliation::Publisher),
            PublisherModel::Subscribers => {
                affiliation == Some(Affiliation::Publisher)
                    || self
                        .subscriptions
                        .owned_by(&bare)
                        .iter()
                        .any(|s| s.is_active())
            }
        }
    }

    pub fn is_presence_based_delivery(&self) -> bool {
        self.settings.presence_based_delivery
    }

    /// Whether a published item must carry its payload to the store.
    pub fn is_item_required(&self) -> bool {
        self.leaf()
            .is_some_and(|leaf| leaf.persist_items || self.settings.deliver_payloads)
    }

    pub fn add_owner(&mut self, jid: &Jid, service: &ServiceConfig) -> Vec<NodeChange> {
        self.add_privileged(jid, Affiliation::Owner, service)
    }

    pub fn add_publisher(&mut self, jid: &Jid, service: &ServiceConfig) -> Vec<NodeChange> {
        self.add_privileged(jid, Affiliation::Publisher, service)
    }

    /// Grants `affiliation`, then either approves the entity's pending
    /// subscriptions or gives it a default subscription when it has none.
    /// Nothing happens when `jid` already holds `affiliation`.
    fn add_privileged(
        &mut self,
        jid: &Jid,
        affiliation: Affiliation,
        service: &ServiceConfig,
    ) -> Vec<NodeChange> {
        let mut changes = self.set_affiliation(jid, affiliation);
        if changes.is_empty() {
            return changes;
        }
        let owned = self.subscriptions.ids_owned_by(jid);
        if owned.is_empty() {
            if let Ok((_, created)) = self.create_subscription(jid, jid, false, None, service) {
                changes.extend(created);
            }
        } else {
            for id in owned {
                if let Some(sub) = self.subscriptions.get_mut(&id) {
                    if sub.is_authorization_pending() {
                        sub.state = SubscriptionState::Subscribed;
                        changes.push(NodeChange::SubscriptionUpdated(sub.clone()));
                    }
                }
            }
        }
        changes
    }

    pub fn remove_owner(&mut self, jid: &Jid) -> Vec<NodeChange> {
        self.demote(jid, Affiliation::Owner)
    }

    pub fn remove_publisher(&mut self, jid: &Jid) -> Vec<NodeChange> {
        self.demote(jid, Affiliation::Publisher)
    }

    /// Drops `affiliation` from `jid`. An entity still holding subscriptions
    /// keeps a `none` record so those stay attributable.
    fn demote(&mut self, jid: &Jid, affiliation: Affiliation) -> Vec<NodeChange> {
        if self.affiliate(jid).map(|a| a.affiliation) != Some(affiliation) {
            return Vec::new();
        }
        if self.subscriptions.owned_by(jid).is_empty() {
            let mut changes = self.remove_affiliation(jid);
            changes.extend(self.remove_subscriptions(jid));
            changes
        } else {
            self.set_affiliation(jid, Affiliation::None)
        }
    }

    /// Sets a `none` affiliation. Without subscriptions such a record means
    /// nothing, so any existing affiliation is removed instead.
    pub fn add_none_affiliation(&mut self, jid: &Jid) -> Vec<NodeChange> {
        if self.subscriptions.owned_by(jid).is_empty() {
            return self.remove_affiliation(jid);
        }
        self.set_affiliation(jid, Affiliation::None)
    }

    /// Bans `jid` and cancels its subscriptions.
    pub fn add_outcast(&mut self, jid: &Jid) -> Vec<NodeChange> {
        let mut changes = self.set_affiliation(jid, Affiliation::Outcast);
        changes.extend(self.remove_subscriptions(jid));
        changes
    }

    pub fn remove_outcast(&mut self, jid: &Jid) -> Vec<NodeChange> {
        if self.affiliate(jid).map(|a| a.affiliation) != Some(Affiliation::Outcast) {
            return Vec::new();
        }
        self.remove_affiliation(jid)
    }

    fn set_affiliation(&mut self, jid: &Jid, affiliation: Affiliation) -> Vec<NodeChange> {
        match self.affiliates.iter_mut().find(|a| a.jid == *jid) {
            Some(existing) if existing.affiliation == affiliation => Vec::new(),
            Some(existing) => {
                existing.affiliation = affiliation;
                vec![NodeChange::AffiliateUpdated(existing.clone())]
            }
            None => {
                let affiliate = NodeAffiliate::new(self.identity.clone(), jid.clone(), affiliation);
                self.affiliates.push(affiliate.clone());
                vec![NodeChange::AffiliateCreated(affiliate)]
            }
        }
    }

    fn remove_affiliation(&mut self, jid: &Jid) -> Vec<NodeChange> {
        match self.affiliates.iter().position(|a| a.jid == *jid) {
            Some(pos) => vec![NodeChange::AffiliateRemoved(self.affiliates.remove(pos))],
            None => Vec::new(),
        }
    }

    fn remove_subscriptions(&mut self, owner: &Jid) -> Vec<NodeChange> {
        self.subscriptions
            .ids_owned_by(owner)
            .into_iter()
            .flat_map(|id| self.cancel_subscription(&id))
            .collect()
    }

    /// Registers a new subscription.
    ///
    /// The initial state is `unconfigured` when the node requires
    /// configuration, `pending` when authorization is required and `owner`
    /// is no admin, and `subscribed` otherwise. A second request for an
    /// address that already has a pending subscription is rejected.
    pub fn create_subscription(
        &mut self,
        owner: &Jid,
        jid: &Jid,
        authorization_required: bool,
        options: Option<&SubscriptionForm>,
        service: &ServiceConfig,
    ) -> Result<(NodeSubscription, Vec<NodeChange>), ModelError> {
        if self
            .subscriptions
            .by_jid(jid)
            .iter()
            .any(|s| s.is_authorization_pending())
        {
            return Err(ModelError::PendingSubscriptionConflict { jid: jid.clone() });
        }

        let mut changes = Vec::new();
        if self.affiliate(owner).is_none() {
            changes.extend(self.set_affiliation(owner, Affiliation::None));
        }

        let state = if self.settings.subscription_configuration_required {
            SubscriptionState::Unconfigured
        } else if authorization_required && !self.is_admin(owner, service) {
            SubscriptionState::Pending
        } else {
            SubscriptionState::Subscribed
        };

        let mut sub = NodeSubscription::new(self.identity.clone(), owner.clone(), jid.clone(), state);
        if let Some(form) = options {
            sub.apply_form(form);
        }
        self.subscriptions.insert(sub.clone());
        changes.push(NodeChange::SubscriptionCreated(sub.clone()));

        if self.is_presence_based_delivery()
            && self.subscriptions.owned_by(owner).len() == 1
            && !sub.uses_presence_filter()
        {
            changes.push(NodeChange::PresenceRequired(owner.clone()));
        }
        Ok((sub, changes))
    }

    /// Removes a subscription from both indexes and collects a `none`
    /// affiliate left with no subscriptions.
    pub fn cancel_subscription(&mut self, id: &str) -> Vec<NodeChange> {
        let Some(sub) = self.subscriptions.remove(id) else {
            return Vec::new();
        };
        let owner = sub.owner.clone();
        let mut changes = vec![NodeChange::SubscriptionRemoved(sub)];

        let remaining = self.subscriptions.owned_by(&owner).len();
        if remaining == 0
            && self.affiliate(&owner).map(|a| a.affiliation) == Some(Affiliation::None)
        {
            changes.extend(self.remove_affiliation(&owner));
        }
        if self.is_presence_based_delivery() && remaining == 0 {
            changes.push(NodeChange::PresenceNotRequired(owner));
        }
        changes
    }

    /// Resolves a pending subscription. Anything not pending is left alone.
    pub fn approve_subscription(
        &mut self,
        id: &str,
        approved: bool,
    ) -> Result<Vec<NodeChange>, ModelError> {
        let sub = self
            .subscriptions
            .get_mut(id)
            .ok_or_else(|| ModelError::SubscriptionNotFound(id.to_string()))?;
        if !sub.is_authorization_pending() {
            return Ok(Vec::new());
        }
        if approved {
            sub.state = SubscriptionState::Subscribed;
            Ok(vec![NodeChange::SubscriptionUpdated(sub.clone())])
        } else {
            Ok(self.cancel_subscription(id))
        }
    }

    /// Applies subscription options. An unconfigured subscription becomes
    /// pending or subscribed once real delivery options arrive.
    pub fn configure_subscription(
        &mut self,
        id: &str,
        form: &SubscriptionForm,
        service: &ServiceConfig,
    ) -> Result<Vec<NodeChange>, ModelError> {
        let owner = self
            .subscriptions
            .get(id)
            .map(|s| s.owner.clone())
            .ok_or_else(|| ModelError::SubscriptionNotFound(id.to_string()))?;
        let next_state = if self.settings.access_model.requires_authorization()
            && !self.is_admin(&owner, service)
        {
            SubscriptionState::Pending
        } else {
            SubscriptionState::Subscribed
        };
        let presence_based = self.is_presence_based_delivery();

        let Some(sub) = self.subscriptions.get_mut(id) else {
            return Err(ModelError::SubscriptionNotFound(id.to_string()));
        };
        let toggled = sub.apply_form(form);
        if sub.is_configuration_pending() && form.has_delivery_fields() {
            sub.state = next_state;
        }

        let mut changes = vec![NodeChange::SubscriptionUpdated(sub.clone())];
        if !presence_based && toggled {
            changes.push(if sub.uses_presence_filter() {
                NodeChange::PresenceRequired(owner)
            } else {
                NodeChange::PresenceNotRequired(owner)
            });
        }
        Ok(changes)
    }

    /// Applies a configuration form.
    ///
    /// Parent and child lists are resolved by the service before this is
    /// called; everything else is validated here before any field changes.
    pub fn configure(
        &mut self,
        form: &NodeConfigForm,
        service: &ServiceConfig,
    ) -> Result<Vec<NodeChange>, ModelError> {
        if form.owners.as_ref().is_some_and(Vec::is_empty) {
            return Err(ModelError::ConfigurationRejected(
                "a node must keep at least one owner".to_string(),
            ));
        }
        if form.max_items.is_some_and(|v| v < UNLIMITED)
            || form.max_leaf_nodes.is_some_and(|v| v < UNLIMITED)
        {
            return Err(ModelError::ConfigurationRejected(
                "limits must be -1 or positive".to_string(),
            ));
        }

        let was_presence_based = self.is_presence_based_delivery();
        form.apply_common(&mut self.settings);

        match &mut self.kind {
            NodeKind::Leaf(leaf) => {
                if let Some(v) = form.persist_items {
                    leaf.persist_items = v;
                }
                if let Some(v) = form.max_items {
                    leaf.max_items = v;
                }
                if let Some(v) = form.max_payload_size {
                    leaf.max_payload_size = v;
                }
                if let Some(v) = form.send_item_subscribe {
                    leaf.send_item_subscribe = v;
                }
                if !leaf.persist_items {
                    leaf.max_items = 1;
                }
            }
            NodeKind::Collection(collection) => {
                if let Some(v) = form.association_policy {
                    collection.association_policy = v;
                }
                if let Some(v) = &form.association_whitelist {
                    collection.association_trusted = v.clone();
                }
                if let Some(v) = form.max_leaf_nodes {
                    collection.max_leaf_nodes = v;
                }
            }
        }

        let mut changes = Vec::new();
        if let Some(owners) = &form.owners {
            for old in self.owners() {
                if !owners.contains(&old) {
                    changes.extend(self.remove_owner(&old));
                }
            }
            let current = self.owners();
            for new in owners {
                if !current.contains(new) {
                    changes.extend(self.add_owner(new, service));
                }
            }
        }
        if let Some(publishers) = &form.publishers {
            for old in self.publishers() {
                if !publishers.contains(&old) {
                    changes.extend(self.remove_publisher(&old));
                }
            }
            let current = self.publishers();
            for new in publishers {
                if !current.contains(new) {
                    changes.extend(self.add_publisher(new, service));
                }
            }
        }

        self.touch();
        changes.push(NodeChange::NodeUpdated);

        if was_presence_based != self.is_presence_based_delivery() {
            if self.is_presence_based_delivery() {
                changes.extend(self.presence_acquire_all());
            } else {
                changes.extend(self.presence_release_unfiltered());
            }
        }
        Ok(changes)
    }

    fn presence_acquire_all(&self) -> Vec<NodeChange> {
        self.affiliates
            .iter()
            .filter(|a| a.affiliation != Affiliation::Outcast)
            .map(|a| NodeChange::PresenceRequired(a.jid.clone()))
            .collect()
    }

    fn presence_release_unfiltered(&self) -> Vec<NodeChange> {
        let mut owners: Vec<Jid> = self
            .subscriptions
            .iter()
            .filter(|s| !s.uses_presence_filter())
            .map(|s| s.owner.clone())
            .collect();
        owners.dedup();
        owners
            .into_iter()
            .map(NodeChange::PresenceNotRequired)
            .collect()
    }

    /// Presence subscriptions to drop when the node goes away.
    pub fn presence_release_on_delete(&self) -> Vec<NodeChange> {
        let presence_based = self.is_presence_based_delivery();
        let mut owners: Vec<Jid> = Vec::new();
        for sub in self.subscriptions.iter() {
            if (presence_based || sub.uses_presence_filter()) && !owners.contains(&sub.owner) {
                owners.push(sub.owner.clone());
            }
        }
        owners
            .into_iter()
            .map(NodeChange::PresenceNotRequired)
            .collect()
    }

    /// Replaces affiliates and subscriptions with rows loaded from a store.
    pub(crate) fn restore_membership(
        &mut self,
        affiliates: Vec<NodeAffiliate>,
        subscriptions: Vec<NodeSubscription>,
    ) {
        self.affiliates = affiliates;
        self.subscriptions = SubscriptionIndex::from(subscriptions);
    }

    /// Clears affiliates and subscriptions after deletion.
    pub(crate) fn clear_membership(&mut self) {
        self.affiliates.clear();
        self.subscriptions.clear();
    }

    /// Whether `jid` may attach a child to this collection.
    pub fn is_association_allowed(&self, jid: &Jid, service: &ServiceConfig) -> bool {
        let Some(collection) = self.collection() else {
            return false;
        };
        match collection.association_policy {
            AssociationPolicy::All => true,
            AssociationPolicy::Owners => self.is_admin(jid, service),
            AssociationPolicy::Whitelist => {
                self.is_admin(jid, service)
                    || collection.association_trusted.contains(jid)
                    || collection.association_trusted.contains(&jid.bare())
            }
        }
    }

    /// True when `leaf_children` already meets the collection's limit.
    pub fn is_max_leaf_nodes_reached(&self, leaf_children: usize) -> bool {
        self.collection().is_some_and(|c| {
            c.max_leaf_nodes != UNLIMITED && leaf_children >= c.max_leaf_nodes.max(0) as usize
        })
    }

    pub fn children(&self) -> Vec<NodeIdentity> {
        self.collection()
            .map(|c| c.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn add_child(&mut self, child: NodeIdentity) {
        if let Some(collection) = self.collection_mut() {
            collection.children.insert(child);
        }
    }

    pub(crate) fn remove_child(&mut self, child: &NodeIdentity) {
        if let Some(collection) = self.collection_mut() {
            collection.children.remove(child);
        }
    }

    pub fn last_published(&self) -> Option<&PublishedItem> {
        self.leaf().and_then(|leaf| leaf.last_published.as_ref())
    }

    /// Records `item` as the most recent publication unless a newer one is
    /// already known.
    pub(crate) fn set_last_published(&mut self, item: PublishedItem) {
        if let Some(leaf) = self.leaf_mut() {
            let newer = leaf
                .last_published
                .as_ref()
                .is_none_or(|last| last.created_ms <= item.created_ms);
            if newer {
                leaf.last_published = Some(item);
            }
        }
    }

    /// Forgets the last published item if its id is among `item_ids`.
    pub(crate) fn forget_last_published(&mut self, item_ids: &[String]) {
        if let Some(leaf) = self.leaf_mut() {
            if leaf
                .last_published
                .as_ref()
                .is_some_and(|last| item_ids.contains(&last.item_id))
            {
                leaf.last_published = None;
            }
        }
    }
}
