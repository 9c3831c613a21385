//! Node settings, per-service defaults, and the sparse configuration form.

use serde::{Deserialize, Serialize};

use crate::types::{AccessModel, AssociationPolicy, ItemReplyPolicy, Jid, PublisherModel};

/// Default payload size limit for new leaf nodes, in bytes.
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 5120;

/// Marker for "no limit" on item and child counts.
pub const UNLIMITED: i32 = -1;

/// Per-service template applied to newly created nodes of one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultNodeConfiguration {
    /// True for the leaf template, false for the collection template.
    pub leaf: bool,
    pub deliver_payloads: bool,
    pub max_payload_size: u32,
    pub persist_items: bool,
    pub max_items: i32,
    pub notify_config_changes: bool,
    pub notify_delete: bool,
    pub notify_retract: bool,
    pub presence_based_delivery: bool,
    pub send_item_subscribe: bool,
    pub publisher_model: PublisherModel,
    pub subscription_enabled: bool,
    pub access_model: AccessModel,
    pub language: String,
    pub reply_policy: Option<ItemReplyPolicy>,
    pub association_policy: AssociationPolicy,
    pub max_leaf_nodes: i32,
}

impl DefaultNodeConfiguration {
    /// Built-in leaf template used when a service has none stored.
    pub fn leaf() -> Self {
        Self {
            leaf: true,
            deliver_payloads: true,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            persist_items: false,
            max_items: UNLIMITED,
            notify_config_changes: true,
            notify_delete: true,
            notify_retract: true,
            presence_based_delivery: false,
            send_item_subscribe: true,
            publisher_model: PublisherModel::Publishers,
            subscription_enabled: true,
            access_model: AccessModel::Open,
            language: "English".to_string(),
            reply_policy: None,
            association_policy: AssociationPolicy::All,
            max_leaf_nodes: UNLIMITED,
        }
    }

    /// Built-in collection template used when a service has none stored.
    pub fn collection() -> Self {
        Self {
            leaf: false,
            deliver_payloads: false,
            max_payload_size: 0,
            persist_items: false,
            max_items: 0,
            send_item_subscribe: false,
            ..Self::leaf()
        }
    }
}

/// Configuration shared by leaf and collection nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSettings {
    pub deliver_payloads: bool,
    pub notify_config_changes: bool,
    pub notify_delete: bool,
    pub notify_retract: bool,
    pub presence_based_delivery: bool,
    pub subscription_enabled: bool,
    pub subscription_configuration_required: bool,
    pub access_model: AccessModel,
    pub publisher_model: PublisherModel,
    pub title: String,
    pub description: String,
    pub language: String,
    pub payload_type: String,
    pub body_xslt: String,
    pub dataform_xslt: String,
    pub contacts: Vec<Jid>,
    pub roster_groups_allowed: Vec<String>,
    pub reply_policy: Option<ItemReplyPolicy>,
    pub reply_rooms: Vec<Jid>,
    pub reply_to: Vec<Jid>,
}

impl NodeSettings {
    pub fn from_defaults(defaults: &DefaultNodeConfiguration) -> Self {
        Self {
            deliver_payloads: defaults.deliver_payloads,
            notify_config_changes: defaults.notify_config_changes,
            notify_delete: defaults.notify_delete,
            notify_retract: defaults.notify_retract,
            presence_based_delivery: defaults.presence_based_delivery,
            subscription_enabled: defaults.subscription_enabled,
            subscription_configuration_required: false,
            access_model: defaults.access_model,
            publisher_model: defaults.publisher_model,
            title: String::new(),
            description: String::new(),
            language: defaults.language.clone(),
            payload_type: String::new(),
            body_xslt: String::new(),
            dataform_xslt: String::new(),
            contacts: Vec::new(),
            roster_groups_allowed: Vec::new(),
            reply_policy: defaults.reply_policy,
            reply_rooms: Vec::new(),
            reply_to: Vec::new(),
        }
    }
}

/// Sparse node configuration submission.
///
/// Absent fields keep their current value. Leaf fields are ignored by
/// collection nodes and vice versa.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeConfigForm {
    pub deliver_payloads: Option<bool>,
    pub notify_config_changes: Option<bool>,
    pub notify_delete: Option<bool>,
    pub notify_retract: Option<bool>,
    pub presence_based_delivery: Option<bool>,
    pub subscription_enabled: Option<bool>,
    pub subscription_configuration_required: Option<bool>,
    pub access_model: Option<AccessModel>,
    pub publisher_model: Option<PublisherModel>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub payload_type: Option<String>,
    pub body_xslt: Option<String>,
    pub dataform_xslt: Option<String>,
    pub contacts: Option<Vec<Jid>>,
    pub roster_groups_allowed: Option<Vec<String>>,
    pub reply_policy: Option<ItemReplyPolicy>,
    pub reply_rooms: Option<Vec<Jid>>,
    pub reply_to: Option<Vec<Jid>>,
    /// Complete new owner list. An explicit empty list is rejected.
    pub owners: Option<Vec<Jid>>,
    /// Complete new publisher list.
    pub publishers: Option<Vec<Jid>>,
    /// Node id of the new parent collection.
    pub parent: Option<String>,

    pub persist_items: Option<bool>,
    pub max_items: Option<i32>,
    pub max_payload_size: Option<u32>,
    pub send_item_subscribe: Option<bool>,

    pub association_policy: Option<AssociationPolicy>,
    pub association_whitelist: Option<Vec<Jid>>,
    pub max_leaf_nodes: Option<i32>,
    /// Node ids of the complete new child list.
    pub children: Option<Vec<String>>,
}

impl NodeConfigForm {
    pub(crate) fn apply_common(&self, settings: &mut NodeSettings) {
        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = &self.$field {
                    settings.$field = v.clone();
                })*
            };
        }
        set!(
            deliver_payloads,
            notify_config_changes,
            notify_delete,
            notify_retract,
            presence_based_delivery,
            subscription_enabled,
            subscription_configuration_required,
            access_model,
            publisher_model,
            title,
            description,
            language,
            payload_type,
            body_xslt,
            dataform_xslt,
            contacts,
            roster_groups_allowed,
            reply_rooms,
            reply_to,
        );
        if let Some(policy) = self.reply_policy {
            settings.reply_policy = Some(policy);
        }
    }
}
