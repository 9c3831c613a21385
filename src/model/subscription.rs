use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};

use crate::types::{Jid, NodeIdentity, SubscriptionType};

/// Length of generated subscription ids.
pub const SUBSCRIPTION_ID_LEN: usize = 40;

/// Default digest period in milliseconds (one day).
pub const DEFAULT_DIGEST_FREQUENCY_MS: u32 = 86_400_000;

/// Authorization state of a subscription.
///
/// `None` is the terminal-deleted state; it is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    None,
    Pending,
    Unconfigured,
    Subscribed,
}

impl SubscriptionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Unconfigured => "unconfigured",
            Self::Subscribed => "subscribed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "pending" => Some(Self::Pending),
            "unconfigured" => Some(Self::Unconfigured),
            "subscribed" => Some(Self::Subscribed),
            _ => None,
        }
    }
}

/// How deep below a collection node notifications are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionDepth {
    /// Direct children only.
    One,
    /// Every descendant.
    All,
}

/// Delivery options of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    pub deliver: bool,
    pub digest: bool,
    pub digest_frequency_ms: u32,
    /// Expiry in milliseconds since epoch.
    pub expire_ms: Option<u64>,
    pub include_body: bool,
    /// Presence show values that gate delivery. Empty means no filter.
    pub presence_states: Vec<String>,
    pub subscription_type: SubscriptionType,
    pub depth: SubscriptionDepth,
    pub keyword: Option<String>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            deliver: true,
            digest: false,
            digest_frequency_ms: DEFAULT_DIGEST_FREQUENCY_MS,
            expire_ms: None,
            include_body: false,
            presence_states: Vec::new(),
            subscription_type: SubscriptionType::Nodes,
            depth: SubscriptionDepth::One,
            keyword: None,
        }
    }
}

/// Sparse subscription options submission. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionForm {
    pub deliver: Option<bool>,
    pub digest: Option<bool>,
    pub digest_frequency_ms: Option<u32>,
    pub expire_ms: Option<u64>,
    pub include_body: Option<bool>,
    pub presence_states: Option<Vec<String>>,
    pub keyword: Option<String>,
    pub subscription_type: Option<SubscriptionType>,
    pub depth: Option<SubscriptionDepth>,
}

impl SubscriptionForm {
    /// True when the form carries at least one option that moves an
    /// unconfigured subscription forward. Type and depth alone do not.
    pub fn has_delivery_fields(&self) -> bool {
        self.deliver.is_some()
            || self.digest.is_some()
            || self.digest_frequency_ms.is_some()
            || self.expire_ms.is_some()
            || self.include_body.is_some()
            || self.presence_states.is_some()
            || self.keyword.is_some()
    }

    fn apply_to(&self, options: &mut SubscriptionOptions) {
        if let Some(v) = self.subscription_type {
            options.subscription_type = v;
        }
        if let Some(v) = self.depth {
            options.depth = v;
        }
        if let Some(v) = self.deliver {
            options.deliver = v;
        }
        if let Some(v) = self.digest {
            options.digest = v;
        }
        if let Some(v) = self.digest_frequency_ms {
            options.digest_frequency_ms = v;
        }
        if let Some(v) = self.expire_ms {
            options.expire_ms = Some(v);
        }
        if let Some(v) = self.include_body {
            options.include_body = v;
        }
        if let Some(v) = &self.presence_states {
            options.presence_states = v.clone();
        }
        if let Some(v) = &self.keyword {
            options.keyword = (!v.is_empty()).then(|| v.clone());
        }
    }
}

/// One delivery registration on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSubscription {
    pub node: NodeIdentity,
    pub id: String,
    /// Entity that owns the subscription (bare address of the subscriber).
    pub owner: Jid,
    /// Address notifications are delivered to.
    pub jid: Jid,
    pub state: SubscriptionState,
    pub options: SubscriptionOptions,
}

impl NodeSubscription {
    pub fn new(node: NodeIdentity, owner: Jid, jid: Jid, state: SubscriptionState) -> Self {
        Self {
            node,
            id: generate_subscription_id(),
            owner,
            jid,
            state,
            options: SubscriptionOptions::default(),
        }
    }

    pub fn is_authorization_pending(&self) -> bool {
        self.state == SubscriptionState::Pending
    }

    pub fn is_configuration_pending(&self) -> bool {
        self.state == SubscriptionState::Unconfigured
    }

    pub fn is_active(&self) -> bool {
        self.state == SubscriptionState::Subscribed
    }

    pub fn uses_presence_filter(&self) -> bool {
        !self.options.presence_states.is_empty()
    }

    /// Applies `form` and returns whether presence filtering was toggled.
    pub(crate) fn apply_form(&mut self, form: &SubscriptionForm) -> bool {
        let was_filtering = self.uses_presence_filter();
        form.apply_to(&mut self.options);
        was_filtering != self.uses_presence_filter()
    }
}

/// Random alphanumeric subscription id.
pub fn generate_subscription_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUBSCRIPTION_ID_LEN)
        .map(char::from)
        .collect()
}
