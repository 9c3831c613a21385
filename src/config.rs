//! Cache and service configuration.
//!
//! Every section is `#[serde(default)]`, so a partial JSON document only
//! overrides the keys it names:
//!
//! ```
//! use pubsubcache::config::PubSubConfig;
//!
//! let cfg = PubSubConfig::from_json_str(r#"{ "cache": { "flush_timer_secs": 5 } }"#)
//!     .expect("parse");
//! assert_eq!(cfg.cache.flush_period().as_secs(), 20);
//! assert_eq!(cfg.cache.max_items_flush, 1000);
//! assert!(cfg.service.multiple_subscriptions_enabled);
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Jid;

/// Shortest allowed periodic flush interval, in seconds.
pub const MIN_FLUSH_TIMER_SECS: u64 = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write-behind cache tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Periodic flush interval; values below the floor are raised to it.
    pub flush_timer_secs: u64,
    /// Pending item count that triggers an asynchronous full flush.
    /// Zero disables both the threshold and the periodic timer.
    pub max_items_flush: usize,
    /// Upper bound on rows fetched by one item query.
    pub max_rows_fetch: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            flush_timer_secs: 120,
            max_items_flush: 1000,
            max_rows_fetch: 2000,
        }
    }
}

impl CacheConfig {
    pub fn flush_period(&self) -> Duration {
        Duration::from_secs(self.flush_timer_secs.max(MIN_FLUSH_TIMER_SECS))
    }

    pub fn timer_enabled(&self) -> bool {
        self.max_items_flush > 0
    }
}

/// Per-service policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub multiple_subscriptions_enabled: bool,
    pub node_creation_restricted: bool,
    pub allowed_to_create: Vec<Jid>,
    pub sys_admins: Vec<Jid>,
    /// Node id of the root collection node.
    pub root_node_id: String,
    /// Owner of a freshly created root node. Defaults to the service id.
    pub root_creator: Option<Jid>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            multiple_subscriptions_enabled: true,
            node_creation_restricted: false,
            allowed_to_create: Vec::new(),
            sys_admins: Vec::new(),
            root_node_id: String::new(),
            root_creator: None,
        }
    }
}

impl ServiceConfig {
    /// Checks the full address first, then the bare one.
    pub fn is_service_admin(&self, jid: &Jid) -> bool {
        self.sys_admins.contains(jid) || self.sys_admins.contains(&jid.bare())
    }

    pub fn can_create_node(&self, jid: &Jid) -> bool {
        if !self.node_creation_restricted || self.is_service_admin(jid) {
            return true;
        }
        let bare = jid.bare();
        self.allowed_to_create
            .iter()
            .any(|allowed| *allowed == bare || allowed == jid)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    pub cache: CacheConfig,
    pub service: ServiceConfig,
}

impl PubSubConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}
