//! Pub/sub node model with a write-behind cache in front of a durable store.
//!
//! Node, affiliation and subscription changes are queued per node and
//! coalesced; published items are buffered and written in one bulk write per
//! node. Reads flush the node they touch first, so they always observe every
//! write enqueued before them.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use pubsubcache::{
//!     cache::CachingProvider,
//!     config::{CacheConfig, ServiceConfig},
//!     item::ItemDraft,
//!     persist::memory::MemoryStore,
//!     service::{NoopPresenceTracker, PubSubService},
//!     types::{Jid, ServiceId},
//! };
//!
//! let provider = Arc::new(CachingProvider::new(
//!     Arc::new(MemoryStore::new()),
//!     CacheConfig::default(),
//! ));
//! let service = PubSubService::start(
//!     ServiceId::new("pubsub.example.org"),
//!     ServiceConfig::default(),
//!     Arc::clone(&provider),
//!     Arc::new(NoopPresenceTracker),
//! )
//! .expect("start service");
//!
//! let owner = Jid::new("alice@example.org/phone");
//! service
//!     .create_node(&owner, "news", true, None, None)
//!     .expect("create node");
//! service
//!     .publish("news", &owner, vec![ItemDraft::new("1", "hello")])
//!     .expect("publish");
//!
//! let items = service.get_published_items("news", None).expect("read");
//! assert_eq!(items.len(), 1);
//! provider.shutdown();
//! ```

/// Write-behind coordinator, pending queues and the flush worker.
pub mod cache;
/// Cluster flush coordination.
pub mod cluster;
/// Cache and service configuration.
pub mod config;
/// Published items.
pub mod item;
/// Node, affiliation and subscription model.
pub mod model;
/// Pending store operations.
pub mod op;
/// Durable store contract and its SQLite and in-memory implementations.
pub mod persist;
/// Node registry and client-facing operations.
pub mod service;
/// Shared identifiers and policy enums.
pub mod types;
