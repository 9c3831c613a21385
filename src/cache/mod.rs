//! Write-behind cache coordinator.

pub mod events;
pub mod pending;
pub mod provider;
mod stripes;
pub mod worker;

pub use events::CacheEvent;
pub use pending::{PendingItems, PendingOperations};
pub use provider::{CachingProvider, FlushReport};
pub use worker::{FlushWorker, WorkerError, spawn_flush_worker};
