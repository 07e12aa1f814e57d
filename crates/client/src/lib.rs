//! `waybill-client`
//!
//! **Responsibility:** offline-aware sync core for the field client.
//!
//! This crate provides:
//! - A persistent local store (SQLite) with entity cache and preferences
//! - A durable offline mutation queue with ordered replay and id reconciliation
//! - A request dispatcher that defers writes and serves cached reads when offline
//! - A realtime event channel with bounded reconnect
//!
//! The server stays the authority; local state is a cache plus a queue of
//! intended mutations.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod dispatcher;
pub mod queue;
pub mod realtime;
pub mod store;
pub mod sync_worker;
pub mod transport;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use waybill_events::{EventBus, InMemoryEventBus, SyncEvent};

pub use api::{ApiClient, ApiError, ErrorClass};
pub use cache::{EntityCache, Preferences};
pub use config::{ClientConfig, ConfigError, StoreLocation};
pub use connectivity::{Connectivity, ConnectivityMonitor, ConnectivityProbe, HealthCheckProbe};
pub use context::SyncContext;
pub use dispatcher::{DeferredSuccess, DispatchError, DispatchResponse, RequestDispatcher};
pub use queue::{DrainReport, Mutation, OfflineQueue, QueueError};
pub use realtime::{ConnectionStatus, RealtimeChannel, ReconnectPolicy};
pub use store::{LocalStore, MemoryStore, Partition, SqliteStore, StoreError};
pub use sync_worker::SyncWorker;

/// Bus carrying [`SyncEvent`] notifications to the application.
pub type SyncBus = Arc<InMemoryEventBus<SyncEvent>>;

/// Publish on `bus`; a failed publish is logged, never propagated.
pub(crate) fn publish(bus: &SyncBus, event: SyncEvent) {
    let kind = event.kind();
    if let Err(err) = bus.publish(event) {
        tracing::error!(kind, "failed to publish sync event: {err:?}");
    }
}
