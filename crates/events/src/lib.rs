//! `waybill-events`: event plumbing shared by the sync client.
//!
//! - [`envelope`]: realtime wire messages (inbound events, outbound messages).
//! - [`registry`]: callback registry keyed by event type, with a `*` bucket.
//! - [`bus`]: fan-out pub/sub for [`SyncEvent`] notifications.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;
pub mod registry;
pub mod sync_event;

pub use bus::{EventBus, Subscription};
pub use envelope::{ConnectMessage, EnvelopeError, InboundEvent, OutboundMessage, WILDCARD, kinds};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use registry::{DispatchOutcome, EventRegistry, Routable, SubscriptionHandle};
pub use sync_event::SyncEvent;
