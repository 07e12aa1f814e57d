//! Fan-out pub/sub for sync notifications (mechanics only).
//!
//! The offline queue, the API client and the sync worker publish
//! [`SyncEvent`](crate::SyncEvent)s here; the application layer subscribes to
//! learn about reconciled ids, operations that need attention, and
//! re-authentication requests.
//!
//! ## Delivery
//!
//! - **Broadcast**: every live subscription receives its own copy.
//! - **Best-effort**: a subscription whose receiver was dropped is pruned on
//!   the next publish. Nothing is persisted; the local store remains the
//!   source of truth for queued operations.
//! - **Ordered per publisher**: messages published from one task arrive in
//!   publish order.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// Receiving end of a bus subscription.
///
/// Non-async on purpose: UI loops poll with [`try_recv`](Self::try_recv) or
/// [`drain`](Self::drain) between frames.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Take every message currently buffered.
    pub fn drain(&self) -> Vec<M> {
        std::iter::from_fn(|| self.receiver.try_recv().ok()).collect()
    }
}

/// Transport-agnostic publish/subscribe contract.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    /// Publish to every live subscriber; returns how many received it.
    fn publish(&self, message: M) -> Result<usize, Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<usize, Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
