//! Process-local [`EventBus`] used for [`SyncEvent`](crate::SyncEvent) fan-out.
//!
//! Each subscriber owns an unbounded `std::sync::mpsc` receiver, so publishing
//! never blocks the queue or the API client. A subscriber whose receiver was
//! dropped is forgotten on the next publish.

use std::sync::{Mutex, MutexGuard, mpsc::Sender};

use crate::bus::{EventBus, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum InMemoryBusError {
    /// A publisher panicked while holding the listener list.
    #[error("event bus listener list is poisoned")]
    Poisoned,
}

#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    listeners: Mutex<Vec<Sender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Listeners registered so far, minus those pruned by earlier publishes.
    pub fn subscriber_count(&self) -> usize {
        self.listeners().map_or(0, |listeners| listeners.len())
    }

    fn listeners(&self) -> Result<MutexGuard<'_, Vec<Sender<M>>>, InMemoryBusError> {
        self.listeners.lock().map_err(|_| InMemoryBusError::Poisoned)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<usize, Self::Error> {
        let mut listeners = self.listeners()?;
        let before = listeners.len();
        listeners.retain(|listener| listener.send(message.clone()).is_ok());

        let gone = before - listeners.len();
        if gone > 0 {
            tracing::trace!(gone, "dropped closed event listeners");
        }
        Ok(listeners.len())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (sender, receiver) = std::sync::mpsc::channel();
        match self.listeners() {
            Ok(mut listeners) => listeners.push(sender),
            // The subscription stays valid but never receives anything.
            Err(err) => tracing::error!("cannot register event listener: {err}"),
        }
        Subscription::new(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_every_listener_and_counts_them() {
        let bus = InMemoryEventBus::<&str>::new();
        assert_eq!(bus.publish("nobody").unwrap(), 0);

        let first = bus.subscribe();
        let second = bus.subscribe();

        assert_eq!(bus.publish("drain_completed").unwrap(), 2);
        assert_eq!(first.drain(), vec!["drain_completed"]);
        assert_eq!(second.drain(), vec!["drain_completed"]);
    }

    #[test]
    fn late_listener_only_sees_later_messages() {
        let bus = InMemoryEventBus::<u8>::new();
        let early = bus.subscribe();
        bus.publish(1).unwrap();

        let late = bus.subscribe();
        bus.publish(2).unwrap();

        assert_eq!(early.drain(), vec![1, 2]);
        assert_eq!(late.drain(), vec![2]);
    }

    #[test]
    fn closed_listeners_are_forgotten_on_publish() {
        let bus = InMemoryEventBus::<u8>::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        assert_eq!(bus.publish(9).unwrap(), 1);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.drain(), vec![9]);
    }
}
