//! Callback registry keyed by event type.
//!
//! Each event is delivered to the callbacks registered for its type **and** to
//! the callbacks registered under [`WILDCARD`]. Subscriptions are owned by a
//! [`SubscriptionHandle`]: dropping the handle (or calling
//! [`unsubscribe`](SubscriptionHandle::unsubscribe)) removes exactly that
//! callback, and an event type whose last callback goes away is pruned.
//!
//! A callback that returns an error or panics is logged and skipped; the
//! remaining callbacks for the same event still run.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::envelope::{InboundEvent, WILDCARD};

/// Anything that can be routed by a type name.
pub trait Routable {
    fn route(&self) -> &str;
}

impl Routable for InboundEvent {
    fn route(&self) -> &str {
        &self.event_type
    }
}

type Callback<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

struct Slots<E> {
    next_id: u64,
    by_type: HashMap<String, Vec<(u64, Callback<E>)>>,
}

impl<E> Slots<E> {
    fn remove(&mut self, event_type: &str, id: u64) {
        if let Some(callbacks) = self.by_type.get_mut(event_type) {
            if let Some(pos) = callbacks.iter().position(|(cid, _)| *cid == id) {
                callbacks.remove(pos);
            }
            if callbacks.is_empty() {
                self.by_type.remove(event_type);
            }
        }
    }
}

/// Delivery counts for one dispatched event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub delivered: usize,
    pub failed: usize,
}

/// Multimap from event type to callbacks, plus the wildcard bucket.
pub struct EventRegistry<E> {
    slots: Arc<Mutex<Slots<E>>>,
}

impl<E> Clone for EventRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<E> Default for EventRegistry<E> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                next_id: 0,
                by_type: HashMap::new(),
            })),
        }
    }
}

impl<E> core::fmt::Debug for EventRegistry<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}

impl<E> EventRegistry<E>
where
    E: Routable + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `event_type` (`"*"` for every event).
    pub fn subscribe<F>(&self, event_type: impl Into<String>, callback: F) -> SubscriptionHandle
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let id = {
            let mut slots = self.lock();
            let id = slots.next_id;
            slots.next_id += 1;
            slots
                .by_type
                .entry(event_type.clone())
                .or_default()
                .push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<Slots<E>>> = Arc::downgrade(&self.slots);
        SubscriptionHandle {
            cancel: Some(Box::new(move || {
                if let Some(slots) = weak.upgrade() {
                    slots
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&event_type, id);
                }
            })),
        }
    }

    /// Deliver `event` to its typed subscribers, then to wildcard subscribers.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe freely.
    pub fn dispatch(&self, event: &E) -> DispatchOutcome {
        let route = event.route();
        let callbacks: Vec<Callback<E>> = {
            let slots = self.lock();
            let typed = slots.by_type.get(route).into_iter().flatten();
            let wildcard = if route == WILDCARD {
                None
            } else {
                slots.by_type.get(WILDCARD)
            };
            typed
                .chain(wildcard.into_iter().flatten())
                .map(|(_, cb)| cb.clone())
                .collect()
        };

        let mut outcome = DispatchOutcome::default();
        for cb in callbacks {
            match catch_unwind(AssertUnwindSafe(|| cb(event))) {
                Ok(Ok(())) => outcome.delivered += 1,
                Ok(Err(err)) => {
                    outcome.failed += 1;
                    tracing::error!(event_type = route, "subscriber callback failed: {err:#}");
                }
                Err(_) => {
                    outcome.failed += 1;
                    tracing::error!(event_type = route, "subscriber callback panicked");
                }
            }
        }
        outcome
    }

    /// Callbacks registered for exactly `event_type`.
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.lock().by_type.get(event_type).map(Vec::len).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.lock().by_type.clear();
    }
}

impl<E> EventRegistry<E> {
    /// Event types with at least one callback, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.lock().by_type.keys().cloned().collect();
        types.sort();
        types
    }

    fn lock(&self) -> MutexGuard<'_, Slots<E>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns one registered callback; dropping it unsubscribes.
#[must_use = "dropping the handle unsubscribes the callback"]
pub struct SubscriptionHandle {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the callback registered for the registry's lifetime.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl core::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&InboundEvent) -> anyhow::Result<()> + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, move |_: &InboundEvent| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn typed_and_wildcard_subscribers_each_fire_once() {
        let registry = EventRegistry::<InboundEvent>::new();
        let (typed_hits, typed) = counter();
        let (any_hits, any) = counter();
        let _a = registry.subscribe("shipment_status_update", typed);
        let _b = registry.subscribe(WILDCARD, any);

        let outcome = registry.dispatch(&InboundEvent::new("shipment_status_update", json!({})));

        assert_eq!(outcome, DispatchOutcome { delivered: 2, failed: 0 });
        assert_eq!(typed_hits.load(Ordering::SeqCst), 1);
        assert_eq!(any_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_exactly_one_and_prunes() {
        let registry = EventRegistry::<InboundEvent>::new();
        let (hits, cb) = counter();
        let cb = Arc::new(cb);
        let (c1, c2) = (cb.clone(), cb.clone());
        let first = registry.subscribe("notification", move |e| c1(e));
        let second = registry.subscribe("notification", move |e| c2(e));
        assert_eq!(registry.subscriber_count("notification"), 2);

        first.unsubscribe();
        assert_eq!(registry.subscriber_count("notification"), 1);
        registry.dispatch(&InboundEvent::new("notification", json!(null)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(second);
        assert_eq!(registry.subscriber_count("notification"), 0);
        assert!(registry.event_types().is_empty());
    }

    #[test]
    fn failing_and_panicking_callbacks_do_not_block_others() {
        let registry = EventRegistry::<InboundEvent>::new();
        let (hits, ok) = counter();
        let _e = registry.subscribe("notification", |_| anyhow::bail!("boom"));
        let _p = registry.subscribe("notification", |_| panic!("callback bug"));
        let _ok = registry.subscribe("notification", ok);

        let outcome = registry.dispatch(&InboundEvent::new("notification", json!({})));

        assert_eq!(outcome, DispatchOutcome { delivered: 1, failed: 2 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detached_subscription_outlives_its_handle() {
        let registry = EventRegistry::<InboundEvent>::new();
        let (hits, cb) = counter();
        registry.subscribe("reconnect", cb).detach();

        registry.dispatch(&InboundEvent::new("reconnect", json!({})));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callbacks_may_unsubscribe_during_dispatch() {
        let registry = EventRegistry::<InboundEvent>::new();
        let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
        let inner = slot.clone();
        let handle = registry.subscribe("notification", move |_| {
            inner.lock().unwrap().take();
            Ok(())
        });
        *slot.lock().unwrap() = Some(handle);

        registry.dispatch(&InboundEvent::new("notification", json!({})));
        assert_eq!(registry.subscriber_count("notification"), 0);
    }
}
