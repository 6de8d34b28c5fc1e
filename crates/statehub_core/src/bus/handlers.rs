/// Event handler registration methods
use super::core::{BusInner, EventBus};
use crate::error::EventError;
use crate::events::{BusEvent, Event, RawEvent};
use compact_str::CompactString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Type-erased handler as stored by the bus.
pub type RawHandlerFn = dyn Fn(&RawEvent) -> Result<(), EventError> + Send + Sync;

pub(crate) struct HandlerEntry {
    pub(crate) id: u64,
    pub(crate) name: CompactString,
    pub(crate) handler: Box<RawHandlerFn>,
}

impl EventBus {
    /// Registers a typed handler for `E::NAME`.
    ///
    /// The payload is decoded from the (possibly middleware-transformed) JSON
    /// form before the handler runs; a payload that no longer decodes counts
    /// as a handler failure for that delivery.
    ///
    /// ```rust
    /// use statehub_core::{EventBus, events::StateSliceReset};
    ///
    /// let bus = EventBus::new();
    /// let subscription = bus.subscribe(|event: &statehub_core::Event<StateSliceReset>| {
    ///     println!("slice {} reset by {}", event.data.slice_id, event.data.source);
    ///     Ok(())
    /// });
    /// assert_eq!(bus.listener_count("state-slice-reset"), 1);
    /// subscription.unsubscribe();
    /// assert_eq!(bus.listener_count("state-slice-reset"), 0);
    /// ```
    pub fn subscribe<E, F>(&self, handler: F) -> Subscription
    where
        E: BusEvent,
        F: Fn(&Event<E>) -> Result<(), EventError> + Send + Sync + 'static,
    {
        self.subscribe_raw(E::NAME, move |raw: &RawEvent| {
            let event = raw
                .decode::<E>()
                .map_err(|e| EventError::Deserialization(format!("{}: {e}", E::NAME)))?;
            handler(&event)
        })
    }

    /// Registers an untyped handler that sees the JSON payload.
    pub fn subscribe_raw<F>(&self, event_type: &str, handler: F) -> Subscription
    where
        F: Fn(&RawEvent) -> Result<(), EventError> + Send + Sync + 'static,
    {
        let id = self.next_id();
        let key = CompactString::new(event_type);
        let entry = Arc::new(HandlerEntry {
            id,
            name: CompactString::new(format!("{event_type}#{id}")),
            handler: Box::new(handler),
        });

        self.inner
            .handlers
            .entry(key.clone())
            .or_default()
            .push(entry);
        self.inner.stats.write().total_subscriptions += 1;

        debug!("📝 Registered handler #{} for {}", id, event_type);
        Subscription {
            bus: Arc::downgrade(&self.inner),
            event_type: key,
            id,
            active: AtomicBool::new(true),
        }
    }
}

/// Handle to a registered handler.
///
/// Dropping the subscription unregisters the handler; call
/// [`detach`](Subscription::detach) to keep it registered for the lifetime
/// of the bus.
#[must_use = "dropping a Subscription immediately unsubscribes its handler"]
pub struct Subscription {
    bus: Weak<BusInner>,
    event_type: CompactString,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    /// Removes the handler. Calling this more than once is harmless.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.bus.upgrade() else {
            return;
        };

        let now_empty = match inner.handlers.get_mut(&self.event_type) {
            Some(mut handlers) => {
                handlers.retain(|entry| entry.id != self.id);
                handlers.is_empty()
            }
            None => false,
        };
        if now_empty {
            inner
                .handlers
                .remove_if(&self.event_type, |_, handlers| handlers.is_empty());
        }
        debug!("🗑️ Unregistered handler #{} for {}", self.id, self.event_type);
    }

    /// Leaves the handler registered and gives up the ability to remove it.
    pub fn detach(self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.event_type)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
