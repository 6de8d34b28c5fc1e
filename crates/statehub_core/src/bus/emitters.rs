/// Event emission and global middleware
use super::core::EventBus;
use crate::error::{EventError, MiddlewareError};
use crate::events::{BusEvent, RawEvent};
use crate::middleware::Flow;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Global transform applied to every emission regardless of type.
///
/// Returning [`Flow::Next`] replaces the event payload for the following
/// steps and for handlers; [`Flow::Halt`] drops the emission. An `Err` (or a
/// panic) is logged and treated as the identity transform.
pub type GlobalMiddlewareFn = dyn Fn(&RawEvent) -> Result<Flow, MiddlewareError> + Send + Sync;

/// Read-only view of an event after the whole middleware chain ran.
pub type ObserverFn = dyn Fn(&RawEvent) + Send + Sync;

/// Identifies a global middleware or observer for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MiddlewareHandle(u64);

impl EventBus {
    /// Emits a typed event.
    ///
    /// Fails only if `data` cannot be serialised; handler and middleware
    /// failures are isolated and logged.
    #[inline]
    pub fn emit<E: BusEvent>(&self, data: E, source: Option<&str>) -> Result<(), EventError> {
        let payload = serde_json::to_value(&data).map_err(|e| {
            error!("🔴 Failed to serialize {} for emission: {}", E::NAME, e);
            EventError::Serialization(e.to_string())
        })?;
        self.emit_raw(E::NAME, payload, source);
        Ok(())
    }

    /// Emits an untyped event and returns the event as delivered, or `None`
    /// if a global middleware halted it.
    pub fn emit_raw(&self, event_type: &str, data: Value, source: Option<&str>) -> Option<RawEvent> {
        let mut event = RawEvent {
            event_type: event_type.to_string(),
            data,
            timestamp: self.now(),
            source: source.map(str::to_string),
        };

        let chain: Vec<_> = self
            .inner
            .middleware
            .read()
            .iter()
            .map(|(_, middleware)| middleware.clone())
            .collect();
        for middleware in chain {
            match catch_unwind(AssertUnwindSafe(|| middleware(&event))) {
                Ok(Ok(Flow::Next(data))) => event.data = data,
                Ok(Ok(Flow::Halt)) => {
                    debug!("🚫 Emission of {} halted by middleware", event_type);
                    self.inner.stats.write().events_dropped += 1;
                    return None;
                }
                Ok(Err(e)) => {
                    error!("❌ Global middleware failed on {}: {}", event_type, e);
                    self.inner.stats.write().middleware_failures += 1;
                }
                Err(_) => {
                    error!("💥 Global middleware panicked on {}", event_type);
                    self.inner.stats.write().middleware_failures += 1;
                }
            }
        }

        let observers: Vec<_> = self
            .inner
            .observers
            .read()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(&event))).is_err() {
                error!("💥 Observer panicked on {}", event_type);
            }
        }

        {
            let mut history = self.inner.history.lock();
            history.push_back(event.clone());
            while history.len() > self.inner.history_capacity {
                history.pop_front();
            }
        }

        let handlers = self
            .inner
            .handlers
            .get(event_type)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        let mut invoked = 0;
        let mut failed = 0;
        if handlers.is_empty() {
            trace!("No handlers for event: {}", event_type);
        } else {
            debug!("📤 Emitting {} to {} handlers", event_type, handlers.len());
        }
        for entry in handlers.iter() {
            match catch_unwind(AssertUnwindSafe(|| (entry.handler)(&event))) {
                Ok(Ok(())) => invoked += 1,
                Ok(Err(e)) => {
                    error!("❌ Handler {} failed: {}", entry.name, e);
                    failed += 1;
                }
                Err(_) => {
                    error!("💥 Handler {} panicked", entry.name);
                    failed += 1;
                }
            }
        }

        let mut stats = self.inner.stats.write();
        stats.events_emitted += 1;
        stats.handlers_invoked += invoked;
        stats.handler_failures += failed;
        drop(stats);

        Some(event)
    }

    /// Appends a global middleware to the chain.
    pub fn add_middleware<F>(&self, middleware: F) -> MiddlewareHandle
    where
        F: Fn(&RawEvent) -> Result<Flow, MiddlewareError> + Send + Sync + 'static,
    {
        let handle = MiddlewareHandle(self.next_id());
        self.inner
            .middleware
            .write()
            .push((handle, Arc::new(middleware)));
        handle
    }

    /// Removes a global middleware. Returns `false` if it was not registered.
    pub fn remove_middleware(&self, handle: MiddlewareHandle) -> bool {
        let mut chain = self.inner.middleware.write();
        let before = chain.len();
        chain.retain(|(registered, _)| *registered != handle);
        chain.len() != before
    }

    /// Registers an observer that sees every event exactly as delivered,
    /// after all global middleware. Halted emissions never reach it.
    pub fn add_observer<F>(&self, observer: F) -> MiddlewareHandle
    where
        F: Fn(&RawEvent) + Send + Sync + 'static,
    {
        let handle = MiddlewareHandle(self.next_id());
        self.inner.observers.write().push((handle, Arc::new(observer)));
        handle
    }

    pub fn remove_observer(&self, handle: MiddlewareHandle) -> bool {
        let mut observers = self.inner.observers.write();
        let before = observers.len();
        observers.retain(|(registered, _)| *registered != handle);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.read().len()
    }

    pub fn middleware_count(&self) -> usize {
        self.inner.middleware.read().len()
    }
}
