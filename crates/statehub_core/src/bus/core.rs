/// Core EventBus implementation
use super::emitters::{GlobalMiddlewareFn, MiddlewareHandle, ObserverFn};
use super::handlers::HandlerEntry;
use super::stats::BusStats;
use crate::events::RawEvent;
use crate::utils::{system_clock, SharedClock};
use compact_str::CompactString;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Number of trailing events kept for diagnostics.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Handler lists stay inline for the common case of a few subscribers per type.
pub(super) type HandlerList = SmallVec<[Arc<HandlerEntry>; 4]>;

pub(super) struct BusInner {
    /// Event type to subscribed handlers, in subscription order
    pub(super) handlers: DashMap<CompactString, HandlerList>,
    /// Global transforms applied to every emission, in registration order
    pub(super) middleware: RwLock<Vec<(MiddlewareHandle, Arc<GlobalMiddlewareFn>)>>,
    /// Read-only taps on every event that survived the chain
    pub(super) observers: RwLock<Vec<(MiddlewareHandle, Arc<ObserverFn>)>>,
    pub(super) history: Mutex<VecDeque<RawEvent>>,
    pub(super) history_capacity: usize,
    pub(super) last_timestamp: AtomicU64,
    pub(super) next_id: AtomicU64,
    pub(super) stats: RwLock<BusStats>,
    pub(super) clock: SharedClock,
}

/// In-process publish/subscribe hub with a global middleware chain and a
/// bounded event history.
///
/// `EventBus` is a cheap handle; clones share the same listeners, middleware
/// and history. Delivery is synchronous: [`emit`](EventBus::emit) returns
/// once every middleware step and every handler has run.
///
/// Handler lists are cloned out of the listener map before delivery, so a
/// handler may subscribe, unsubscribe or emit from inside a delivery.
#[derive(Clone)]
pub struct EventBus {
    pub(super) inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("event_types", &self.inner.handlers.len())
            .field("middleware", &self.inner.middleware.read().len())
            .field("history_len", &self.inner.history.lock().len())
            .field("history_capacity", &self.inner.history_capacity)
            .finish()
    }
}

impl EventBus {
    /// Creates a bus with the system clock and the default history capacity.
    pub fn new() -> Self {
        Self::with_options(DEFAULT_HISTORY_CAPACITY, system_clock())
    }

    /// Creates a bus reading timestamps from `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self::with_options(DEFAULT_HISTORY_CAPACITY, clock)
    }

    pub fn with_options(history_capacity: usize, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: DashMap::new(),
                middleware: RwLock::new(Vec::new()),
                observers: RwLock::new(Vec::new()),
                history: Mutex::new(VecDeque::with_capacity(history_capacity)),
                history_capacity,
                last_timestamp: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                stats: RwLock::new(BusStats::default()),
                clock,
            }),
        }
    }

    /// The clock this bus stamps events with.
    pub fn clock(&self) -> SharedClock {
        self.inner.clock.clone()
    }

    /// Current time from the bus clock, clamped so it never goes backwards
    /// relative to previously stamped events.
    pub fn now(&self) -> u64 {
        let now = self.inner.clock.now_ms();
        let previous = self.inner.last_timestamp.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }

    /// Copy of the trailing event history, oldest first.
    pub fn event_history(&self) -> Vec<RawEvent> {
        self.inner.history.lock().iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    pub fn history_capacity(&self) -> usize {
        self.inner.history_capacity
    }

    /// Event type to current subscriber count.
    pub fn active_listeners(&self) -> HashMap<String, usize> {
        self.inner
            .handlers
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| (entry.key().to_string(), entry.value().len()))
            .collect()
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        self.inner
            .handlers
            .get(event_type)
            .map(|entry| entry.value().len())
            .unwrap_or(0)
    }

    #[inline]
    pub fn stats(&self) -> BusStats {
        self.inner.stats.read().clone()
    }

    pub(super) fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
