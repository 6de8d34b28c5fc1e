//! # State Slices
//!
//! A [`StateSlice`] is a named fragment of state. Several live instances may
//! share a `slice_id`; with `sync_across_components` each instance broadcasts
//! its partial updates on the bus and applies the updates of its siblings, so
//! all instances converge once the synchronous delivery completes.
//!
//! Every instance carries a random `origin` id. Broadcasts are tagged with it
//! and an instance ignores broadcasts carrying its own origin, which keeps an
//! update from being applied twice to the instance that produced it.
//!
//! Persisted slices mirror their state into a [`SessionStorage`] under
//! `state-slice-{slice_id}`. Storage failures are logged and never fail the
//! in-memory update.

mod storage;
mod tests;

pub use storage::{slice_storage_key, MemorySessionStorage, SessionStorage};

use crate::bus::Subscription;
use crate::error::{EventError, StateError};
use crate::events::{ComponentMount, ComponentUnmount, Event, StateSliceReset, StateSliceUpdate};
use crate::selector::{SelectorOptions, StateSelector};
use crate::utils::{as_object, merge_shallow};
use crate::EventBus;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

/// Source tag used when the caller does not provide one.
pub const LOCAL_SOURCE: &str = "local";

/// Bound for values that can live in a slice.
pub trait SliceState: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> SliceState for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

#[derive(Debug, Clone)]
pub struct SliceOptions<T> {
    pub slice_id: String,
    pub initial_state: T,
    pub persist_to_session: bool,
    pub sync_across_components: bool,
    pub debug_mode: bool,
}

impl<T> SliceOptions<T> {
    /// Options for an unpersisted slice that syncs across instances.
    pub fn new(slice_id: impl Into<String>, initial_state: T) -> Self {
        Self {
            slice_id: slice_id.into(),
            initial_state,
            persist_to_session: false,
            sync_across_components: true,
            debug_mode: false,
        }
    }

    pub fn persisted(mut self, persist: bool) -> Self {
        self.persist_to_session = persist;
        self
    }

    pub fn synced(mut self, sync: bool) -> Self {
        self.sync_across_components = sync;
        self
    }

    pub fn debug(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }
}

struct SliceInner<T> {
    origin: Uuid,
    options: SliceOptions<T>,
    state: RwLock<Arc<T>>,
    revision: AtomicU64,
    bus: EventBus,
    storage: Option<Arc<dyn SessionStorage>>,
}

/// One live instance of a named slice.
pub struct StateSlice<T: SliceState> {
    inner: Arc<SliceInner<T>>,
    _subscriptions: Vec<Subscription>,
}

impl<T: SliceState> StateSlice<T> {
    /// Creates an instance, restoring persisted state when available and
    /// subscribing to sibling broadcasts when syncing is enabled.
    pub fn mount(
        bus: &EventBus,
        options: SliceOptions<T>,
        storage: Option<Arc<dyn SessionStorage>>,
    ) -> Self {
        let initial = match (&storage, options.persist_to_session) {
            (Some(storage), true) => restore(storage.as_ref(), &options),
            _ => options.initial_state.clone(),
        };

        let inner = Arc::new(SliceInner {
            origin: Uuid::new_v4(),
            options,
            state: RwLock::new(Arc::new(initial)),
            revision: AtomicU64::new(0),
            bus: bus.clone(),
            storage,
        });

        let mut subscriptions = Vec::new();
        if inner.options.sync_across_components {
            subscriptions.push(subscribe_updates(&inner));
            subscriptions.push(subscribe_resets(&inner));
        }

        if inner.options.debug_mode {
            let mount = ComponentMount {
                component: component_name(&inner.options.slice_id),
                instance: inner.origin,
            };
            if let Err(e) = bus.emit(mount, Some(&inner.options.slice_id)) {
                warn!("⚠️ Failed to report slice mount: {}", e);
            }
        }

        Self {
            inner,
            _subscriptions: subscriptions,
        }
    }

    /// Current state snapshot. A new `Arc` is produced by every mutation.
    pub fn state(&self) -> Arc<T> {
        self.inner.state.read().clone()
    }

    pub fn slice_id(&self) -> &str {
        &self.inner.options.slice_id
    }

    /// Instance id used to tag broadcasts.
    pub fn origin(&self) -> Uuid {
        self.inner.origin
    }

    /// Number of mutations applied to this instance.
    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::SeqCst)
    }

    /// Shallow-merges `patch` (a JSON object) into the state, mirrors it to
    /// storage and broadcasts it to sibling instances.
    pub fn update_state(&self, patch: Value, source: Option<&str>) -> Result<(), StateError> {
        let updates = as_object(&patch)?.clone();
        let next = self.inner.apply_patch(&updates)?;
        self.publish(&next, updates, source)
    }

    /// Computes a patch from the current state and applies it as one update.
    ///
    /// `compute` runs under the slice's write lock, so concurrent batch
    /// updates each see the result of the previous one. It must not call back
    /// into this slice.
    pub fn batch_update<F>(&self, compute: F, source: Option<&str>) -> Result<(), StateError>
    where
        F: FnOnce(&T) -> Value,
    {
        let (next, updates) = self.inner.apply_with(|current| {
            let patch = compute(current);
            as_object(&patch).cloned()
        })?;
        if self.inner.options.debug_mode {
            debug!(slice = %self.inner.options.slice_id, "📦 Batch update: {:?}", updates);
        }
        self.publish(&next, updates, source)
    }

    fn publish(&self, next: &T, updates: Map<String, Value>, source: Option<&str>) -> Result<(), StateError> {
        self.inner.persist(next);

        if self.inner.options.debug_mode {
            debug!(slice = %self.inner.options.slice_id, "🧩 Slice updated: {:?}", updates);
        }
        if self.inner.options.sync_across_components {
            let update = StateSliceUpdate {
                slice_id: self.inner.options.slice_id.clone(),
                updates,
                source: source.unwrap_or(LOCAL_SOURCE).to_string(),
                origin: self.inner.origin,
                timestamp: self.inner.bus.now(),
            };
            self.inner.bus.emit(update, source)?;
        }
        Ok(())
    }

    /// Restores the initial state, removes the storage mirror and broadcasts
    /// the reset.
    pub fn reset_state(&self, source: Option<&str>) -> Result<(), StateError> {
        self.inner.restore_initial();
        if let Some(storage) = self.inner.mirror() {
            let key = slice_storage_key(&self.inner.options.slice_id);
            if let Err(e) = storage.remove(&key) {
                warn!("⚠️ Failed to clear session mirror {}: {}", key, e);
            }
        }

        if self.inner.options.sync_across_components {
            let reset = StateSliceReset {
                slice_id: self.inner.options.slice_id.clone(),
                source: source.unwrap_or(LOCAL_SOURCE).to_string(),
                origin: self.inner.origin,
                timestamp: self.inner.bus.now(),
            };
            self.inner.bus.emit(reset, source)?;
        }
        Ok(())
    }

    /// Applies `selector` to the current state.
    pub fn select<R>(&self, selector: impl FnOnce(&T) -> R) -> R {
        selector(&self.state())
    }

    /// Creates a memoised selector over this slice's snapshots. In debug mode
    /// its accepted changes are reported on the slice's bus.
    pub fn create_selector<R, F>(&self, selector: F, options: SelectorOptions<R>) -> StateSelector<T, R>
    where
        R: Clone + Serialize + Send + Sync + 'static,
        F: Fn(&T) -> R + Send + Sync + 'static,
    {
        let selector = StateSelector::new(selector, options);
        if self.inner.options.debug_mode {
            selector.with_bus(&self.inner.bus)
        } else {
            selector
        }
    }
}

impl<T: SliceState> Drop for StateSlice<T> {
    fn drop(&mut self) {
        if self.inner.options.debug_mode {
            let unmount = ComponentUnmount {
                component: component_name(&self.inner.options.slice_id),
                instance: self.inner.origin,
            };
            if let Err(e) = self.inner.bus.emit(unmount, Some(&self.inner.options.slice_id)) {
                warn!("⚠️ Failed to report slice unmount: {}", e);
            }
        }
    }
}

impl<T: SliceState + std::fmt::Debug> std::fmt::Debug for StateSlice<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSlice")
            .field("slice_id", &self.inner.options.slice_id)
            .field("origin", &self.inner.origin)
            .field("revision", &self.revision())
            .field("state", &self.state())
            .finish()
    }
}

impl<T: SliceState> SliceInner<T> {
    fn apply_patch(&self, updates: &Map<String, Value>) -> Result<Arc<T>, StateError> {
        self.apply_with(|_| Ok(updates.clone())).map(|(next, _)| next)
    }

    /// Computes and merges a patch under the write lock so back-to-back
    /// updates build on each other. Returns the new state and the patch.
    fn apply_with<F>(&self, compute: F) -> Result<(Arc<T>, Map<String, Value>), StateError>
    where
        F: FnOnce(&T) -> Result<Map<String, Value>, StateError>,
    {
        let mut state = self.state.write();
        let updates = compute(state.as_ref())?;
        let mut current = match serde_json::to_value(state.as_ref())? {
            Value::Object(map) => map,
            other => {
                return Err(StateError::InvalidPatch(format!(
                    "slice '{}' does not hold an object: {other}",
                    self.options.slice_id
                )))
            }
        };
        merge_shallow(&mut current, &updates);
        let next = Arc::new(serde_json::from_value::<T>(Value::Object(current))?);
        *state = next.clone();
        self.revision.fetch_add(1, Ordering::SeqCst);
        Ok((next, updates))
    }

    fn restore_initial(&self) {
        *self.state.write() = Arc::new(self.options.initial_state.clone());
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    fn mirror(&self) -> Option<&Arc<dyn SessionStorage>> {
        self.storage
            .as_ref()
            .filter(|_| self.options.persist_to_session)
    }

    fn persist(&self, state: &T) {
        let Some(storage) = self.mirror() else {
            return;
        };
        let key = slice_storage_key(&self.options.slice_id);
        let result = serde_json::to_string(state)
            .map_err(|e| e.to_string())
            .and_then(|json| storage.set(&key, &json).map_err(|e| e.to_string()));
        if let Err(e) = result {
            warn!("⚠️ Failed to mirror slice {} to session storage: {}", key, e);
        }
    }
}

fn component_name(slice_id: &str) -> String {
    format!("state-slice:{slice_id}")
}

fn restore<T: SliceState>(storage: &dyn SessionStorage, options: &SliceOptions<T>) -> T {
    let key = slice_storage_key(&options.slice_id);
    match storage.get(&key) {
        Ok(Some(json)) => match serde_json::from_str(&json) {
            Ok(state) => {
                debug!("♻️ Restored slice {} from session storage", options.slice_id);
                state
            }
            Err(e) => {
                warn!("⚠️ Ignoring unreadable session mirror {}: {}", key, e);
                options.initial_state.clone()
            }
        },
        Ok(None) => options.initial_state.clone(),
        Err(e) => {
            warn!("⚠️ Session storage unavailable for {}: {}", key, e);
            options.initial_state.clone()
        }
    }
}

fn subscribe_updates<T: SliceState>(inner: &Arc<SliceInner<T>>) -> Subscription {
    let weak: Weak<SliceInner<T>> = Arc::downgrade(inner);
    inner.bus.subscribe(move |event: &Event<StateSliceUpdate>| {
        let Some(inner) = weak.upgrade() else {
            return Ok(());
        };
        let update = &event.data;
        if update.slice_id != inner.options.slice_id || update.origin == inner.origin {
            return Ok(());
        }
        inner
            .apply_patch(&update.updates)
            .map(|_| ())
            .map_err(|e| EventError::HandlerExecution(e.to_string()))
    })
}

fn subscribe_resets<T: SliceState>(inner: &Arc<SliceInner<T>>) -> Subscription {
    let weak: Weak<SliceInner<T>> = Arc::downgrade(inner);
    inner.bus.subscribe(move |event: &Event<StateSliceReset>| {
        let Some(inner) = weak.upgrade() else {
            return Ok(());
        };
        if event.data.slice_id == inner.options.slice_id && event.data.origin != inner.origin {
            inner.restore_initial();
        }
        Ok(())
    })
}
