//! # State Synchronisation
//!
//! A [`StateSynchronizer`] keeps one logical piece of state (a `state_key`)
//! consistent across independently owned copies. Each copy broadcasts full
//! snapshots tagged with a version, a checksum and the broadcaster's
//! timestamp; receivers apply them by policy.
//!
//! Ordering is last-write-wins on the broadcaster's wall clock. An update
//! whose timestamp is not strictly newer than the last applied one is
//! discarded. There is no clock-skew correction: two broadcasters with skewed
//! clocks can be applied out of causal order.
//!
//! A copy has *local unsaved changes* when the checksum of its current state
//! differs from the incoming checksum. Under [`ConflictResolution::PromptUser`]
//! such an update raises a `state-sync-conflict` event and waits for
//! [`resolve_conflict`](StateSynchronizer::resolve_conflict).

mod tests;

use crate::bus::Subscription;
use crate::error::{EventError, StateError};
use crate::events::{Event, StateSyncConflict, StateSyncConflictResolved, StateSyncUpdate};
use crate::slice::SliceState;
use crate::utils::{checksum, generate_id, merged_value};
use crate::EventBus;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Source tag used for broadcasts produced by conflict resolution.
pub const CONFLICT_RESOLUTION_SOURCE: &str = "conflict-resolution";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncScope {
    /// Copies within one component tree
    #[default]
    Component,
    /// Copies within one session
    Session,
    /// Every copy in the process
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    /// Accept the incoming state wholesale
    #[default]
    LatestWins,
    /// Shallow-merge the incoming state over the current one
    Merge,
    /// Raise a conflict event when local unsaved changes exist
    PromptUser,
}

/// Caller's answer to a pending conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictChoice {
    Local,
    Remote,
    Merge,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub state_key: String,
    pub sync_scope: SyncScope,
    pub conflict_resolution: ConflictResolution,
    pub enable_optimistic_updates: bool,
    /// How long an optimistic broadcast counts as pending
    pub optimistic_retention: Duration,
}

impl SyncOptions {
    pub fn new(state_key: impl Into<String>) -> Self {
        Self {
            state_key: state_key.into(),
            sync_scope: SyncScope::default(),
            conflict_resolution: ConflictResolution::default(),
            enable_optimistic_updates: true,
            optimistic_retention: Duration::from_secs(1),
        }
    }

    pub fn scope(mut self, scope: SyncScope) -> Self {
        self.sync_scope = scope;
        self
    }

    pub fn resolution(mut self, resolution: ConflictResolution) -> Self {
        self.conflict_resolution = resolution;
        self
    }

    pub fn optimistic(mut self, enabled: bool) -> Self {
        self.enable_optimistic_updates = enabled;
        self
    }
}

/// What [`StateSynchronizer::handle_incoming_update`] did with an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    /// Checksums already matched; only the ordering marker moved
    AlreadyInSync,
    /// Waiting for `resolve_conflict` with this id
    Conflict(String),
    /// Ignored for the given reason
    Discarded(DiscardReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    OwnBroadcast,
    OtherKey,
    OtherScope,
    Stale,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub pending_updates: usize,
    pub pending_conflicts: usize,
    pub last_applied: u64,
    pub last_sent: u64,
    pub version: u64,
}

type StateGetter<T> = Box<dyn Fn() -> T + Send + Sync>;
type StateCallback<T> = Box<dyn Fn(T, &str) + Send + Sync>;

#[derive(Default)]
struct SyncBook {
    version: u64,
    last_sent: u64,
    last_applied: u64,
    /// Optimistic broadcasts by update id, with their timestamps
    pending: HashMap<String, u64>,
    conflicts: HashMap<String, (StateSyncConflict, StateSyncUpdate)>,
}

struct SyncInner<T> {
    origin: Uuid,
    options: SyncOptions,
    bus: EventBus,
    current: StateGetter<T>,
    on_update: StateCallback<T>,
    book: Mutex<SyncBook>,
}

/// Conflict-aware synchroniser for one state key.
pub struct StateSynchronizer<T: SliceState> {
    inner: Arc<SyncInner<T>>,
    _subscription: Subscription,
}

impl<T: SliceState> StateSynchronizer<T> {
    /// Attaches a synchroniser to `bus`.
    ///
    /// `current_state` reads the owner's state; `on_state_update` receives
    /// every resolved remote state together with its source.
    pub fn attach<G, U>(bus: &EventBus, current_state: G, on_state_update: U, options: SyncOptions) -> Self
    where
        G: Fn() -> T + Send + Sync + 'static,
        U: Fn(T, &str) + Send + Sync + 'static,
    {
        let inner = Arc::new(SyncInner {
            origin: Uuid::new_v4(),
            options,
            bus: bus.clone(),
            current: Box::new(current_state),
            on_update: Box::new(on_state_update),
            book: Mutex::new(SyncBook::default()),
        });

        let weak: Weak<SyncInner<T>> = Arc::downgrade(&inner);
        let subscription = bus.subscribe(move |event: &Event<StateSyncUpdate>| {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            inner
                .handle_incoming(&event.data)
                .map(|_| ())
                .map_err(|e| EventError::HandlerExecution(e.to_string()))
        });

        Self {
            inner,
            _subscription: subscription,
        }
    }

    pub fn origin(&self) -> Uuid {
        self.inner.origin
    }

    pub fn state_key(&self) -> &str {
        &self.inner.options.state_key
    }

    /// Broadcasts a full snapshot of `new_state`.
    pub fn broadcast_state_change(&self, new_state: &T, source: &str) -> Result<StateSyncUpdate, StateError> {
        self.inner.broadcast(new_state, source)
    }

    /// Applies (or discards, or escalates) an update from another copy.
    pub fn handle_incoming_update(&self, update: &StateSyncUpdate) -> Result<SyncOutcome, StateError> {
        self.inner.handle_incoming(update)
    }

    /// Settles a pending conflict and returns the resulting state.
    pub fn resolve_conflict(
        &self,
        conflict_id: &str,
        choice: ConflictChoice,
        merged: Option<T>,
    ) -> Result<T, StateError> {
        self.inner.resolve(conflict_id, choice, merged)
    }

    pub fn pending_conflicts(&self) -> Vec<StateSyncConflict> {
        self.inner
            .book
            .lock()
            .conflicts
            .values()
            .map(|(conflict, _)| conflict.clone())
            .collect()
    }

    pub fn sync_status(&self) -> SyncStatus {
        let now = self.inner.bus.now();
        let mut book = self.inner.book.lock();
        prune_pending(&mut book, now, self.inner.options.optimistic_retention);
        SyncStatus {
            pending_updates: book.pending.len(),
            pending_conflicts: book.conflicts.len(),
            last_applied: book.last_applied,
            last_sent: book.last_sent,
            version: book.version,
        }
    }
}

fn prune_pending(book: &mut SyncBook, now: u64, retention: Duration) {
    let retention = retention.as_millis() as u64;
    book.pending
        .retain(|_, sent_at| now.saturating_sub(*sent_at) < retention);
}

impl<T: SliceState> SyncInner<T> {
    fn broadcast(&self, new_state: &T, source: &str) -> Result<StateSyncUpdate, StateError> {
        let data = serde_json::to_value(new_state)?;
        let digest = checksum(&data);
        let timestamp = self.bus.now();

        let version = {
            let mut book = self.book.lock();
            book.version += 1;
            book.last_sent = timestamp;
            if self.options.enable_optimistic_updates {
                prune_pending(&mut book, timestamp, self.options.optimistic_retention);
                let update_id = format!("{}:{}", self.origin, book.version);
                book.pending.insert(update_id, timestamp);
            }
            book.version
        };

        let update = StateSyncUpdate {
            state_key: self.options.state_key.clone(),
            scope: self.options.sync_scope,
            data,
            timestamp,
            source: source.to_string(),
            origin: self.origin,
            version,
            checksum: digest,
        };
        debug!(
            state_key = %update.state_key,
            version,
            "📡 Broadcasting state change from {}",
            source
        );
        self.bus.emit(update.clone(), Some(source))?;
        Ok(update)
    }

    fn handle_incoming(&self, update: &StateSyncUpdate) -> Result<SyncOutcome, StateError> {
        if update.origin == self.origin {
            return Ok(SyncOutcome::Discarded(DiscardReason::OwnBroadcast));
        }
        if update.state_key != self.options.state_key {
            return Ok(SyncOutcome::Discarded(DiscardReason::OtherKey));
        }
        if update.scope != self.options.sync_scope {
            return Ok(SyncOutcome::Discarded(DiscardReason::OtherScope));
        }

        {
            let book = self.book.lock();
            if update.timestamp <= book.last_applied {
                debug!(
                    state_key = %update.state_key,
                    "⏪ Discarding stale update ({} <= {})",
                    update.timestamp,
                    book.last_applied
                );
                return Ok(SyncOutcome::Discarded(DiscardReason::Stale));
            }
        }

        let current = serde_json::to_value((self.current)())?;
        let current_checksum = checksum(&current);

        if current_checksum == update.checksum {
            self.book.lock().last_applied = update.timestamp;
            return Ok(SyncOutcome::AlreadyInSync);
        }

        // Any divergence from the incoming state counts as local unsaved changes.
        if self.options.conflict_resolution == ConflictResolution::PromptUser {
            return self.raise_conflict(update, current, current_checksum);
        }

        let resolved = match self.options.conflict_resolution {
            ConflictResolution::Merge => merged_value(&current, &update.data)?,
            ConflictResolution::LatestWins | ConflictResolution::PromptUser => update.data.clone(),
        };
        self.apply(resolved, update.timestamp, &update.source)?;
        Ok(SyncOutcome::Applied)
    }

    fn raise_conflict(
        &self,
        update: &StateSyncUpdate,
        local: Value,
        local_checksum: String,
    ) -> Result<SyncOutcome, StateError> {
        let conflict = StateSyncConflict {
            conflict_id: generate_id(),
            state_key: update.state_key.clone(),
            local,
            remote: update.data.clone(),
            local_checksum,
            remote_checksum: update.checksum.clone(),
            remote_source: update.source.clone(),
            timestamp: self.bus.now(),
        };
        let conflict_id = conflict.conflict_id.clone();
        self.book
            .lock()
            .conflicts
            .insert(conflict_id.clone(), (conflict.clone(), update.clone()));

        warn!(
            state_key = %update.state_key,
            "⚔️ Conflicting update from {} awaiting resolution ({})",
            update.source,
            conflict_id
        );
        self.bus.emit(conflict, Some(&self.options.state_key))?;
        Ok(SyncOutcome::Conflict(conflict_id))
    }

    /// Records the update as applied and hands the state to the owner.
    fn apply(&self, resolved: Value, timestamp: u64, source: &str) -> Result<T, StateError> {
        let state: T = serde_json::from_value(resolved)?;
        {
            let mut book = self.book.lock();
            book.last_applied = book.last_applied.max(timestamp);
        }
        (self.on_update)(state.clone(), source);
        Ok(state)
    }

    fn resolve(&self, conflict_id: &str, choice: ConflictChoice, merged: Option<T>) -> Result<T, StateError> {
        let (conflict, remote) = self
            .book
            .lock()
            .conflicts
            .remove(conflict_id)
            .ok_or_else(|| StateError::UnknownConflict(conflict_id.to_string()))?;

        let resolved = match choice {
            ConflictChoice::Local => {
                let local = (self.current)();
                {
                    let mut book = self.book.lock();
                    book.last_applied = book.last_applied.max(remote.timestamp);
                }
                self.broadcast(&local, CONFLICT_RESOLUTION_SOURCE)?;
                local
            }
            ConflictChoice::Remote => self.apply(remote.data.clone(), remote.timestamp, &remote.source)?,
            ConflictChoice::Merge => {
                let merged = match merged {
                    Some(state) => serde_json::to_value(state)?,
                    None => merged_value(&serde_json::to_value((self.current)())?, &remote.data)?,
                };
                let state = self.apply(merged, remote.timestamp, CONFLICT_RESOLUTION_SOURCE)?;
                self.broadcast(&state, CONFLICT_RESOLUTION_SOURCE)?;
                state
            }
        };

        info!(
            state_key = %conflict.state_key,
            "🤝 Conflict {} resolved with {:?}",
            conflict_id,
            choice
        );
        let resolved_event = StateSyncConflictResolved {
            conflict_id: conflict_id.to_string(),
            state_key: conflict.state_key,
            resolution: choice,
            timestamp: self.bus.now(),
        };
        self.bus.emit(resolved_event, Some(&self.options.state_key))?;
        Ok(resolved)
    }
}
