//! # Event Types
//!
//! Every payload that flows over the [`EventBus`](crate::EventBus) is a
//! [`BusEvent`]: a serialisable type bound to one event name. Emission and
//! subscription are typed on that binding, so a handler for
//! `state-slice-update` can only ever be registered with a
//! [`StateSliceUpdate`] parameter.
//!
//! On the bus itself events travel as [`RawEvent`]s (JSON payloads) so that
//! global middleware and the debug layer can inspect and transform any event
//! regardless of its Rust type.

use crate::sync::{ConflictChoice, SyncScope};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Debug;
use uuid::Uuid;

/// A payload type bound to a single event name.
pub trait BusEvent: Serialize + DeserializeOwned + Clone + Send + Sync + Debug + 'static {
    /// Event type used for routing.
    const NAME: &'static str;
}

/// An emitted event as observed by handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    pub event_type: String,
    pub data: T,
    /// Unix milliseconds, non-decreasing in emission order for one bus.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Type-erased event as stored in history and seen by global middleware.
pub type RawEvent = Event<Value>;

impl RawEvent {
    /// Decode the payload into a typed event.
    pub fn decode<T: BusEvent>(&self) -> Result<Event<T>, serde_json::Error> {
        Ok(Event {
            event_type: self.event_type.clone(),
            data: serde_json::from_value(self.data.clone())?,
            timestamp: self.timestamp,
            source: self.source.clone(),
        })
    }
}

macro_rules! bus_event {
    ($ty:ty, $name:literal) => {
        impl BusEvent for $ty {
            const NAME: &'static str = $name;
        }
    };
}

/// Partial update broadcast by a [`StateSlice`](crate::StateSlice).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSliceUpdate {
    pub slice_id: String,
    pub updates: Map<String, Value>,
    pub source: String,
    /// Instance that produced the update; receivers drop their own echoes.
    pub origin: Uuid,
    pub timestamp: u64,
}

/// Reset broadcast by a [`StateSlice`](crate::StateSlice).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSliceReset {
    pub slice_id: String,
    pub source: String,
    pub origin: Uuid,
    pub timestamp: u64,
}

/// Full-state broadcast by a [`StateSynchronizer`](crate::StateSynchronizer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSyncUpdate {
    pub state_key: String,
    pub scope: SyncScope,
    pub data: Value,
    pub timestamp: u64,
    pub source: String,
    pub origin: Uuid,
    pub version: u64,
    pub checksum: String,
}

/// Divergence awaiting an explicit `resolve_conflict` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSyncConflict {
    pub conflict_id: String,
    pub state_key: String,
    pub local: Value,
    pub remote: Value,
    pub local_checksum: String,
    pub remote_checksum: String,
    pub remote_source: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSyncConflictResolved {
    pub conflict_id: String,
    pub state_key: String,
    pub resolution: ConflictChoice,
    pub timestamp: u64,
}

/// Accepted change of a selector's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSelectorUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub value: Value,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentMount {
    pub component: String,
    pub instance: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentUnmount {
    pub component: String,
    pub instance: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoizationHit {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub hit_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoizationMiss {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// One flush cycle of a [`BatchScheduler`](crate::perf::BatchScheduler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProcessed {
    pub processed: usize,
    pub remaining: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LazyPageLoaded {
    pub page: usize,
    pub items: usize,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionApplied {
    pub algorithm: String,
    pub original_size: usize,
    pub compressed_size: usize,
    pub compressed: bool,
}

bus_event!(StateSliceUpdate, "state-slice-update");
bus_event!(StateSliceReset, "state-slice-reset");
bus_event!(StateSyncUpdate, "state-sync-update");
bus_event!(StateSyncConflict, "state-sync-conflict");
bus_event!(StateSyncConflictResolved, "state-sync-conflict-resolved");
bus_event!(StateSelectorUpdate, "state-selector-update");
bus_event!(ComponentMount, "component-mount");
bus_event!(ComponentUnmount, "component-unmount");
bus_event!(MemoizationHit, "memoization-hit");
bus_event!(MemoizationMiss, "memoization-miss");
bus_event!(BatchProcessed, "batch-processed");
bus_event!(LazyPageLoaded, "lazy-page-loaded");
bus_event!(CompressionApplied, "compression-applied");
