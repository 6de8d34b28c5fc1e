//! # Statehub Core
//!
//! In-process state synchronisation and middleware core for UI runtimes.
//!
//! ## Core Features
//!
//! - **Event Bus**: typed publish/subscribe with synchronous, fault-isolated
//!   delivery, a global middleware chain and a bounded event history
//! - **Middleware Manager**: prioritised, toggleable transforms over event
//!   payloads, fail-open on errors
//! - **State Slices**: named state containers whose live instances converge
//!   over the bus, optionally mirrored to session storage
//! - **State Synchroniser**: checksum and timestamp based reconciliation of
//!   full-state broadcasts with pluggable conflict policies
//! - **Selectors**: memoised projections with change detection and debounced
//!   notifications
//! - **Performance Utilities**: memoisation, batched updates, lazy paging,
//!   normalisation and compression, all reporting on the bus
//! - **Debug Recorder**: bounded, filterable and exportable trace of bus activity
//!
//! ## Quick Start
//!
//! ```rust
//! use serde_json::json;
//! use statehub_core::{EventBus, SliceOptions, StateSlice};
//!
//! let bus = EventBus::new();
//! let editor = StateSlice::mount(&bus, SliceOptions::new("board", json!({"title": "Sprint"})), None);
//! let sidebar = StateSlice::mount(&bus, SliceOptions::new("board", json!({"title": "Sprint"})), None);
//!
//! editor.update_state(json!({"title": "Sprint 2"}), Some("editor")).unwrap();
//! assert_eq!(*sidebar.state(), json!({"title": "Sprint 2"}));
//! ```

pub mod bus;
pub mod debug;
pub mod error;
pub mod events;
pub mod middleware;
pub mod perf;
pub mod selector;
pub mod slice;
pub mod sync;
pub mod utils;

pub use bus::{default_bus, BusStats, EventBus, MiddlewareHandle, Subscription};
pub use debug::{DebugConfig, DebugEntry, DebugEntryType, DebugExport, DebugFilter, DebugRecorder};
pub use error::{CompressionError, EventError, ExportError, LoadError, MiddlewareError, StateError, StorageError};
pub use events::{BusEvent, Event, RawEvent};
pub use middleware::{Flow, MiddlewareContext, MiddlewareManager, MiddlewareOptions};
pub use perf::{
    BatchOptions, BatchScheduler, CompressionAlgorithm, CompressionConfig, LazyLoader, LazyOptions, MemoOptions,
    Memoizer, NormalizedState, PageSource, Priority, StateCompressor,
};
pub use selector::{BatchSelector, SelectorOptions, StateSelector};
pub use slice::{MemorySessionStorage, SessionStorage, SliceOptions, StateSlice};
pub use sync::{ConflictChoice, ConflictResolution, StateSynchronizer, SyncOptions, SyncOutcome, SyncScope};
pub use utils::{current_timestamp, Clock, ManualClock, SharedClock, SystemClock};

// Dependencies callers commonly need alongside the core
pub use async_trait::async_trait;
pub use serde_json;
