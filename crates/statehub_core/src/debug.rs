//! # Debugging Layer
//!
//! [`DebugRecorder`] is a passive observer of an [`EventBus`]. It keeps a
//! bounded ring buffer of the state, selector and lifecycle events flowing
//! through the bus, or of every emission when `trace_all_events` is set.
//! Payloads are snapshotted as JSON at capture time, so later changes to the
//! emitting state never alter a recorded entry.

use crate::bus::{BusStats, MiddlewareHandle, Subscription};
use crate::error::ExportError;
use crate::events::{
    BusEvent, ComponentMount, ComponentUnmount, RawEvent, StateSelectorUpdate, StateSliceReset, StateSliceUpdate,
    StateSyncConflict, StateSyncConflictResolved, StateSyncUpdate,
};
use crate::EventBus;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    pub max_entries: usize,
    pub capture_stack_traces: bool,
    /// Record every delivered emission, as it leaves the middleware chain
    pub trace_all_events: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            capture_stack_traces: false,
            trace_all_events: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DebugEntryType {
    StateUpdate,
    Event,
    SelectorUpdate,
    ComponentMount,
    ComponentUnmount,
}

impl DebugEntryType {
    /// Classifies an event type.
    pub fn for_event(event_type: &str) -> Self {
        match event_type {
            StateSliceUpdate::NAME
            | StateSliceReset::NAME
            | StateSyncUpdate::NAME
            | StateSyncConflict::NAME
            | StateSyncConflictResolved::NAME => DebugEntryType::StateUpdate,
            StateSelectorUpdate::NAME => DebugEntryType::SelectorUpdate,
            ComponentMount::NAME => DebugEntryType::ComponentMount,
            ComponentUnmount::NAME => DebugEntryType::ComponentUnmount,
            _ => DebugEntryType::Event,
        }
    }
}

/// Event types recorded when not tracing every emission.
const OBSERVED_EVENTS: [&str; 8] = [
    StateSliceUpdate::NAME,
    StateSliceReset::NAME,
    StateSyncUpdate::NAME,
    StateSyncConflict::NAME,
    StateSyncConflictResolved::NAME,
    StateSelectorUpdate::NAME,
    ComponentMount::NAME,
    ComponentUnmount::NAME,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEntry {
    /// Monotonic per recorder
    pub id: String,
    pub timestamp: u64,
    pub entry_type: DebugEntryType,
    pub event_type: String,
    pub source: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

/// Criteria for [`DebugRecorder::entries`]; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct DebugFilter {
    pub entry_types: Option<Vec<DebugEntryType>>,
    pub source: Option<String>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    /// Case-insensitive substring of the source, event type or payload
    pub search: Option<String>,
}

impl DebugFilter {
    pub fn of_type(entry_type: DebugEntryType) -> Self {
        Self {
            entry_types: Some(vec![entry_type]),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &DebugEntry) -> bool {
        if let Some(types) = &self.entry_types {
            if !types.contains(&entry.entry_type) {
                return false;
            }
        }
        if self.source.as_ref().is_some_and(|source| *source != entry.source) {
            return false;
        }
        if self.since.is_some_and(|since| entry.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| entry.timestamp > until) {
            return false;
        }
        match &self.search {
            Some(text) => {
                let needle = text.to_lowercase();
                entry.source.to_lowercase().contains(&needle)
                    || entry.event_type.to_lowercase().contains(&needle)
                    || entry.data.to_string().to_lowercase().contains(&needle)
            }
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugMetadata {
    pub recorded: u64,
    pub evicted: u64,
    pub retained: usize,
    pub bus: BusStats,
}

/// Serialised form of a recorder's trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugExport {
    pub entries: Vec<DebugEntry>,
    pub metadata: DebugMetadata,
    pub timestamp: u64,
    pub config: DebugConfig,
}

struct RecorderInner {
    config: DebugConfig,
    entries: Mutex<VecDeque<DebugEntry>>,
    next_id: AtomicU64,
    evicted: AtomicU64,
    bus: EventBus,
}

impl RecorderInner {
    fn record_event(&self, event: &RawEvent) {
        let source = event.source.clone().unwrap_or_else(|| event.event_type.clone());
        self.push(
            DebugEntryType::for_event(&event.event_type),
            &event.event_type,
            source,
            event.data.clone(),
            event.timestamp,
        );
    }

    fn push(&self, entry_type: DebugEntryType, event_type: &str, source: String, data: Value, timestamp: u64) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let stack_trace = self
            .config
            .capture_stack_traces
            .then(|| format!("{:?}", backtrace::Backtrace::new()));

        let entry = DebugEntry {
            id: id.to_string(),
            timestamp,
            entry_type,
            event_type: event_type.to_string(),
            source,
            data,
            stack_trace,
        };

        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.config.max_entries {
            entries.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Bounded, filterable trace of bus activity.
pub struct DebugRecorder {
    inner: Arc<RecorderInner>,
    _subscriptions: Vec<Subscription>,
    observer: Option<MiddlewareHandle>,
}

impl DebugRecorder {
    pub fn attach(bus: &EventBus, mut config: DebugConfig) -> Self {
        config.max_entries = config.max_entries.max(1);
        let inner = Arc::new(RecorderInner {
            config,
            entries: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            evicted: AtomicU64::new(0),
            bus: bus.clone(),
        });

        let mut subscriptions = Vec::new();
        let mut observer = None;
        if inner.config.trace_all_events {
            let weak: Weak<RecorderInner> = Arc::downgrade(&inner);
            observer = Some(bus.add_observer(move |event: &RawEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.record_event(event);
                }
            }));
        } else {
            for event_type in OBSERVED_EVENTS {
                let weak: Weak<RecorderInner> = Arc::downgrade(&inner);
                subscriptions.push(bus.subscribe_raw(event_type, move |event: &RawEvent| {
                    if let Some(inner) = weak.upgrade() {
                        inner.record_event(event);
                    }
                    Ok(())
                }));
            }
        }

        debug!(
            "🔍 Debug recorder attached (max {} entries, trace all: {})",
            inner.config.max_entries, inner.config.trace_all_events
        );
        Self {
            inner,
            _subscriptions: subscriptions,
            observer,
        }
    }

    /// Records an entry that did not come from the bus.
    pub fn record(&self, entry_type: DebugEntryType, source: &str, data: Value) {
        let timestamp = self.inner.bus.now();
        self.inner
            .push(entry_type, "manual", source.to_string(), data, timestamp);
    }

    /// Retained entries matching `filter`, oldest first.
    pub fn entries(&self, filter: &DebugFilter) -> Vec<DebugEntry> {
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }

    pub fn config(&self) -> &DebugConfig {
        &self.inner.config
    }

    pub fn export(&self) -> DebugExport {
        let entries = self.entries(&DebugFilter::default());
        DebugExport {
            metadata: DebugMetadata {
                recorded: self.inner.next_id.load(Ordering::SeqCst) - 1,
                evicted: self.inner.evicted.load(Ordering::Relaxed),
                retained: entries.len(),
                bus: self.inner.bus.stats(),
            },
            entries,
            timestamp: self.inner.bus.now(),
            config: self.inner.config.clone(),
        }
    }

    /// Writes the export as `state-debug-<timestamp>.json` into `dir` and
    /// returns the file path.
    pub fn export_to_file(&self, dir: &Path) -> Result<PathBuf, ExportError> {
        let export = self.export();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("state-debug-{}.json", export.timestamp));
        std::fs::write(&path, serde_json::to_string_pretty(&export)?)?;
        info!("💾 Wrote {} debug entries to {}", export.entries.len(), path.display());
        Ok(path)
    }
}

impl Drop for DebugRecorder {
    fn drop(&mut self) {
        if let Some(handle) = self.observer.take() {
            self.inner.bus.remove_observer(handle);
        }
    }
}
