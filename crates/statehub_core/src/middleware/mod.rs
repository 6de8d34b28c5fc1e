//! # Middleware Manager
//!
//! An ordered, priority-sorted pipeline of synchronous data transforms.
//!
//! Each middleware is a function `(data, context) -> Result<Flow, _>` and the
//! chain is reduced left to right in priority order (higher priority first,
//! ties in insertion order). A middleware forwards data by returning
//! [`Flow::Next`] and drops it by returning [`Flow::Halt`]; there is no
//! continuation to forget to call.
//!
//! Failures are fail-open: a middleware that returns `Err` or panics is
//! logged and the chain continues with that step's input unchanged.
//!
//! A manager can be used on its own through
//! [`process_data_sync`](MiddlewareManager::process_data_sync) or installed as
//! a single global middleware on an [`EventBus`] with
//! [`install_on`](MiddlewareManager::install_on).

mod builtin;
mod creators;

pub use builtin::{
    logging_middleware, register_builtin_middleware, timestamp_middleware, validation_middleware,
};
pub use creators::{cache_middleware, filter_middleware, transform_middleware};

use crate::bus::{EventBus, MiddlewareHandle};
use crate::error::MiddlewareError;
use crate::events::RawEvent;
use crate::utils::current_timestamp;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, trace};

/// Outcome of one middleware step.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Continue the chain with this data
    Next(Value),
    /// Stop the chain and drop the data
    Halt,
}

/// Information about the data passing through the pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MiddlewareContext {
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub timestamp: u64,
    pub metadata: HashMap<String, String>,
}

impl MiddlewareContext {
    pub fn new(source: Option<&str>) -> Self {
        Self {
            event_type: None,
            source: source.map(str::to_string),
            timestamp: current_timestamp(),
            metadata: HashMap::new(),
        }
    }

    /// Context describing an event passing through a bus.
    pub fn for_event(event: &RawEvent) -> Self {
        Self {
            event_type: Some(event.event_type.clone()),
            source: event.source.clone(),
            timestamp: event.timestamp,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// A middleware step.
pub type MiddlewareFn =
    dyn Fn(Value, &MiddlewareContext) -> Result<Flow, MiddlewareError> + Send + Sync;

/// Registration options for [`MiddlewareManager::add_middleware`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddlewareOptions {
    pub id: String,
    /// Higher runs first
    pub priority: i32,
    pub enabled: bool,
}

impl MiddlewareOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            enabled: true,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

struct MiddlewareEntry {
    id: String,
    priority: i32,
    enabled: bool,
    func: Arc<MiddlewareFn>,
}

/// Priority-ordered middleware pipeline. Clones share the same entries.
#[derive(Clone, Default)]
pub struct MiddlewareManager {
    entries: Arc<RwLock<Vec<MiddlewareEntry>>>,
}

impl std::fmt::Debug for MiddlewareManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareManager")
            .field("middleware", &self.middleware_ids())
            .finish()
    }
}

impl MiddlewareManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a middleware, replacing any entry with the same id.
    pub fn add_middleware<F>(&self, func: F, options: MiddlewareOptions)
    where
        F: Fn(Value, &MiddlewareContext) -> Result<Flow, MiddlewareError> + Send + Sync + 'static,
    {
        let mut entries = self.entries.write();
        entries.retain(|entry| entry.id != options.id);
        entries.push(MiddlewareEntry {
            id: options.id,
            priority: options.priority,
            enabled: options.enabled,
            func: Arc::new(func),
        });
        // stable: equal priorities keep insertion order
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Returns `false` if no middleware had this id.
    pub fn remove_middleware(&self, id: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Returns `false` if no middleware had this id.
    pub fn enable_middleware(&self, id: &str, enabled: bool) -> bool {
        match self.entries.write().iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Ids in execution order, including disabled entries.
    pub fn middleware_ids(&self) -> Vec<String> {
        self.entries.read().iter().map(|entry| entry.id.clone()).collect()
    }

    pub fn is_enabled(&self, id: &str) -> Option<bool> {
        self.entries
            .read()
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.enabled)
    }

    /// Runs the enabled middleware in priority order.
    ///
    /// Returns `None` when a middleware halted the chain.
    pub fn process_data_sync(&self, data: Value, context: &MiddlewareContext) -> Option<Value> {
        let chain: Vec<(String, Arc<MiddlewareFn>)> = self
            .entries
            .read()
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| (entry.id.clone(), entry.func.clone()))
            .collect();

        let mut current = data;
        for (id, func) in chain {
            let input = current.clone();
            match catch_unwind(AssertUnwindSafe(|| func(input, context))) {
                Ok(Ok(Flow::Next(next))) => current = next,
                Ok(Ok(Flow::Halt)) => {
                    trace!("Middleware '{}' halted the chain", id);
                    return None;
                }
                Ok(Err(e)) => error!("❌ Middleware '{}' failed, passing data through: {}", id, e),
                Err(_) => error!("💥 Middleware '{}' panicked, passing data through", id),
            }
        }
        Some(current)
    }

    /// Registers this manager as one global middleware on `bus`.
    pub fn install_on(&self, bus: &EventBus) -> MiddlewareHandle {
        let manager = self.clone();
        bus.add_middleware(move |event: &RawEvent| {
            let context = MiddlewareContext::for_event(event);
            Ok(match manager.process_data_sync(event.data.clone(), &context) {
                Some(data) => Flow::Next(data),
                None => Flow::Halt,
            })
        })
    }
}
