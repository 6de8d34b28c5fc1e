//! # State Selectors
//!
//! A [`StateSelector`] derives a projection from a state snapshot and
//! memoises it by snapshot identity: passing the same `Arc<S>` twice does not
//! rerun the selector function.
//!
//! Change detection is separate from recomputation. Every fresh result is
//! compared with the last *accepted* result using the configured comparator;
//! only a material change is accepted and reported on the bus as
//! `state-selector-update`. With a debounce window the report is delayed and
//! coalesced to the last value, but [`select`](StateSelector::select) always
//! returns the latest computed value.

use crate::events::StateSelectorUpdate;
use crate::EventBus;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Decides whether two selector results are equivalent.
pub type Comparator<R> = Arc<dyn Fn(&R, &R) -> bool + Send + Sync>;

type SelectorFn<S, R> = Arc<dyn Fn(&S) -> R + Send + Sync>;

/// Shallow equality for JSON values: objects are equal when they have the
/// same keys and each top-level value compares equal; anything else falls
/// back to plain equality.
pub fn shallow_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            left.len() == right.len()
                && left
                    .iter()
                    .all(|(key, value)| right.get(key).is_some_and(|other| other == value))
        }
        _ => a == b,
    }
}

pub struct SelectorOptions<R> {
    pub comparator: Comparator<R>,
    /// Zero reports changes immediately
    pub debounce: Duration,
    pub debug_label: Option<String>,
}

impl<R: PartialEq + 'static> Default for SelectorOptions<R> {
    fn default() -> Self {
        Self {
            comparator: Arc::new(|a: &R, b: &R| a == b),
            debounce: Duration::ZERO,
            debug_label: None,
        }
    }
}

impl SelectorOptions<Value> {
    /// Options using [`shallow_equal`].
    pub fn shallow() -> Self {
        Self {
            comparator: Arc::new(shallow_equal),
            debounce: Duration::ZERO,
            debug_label: None,
        }
    }
}

impl<R> SelectorOptions<R> {
    pub fn comparator<F>(mut self, comparator: F) -> Self
    where
        F: Fn(&R, &R) -> bool + Send + Sync + 'static,
    {
        self.comparator = Arc::new(comparator);
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.debug_label = Some(label.into());
        self
    }
}

/// Memoised projection of a state snapshot.
pub struct StateSelector<S, R> {
    selector: SelectorFn<S, R>,
    options: SelectorOptions<R>,
    bus: Option<EventBus>,
    memo: Option<(Arc<S>, R)>,
    accepted: Option<R>,
    recomputations: u64,
    generation: Arc<AtomicU64>,
}

impl<S, R> StateSelector<S, R>
where
    S: Send + Sync + 'static,
    R: Clone + Serialize + Send + Sync + 'static,
{
    pub fn new<F>(selector: F, options: SelectorOptions<R>) -> Self
    where
        F: Fn(&S) -> R + Send + Sync + 'static,
    {
        Self {
            selector: Arc::new(selector),
            options,
            bus: None,
            memo: None,
            accepted: None,
            recomputations: 0,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Reports accepted changes on `bus`.
    pub fn with_bus(mut self, bus: &EventBus) -> Self {
        self.bus = Some(bus.clone());
        self
    }

    /// Returns the selection for `state`, recomputing only when the snapshot
    /// identity differs from the previous call.
    pub fn select(&mut self, state: &Arc<S>) -> R {
        if let Some((previous, computed)) = &self.memo {
            if Arc::ptr_eq(previous, state) {
                return computed.clone();
            }
        }

        let computed = (self.selector)(state);
        self.recomputations += 1;

        let changed = match &self.accepted {
            Some(accepted) => !(self.options.comparator)(accepted, &computed),
            None => true,
        };
        if changed {
            self.accepted = Some(computed.clone());
            self.notify(&computed);
        }

        self.memo = Some((state.clone(), computed.clone()));
        computed
    }

    /// Replaces the selector function and drops the memoised result.
    pub fn set_selector<F>(&mut self, selector: F)
    where
        F: Fn(&S) -> R + Send + Sync + 'static,
    {
        self.selector = Arc::new(selector);
        self.memo = None;
    }

    /// Last result the comparator accepted as a change.
    pub fn accepted(&self) -> Option<&R> {
        self.accepted.as_ref()
    }

    /// Number of times the selector function actually ran.
    pub fn recomputations(&self) -> u64 {
        self.recomputations
    }

    fn notify(&self, value: &R) {
        let Some(bus) = &self.bus else {
            return;
        };
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                warn!("⚠️ Selector result could not be serialized for notification: {}", e);
                return;
            }
        };
        let label = self.options.debug_label.clone();

        if self.options.debounce.is_zero() {
            emit_selector_update(bus, label, value);
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let bus = bus.clone();
                let latest = self.generation.clone();
                let delay = self.options.debounce;
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if latest.load(Ordering::SeqCst) == generation {
                        emit_selector_update(&bus, label, value);
                    } else {
                        trace!("Selector notification superseded");
                    }
                });
            }
            Err(_) => {
                trace!("No runtime for debounced selector notification, reporting immediately");
                emit_selector_update(bus, label, value);
            }
        }
    }
}

fn emit_selector_update(bus: &EventBus, label: Option<String>, value: Value) {
    let update = StateSelectorUpdate {
        label: label.clone(),
        value,
        timestamp: bus.now(),
    };
    if let Err(e) = bus.emit(update, label.as_deref()) {
        warn!("⚠️ Failed to report selector update: {}", e);
    }
}

/// Several named selectors evaluated in one pass.
///
/// The batch is memoised as a whole: a new snapshot (or a new selector)
/// recomputes every entry.
pub struct BatchSelector<S> {
    selectors: Vec<(String, SelectorFn<S, Value>)>,
    memo: Option<(Arc<S>, HashMap<String, Value>)>,
}

impl<S: Send + Sync + 'static> BatchSelector<S> {
    pub fn new() -> Self {
        Self {
            selectors: Vec::new(),
            memo: None,
        }
    }

    pub fn with<F>(mut self, name: impl Into<String>, selector: F) -> Self
    where
        F: Fn(&S) -> Value + Send + Sync + 'static,
    {
        self.selectors.push((name.into(), Arc::new(selector)));
        self.memo = None;
        self
    }

    pub fn select_all(&mut self, state: &Arc<S>) -> HashMap<String, Value> {
        if let Some((previous, results)) = &self.memo {
            if Arc::ptr_eq(previous, state) {
                return results.clone();
            }
        }
        let results: HashMap<String, Value> = self
            .selectors
            .iter()
            .map(|(name, selector)| (name.clone(), selector(state)))
            .collect();
        self.memo = Some((state.clone(), results.clone()));
        results
    }
}

impl<S: Send + Sync + 'static> Default for BatchSelector<S> {
    fn default() -> Self {
        Self::new()
    }
}
