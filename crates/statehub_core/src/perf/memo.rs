//! Dependency-keyed memoisation cache with TTL and bounded size.

use crate::error::StateError;
use crate::events::{MemoizationHit, MemoizationMiss};
use crate::utils::{system_clock, SharedClock};
use crate::EventBus;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{trace, warn};

#[derive(Debug, Clone)]
pub struct MemoOptions {
    pub ttl: Duration,
    pub max_cache_size: usize,
    pub debug_label: Option<String>,
}

impl Default for MemoOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            max_cache_size: 100,
            debug_label: None,
        }
    }
}

impl MemoOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn max_cache_size(mut self, size: usize) -> Self {
        self.max_cache_size = size.max(1);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.debug_label = Some(label.into());
        self
    }
}

#[derive(Debug, Clone)]
struct MemoEntry<V> {
    value: V,
    timestamp: u64,
    hit_count: u64,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

struct MemoStore<V> {
    entries: HashMap<String, MemoEntry<V>>,
    /// Keys in insertion order; the front is evicted first
    order: VecDeque<String>,
    stats: MemoStats,
}

/// Memoises values by the serialised form of their dependency list.
///
/// Eviction removes the oldest *inserted* key, not the least recently used
/// one. Entries expire after `ttl` regardless of how often they are hit.
pub struct Memoizer<V> {
    options: MemoOptions,
    clock: SharedClock,
    bus: Option<EventBus>,
    store: Mutex<MemoStore<V>>,
}

impl<V: Clone> Memoizer<V> {
    pub fn new(options: MemoOptions) -> Self {
        Self {
            options,
            clock: system_clock(),
            bus: None,
            store: Mutex::new(MemoStore {
                entries: HashMap::new(),
                order: VecDeque::new(),
                stats: MemoStats::default(),
            }),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Reports hits and misses on `bus`.
    pub fn with_bus(mut self, bus: &EventBus) -> Self {
        self.bus = Some(bus.clone());
        self
    }

    /// Returns the cached value for `deps`, or runs `compute` and caches it.
    ///
    /// `compute` runs without the cache lock held.
    pub fn memoize<D, F>(&self, deps: &D, compute: F) -> Result<V, StateError>
    where
        D: Serialize + ?Sized,
        F: FnOnce() -> V,
    {
        let key = serde_json::to_string(deps)?;
        let now = self.clock.now_ms();
        let ttl = self.options.ttl.as_millis() as u64;

        let hit = {
            let mut store = self.store.lock();
            let fresh = match store.entries.get_mut(&key) {
                Some(entry) if now.saturating_sub(entry.timestamp) < ttl => {
                    entry.hit_count += 1;
                    Some((entry.value.clone(), entry.hit_count))
                }
                _ => None,
            };
            match fresh {
                Some(hit) => {
                    store.stats.hits += 1;
                    Some(hit)
                }
                None => {
                    store.stats.misses += 1;
                    None
                }
            }
        };

        if let Some((value, hit_count)) = hit {
            trace!("🎯 Memo hit for {}", key);
            self.report(MemoizationHit {
                key,
                label: self.options.debug_label.clone(),
                hit_count,
            });
            return Ok(value);
        }

        let value = compute();
        self.insert(key.clone(), value.clone(), now);
        self.report(MemoizationMiss {
            key,
            label: self.options.debug_label.clone(),
        });
        Ok(value)
    }

    fn insert(&self, key: String, value: V, now: u64) {
        let mut store = self.store.lock();
        let entry = MemoEntry {
            value,
            timestamp: now,
            hit_count: 0,
        };
        if store.entries.insert(key.clone(), entry).is_some() {
            store.order.retain(|existing| existing != &key);
        }
        store.order.push_back(key);

        while store.entries.len() > self.options.max_cache_size {
            let Some(oldest) = store.order.pop_front() else {
                break;
            };
            store.entries.remove(&oldest);
            store.stats.evictions += 1;
        }
    }

    fn report<E: crate::BusEvent>(&self, event: E) {
        if let Some(bus) = &self.bus {
            if let Err(e) = bus.emit(event, self.options.debug_label.as_deref()) {
                warn!("⚠️ Failed to report memoization event: {}", e);
            }
        }
    }

    pub fn stats(&self) -> MemoStats {
        let store = self.store.lock();
        MemoStats {
            entries: store.entries.len(),
            ..store.stats
        }
    }

    pub fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry; counters are kept.
    pub fn clear(&self) {
        let mut store = self.store.lock();
        store.entries.clear();
        store.order.clear();
    }
}
