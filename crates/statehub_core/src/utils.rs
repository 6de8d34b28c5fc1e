//! # Utility Functions
//!
//! Timestamps, clocks, checksums and JSON object helpers shared by every
//! module in the core.
//!
//! All time in the core is expressed as Unix milliseconds and read through a
//! [`Clock`] so TTL and ordering behaviour can be driven deterministically in
//! tests with a [`ManualClock`].

use crate::error::StateError;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Returns the current Unix timestamp in milliseconds.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a unique string id.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Source of wall-clock milliseconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> u64;
}

/// Clock backed by [`std::time::SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        current_timestamp()
    }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The default clock used when none is injected.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Deterministic short digest of a JSON value.
///
/// `serde_json` keeps object keys sorted (no `preserve_order` feature), so
/// equal values always serialise to the same bytes.
pub fn checksum(value: &Value) -> String {
    let serialized = value.to_string();
    let mut hash = FNV_OFFSET;
    for byte in serialized.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:016x}")
}

/// Shallow-merges `patch` into `target`: top-level keys of `patch` overwrite
/// those of `target`, nested values are replaced wholesale.
pub fn merge_shallow(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        target.insert(key.clone(), value.clone());
    }
}

/// Shallow-merges two object-shaped values into a new one.
pub fn merged_value(base: &Value, patch: &Value) -> Result<Value, StateError> {
    let mut base = as_object(base)?.clone();
    merge_shallow(&mut base, as_object(patch)?);
    Ok(Value::Object(base))
}

/// Borrows a value as a JSON object or reports it as an invalid patch.
pub fn as_object(value: &Value) -> Result<&Map<String, Value>, StateError> {
    value
        .as_object()
        .ok_or_else(|| StateError::InvalidPatch(format!("expected a JSON object, got {value}")))
}
