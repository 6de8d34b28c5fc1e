/// Session storage port for persisted slices
use crate::error::StorageError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Key under which a persisted slice is mirrored.
pub fn slice_storage_key(slice_id: &str) -> String {
    format!("state-slice-{slice_id}")
}

/// Session-scoped key/value store used to mirror persisted slices.
///
/// Implementations are best-effort: slices log failures and keep the
/// in-memory update.
pub trait SessionStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory [`SessionStorage`] with an optional total size quota.
#[derive(Debug, Default)]
pub struct MemorySessionStorage {
    entries: DashMap<String, String>,
    quota_bytes: Option<usize>,
    unavailable: AtomicBool,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that rejects writes once keys plus values exceed `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Simulates the backend disappearing (or coming back).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("session storage disabled".into()));
        }
        Ok(())
    }

    fn used_bytes_excluding(&self, key: &str) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.key() != key)
            .map(|entry| entry.key().len() + entry.value().len())
            .sum()
    }
}

impl SessionStorage for MemorySessionStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check_available()?;
        Ok(self.entries.get(key).map(|value| value.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_available()?;
        if let Some(quota) = self.quota_bytes {
            if self.used_bytes_excluding(key) + key.len() + value.len() > quota {
                return Err(StorageError::QuotaExceeded { key: key.to_string() });
            }
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }
}
