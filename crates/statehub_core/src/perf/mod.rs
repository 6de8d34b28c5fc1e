//! # Performance Utilities
//!
//! Memoisation, update batching, lazy pagination, normalisation and state
//! compression. Each utility works standalone and can optionally report its
//! activity on an [`EventBus`](crate::EventBus).

mod batch;
mod compression;
mod lazy;
mod memo;
mod normalize;

pub use batch::{BatchOptions, BatchScheduler, Priority, UpdateFn, UpdateId};
pub use compression::{CompressedPayload, CompressionAlgorithm, CompressionConfig, StateCompressor};
pub use lazy::{LazyLoader, LazyOptions, PageSource};
pub use memo::{MemoOptions, MemoStats, Memoizer};
pub use normalize::NormalizedState;
