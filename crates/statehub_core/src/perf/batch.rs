//! Priority-queued update batching
//!
//! Updates are queued under one of three priorities and flushed in cycles of
//! at most `max_batch_size` items, high before normal before low. When a
//! tokio runtime is available a background task runs a cycle every
//! `flush_interval` for as long as any queue is non-empty; otherwise the
//! owner drives cycles with [`BatchScheduler::run_cycle`] or
//! [`BatchScheduler::flush_batch`].

use crate::events::BatchProcessed;
use crate::EventBus;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// Handle for cancelling a queued update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpdateId(u64);

pub type UpdateFn = Box<dyn FnOnce(Value) + Send>;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    /// Replace a queued update whose data is deep-equal instead of queueing twice
    pub deduplicate: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            flush_interval: Duration::from_millis(16),
            deduplicate: true,
        }
    }
}

struct QueuedUpdate {
    id: UpdateId,
    data: Value,
    update: UpdateFn,
}

struct BatchInner {
    options: BatchOptions,
    queues: Mutex<[VecDeque<QueuedUpdate>; 3]>,
    next_id: AtomicU64,
    scheduled: AtomicBool,
    bus: Option<EventBus>,
}

/// Batches updates into prioritised flush cycles.
#[derive(Clone)]
pub struct BatchScheduler {
    inner: Arc<BatchInner>,
}

impl BatchScheduler {
    pub fn new(options: BatchOptions) -> Self {
        Self::build(options, None)
    }

    /// Scheduler that reports every cycle as a `batch-processed` event.
    pub fn with_bus(options: BatchOptions, bus: &EventBus) -> Self {
        Self::build(options, Some(bus.clone()))
    }

    fn build(mut options: BatchOptions, bus: Option<EventBus>) -> Self {
        options.max_batch_size = options.max_batch_size.max(1);
        Self {
            inner: Arc::new(BatchInner {
                options,
                queues: Mutex::new(Default::default()),
                next_id: AtomicU64::new(1),
                scheduled: AtomicBool::new(false),
                bus,
            }),
        }
    }

    /// Queues `update` to be called with `data`.
    pub fn batch_update<F>(&self, update: F, data: Value, priority: Priority) -> UpdateId
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let id = UpdateId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let entry = QueuedUpdate {
            id,
            data,
            update: Box::new(update),
        };

        {
            let mut queues = self.inner.queues.lock();
            let queue = &mut queues[priority.index()];
            let duplicate = self
                .inner
                .options
                .deduplicate
                .then(|| queue.iter().position(|queued| queued.data == entry.data))
                .flatten();
            match duplicate {
                Some(position) => {
                    debug!("♻️ Replacing duplicate {:?} update", priority);
                    queue[position] = entry;
                }
                None => queue.push_back(entry),
            }
        }

        self.inner.schedule();
        id
    }

    /// Removes a queued update. Returns `false` once it has run or been replaced.
    pub fn cancel_update(&self, id: UpdateId) -> bool {
        let mut queues = self.inner.queues.lock();
        for queue in queues.iter_mut() {
            if let Some(position) = queue.iter().position(|queued| queued.id == id) {
                queue.remove(position);
                return true;
            }
        }
        false
    }

    /// Runs one cycle of at most `max_batch_size` updates and returns how
    /// many ran.
    pub fn run_cycle(&self) -> usize {
        self.inner.run_cycle()
    }

    /// Drains every queue synchronously, returning the number of updates run.
    pub fn flush_batch(&self) -> usize {
        let mut total = 0;
        loop {
            let processed = self.inner.run_cycle();
            if processed == 0 {
                return total;
            }
            total += processed;
        }
    }

    /// Queue lengths as `[high, normal, low]`.
    pub fn queue_sizes(&self) -> [usize; 3] {
        let queues = self.inner.queues.lock();
        [queues[0].len(), queues[1].len(), queues[2].len()]
    }

    pub fn pending(&self) -> usize {
        self.queue_sizes().iter().sum()
    }
}

impl BatchInner {
    fn run_cycle(&self) -> usize {
        let (batch, remaining) = {
            let mut queues = self.queues.lock();
            let mut batch = Vec::with_capacity(self.options.max_batch_size);
            for priority in Priority::ALL {
                let queue = &mut queues[priority.index()];
                while batch.len() < self.options.max_batch_size {
                    match queue.pop_front() {
                        Some(update) => batch.push(update),
                        None => break,
                    }
                }
            }
            let remaining: usize = queues.iter().map(VecDeque::len).sum();
            (batch, remaining)
        };

        if batch.is_empty() {
            return 0;
        }

        let processed = batch.len();
        let mut failed = 0;
        for QueuedUpdate { id, data, update } in batch {
            if catch_unwind(AssertUnwindSafe(move || update(data))).is_err() {
                error!("💥 Batched update {:?} panicked", id);
                failed += 1;
            }
        }

        debug!("📦 Batch cycle ran {} updates ({} left)", processed, remaining);
        if let Some(bus) = &self.bus {
            let report = BatchProcessed {
                processed,
                remaining,
                failed,
            };
            if let Err(e) = bus.emit(report, Some("batch-scheduler")) {
                warn!("⚠️ Failed to report batch cycle: {}", e);
            }
        }
        processed
    }

    fn is_empty(&self) -> bool {
        self.queues.lock().iter().all(VecDeque::is_empty)
    }

    /// Starts the flush task unless one is running or no runtime is available.
    fn schedule(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak: Weak<BatchInner> = Arc::downgrade(self);
        let interval = self.options.flush_interval;
        handle.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.run_cycle();
                if inner.is_empty() {
                    inner.scheduled.store(false, Ordering::SeqCst);
                    // An update queued between the check and the store saw the
                    // flag still set; take the flag back for it.
                    if inner.is_empty() || inner.scheduled.swap(true, Ordering::SeqCst) {
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> UpdateFn) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |name: &str| -> UpdateFn {
            let log = log_clone.clone();
            let name = name.to_string();
            Box::new(move |_data: Value| log.lock().push(name))
        };
        (log, make)
    }

    #[test]
    fn high_priority_runs_first() {
        let scheduler = BatchScheduler::new(BatchOptions {
            max_batch_size: 1,
            ..Default::default()
        });
        let (log, make) = recorder();

        scheduler.batch_update(make("low"), json!({"card": 1}), Priority::Low);
        scheduler.batch_update(make("high"), json!({"card": 2}), Priority::High);

        assert_eq!(scheduler.run_cycle(), 1);
        assert_eq!(*log.lock(), vec!["high"]);
        assert_eq!(scheduler.queue_sizes(), [0, 0, 1]);

        scheduler.run_cycle();
        assert_eq!(*log.lock(), vec!["high", "low"]);
    }

    #[test]
    fn duplicates_replace_within_a_queue() {
        let scheduler = BatchScheduler::new(BatchOptions::default());
        let (log, make) = recorder();

        scheduler.batch_update(make("first"), json!({"id": 7}), Priority::Normal);
        scheduler.batch_update(make("second"), json!({"id": 7}), Priority::Normal);
        scheduler.batch_update(make("other queue"), json!({"id": 7}), Priority::Low);

        assert_eq!(scheduler.queue_sizes(), [0, 1, 1]);
        scheduler.flush_batch();
        assert_eq!(*log.lock(), vec!["second", "other queue"]);
    }

    #[test]
    fn cancel_removes_queued_update() {
        let scheduler = BatchScheduler::new(BatchOptions::default());
        let (log, make) = recorder();

        let id = scheduler.batch_update(make("cancelled"), json!(1), Priority::Normal);
        scheduler.batch_update(make("kept"), json!(2), Priority::Normal);

        assert!(scheduler.cancel_update(id));
        assert!(!scheduler.cancel_update(id));
        assert_eq!(scheduler.flush_batch(), 1);
        assert_eq!(*log.lock(), vec!["kept"]);
    }

    #[test]
    fn flush_drains_everything_and_isolates_panics() {
        let bus = EventBus::new();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let reports_clone = reports.clone();
        let _sub = bus.subscribe(move |event: &Event<BatchProcessed>| {
            reports_clone.lock().push(event.data.clone());
            Ok(())
        });

        let scheduler = BatchScheduler::with_bus(
            BatchOptions {
                max_batch_size: 2,
                ..Default::default()
            },
            &bus,
        );
        let (log, make) = recorder();
        scheduler.batch_update(|_| panic!("bad update"), json!("boom"), Priority::High);
        for i in 0..3 {
            scheduler.batch_update(make(&format!("n{i}")), json!(i), Priority::Normal);
        }

        assert_eq!(scheduler.flush_batch(), 4);
        assert_eq!(*log.lock(), vec!["n0", "n1", "n2"]);
        assert_eq!(scheduler.pending(), 0);

        let reports = reports.lock();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].failed, 1);
        assert_eq!(reports[0].remaining, 2);
        assert_eq!(reports[1].remaining, 0);
    }

    #[tokio::test]
    async fn timer_flushes_until_queues_are_empty() {
        let scheduler = BatchScheduler::new(BatchOptions {
            max_batch_size: 1,
            flush_interval: Duration::from_millis(5),
            deduplicate: false,
        });
        let (log, make) = recorder();
        for i in 0..3 {
            scheduler.batch_update(make(&format!("u{i}")), json!(i), Priority::Normal);
        }

        for _ in 0..100 {
            if scheduler.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*log.lock(), vec!["u0", "u1", "u2"]);

        scheduler.batch_update(make("late"), json!("late"), Priority::Low);
        for _ in 0..100 {
            if scheduler.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(log.lock().last().map(String::as_str), Some("late"));
    }
}
