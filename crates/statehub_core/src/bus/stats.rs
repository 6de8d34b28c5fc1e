/// Statistics tracking for the event bus
use serde::{Deserialize, Serialize};

/// Counters maintained by an [`EventBus`](super::EventBus) for monitoring.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Events that passed the middleware chain and were delivered
    pub events_emitted: u64,
    /// Events a global middleware halted
    pub events_dropped: u64,
    /// Successful handler invocations
    pub handlers_invoked: u64,
    /// Handler invocations that returned an error or panicked
    pub handler_failures: u64,
    /// Middleware steps that returned an error or panicked
    pub middleware_failures: u64,
    /// Subscriptions ever registered
    pub total_subscriptions: u64,
}
