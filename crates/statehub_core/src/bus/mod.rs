/// Event bus - split into registration, emission and statistics components
mod core;
mod emitters;
mod handlers;
mod stats;
mod tests;

pub use core::{EventBus, DEFAULT_HISTORY_CAPACITY};
pub use emitters::{GlobalMiddlewareFn, MiddlewareHandle, ObserverFn};
pub use handlers::{RawHandlerFn, Subscription};
pub use stats::BusStats;

lazy_static::lazy_static! {
    static ref DEFAULT_BUS: EventBus = EventBus::new();
}

/// Process-wide bus for the application's composition root.
///
/// Library code should take an [`EventBus`] as a parameter instead; tests
/// construct isolated buses with [`EventBus::new`].
pub fn default_bus() -> EventBus {
    DEFAULT_BUS.clone()
}
