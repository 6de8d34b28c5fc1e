/// Composable middleware creators
use super::{Flow, MiddlewareContext};
use crate::error::MiddlewareError;
use crate::utils::SharedClock;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Maps every payload through `map`.
pub fn transform_middleware<F>(
    map: F,
) -> impl Fn(Value, &MiddlewareContext) -> Result<Flow, MiddlewareError> + Send + Sync + 'static
where
    F: Fn(Value, &MiddlewareContext) -> Value + Send + Sync + 'static,
{
    move |data: Value, context: &MiddlewareContext| Ok(Flow::Next(map(data, context)))
}

/// Forwards payloads for which `predicate` holds and halts the rest.
pub fn filter_middleware<P>(
    predicate: P,
) -> impl Fn(Value, &MiddlewareContext) -> Result<Flow, MiddlewareError> + Send + Sync + 'static
where
    P: Fn(&Value, &MiddlewareContext) -> bool + Send + Sync + 'static,
{
    move |data: Value, context: &MiddlewareContext| {
        if predicate(&data, context) {
            Ok(Flow::Next(data))
        } else {
            Ok(Flow::Halt)
        }
    }
}

/// TTL-keyed memo over the pipeline.
///
/// The first payload seen for a key is remembered; until `ttl` elapses, every
/// later payload with the same key is *replaced* by the remembered one. A hit
/// therefore forwards stale data downstream instead of the fresh input.
pub fn cache_middleware<K>(
    cache_key: K,
    ttl: Duration,
    clock: SharedClock,
) -> impl Fn(Value, &MiddlewareContext) -> Result<Flow, MiddlewareError> + Send + Sync + 'static
where
    K: Fn(&Value, &MiddlewareContext) -> String + Send + Sync + 'static,
{
    let ttl_ms = ttl.as_millis() as u64;
    let cache: Mutex<HashMap<String, (Value, u64)>> = Mutex::new(HashMap::new());

    move |data: Value, context: &MiddlewareContext| {
        let key = cache_key(&data, context);
        let now = clock.now_ms();
        let mut cache = cache.lock();

        if let Some((cached, stored_at)) = cache.get(&key) {
            if now.saturating_sub(*stored_at) < ttl_ms {
                return Ok(Flow::Next(cached.clone()));
            }
        }

        cache.retain(|_, (_, stored_at)| now.saturating_sub(*stored_at) < ttl_ms);
        cache.insert(key, (data.clone(), now));
        Ok(Flow::Next(data))
    }
}
