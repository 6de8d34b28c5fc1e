/// Built-in middleware
use super::{Flow, MiddlewareContext, MiddlewareManager, MiddlewareOptions};
use crate::error::MiddlewareError;
use serde_json::Value;
use tracing::{debug, warn};

/// Pass-through that logs every payload at debug level.
pub fn logging_middleware(
) -> impl Fn(Value, &MiddlewareContext) -> Result<Flow, MiddlewareError> + Send + Sync + 'static {
    |data: Value, context: &MiddlewareContext| {
        debug!(
            event_type = context.event_type.as_deref().unwrap_or("-"),
            source = context.source.as_deref().unwrap_or("-"),
            "🔄 Middleware pass: {}",
            data
        );
        Ok(Flow::Next(data))
    }
}

/// Pass-through that warns on a null payload.
pub fn validation_middleware(
) -> impl Fn(Value, &MiddlewareContext) -> Result<Flow, MiddlewareError> + Send + Sync + 'static {
    |data: Value, context: &MiddlewareContext| {
        if data.is_null() {
            warn!(
                "⚠️ Null payload passed validation middleware (event: {})",
                context.event_type.as_deref().unwrap_or("-")
            );
        }
        Ok(Flow::Next(data))
    }
}

/// Stamps `_timestamp` and `_source` onto object payloads. Other payloads
/// pass through untouched.
pub fn timestamp_middleware(
) -> impl Fn(Value, &MiddlewareContext) -> Result<Flow, MiddlewareError> + Send + Sync + 'static {
    |data: Value, context: &MiddlewareContext| {
        let Value::Object(mut map) = data else {
            return Ok(Flow::Next(data));
        };
        map.insert("_timestamp".into(), Value::from(context.timestamp));
        map.insert(
            "_source".into(),
            Value::from(context.source.clone().unwrap_or_else(|| "unknown".into())),
        );
        Ok(Flow::Next(Value::Object(map)))
    }
}

/// Registers validation, timestamping and logging, in that order.
pub fn register_builtin_middleware(manager: &MiddlewareManager) {
    manager.add_middleware(
        validation_middleware(),
        MiddlewareOptions::new("validation").priority(100),
    );
    manager.add_middleware(
        timestamp_middleware(),
        MiddlewareOptions::new("timestamp").priority(50),
    );
    manager.add_middleware(logging_middleware(), MiddlewareOptions::new("logging"));
}
