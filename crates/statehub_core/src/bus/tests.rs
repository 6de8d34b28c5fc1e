//! Tests for the event bus

#[cfg(test)]
mod tests {
    use crate::error::{EventError, MiddlewareError};
    use crate::events::{Event, MemoizationMiss, StateSliceReset};
    use crate::middleware::Flow;
    use crate::utils::ManualClock;
    use crate::EventBus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn miss(key: &str) -> MemoizationMiss {
        MemoizationMiss {
            key: key.to_string(),
            label: None,
        }
    }

    #[test]
    fn failing_handler_does_not_block_siblings() {
        let bus = EventBus::new();
        let called = Arc::new(AtomicUsize::new(0));
        let called_clone = called.clone();

        let _failing = bus.subscribe(|_: &Event<MemoizationMiss>| {
            Err(EventError::HandlerExecution("nope".into()))
        });
        let _panicking = bus.subscribe(|_: &Event<MemoizationMiss>| -> Result<(), EventError> {
            panic!("handler bug")
        });
        let _counting = bus.subscribe(move |_: &Event<MemoizationMiss>| {
            called_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(miss("k"), None).unwrap();

        assert_eq!(called.load(Ordering::SeqCst), 1);
        let stats = bus.stats();
        assert_eq!(stats.handler_failures, 2);
        assert_eq!(stats.handlers_invoked, 1);
        assert_eq!(stats.events_emitted, 1);
    }

    #[test]
    fn handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let subs: Vec<_> = (0..3)
            .map(|i| {
                let order = order.clone();
                bus.subscribe(move |_: &Event<MemoizationMiss>| {
                    order.lock().unwrap().push(i);
                    Ok(())
                })
            })
            .collect();

        bus.emit(miss("k"), None).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        drop(subs);
    }

    #[test]
    fn history_keeps_the_most_recent_hundred() {
        let bus = EventBus::new();
        for i in 0..150 {
            bus.emit(miss(&i.to_string()), None).unwrap();
        }

        let history = bus.event_history();
        assert_eq!(history.len(), 100);
        assert_eq!(history[0].data["key"], json!("50"));
        assert_eq!(history[99].data["key"], json!("149"));

        bus.clear_history();
        assert!(bus.event_history().is_empty());
    }

    #[test]
    fn unsubscribe_is_idempotent_and_drop_unsubscribes() {
        let bus = EventBus::new();
        let first = bus.subscribe(|_: &Event<MemoizationMiss>| Ok(()));
        let second = bus.subscribe(|_: &Event<MemoizationMiss>| Ok(()));
        assert_eq!(bus.active_listeners().get("memoization-miss"), Some(&2));

        first.unsubscribe();
        first.unsubscribe();
        assert!(!first.is_active());
        assert_eq!(bus.listener_count("memoization-miss"), 1);

        drop(second);
        assert!(bus.active_listeners().is_empty());
    }

    #[test]
    fn detached_subscription_stays_registered() {
        let bus = EventBus::new();
        bus.subscribe(|_: &Event<MemoizationMiss>| Ok(())).detach();
        assert_eq!(bus.listener_count("memoization-miss"), 1);
    }

    #[test]
    fn subscription_outliving_bus_is_harmless() {
        let sub = {
            let bus = EventBus::new();
            bus.subscribe(|_: &Event<MemoizationMiss>| Ok(()))
        };
        sub.unsubscribe();
    }

    #[test]
    fn handlers_may_reenter_the_bus() {
        let bus = EventBus::new();
        let inner_bus = bus.clone();
        let nested = Arc::new(AtomicUsize::new(0));
        let nested_clone = nested.clone();

        let _outer = bus.subscribe(move |event: &Event<MemoizationMiss>| {
            if event.data.key == "outer" {
                let counter = nested_clone.clone();
                inner_bus
                    .subscribe(move |_: &Event<MemoizationMiss>| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .detach();
                inner_bus.emit(miss("inner"), Some("nested"))?;
            }
            Ok(())
        });

        bus.emit(miss("outer"), None).unwrap();
        assert_eq!(nested.load(Ordering::SeqCst), 1);
        assert_eq!(bus.event_history().len(), 2);
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let clock = ManualClock::new(1_000);
        let bus = EventBus::with_clock(Arc::new(clock.clone()));

        bus.emit(miss("a"), None).unwrap();
        clock.set(500);
        bus.emit(miss("b"), None).unwrap();
        clock.set(2_000);
        bus.emit(miss("c"), None).unwrap();

        let stamps: Vec<u64> = bus.event_history().iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![1_000, 1_000, 2_000]);
    }

    #[test]
    fn global_middleware_transforms_in_registration_order() {
        let bus = EventBus::new();
        bus.add_middleware(|event| {
            let mut data = event.data.clone();
            data["key"] = json!(format!("{}-first", data["key"].as_str().unwrap_or_default()));
            Ok(Flow::Next(data))
        });
        bus.add_middleware(|_| -> Result<Flow, MiddlewareError> { panic!("broken middleware") });
        bus.add_middleware(|event| {
            let mut data = event.data.clone();
            data["key"] = json!(format!("{}-second", data["key"].as_str().unwrap_or_default()));
            Ok(Flow::Next(data))
        });

        let received = Arc::new(Mutex::new(String::new()));
        let received_clone = received.clone();
        let _sub = bus.subscribe(move |event: &Event<MemoizationMiss>| {
            *received_clone.lock().unwrap() = event.data.key.clone();
            Ok(())
        });

        bus.emit(miss("k"), Some("test")).unwrap();
        assert_eq!(*received.lock().unwrap(), "k-first-second");
        assert_eq!(bus.stats().middleware_failures, 1);
    }

    #[test]
    fn middleware_breaking_the_payload_counts_as_handler_failure() {
        let bus = EventBus::new();
        let handle = bus.add_middleware(|_| Ok(Flow::Next(json!("not a reset"))));
        let _sub = bus.subscribe(|_: &Event<StateSliceReset>| Ok(()));

        bus.emit(
            StateSliceReset {
                slice_id: "s".into(),
                source: "t".into(),
                origin: uuid::Uuid::new_v4(),
                timestamp: 0,
            },
            None,
        )
        .unwrap();
        assert_eq!(bus.stats().handler_failures, 1);
        assert!(bus.remove_middleware(handle));
        assert!(!bus.remove_middleware(handle));
    }

    #[test]
    fn raw_emission_reaches_typed_subscribers() {
        let bus = EventBus::new();
        let keys = Arc::new(Mutex::new(Vec::new()));
        let keys_clone = keys.clone();
        let _sub = bus.subscribe(move |event: &Event<MemoizationMiss>| {
            keys_clone.lock().unwrap().push(event.data.key.clone());
            Ok(())
        });

        let delivered = bus.emit_raw("memoization-miss", json!({"key": "raw"}), Some("ui"));
        assert_eq!(delivered.unwrap().source.as_deref(), Some("ui"));
        assert_eq!(*keys.lock().unwrap(), vec!["raw".to_string()]);
    }

    #[test]
    fn observers_see_delivered_payloads_only() {
        let bus = EventBus::new();
        bus.add_middleware(|event| {
            if event.data["key"] == "drop" {
                return Ok(Flow::Halt);
            }
            let mut data = event.data.clone();
            data["key"] = json!("rewritten");
            Ok(Flow::Next(data))
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handle = bus.add_observer(move |event| {
            seen_clone.lock().unwrap().push(event.data["key"].clone());
        });
        bus.add_observer(|_| panic!("observer bug"));

        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_clone = delivered.clone();
        let _sub = bus.subscribe(move |_: &Event<MemoizationMiss>| {
            delivered_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(miss("drop"), None).unwrap();
        bus.emit(miss("keep"), None).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![json!("rewritten")]);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        assert!(bus.remove_observer(handle));
        assert!(!bus.remove_observer(handle));
        bus.emit(miss("again"), None).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(bus.observer_count(), 1);
    }
}
