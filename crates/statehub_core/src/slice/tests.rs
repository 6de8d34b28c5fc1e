//! Tests for state slices

#[cfg(test)]
mod tests {
    use crate::events::{ComponentMount, ComponentUnmount, Event, StateSliceUpdate};
    use crate::perf::{BatchOptions, BatchScheduler, Priority};
    use crate::selector::SelectorOptions;
    use crate::slice::*;
    use crate::EventBus;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct BoardState {
        title: String,
        cards: Vec<String>,
        selected: Option<String>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        n: u64,
        touched: u64,
    }

    fn increment(counter: &Counter) -> serde_json::Value {
        json!({"n": counter.n + 1})
    }

    fn board() -> BoardState {
        BoardState {
            title: "Sprint".into(),
            cards: vec![],
            selected: None,
        }
    }

    #[test]
    fn own_broadcast_is_not_reapplied() {
        let bus = EventBus::new();
        let slice = StateSlice::mount(&bus, SliceOptions::new("board", board()), None);

        slice.update_state(json!({"title": "Sprint 2"}), None).unwrap();

        assert_eq!(slice.state().title, "Sprint 2");
        assert_eq!(slice.revision(), 1);
        assert_eq!(bus.event_history().len(), 1);
    }

    #[test]
    fn sibling_instances_converge() {
        let bus = EventBus::new();
        let a = StateSlice::mount(&bus, SliceOptions::new("board", board()), None);
        let b = StateSlice::mount(&bus, SliceOptions::new("board", board()), None);
        let other = StateSlice::mount(&bus, SliceOptions::new("inbox", board()), None);

        a.update_state(json!({"cards": ["c1"], "selected": "c1"}), Some("kanban"))
            .unwrap();

        assert_eq!(*a.state(), *b.state());
        assert_eq!(b.state().cards, vec!["c1".to_string()]);
        assert_eq!(a.revision(), 1);
        assert_eq!(b.revision(), 1);
        assert_eq!(other.revision(), 0);
    }

    #[test]
    fn broadcast_carries_source_and_origin() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = bus.subscribe(move |event: &Event<StateSliceUpdate>| {
            seen_clone.lock().unwrap().push(event.data.clone());
            Ok(())
        });

        let slice = StateSlice::mount(&bus, SliceOptions::new("board", board()), None);
        slice.update_state(json!({"title": "x"}), None).unwrap();
        slice.update_state(json!({"title": "y"}), Some("toolbar")).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].source, LOCAL_SOURCE);
        assert_eq!(seen[1].source, "toolbar");
        assert_eq!(seen[0].origin, slice.origin());
        assert_eq!(seen[1].updates.get("title"), Some(&json!("y")));
    }

    #[test]
    fn unsynced_slice_neither_broadcasts_nor_listens() {
        let bus = EventBus::new();
        let local = StateSlice::mount(&bus, SliceOptions::new("board", board()).synced(false), None);
        let synced = StateSlice::mount(&bus, SliceOptions::new("board", board()), None);

        local.update_state(json!({"title": "local only"}), None).unwrap();
        synced.update_state(json!({"title": "shared"}), None).unwrap();

        assert_eq!(local.state().title, "local only");
        assert_eq!(synced.state().title, "shared");
    }

    #[test]
    fn sequential_updates_build_on_latest_state() {
        let bus = EventBus::new();
        let slice = StateSlice::mount(&bus, SliceOptions::new("board", board()), None);

        for i in 0..3 {
            slice
                .batch_update(
                    |state: &BoardState| {
                        let mut cards = state.cards.clone();
                        cards.push(format!("card-{i}"));
                        json!({ "cards": cards })
                    },
                    None,
                )
                .unwrap();
        }

        assert_eq!(slice.state().cards, vec!["card-0", "card-1", "card-2"]);
        assert_eq!(slice.revision(), 3);
    }

    #[test]
    fn non_object_patch_is_rejected() {
        let bus = EventBus::new();
        let slice = StateSlice::mount(&bus, SliceOptions::new("board", board()), None);
        assert!(matches!(
            slice.update_state(json!(["nope"]), None),
            Err(crate::StateError::InvalidPatch(_))
        ));
        assert!(matches!(
            slice.update_state(json!({"cards": "not a list"}), None),
            Err(crate::StateError::Serialization(_))
        ));
        assert_eq!(slice.revision(), 0);
    }

    #[test]
    fn persisted_slice_mirrors_restores_and_clears() {
        let bus = EventBus::new();
        let storage = Arc::new(MemorySessionStorage::new());
        let port: Arc<dyn SessionStorage> = storage.clone();
        let key = slice_storage_key("board");

        let slice = StateSlice::mount(
            &bus,
            SliceOptions::new("board", board()).persisted(true),
            Some(port.clone()),
        );
        assert!(storage.get(&key).unwrap().is_none());

        slice.update_state(json!({"title": "Saved"}), None).unwrap();
        let mirrored: BoardState = serde_json::from_str(&storage.get(&key).unwrap().unwrap()).unwrap();
        assert_eq!(mirrored.title, "Saved");

        let remounted = StateSlice::mount(
            &bus,
            SliceOptions::new("board", board()).persisted(true),
            Some(port),
        );
        assert_eq!(remounted.state().title, "Saved");

        slice.reset_state(None).unwrap();
        assert!(storage.get(&key).unwrap().is_none());
        assert_eq!(slice.state().title, "Sprint");
        assert_eq!(remounted.state().title, "Sprint");
    }

    #[test]
    fn storage_faults_do_not_fail_updates() {
        let bus = EventBus::new();
        let storage = Arc::new(MemorySessionStorage::with_quota(8));
        let slice = StateSlice::mount(
            &bus,
            SliceOptions::new("board", board()).persisted(true),
            Some(storage.clone() as Arc<dyn SessionStorage>),
        );

        slice.update_state(json!({"title": "far too long to fit"}), None).unwrap();
        assert_eq!(slice.state().title, "far too long to fit");
        assert!(storage.is_empty());

        storage.set_unavailable(true);
        slice.update_state(json!({"title": "still works"}), None).unwrap();
        slice.reset_state(None).unwrap();
        assert_eq!(slice.state().title, "Sprint");
    }

    #[test]
    fn unreadable_mirror_falls_back_to_initial_state() {
        let bus = EventBus::new();
        let storage = Arc::new(MemorySessionStorage::new());
        storage.set(&slice_storage_key("board"), "{not json").unwrap();

        let slice = StateSlice::mount(
            &bus,
            SliceOptions::new("board", board()).persisted(true),
            Some(storage as Arc<dyn SessionStorage>),
        );
        assert_eq!(*slice.state(), board());
    }

    #[test]
    fn debug_mode_reports_mount_and_unmount() {
        let bus = EventBus::new();
        let lifecycle = Arc::new(Mutex::new(Vec::new()));
        let mounts = lifecycle.clone();
        let unmounts = lifecycle.clone();
        let _m = bus.subscribe(move |event: &Event<ComponentMount>| {
            mounts.lock().unwrap().push(format!("mount {}", event.data.component));
            Ok(())
        });
        let _u = bus.subscribe(move |event: &Event<ComponentUnmount>| {
            unmounts.lock().unwrap().push(format!("unmount {}", event.data.component));
            Ok(())
        });

        let slice = StateSlice::mount(&bus, SliceOptions::new("board", board()).debug(true), None);
        drop(slice);

        assert_eq!(
            *lifecycle.lock().unwrap(),
            vec!["mount state-slice:board", "unmount state-slice:board"]
        );
        assert_eq!(bus.listener_count("state-slice-update"), 0);
    }

    #[test]
    fn slice_selectors_follow_snapshots() {
        let bus = EventBus::new();
        let slice = StateSlice::mount(&bus, SliceOptions::new("board", board()), None);
        let mut count = slice.create_selector(|state: &BoardState| state.cards.len(), SelectorOptions::default());

        assert_eq!(count.select(&slice.state()), 0);
        slice.update_state(json!({"cards": ["a", "b"]}), None).unwrap();
        assert_eq!(count.select(&slice.state()), 2);
        assert_eq!(slice.select(|state| state.title.clone()), "Sprint");
    }

    #[test]
    fn concurrent_batch_updates_are_not_lost() {
        let bus = EventBus::new();
        let slice = StateSlice::mount(&bus, SliceOptions::new("counter", Counter::default()), None);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..500 {
                        slice.batch_update(increment, None).unwrap();
                    }
                });
            }
            scope.spawn(|| {
                for i in 1..=200 {
                    slice.update_state(json!({"touched": i}), None).unwrap();
                }
            });
        });

        assert_eq!(slice.state().n, 2000);
        assert_eq!(slice.state().touched, 200);
        assert_eq!(slice.revision(), 2200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scheduled_flush_racing_direct_updates_keeps_every_increment() {
        let bus = EventBus::new();
        let slice = Arc::new(StateSlice::mount(&bus, SliceOptions::new("counter", Counter::default()), None));
        let scheduler = BatchScheduler::new(BatchOptions {
            max_batch_size: 5,
            flush_interval: Duration::from_millis(1),
            deduplicate: true,
        });

        for i in 0..300 {
            let target = slice.clone();
            scheduler.batch_update(
                move |_| target.batch_update(increment, Some("batch")).unwrap(),
                json!({"seq": i}),
                Priority::Normal,
            );
            slice.batch_update(increment, Some("direct")).unwrap();
            if i % 50 == 0 {
                tokio::task::yield_now().await;
            }
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while slice.state().n < 600 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(slice.state().n, 600);
        assert_eq!(slice.revision(), 600);
        assert_eq!(scheduler.pending(), 0);
    }
}
