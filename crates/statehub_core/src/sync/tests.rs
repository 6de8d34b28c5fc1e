//! Tests for the state synchroniser

#[cfg(test)]
mod tests {
    use crate::events::{Event, StateSyncConflict, StateSyncUpdate};
    use crate::sync::*;
    use crate::utils::{checksum, ManualClock};
    use crate::EventBus;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct Peer {
        sync: StateSynchronizer<Value>,
        state: Arc<Mutex<Value>>,
        applied: Arc<Mutex<Vec<(Value, String)>>>,
    }

    fn peer(bus: &EventBus, initial: Value, options: SyncOptions) -> Peer {
        let state = Arc::new(Mutex::new(initial));
        let applied = Arc::new(Mutex::new(Vec::new()));

        let reader = state.clone();
        let writer = state.clone();
        let log = applied.clone();
        let sync = StateSynchronizer::attach(
            bus,
            move || reader.lock().clone(),
            move |next: Value, source: &str| {
                *writer.lock() = next.clone();
                log.lock().push((next, source.to_string()));
            },
            options,
        );
        Peer { sync, state, applied }
    }

    fn clocked_bus() -> (EventBus, ManualClock) {
        let clock = ManualClock::new(1_000);
        (EventBus::with_clock(Arc::new(clock.clone())), clock)
    }

    fn remote_update(state_key: &str, data: Value, timestamp: u64) -> StateSyncUpdate {
        StateSyncUpdate {
            state_key: state_key.into(),
            scope: SyncScope::Component,
            checksum: checksum(&data),
            data,
            timestamp,
            source: "remote".into(),
            origin: uuid::Uuid::new_v4(),
            version: 1,
        }
    }

    #[test]
    fn latest_wins_applies_remote_state() {
        let (bus, clock) = clocked_bus();
        let a = peer(&bus, json!({"title": "a"}), SyncOptions::new("board"));
        let b = peer(&bus, json!({"title": "a"}), SyncOptions::new("board"));

        clock.advance(10);
        let update = a.sync.broadcast_state_change(&json!({"title": "b"}), "editor").unwrap();

        assert_eq!(update.version, 1);
        assert_eq!(*b.state.lock(), json!({"title": "b"}));
        assert_eq!(*b.applied.lock(), vec![(json!({"title": "b"}), "editor".to_string())]);
        assert!(a.applied.lock().is_empty());
        assert_eq!(b.sync.sync_status().last_applied, 1_010);
    }

    #[test]
    fn stale_updates_are_ignored() {
        let (bus, _clock) = clocked_bus();
        let b = peer(&bus, json!({"n": 0}), SyncOptions::new("counter"));

        let fresh = remote_update("counter", json!({"n": 2}), 2_000);
        assert_eq!(b.sync.handle_incoming_update(&fresh).unwrap(), SyncOutcome::Applied);

        let older = remote_update("counter", json!({"n": 1}), 1_500);
        let same = remote_update("counter", json!({"n": 3}), 2_000);
        assert_eq!(
            b.sync.handle_incoming_update(&older).unwrap(),
            SyncOutcome::Discarded(DiscardReason::Stale)
        );
        assert_eq!(
            b.sync.handle_incoming_update(&same).unwrap(),
            SyncOutcome::Discarded(DiscardReason::Stale)
        );
        assert_eq!(*b.state.lock(), json!({"n": 2}));
        assert_eq!(b.applied.lock().len(), 1);
    }

    #[test]
    fn foreign_and_own_updates_are_discarded() {
        let (bus, clock) = clocked_bus();
        let a = peer(&bus, json!({}), SyncOptions::new("board"));
        let other_scope = peer(&bus, json!({}), SyncOptions::new("board").scope(SyncScope::Global));

        clock.advance(1);
        let own = a.sync.broadcast_state_change(&json!({"x": 1}), "a").unwrap();
        assert_eq!(
            a.sync.handle_incoming_update(&own).unwrap(),
            SyncOutcome::Discarded(DiscardReason::OwnBroadcast)
        );
        assert!(other_scope.applied.lock().is_empty());

        let foreign = remote_update("inbox", json!({"x": 2}), 5_000);
        assert_eq!(
            a.sync.handle_incoming_update(&foreign).unwrap(),
            SyncOutcome::Discarded(DiscardReason::OtherKey)
        );
    }

    #[test]
    fn matching_checksum_only_moves_the_marker() {
        let (bus, _clock) = clocked_bus();
        let b = peer(&bus, json!({"title": "same"}), SyncOptions::new("board"));

        let update = remote_update("board", json!({"title": "same"}), 3_000);
        assert_eq!(b.sync.handle_incoming_update(&update).unwrap(), SyncOutcome::AlreadyInSync);
        assert!(b.applied.lock().is_empty());
        assert_eq!(b.sync.sync_status().last_applied, 3_000);
    }

    #[test]
    fn merge_policy_shallow_merges_over_current() {
        let (bus, _clock) = clocked_bus();
        let b = peer(
            &bus,
            json!({"title": "mine", "wip": 3}),
            SyncOptions::new("board").resolution(ConflictResolution::Merge),
        );

        let update = remote_update("board", json!({"title": "theirs", "owner": "sam"}), 2_000);
        b.sync.handle_incoming_update(&update).unwrap();
        assert_eq!(*b.state.lock(), json!({"title": "theirs", "wip": 3, "owner": "sam"}));
    }

    #[test]
    fn prompt_user_raises_conflict_for_local_changes() {
        let (bus, _clock) = clocked_bus();
        let conflicts = Arc::new(Mutex::new(Vec::new()));
        let conflicts_clone = conflicts.clone();
        let _sub = bus.subscribe(move |event: &Event<StateSyncConflict>| {
            conflicts_clone.lock().push(event.data.clone());
            Ok(())
        });

        let b = peer(
            &bus,
            json!({"title": "base"}),
            SyncOptions::new("board").resolution(ConflictResolution::PromptUser),
        );
        *b.state.lock() = json!({"title": "unsaved edit"});

        let update = remote_update("board", json!({"title": "remote edit"}), 2_000);
        let SyncOutcome::Conflict(conflict_id) = b.sync.handle_incoming_update(&update).unwrap() else {
            panic!("expected a conflict");
        };

        assert!(b.applied.lock().is_empty());
        assert_eq!(conflicts.lock().len(), 1);
        assert_eq!(conflicts.lock()[0].remote, json!({"title": "remote edit"}));
        assert_eq!(b.sync.sync_status().pending_conflicts, 1);

        let resolved = b.sync.resolve_conflict(&conflict_id, ConflictChoice::Remote, None).unwrap();
        assert_eq!(resolved, json!({"title": "remote edit"}));
        assert_eq!(*b.state.lock(), json!({"title": "remote edit"}));
        assert!(b.sync.pending_conflicts().is_empty());

        assert!(matches!(
            b.sync.resolve_conflict(&conflict_id, ConflictChoice::Remote, None),
            Err(crate::StateError::UnknownConflict(_))
        ));
    }

    #[test]
    fn prompt_user_prompts_for_any_divergent_state() {
        let (bus, _clock) = clocked_bus();
        let b = peer(
            &bus,
            json!({"title": "base"}),
            SyncOptions::new("board").resolution(ConflictResolution::PromptUser),
        );

        let update = remote_update("board", json!({"title": "remote"}), 2_000);
        assert!(matches!(
            b.sync.handle_incoming_update(&update).unwrap(),
            SyncOutcome::Conflict(_)
        ));
        assert_eq!(*b.state.lock(), json!({"title": "base"}));
        assert!(b.applied.lock().is_empty());
        assert_eq!(b.sync.sync_status().last_applied, 0);

        let same = remote_update("board", json!({"title": "base"}), 3_000);
        assert_eq!(b.sync.handle_incoming_update(&same).unwrap(), SyncOutcome::AlreadyInSync);
        assert_eq!(b.sync.sync_status().pending_conflicts, 1);
    }

    #[test]
    fn keeping_local_rebroadcasts_to_peers() {
        let (bus, clock) = clocked_bus();
        let a = peer(&bus, json!({"title": "base"}), SyncOptions::new("board"));
        let b = peer(
            &bus,
            json!({"title": "base"}),
            SyncOptions::new("board").resolution(ConflictResolution::PromptUser),
        );

        *b.state.lock() = json!({"title": "b local"});
        clock.advance(5);
        a.sync.broadcast_state_change(&json!({"title": "a remote"}), "a").unwrap();
        let conflict_id = b.sync.pending_conflicts()[0].conflict_id.clone();

        clock.advance(5);
        b.sync.resolve_conflict(&conflict_id, ConflictChoice::Local, None).unwrap();
        assert_eq!(*a.state.lock(), json!({"title": "b local"}));
        assert_eq!(
            a.applied.lock().last().map(|(_, source)| source.clone()),
            Some(CONFLICT_RESOLUTION_SOURCE.to_string())
        );
    }

    #[test]
    fn merge_resolution_accepts_caller_supplied_state() {
        let (bus, _clock) = clocked_bus();
        let b = peer(
            &bus,
            json!({"title": "base"}),
            SyncOptions::new("board").resolution(ConflictResolution::PromptUser),
        );
        *b.state.lock() = json!({"title": "mine", "wip": 1});

        let update = remote_update("board", json!({"title": "theirs"}), 2_000);
        let SyncOutcome::Conflict(id) = b.sync.handle_incoming_update(&update).unwrap() else {
            panic!("expected a conflict");
        };
        let merged = b
            .sync
            .resolve_conflict(&id, ConflictChoice::Merge, Some(json!({"title": "both", "wip": 1})))
            .unwrap();
        assert_eq!(merged, json!({"title": "both", "wip": 1}));
        assert_eq!(b.sync.sync_status().version, 1);
    }

    #[test]
    fn optimistic_updates_expire_from_status() {
        let (bus, clock) = clocked_bus();
        let a = peer(&bus, json!({}), SyncOptions::new("board"));
        let quiet = peer(&bus, json!({}), SyncOptions::new("quiet").optimistic(false));

        a.sync.broadcast_state_change(&json!({"v": 1}), "a").unwrap();
        clock.advance(400);
        a.sync.broadcast_state_change(&json!({"v": 2}), "a").unwrap();
        quiet.sync.broadcast_state_change(&json!({"v": 1}), "q").unwrap();

        let status = a.sync.sync_status();
        assert_eq!(status.pending_updates, 2);
        assert_eq!(status.version, 2);
        assert_eq!(status.last_sent, 1_400);
        assert_eq!(quiet.sync.sync_status().pending_updates, 0);

        clock.advance(700);
        assert_eq!(a.sync.sync_status().pending_updates, 1);
        clock.advance(400);
        assert_eq!(a.sync.sync_status().pending_updates, 0);
    }
}
