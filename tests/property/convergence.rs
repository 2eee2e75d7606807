//! Property-based convergence tests for the reconciler.
//!
//! Uses proptest to verify:
//! 1. Server upserts converge to the same collection in any arrival order.
//! 2. Applying the same event twice is the same as applying it once.
//! 3. No id ever ends up holding an older record than one it has seen.
//! 4. A snapshot merged after pushes keeps the newest record per id.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use tasksync::tasks::{Input, SyncState, reconcile};
use tasksync_proto::task::{MutationEvent, Priority, Task, TaskId, TaskStatus, Timestamp, User};

const IDS: [&str; 4] = ["a", "b", "c", "d"];

fn record(id: u8, updated_at: u64) -> Task {
    Task {
        id: TaskId::new(IDS[usize::from(id)]),
        title: format!("{} @ {updated_at}", IDS[usize::from(id)]),
        description: String::new(),
        status: TaskStatus::Todo,
        priority: Priority::Low,
        assigned_to: None,
        created_by: User::new("u1", "Ada", "ada@example.com"),
        created_at: Timestamp::from_millis(1_000),
        updated_at: Timestamp::from_millis(updated_at),
        due_date: None,
        tags: BTreeSet::new(),
    }
}

/// Distinct `(id, updated_at)` pairs, so equal stamps always mean equal records.
fn arb_versions() -> impl Strategy<Value = Vec<(u8, u64)>> {
    prop::collection::btree_set((0..4u8, 1_000u64..1_050), 1..24)
        .prop_map(|set| set.into_iter().collect())
}

fn upserts(versions: &[(u8, u64)]) -> Vec<MutationEvent> {
    versions
        .iter()
        .map(|&(id, at)| MutationEvent::Updated(record(id, at)))
        .collect()
}

fn apply_all(state: &SyncState, events: &[MutationEvent]) -> SyncState {
    events.iter().fold(state.clone(), |s, e| reconcile(&s, Input::Remote(e)).state)
}

fn newest(versions: &[(u8, u64)]) -> BTreeMap<u8, u64> {
    let mut out = BTreeMap::new();
    for &(id, at) in versions {
        let slot = out.entry(id).or_insert(at);
        *slot = (*slot).max(at);
    }
    out
}

proptest! {
    #[test]
    fn arrival_order_does_not_matter(
        (versions, shuffled) in arb_versions().prop_flat_map(|v| {
            let shuffled = Just(v.clone()).prop_shuffle();
            (Just(v), shuffled)
        })
    ) {
        let a = apply_all(&SyncState::new(), &upserts(&versions));
        let b = apply_all(&SyncState::new(), &upserts(&shuffled));
        prop_assert_eq!(a.tasks(), b.tasks());
    }

    #[test]
    fn reapplying_an_event_changes_nothing(versions in arb_versions(), pick in any::<prop::sample::Index>()) {
        let events = upserts(&versions);
        let state = apply_all(&SyncState::new(), &events);
        let again = reconcile(&state, Input::Remote(&events[pick.index(events.len())]));
        prop_assert!(again.changes.is_empty());
        prop_assert_eq!(again.state, state);
    }

    #[test]
    fn every_id_holds_its_newest_version(versions in arb_versions()) {
        let state = apply_all(&SyncState::new(), &upserts(&versions));
        let expected = newest(&versions);
        prop_assert_eq!(state.tasks().len(), expected.len());
        for (id, at) in expected {
            let held = state.tasks().get(&TaskId::new(IDS[usize::from(id)])).unwrap();
            prop_assert_eq!(held.updated_at, Timestamp::from_millis(at));
        }
    }

    #[test]
    fn snapshot_after_pushes_keeps_newest(pushed in arb_versions(), fetched in arb_versions()) {
        let begun = reconcile(&SyncState::new(), Input::BeginSnapshot).state;
        let state = apply_all(&begun, &upserts(&pushed));

        // A snapshot holds at most one record per id.
        let snapshot: Vec<Task> = newest(&fetched)
            .into_iter()
            .map(|(id, at)| record(id, at))
            .collect();
        let out = reconcile(&state, Input::Snapshot(&snapshot)).state;

        let mut all = pushed.clone();
        all.extend(fetched.iter().copied());
        let expected = newest(&all);
        prop_assert!(!out.snapshot_requested());
        prop_assert_eq!(out.tasks().len(), expected.len());
        for (id, at) in expected {
            let held = out.tasks().get(&TaskId::new(IDS[usize::from(id)])).unwrap();
            prop_assert_eq!(held.updated_at, Timestamp::from_millis(at));
        }
    }
}
