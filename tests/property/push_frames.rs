//! Property-based tests for push-channel frame decoding.
//!
//! Uses proptest to verify:
//! 1. Random bytes and random text never panic a decoder.
//! 2. Text and binary frames decode any valid event to the same value.
//! 3. A record whose `updated_at` precedes `created_at` is refused by both.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;

use proptest::prelude::*;
use tasksync_proto::push::{self, CodecError};
use tasksync_proto::task::{MutationEvent, Priority, Task, TaskId, TaskStatus, Timestamp, User};

fn arb_user() -> impl Strategy<Value = User> {
    ("[a-z0-9]{1,8}", "\\PC{0,16}", "[a-z]{1,8}@[a-z]{1,8}\\.com")
        .prop_map(|(id, name, email)| User::new(id, name, email))
}

fn arb_status() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::Todo),
        Just(TaskStatus::InProgress),
        Just(TaskStatus::Completed),
    ]
}

fn arb_priority() -> impl Strategy<Value = Priority> {
    prop_oneof![Just(Priority::Low), Just(Priority::Medium), Just(Priority::High)]
}

/// Valid tasks: non-empty id, `updated_at >= created_at`.
fn arb_task() -> impl Strategy<Value = Task> {
    (
        "[a-z0-9-]{1,12}",
        "\\PC{0,40}",
        "\\PC{0,80}",
        arb_status(),
        arb_priority(),
        prop::option::of(arb_user()),
        arb_user(),
        0u64..1 << 40,
        0u64..1 << 20,
        prop::option::of(0u64..1 << 40),
        prop::collection::btree_set("[a-z]{1,6}", 0..4),
    )
        .prop_map(
            |(id, title, description, status, priority, assigned_to, created_by, created, age, due, tags)| {
                Task {
                    id: TaskId::new(id),
                    title,
                    description,
                    status,
                    priority,
                    assigned_to,
                    created_by,
                    created_at: Timestamp::from_millis(created),
                    updated_at: Timestamp::from_millis(created + age),
                    due_date: due.map(Timestamp::from_millis),
                    tags,
                }
            },
        )
}

fn arb_event() -> impl Strategy<Value = MutationEvent> {
    prop_oneof![
        arb_task().prop_map(MutationEvent::Created),
        arb_task().prop_map(MutationEvent::Updated),
        "[a-z0-9-]{1,12}".prop_map(|id| MutationEvent::Deleted(TaskId::new(id))),
    ]
}

proptest! {
    #[test]
    fn random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = push::decode_binary(&bytes);
    }

    #[test]
    fn random_text_never_panics(text in "\\PC{0,256}") {
        let _ = push::decode_json(&text);
        let _ = push::decode_snapshot_json(&text);
    }

    #[test]
    fn text_and_binary_frames_agree(event in arb_event()) {
        let from_text = push::decode_json(&push::encode_json(&event).unwrap()).unwrap();
        let from_binary = push::decode_binary(&push::encode_binary(&event).unwrap()).unwrap();
        prop_assert_eq!(&from_text, &event);
        prop_assert_eq!(from_binary, from_text);
    }

    #[test]
    fn records_updated_before_created_are_refused(task in arb_task(), back in 1u64..1_000) {
        let created = task.updated_at.as_millis() + back;
        let broken = MutationEvent::Updated(Task {
            created_at: Timestamp::from_millis(created),
            ..task
        });

        let text = push::encode_json(&broken).unwrap();
        prop_assert!(matches!(push::decode_json(&text), Err(CodecError::Invalid(_))));
        let bytes = push::encode_binary(&broken).unwrap();
        prop_assert!(matches!(push::decode_binary(&bytes), Err(CodecError::Invalid(_))));
    }
}

#[test]
fn empty_snapshot_array_decodes_to_nothing() {
    assert!(push::decode_snapshot_json("[]").unwrap().is_empty());
}

/// A frame exactly as a browser-side backend emits it: JS `Date`s arrive
/// as ISO-8601 strings.
#[test]
fn decodes_frame_with_iso_dates() {
    let text = r#"{"type":"TASK_CREATED","payload":{"id":"ws-1","title":"Review new design assets","description":"Check the new brand assets and provide feedback.","status":"todo","priority":"medium","assignedTo":{"id":"3","name":"Alex Johnson","email":"alex@example.com"},"createdBy":{"id":"2","name":"Jane Smith","email":"jane@example.com"},"createdAt":"2024-05-01T10:00:00.000Z","updatedAt":"2024-05-01T10:00:00.000Z","dueDate":"2024-05-04T10:00:00.000Z","tags":["design","review"]}}"#;

    let MutationEvent::Created(task) = push::decode_json(text).unwrap() else {
        panic!("expected a create");
    };
    assert_eq!(task.id, TaskId::new("ws-1"));
    assert_eq!(task.created_at, Timestamp::from_millis(1_714_557_600_000));
    assert_eq!(task.updated_at, task.created_at);
    assert_eq!(task.due_date, Some(Timestamp::from_millis(1_714_816_800_000)));
    assert_eq!(task.assigned_to.clone().map(|u| u.name), Some("Alex Johnson".to_string()));

    // Re-encoding keeps the same date strings.
    let again = push::encode_json(&MutationEvent::Created(task)).unwrap();
    assert!(again.contains(r#""createdAt":"2024-05-01T10:00:00.000Z""#));
    assert!(again.contains(r#""dueDate":"2024-05-04T10:00:00.000Z""#));
}

#[test]
fn snapshot_mixes_iso_and_millis_dates() {
    let text = r#"[
        {"id":"1","title":"a","status":"todo","priority":"low","createdBy":{"id":"1","name":"A","email":"a@x.com"},"createdAt":"2024-05-01T10:00:00Z","updatedAt":1714557600500},
        {"id":"2","title":"b","status":"completed","priority":"high","createdBy":{"id":"1","name":"A","email":"a@x.com"},"createdAt":0,"updatedAt":"1970-01-01T00:00:01.000Z"}
    ]"#;
    let tasks = push::decode_snapshot_json(text).unwrap();
    assert_eq!(tasks[0].updated_at, Timestamp::from_millis(1_714_557_600_500));
    assert_eq!(tasks[1].updated_at, Timestamp::from_millis(1_000));
}
