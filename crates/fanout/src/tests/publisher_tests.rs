use super::*;

use std::time::Duration;

use chrono::Utc;
use shared::domain::{ConversationId, UserId};
use storage::{LogStore, MemoryStore, Range};

use crate::test_support::FlakyStore;

fn message(conversation_id: ConversationId) -> NewLogEntry {
    NewLogEntry {
        conversation_id,
        sender_id: UserId::new_v4(),
        ciphertext: b"sealed".to_vec(),
        nonce: vec![1; 12],
        created_at: Utc::now(),
    }
}

fn publisher(store: Arc<dyn FanoutStore>, max_len: usize, trim_every: u64) -> Publisher {
    Publisher::new(
        store,
        Arc::new(FanoutMetrics::default()),
        Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(10),
        },
        4,
        max_len,
        trim_every,
    )
}

#[tokio::test]
async fn publish_appends_entry_then_pointer() {
    let store = MemoryStore::new();
    let publisher = publisher(Arc::new(store.clone()), 100, 100);
    let conversation_id = ConversationId::new_v4();

    let entry_id = publisher.publish(message(conversation_id)).await.expect("publish");

    let entries = store
        .range(&conversation_log_key(conversation_id), Range::all())
        .await
        .expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entry_id, entry_id);

    let pointers = store.range(FANOUT_LOG_KEY, Range::all()).await.expect("pointers");
    let pointer = FanoutPointer::from_fields(&pointers[0].fields).expect("pointer");
    assert_eq!(pointer, FanoutPointer::new(conversation_id, entry_id));
}

#[tokio::test(start_paused = true)]
async fn transient_pointer_failures_are_retried() {
    let store = Arc::new(FlakyStore::default());
    store.pointer_append_failures.store(2, Ordering::SeqCst);
    let publisher = publisher(store.clone(), 100, 100);

    publisher
        .publish(message(ConversationId::new_v4()))
        .await
        .expect("publish");
    let pointers = store
        .inner
        .range(FANOUT_LOG_KEY, Range::all())
        .await
        .expect("pointers");
    assert_eq!(pointers.len(), 1);
    assert_eq!(publisher.metrics.get(Counter::StoreRetries), 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_pointer_retries_report_the_durable_entry() {
    let store = Arc::new(FlakyStore::default());
    store.pointer_append_failures.store(10, Ordering::SeqCst);
    let publisher = publisher(store.clone(), 100, 100);
    let conversation_id = ConversationId::new_v4();

    let err = publisher
        .publish(message(conversation_id))
        .await
        .expect_err("fan-out failure");
    let PublishError::Fanout { entry_id, .. } = &err else {
        panic!("expected fan-out failure, got {err:?}");
    };
    let stored = store
        .inner
        .range(&conversation_log_key(conversation_id), Range::all())
        .await
        .expect("entries");
    assert_eq!(stored[0].entry_id, *entry_id);
    assert_eq!(publisher.metrics.get(Counter::PublishFanoutFailures), 1);
}

#[tokio::test]
async fn conversation_log_is_trimmed_periodically() {
    let store = MemoryStore::new();
    let publisher = publisher(Arc::new(store.clone()), 2, 5);
    let conversation_id = ConversationId::new_v4();
    for _ in 0..5 {
        publisher.publish(message(conversation_id)).await.expect("publish");
    }

    let log_key = conversation_log_key(conversation_id);
    let mut remaining = usize::MAX;
    for _ in 0..50 {
        remaining = store.range(&log_key, Range::all()).await.expect("range").len();
        if remaining == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(remaining, 2);
}
