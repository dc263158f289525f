//! Queue behavior: priority-FIFO ordering, forward-only transitions,
//! conversations, broadcast fan-out and retention.

mod common;

use std::time::Duration;

use agent_kernel::{KernelError, MessageStatus};
use common::{kernel, spawn_child, spawn_root};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

#[tokio::test]
async fn receive_orders_by_priority_then_arrival() {
    let kernel = kernel().await;
    let sender = spawn_root(&kernel, 10_000).await;
    let recipient = spawn_child(&kernel, sender.id, 1_000).await;
    let queue = kernel.queue();

    for (content, priority) in [("Low", 0), ("Medium", 5), ("High", 10), ("High2", 10)] {
        queue
            .send(
                sender.id,
                recipient.id,
                serde_json::json!({ "content": content }),
                priority,
                None,
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let inbox = queue.receive(recipient.id, 10).await.unwrap();
    let contents: Vec<&str> = inbox
        .iter()
        .map(|message| message.payload["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["High", "High2", "Medium", "Low"]);
}

#[tokio::test]
async fn receive_is_a_stable_sort_of_the_pending_set() {
    let kernel = kernel().await;
    let sender = spawn_root(&kernel, 10_000).await;
    let recipient = spawn_child(&kernel, sender.id, 1_000).await;
    let queue = kernel.queue();

    let mut rng = StdRng::seed_from_u64(7);
    let mut sent: Vec<(Uuid, i64)> = Vec::new();
    for _ in 0..50 {
        let priority = rng.gen_range(0..5);
        let message = queue
            .send(sender.id, recipient.id, serde_json::json!({}), priority, None)
            .await
            .unwrap();
        sent.push((message.id, priority));
    }

    // Reference model: stable sort by descending priority over insertion order.
    let mut expected = sent.clone();
    expected.sort_by_key(|(_, priority)| -priority);
    let expected_ids: Vec<Uuid> = expected.iter().map(|(id, _)| *id).collect();

    let received_ids: Vec<Uuid> = queue
        .receive(recipient.id, 100)
        .await
        .unwrap()
        .iter()
        .map(|message| message.id)
        .collect();
    assert_eq!(received_ids, expected_ids);
}

#[tokio::test]
async fn receive_respects_the_limit_and_skips_non_pending() {
    let kernel = kernel().await;
    let sender = spawn_root(&kernel, 10_000).await;
    let recipient = spawn_child(&kernel, sender.id, 1_000).await;
    let queue = kernel.queue();

    let first = queue
        .send(sender.id, recipient.id, serde_json::json!({"n": 1}), 0, None)
        .await
        .unwrap();
    queue
        .send(sender.id, recipient.id, serde_json::json!({"n": 2}), 0, None)
        .await
        .unwrap();

    assert_eq!(queue.receive(recipient.id, 1).await.unwrap().len(), 1);

    queue.mark_delivered(first.id).await.unwrap();
    let remaining = queue.receive(recipient.id, 10).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].payload["n"], 2);
}

#[tokio::test]
async fn status_transitions_are_forward_only() {
    let kernel = kernel().await;
    let sender = spawn_root(&kernel, 10_000).await;
    let recipient = spawn_child(&kernel, sender.id, 1_000).await;
    let queue = kernel.queue();

    let message = queue
        .send(sender.id, recipient.id, serde_json::json!({}), 0, None)
        .await
        .unwrap();
    assert_eq!(message.status, MessageStatus::Pending);
    assert!(message.processed_at.is_none());

    let delivered = queue.mark_delivered(message.id).await.unwrap();
    assert_eq!(delivered.status, MessageStatus::Delivered);
    assert!(matches!(
        queue.mark_delivered(message.id).await,
        Err(KernelError::InvalidTransition(_))
    ));

    let processed = queue.mark_processed(message.id).await.unwrap();
    assert_eq!(processed.status, MessageStatus::Processed);
    assert!(processed.processed_at.is_some());

    // A second mark_processed must fail, never silently restamp.
    assert!(matches!(
        queue.mark_processed(message.id).await,
        Err(KernelError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn pending_can_jump_straight_to_processed() {
    let kernel = kernel().await;
    let sender = spawn_root(&kernel, 10_000).await;
    let recipient = spawn_child(&kernel, sender.id, 1_000).await;

    let message = kernel
        .queue()
        .send(sender.id, recipient.id, serde_json::json!({}), 0, None)
        .await
        .unwrap();
    let processed = kernel.queue().mark_processed(message.id).await.unwrap();
    assert_eq!(processed.status, MessageStatus::Processed);
}

#[tokio::test]
async fn receive_and_mark_delivered_is_atomic_hand_off() {
    let kernel = kernel().await;
    let sender = spawn_root(&kernel, 10_000).await;
    let recipient = spawn_child(&kernel, sender.id, 1_000).await;
    let queue = kernel.queue();

    for n in 0..3 {
        queue
            .send(sender.id, recipient.id, serde_json::json!({"n": n}), 0, None)
            .await
            .unwrap();
    }

    let batch = queue
        .receive_and_mark_delivered(recipient.id, 10)
        .await
        .unwrap();
    assert_eq!(batch.len(), 3);
    assert!(batch
        .iter()
        .all(|message| message.status == MessageStatus::Delivered));

    // Nothing pending is left behind.
    assert!(queue.receive(recipient.id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn conversation_is_chronological_and_bidirectional() {
    let kernel = kernel().await;
    let a = spawn_root(&kernel, 10_000).await;
    let b = spawn_child(&kernel, a.id, 1_000).await;
    let queue = kernel.queue();

    let thread = Uuid::new_v4();
    for (from, to, text) in [
        (a.id, b.id, "hello"),
        (b.id, a.id, "hi"),
        (a.id, b.id, "status?"),
    ] {
        queue
            .send(from, to, serde_json::json!({ "text": text }), 0, Some(thread))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let conversation = queue.conversation(a.id, b.id, 10).await.unwrap();
    let texts: Vec<&str> = conversation
        .iter()
        .map(|message| message.payload["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, vec!["hello", "hi", "status?"]);
    assert!(conversation
        .iter()
        .all(|message| message.thread == Some(thread)));

    let limited = queue.conversation(a.id, b.id, 2).await.unwrap();
    assert_eq!(limited.len(), 2);
}

#[tokio::test]
async fn broadcast_reports_partial_failures_per_recipient() {
    let kernel = kernel().await;
    let sender = spawn_root(&kernel, 10_000).await;
    let real = spawn_child(&kernel, sender.id, 1_000).await;
    let ghost = Uuid::new_v4();

    let outcome = kernel
        .queue()
        .send_broadcast(
            sender.id,
            &[real.id, ghost],
            serde_json::json!({"note": "all hands"}),
            3,
        )
        .await
        .unwrap();

    assert_eq!(outcome.sent.len(), 1);
    assert_eq!(outcome.sent[0].recipient, real.id);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, ghost);
}

#[tokio::test]
async fn sending_to_an_unknown_agent_is_not_found() {
    let kernel = kernel().await;
    let sender = spawn_root(&kernel, 10_000).await;
    let result = kernel
        .queue()
        .send(sender.id, Uuid::new_v4(), serde_json::json!({}), 0, None)
        .await;
    assert!(matches!(result, Err(KernelError::NotFound { .. })));
}

#[tokio::test]
async fn statistics_count_by_status() {
    let kernel = kernel().await;
    let sender = spawn_root(&kernel, 10_000).await;
    let recipient = spawn_child(&kernel, sender.id, 1_000).await;
    let queue = kernel.queue();

    let first = queue
        .send(sender.id, recipient.id, serde_json::json!({}), 0, None)
        .await
        .unwrap();
    let second = queue
        .send(sender.id, recipient.id, serde_json::json!({}), 0, None)
        .await
        .unwrap();
    queue
        .send(sender.id, recipient.id, serde_json::json!({}), 0, None)
        .await
        .unwrap();
    queue.mark_delivered(first.id).await.unwrap();
    queue.mark_processed(second.id).await.unwrap();

    let stats = queue.statistics().await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.processed, 1);
}

#[tokio::test]
async fn purge_removes_only_old_processed_messages() {
    let kernel = kernel().await;
    let sender = spawn_root(&kernel, 10_000).await;
    let recipient = spawn_child(&kernel, sender.id, 1_000).await;
    let queue = kernel.queue();

    let processed = queue
        .send(sender.id, recipient.id, serde_json::json!({}), 0, None)
        .await
        .unwrap();
    queue.mark_processed(processed.id).await.unwrap();
    queue
        .send(sender.id, recipient.id, serde_json::json!({}), 0, None)
        .await
        .unwrap();

    // A cutoff in the past touches nothing.
    let untouched = queue
        .purge_processed_before(chrono::Utc::now() - chrono::Duration::days(1))
        .await
        .unwrap();
    assert_eq!(untouched, 0);

    let purged = queue
        .purge_processed_before(chrono::Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(purged, 1);

    let stats = queue.statistics().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.pending, 1);
}
