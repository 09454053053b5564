//! End-to-end streaming scenarios: ordered delivery, drain announcements,
//! crash semantics, and the state-machine guards.

mod common;

use common::{wait_until, Harness, Recorder};
use remora::{ConsumerState, EngineError};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn fresh_topic_announces_drained_and_delivers_nothing() {
    let h = Harness::new("example-42");
    let producer = h.producer();
    producer.start().await.unwrap();

    let consumer = h.consumer();
    consumer.start().await.unwrap();

    let recorder = Recorder::new();
    consumer
        .stream_messages_from(
            recorder.on_message(),
            None,
            recorder.on_drained(),
            recorder.on_crashed(),
        )
        .await
        .unwrap();

    assert!(wait_until(5_000, || recorder.drain_count() >= 1).await);
    assert_eq!(recorder.len(), 0);

    consumer.stop();
    producer.stop();
}

#[tokio::test(start_paused = true)]
async fn pushes_stream_in_order_with_ascending_ids() {
    let h = Harness::new("ordered");
    let producer = h.producer();
    producer.start().await.unwrap();

    let consumer = h.consumer();
    consumer.start().await.unwrap();
    let recorder = Recorder::new();
    consumer
        .stream_messages_from(
            recorder.on_message(),
            None,
            recorder.on_drained(),
            recorder.on_crashed(),
        )
        .await
        .unwrap();

    for i in 1..=10 {
        producer
            .push_message(json!({ "phil": format!("m{i}"), "isGreat": i > 5 }), "k", None)
            .await
            .unwrap();
    }

    assert!(wait_until(5_000, || recorder.len() == 10).await);

    let ids = recorder.ids();
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids not ascending: {ids:?}");
    let expected: Vec<serde_json::Value> = (1..=10)
        .map(|i| json!({ "phil": format!("m{i}"), "isGreat": i > 5 }))
        .collect();
    assert_eq!(recorder.payloads(), expected);

    consumer.stop();
    producer.stop();
}

#[tokio::test(start_paused = true)]
async fn history_is_replayed_before_following_the_tail() {
    let h = Harness::new("replay");
    let producer = h.producer();
    producer.start().await.unwrap();
    for i in 1..=3 {
        producer
            .push_message(json!({ "n": i }), "k", None)
            .await
            .unwrap();
    }

    // Everything above was pushed before anyone subscribed; the wake tokens
    // are gone. The stream must still replay the backlog.
    let consumer = h.consumer();
    consumer.start().await.unwrap();
    let recorder = Recorder::new();
    consumer
        .stream_messages_from(
            recorder.on_message(),
            None,
            recorder.on_drained(),
            recorder.on_crashed(),
        )
        .await
        .unwrap();

    assert!(wait_until(5_000, || recorder.len() == 3).await);
    assert_eq!(recorder.ids(), vec![1, 2, 3]);

    producer
        .push_message(json!({ "n": 4 }), "k", None)
        .await
        .unwrap();
    assert!(wait_until(5_000, || recorder.len() == 4).await);
    assert_eq!(recorder.ids(), vec![1, 2, 3, 4]);

    consumer.stop();
    producer.stop();
}

#[tokio::test(start_paused = true)]
async fn streaming_resumes_from_the_given_cursor() {
    let h = Harness::new("cursor");
    let producer = h.producer();
    producer.start().await.unwrap();
    for i in 1..=5 {
        producer
            .push_message(json!({ "n": i }), "k", None)
            .await
            .unwrap();
    }

    let consumer = h.consumer();
    consumer.start().await.unwrap();
    let recorder = Recorder::new();
    consumer
        .stream_messages_from(
            recorder.on_message(),
            Some(3),
            recorder.on_drained(),
            recorder.on_crashed(),
        )
        .await
        .unwrap();

    assert!(wait_until(5_000, || recorder.len() == 2).await);
    assert_eq!(recorder.ids(), vec![4, 5]);

    consumer.stop();
    producer.stop();
}

#[tokio::test(start_paused = true)]
async fn callback_failure_crashes_once_and_stops_delivery() {
    let h = Harness::new("crash");
    let producer = h.producer();
    producer.start().await.unwrap();
    for i in 1..=25 {
        producer
            .push_message(json!({ "n": i }), "k", None)
            .await
            .unwrap();
    }

    let consumer = h.consumer();
    consumer.start().await.unwrap();
    let recorder = Recorder::new();
    consumer
        .stream_messages_from(
            recorder.on_message_failing_at(21),
            None,
            recorder.on_drained(),
            recorder.on_crashed(),
        )
        .await
        .unwrap();

    assert!(wait_until(5_000, || recorder.crash_count() == 1).await);
    let expected: Vec<i64> = (1..=20).collect();
    assert_eq!(recorder.ids(), expected);
    // The cursor moved past the poisoned record before its callback ran.
    assert_eq!(consumer.last_id(), Some(21));
    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert!(recorder.crashes()[0].contains("21"));

    // Further produces must not reach the crashed consumer.
    for i in 26..=28 {
        producer
            .push_message(json!({ "n": i }), "k", None)
            .await
            .unwrap();
    }
    common::settle(500).await;
    assert_eq!(recorder.len(), 20);
    assert_eq!(recorder.crash_count(), 1);

    producer.stop();
}

#[tokio::test(start_paused = true)]
async fn crash_mid_batch_stops_at_the_poisoned_record() {
    let h = Harness::new("crash-mid");
    let producer = h.producer();
    producer.start().await.unwrap();
    for i in 1..=5 {
        producer
            .push_message(json!({ "n": i }), "k", None)
            .await
            .unwrap();
    }

    let consumer = h.consumer();
    consumer.start().await.unwrap();
    let recorder = Recorder::new();
    consumer
        .stream_messages_from(
            recorder.on_message_failing_at(3),
            None,
            recorder.on_drained(),
            recorder.on_crashed(),
        )
        .await
        .unwrap();

    assert!(wait_until(5_000, || recorder.crash_count() == 1).await);
    assert_eq!(recorder.ids(), vec![1, 2]);
    assert_eq!(consumer.last_id(), Some(3));

    producer.stop();
}

#[tokio::test(start_paused = true)]
async fn no_callbacks_after_stop() {
    let h = Harness::new("silence");
    let producer = h.producer();
    producer.start().await.unwrap();
    producer
        .push_message(json!({ "n": 1 }), "k", None)
        .await
        .unwrap();

    let consumer = h.consumer();
    consumer.start().await.unwrap();
    let recorder = Recorder::new();
    consumer
        .stream_messages_from(
            recorder.on_message(),
            None,
            recorder.on_drained(),
            recorder.on_crashed(),
        )
        .await
        .unwrap();

    assert!(wait_until(5_000, || recorder.len() == 1).await);
    consumer.stop();
    let drains_at_stop = recorder.drain_count();

    for i in 2..=4 {
        producer
            .push_message(json!({ "n": i }), "k", None)
            .await
            .unwrap();
    }
    common::settle(500).await;

    assert_eq!(recorder.len(), 1);
    assert_eq!(recorder.drain_count(), drains_at_stop);
    assert_eq!(recorder.crash_count(), 0);
    assert_eq!(consumer.state(), ConsumerState::Stopped);

    producer.stop();
}

#[tokio::test(start_paused = true)]
async fn drained_fires_again_after_new_activity() {
    let h = Harness::new("re-drain");
    let producer = h.producer();
    producer.start().await.unwrap();

    let consumer = h.consumer();
    consumer.start().await.unwrap();
    let recorder = Recorder::new();
    consumer
        .stream_messages_from(
            recorder.on_message(),
            None,
            recorder.on_drained(),
            recorder.on_crashed(),
        )
        .await
        .unwrap();

    assert!(wait_until(5_000, || recorder.drain_count() == 1).await);

    producer
        .push_message(json!({ "n": 1 }), "k", None)
        .await
        .unwrap();
    assert!(wait_until(5_000, || recorder.drain_count() == 2).await);
    assert_eq!(recorder.len(), 1);

    consumer.stop();
    producer.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_interleave_without_gaps_or_inversions() {
    let h = Harness::new("concurrent");
    let a = h.producer();
    let b = h.producer();
    a.start().await.unwrap();
    b.start().await.unwrap();

    let consumer = h.consumer();
    consumer.start().await.unwrap();
    let recorder = Recorder::new();
    consumer
        .stream_messages_from(
            recorder.on_message(),
            None,
            recorder.on_drained(),
            recorder.on_crashed(),
        )
        .await
        .unwrap();

    let push_a = {
        let a = a.clone();
        tokio::spawn(async move {
            for i in 0..100 {
                a.push_message(json!({ "from": "a", "n": i }), "shard-a", None)
                    .await
                    .unwrap();
            }
        })
    };
    let push_b = {
        let b = b.clone();
        tokio::spawn(async move {
            for i in 0..100 {
                b.push_message(json!({ "from": "b", "n": i }), "shard-b", None)
                    .await
                    .unwrap();
            }
        })
    };
    push_a.await.unwrap();
    push_b.await.unwrap();

    assert!(wait_until(10_000, || recorder.len() == 200).await);

    // Strictly ascending and exactly the committed id set.
    let ids = recorder.ids();
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids not ascending");
    let expected: Vec<i64> = (1..=200).collect();
    assert_eq!(ids, expected);

    // Per-producer payload order follows the per-producer push order.
    let payloads = recorder.payloads();
    for source in ["a", "b"] {
        let ns: Vec<i64> = payloads
            .iter()
            .filter(|p| p["from"] == *source)
            .map(|p| p["n"].as_i64().unwrap())
            .collect();
        let expected: Vec<i64> = (0..100).collect();
        assert_eq!(ns, expected, "push order lost for producer {source}");
    }

    consumer.stop();
    a.stop();
    b.stop();
}

#[tokio::test(start_paused = true)]
async fn state_guards_reject_misuse() {
    let h = Harness::new("guards");

    let producer = h.producer();
    assert!(matches!(
        producer.push_message(json!({}), "k", None).await,
        Err(EngineError::NotStarted)
    ));
    producer.start().await.unwrap();
    assert!(matches!(
        producer.start().await,
        Err(EngineError::AlreadyStarting)
    ));
    assert!(matches!(
        producer.push_message(json!({}), "", None).await,
        Err(EngineError::EmptySharding)
    ));
    producer.stop();
    assert!(matches!(
        producer.push_message(json!({}), "k", None).await,
        Err(EngineError::Stopped)
    ));
    assert!(matches!(producer.start().await, Err(EngineError::Stopped)));

    let consumer = h.consumer();
    let recorder = Recorder::new();
    assert!(matches!(
        consumer
            .stream_messages_from(
                recorder.on_message(),
                None,
                recorder.on_drained(),
                recorder.on_crashed(),
            )
            .await,
        Err(EngineError::NotStarted)
    ));
    consumer.start().await.unwrap();
    assert!(matches!(
        consumer.start().await,
        Err(EngineError::AlreadyStarting)
    ));
    consumer
        .stream_messages_from(
            recorder.on_message(),
            None,
            recorder.on_drained(),
            recorder.on_crashed(),
        )
        .await
        .unwrap();
    assert!(matches!(
        consumer
            .stream_messages_from(
                recorder.on_message(),
                None,
                recorder.on_drained(),
                recorder.on_crashed(),
            )
            .await,
        Err(EngineError::AlreadyStreaming)
    ));
    consumer.stop();
    assert!(matches!(consumer.start().await, Err(EngineError::Stopped)));
}

#[tokio::test(start_paused = true)]
async fn debug_handlers_observe_poll_activity() {
    use remora::ConsumerDebugEvent;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    let h = Harness::new("debug");
    let producer = h.producer();
    producer.start().await.unwrap();

    let consumer = h.consumer();
    let polls = Arc::new(AtomicU64::new(0));
    let delivered = Arc::new(AtomicU64::new(0));
    {
        let polls = polls.clone();
        let delivered = delivered.clone();
        consumer.add_debug_handler(move |event| match event {
            ConsumerDebugEvent::PollStarted { .. } => {
                polls.fetch_add(1, Ordering::SeqCst);
            }
            ConsumerDebugEvent::Delivered { .. } => {
                delivered.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        });
    }

    consumer.start().await.unwrap();
    let recorder = Recorder::new();
    consumer
        .stream_messages_from(
            recorder.on_message(),
            None,
            recorder.on_drained(),
            recorder.on_crashed(),
        )
        .await
        .unwrap();

    producer
        .push_message(json!({ "n": 1 }), "k", None)
        .await
        .unwrap();
    assert!(wait_until(5_000, || delivered.load(Ordering::SeqCst) == 1).await);
    assert!(polls.load(Ordering::SeqCst) >= 1);

    consumer.stop();
    producer.stop();
}
