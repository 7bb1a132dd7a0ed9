use super::fixed_message;
use crate::config::DeliveryRetryStrategy;
use crate::delivery::{DeliveryStatus, DeliveryTracker};
use crate::error::EmsgError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn fast_strategy() -> DeliveryRetryStrategy {
    DeliveryRetryStrategy {
        max_retries: 5,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        backoff_factor: 2.0,
        ..DeliveryRetryStrategy::default()
    }
}

#[tokio::test]
async fn state_machine_walkthrough() {
    let tracker = DeliveryTracker::new(fast_strategy());
    let message = fixed_message();
    let id = message.message_id.clone();

    let receipt = tracker.track(&message);
    assert_eq!(receipt.status, DeliveryStatus::Pending);
    assert_eq!(receipt.recipient, "bob#test.org");
    assert_eq!(receipt.attempt_count, 0);
    assert_eq!(receipt.metadata["from"], "alice#example.com");
    assert_eq!(receipt.metadata["is_encrypted"], false);

    tracker
        .update_status(&id, DeliveryStatus::Sent, None)
        .expect("sent");
    let receipt = tracker.get_receipt(&id).expect("receipt");
    assert_eq!(receipt.status, DeliveryStatus::Sent);
    assert_eq!(receipt.attempt_count, 1);
    assert!(receipt.last_attempt > 0);

    tracker
        .update_status(&id, DeliveryStatus::Retrying, Some("timeout"))
        .expect("retrying");
    let receipt = tracker.get_receipt(&id).expect("receipt");
    assert_eq!(receipt.status, DeliveryStatus::Retrying);
    assert_eq!(receipt.attempt_count, 2);
    assert_eq!(receipt.error_message, "timeout");
    // Second attempt: initial_delay * factor^(2-1).
    let next = receipt.next_attempt.expect("scheduled");
    assert_eq!(next - receipt.last_attempt, 200);

    assert!(tracker.get_pending_retries().is_empty());
    tokio::time::sleep(Duration::from_millis(250)).await;
    let due = tracker.get_pending_retries();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].message_id, id);

    tracker
        .update_status(&id, DeliveryStatus::Sent, None)
        .expect("resent");
    assert!(tracker.get_pending_retries().is_empty());

    tracker
        .update_status(&id, DeliveryStatus::Delivered, None)
        .expect("delivered");

    // Terminal receipts ignore further updates.
    tracker
        .update_status(&id, DeliveryStatus::Failed, Some("late"))
        .expect("no-op");
    let receipt = tracker.get_receipt(&id).expect("receipt");
    assert_eq!(receipt.status, DeliveryStatus::Delivered);
    assert_ne!(receipt.error_message, "late");
}

#[tokio::test]
async fn illegal_transitions_are_rejected() {
    let tracker = DeliveryTracker::new(fast_strategy());
    let message = fixed_message();
    let id = message.message_id.clone();
    tracker.track(&message);

    assert!(matches!(
        tracker.update_status(&id, DeliveryStatus::Delivered, None),
        Err(EmsgError::State(_))
    ));
    assert!(matches!(
        tracker.update_status(&id, DeliveryStatus::Retrying, None),
        Err(EmsgError::State(_))
    ));
    assert!(tracker.update_status("unknown", DeliveryStatus::Sent, None).is_err());
}

#[tokio::test]
async fn next_attempt_is_capped_at_max_delay() {
    let strategy = DeliveryRetryStrategy {
        max_retries: 10,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(300),
        backoff_factor: 2.0,
        ..DeliveryRetryStrategy::default()
    };
    let tracker = DeliveryTracker::new(strategy);
    let message = fixed_message();
    let id = message.message_id.clone();
    tracker.track(&message);
    tracker.update_status(&id, DeliveryStatus::Sent, None).expect("sent");

    for _ in 0..4 {
        tracker
            .update_status(&id, DeliveryStatus::Retrying, Some("failure"))
            .expect("retrying");
        let receipt = tracker.get_receipt(&id).expect("receipt");
        let next = receipt.next_attempt.expect("scheduled");
        assert!(next - receipt.last_attempt <= 300);
        tracker.update_status(&id, DeliveryStatus::Sent, None).expect("sent");
    }
}

#[tokio::test]
async fn retry_stops_at_the_cap() {
    let strategy = DeliveryRetryStrategy {
        max_retries: 2,
        initial_delay: Duration::from_millis(10),
        ..DeliveryRetryStrategy::default()
    };
    let tracker = DeliveryTracker::new(strategy);
    let message = fixed_message();
    let id = message.message_id.clone();
    tracker.track(&message);
    tracker.update_status(&id, DeliveryStatus::Sent, None).expect("sent");
    tracker
        .update_status(&id, DeliveryStatus::Retrying, Some("failure"))
        .expect("retrying");

    // attempt_count == max_retries: nothing scheduled, nothing due.
    let receipt = tracker.get_receipt(&id).expect("receipt");
    assert_eq!(receipt.attempt_count, 2);
    assert!(receipt.next_attempt.is_none());
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(tracker.get_pending_retries().is_empty());
}

#[tokio::test]
async fn should_retry_honors_strategy_flags() {
    let strategy = DeliveryRetryStrategy {
        retry_on_failure: false,
        retry_on_timeout: true,
        ..fast_strategy()
    };
    let tracker = DeliveryTracker::new(strategy);
    let message = fixed_message();
    let id = message.message_id.clone();
    tracker.track(&message);

    assert!(tracker.should_retry(&id, &EmsgError::Timeout));
    assert!(tracker.should_retry(
        &id,
        &EmsgError::Transport("deadline exceeded by peer".to_string())
    ));
    assert!(!tracker.should_retry(&id, &EmsgError::Transport("connection refused".to_string())));
    assert!(!tracker.should_retry("unknown", &EmsgError::Timeout));

    let lenient = DeliveryTracker::new(fast_strategy());
    lenient.track(&message);
    assert!(lenient.should_retry(&id, &EmsgError::Transport("connection refused".to_string())));
}

#[tokio::test]
async fn terminal_transition_fires_callbacks() {
    let tracker = Arc::new(DeliveryTracker::new(fast_strategy()));
    let message = fixed_message();
    let id = message.message_id.clone();
    tracker.track(&message);

    let (tx, mut rx) = mpsc::unbounded_channel();
    tracker.register_global_callback(Arc::new(|_receipt| {
        panic!("callback bug");
    }));
    tracker.register_callback(
        &id,
        Arc::new(move |receipt| {
            let _ = tx.send(receipt.clone());
        }),
    );

    tracker.update_status(&id, DeliveryStatus::Sent, None).expect("sent");
    // Non-terminal updates do not notify.
    assert!(
        tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err()
    );

    tracker
        .update_status(&id, DeliveryStatus::Delivered, None)
        .expect("delivered");
    let receipt = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("callback")
        .expect("receipt");
    assert_eq!(receipt.status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn cleanup_removes_receipts_past_the_window() {
    let strategy = DeliveryRetryStrategy {
        expiration_time: Duration::from_millis(10),
        ..fast_strategy()
    };
    let tracker = DeliveryTracker::new(strategy);
    tracker.track(&fixed_message());
    assert_eq!(tracker.cleanup_expired(), 0);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(tracker.cleanup_expired(), 1);
    assert!(tracker.all_receipts().is_empty());
}

#[tokio::test]
async fn stats_count_by_status() {
    let tracker = DeliveryTracker::new(fast_strategy());
    let first = fixed_message();
    tracker.track(&first);
    tracker
        .update_status(&first.message_id, DeliveryStatus::Sent, None)
        .expect("sent");

    let mut second = fixed_message();
    second.message_id = "other".to_string();
    tracker.track(&second);

    let stats = tracker.get_stats();
    assert_eq!(stats.get(&DeliveryStatus::Sent), Some(&1));
    assert_eq!(stats.get(&DeliveryStatus::Pending), Some(&1));
}
