//! Delivery tests for BrokerClient over MemoryLog
//!
//! Run with: cargo test -p calendar-broker --test broker_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use calendar_broker::{BrokerClient, BrokerConfig, BrokerError, HandlerError, MemoryLog, RetryPolicy};

const TOPIC: &str = "calendar.reminders";

fn fast_config() -> BrokerConfig {
    BrokerConfig::new()
        .with_connect_retry(RetryPolicy::fixed(Duration::from_millis(10)))
        .with_poll_interval(Duration::from_millis(5))
        .with_redelivery_delay(Duration::from_millis(5))
}

/// Poll `check` until it holds or the deadline passes
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

// ============================================
// Connect
// ============================================

#[tokio::test]
async fn test_connect_returns_on_cancel_while_log_is_down() {
    let log = MemoryLog::new(1);
    log.set_available(false);
    let client = BrokerClient::new(Arc::new(log), fast_config());

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(2), client.connect(&token))
        .await
        .expect("connect did not observe cancellation");
    assert!(matches!(result, Err(BrokerError::Cancelled)));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_connect_waits_for_log_to_come_up() {
    let log = MemoryLog::new(1);
    log.set_available(false);
    let client = BrokerClient::new(Arc::new(log.clone()), fast_config());

    let revive = log.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        revive.set_available(true);
    });

    client.connect(&CancellationToken::new()).await.unwrap();
    assert!(client.is_connected());
    client.publish(TOPIC, b"hello".to_vec()).await.unwrap();
    assert_eq!(log.len(TOPIC), 1);
}

// ============================================
// Delivery
// ============================================

#[test_log::test(tokio::test)]
async fn test_retry_is_redelivered_until_handled() {
    let log = MemoryLog::new(1);
    let client = Arc::new(BrokerClient::new(Arc::new(log.clone()), fast_config()));
    let attempts = Arc::new(AtomicUsize::new(0));

    let seen = attempts.clone();
    client.subscribe(TOPIC, "storer", move |_message| {
        let seen = seen.clone();
        async move {
            // Fail twice, then succeed
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(HandlerError::retry("store down"))
            } else {
                Ok(())
            }
        }
    })
    .unwrap();

    let token = CancellationToken::new();
    client.connect(&token).await.unwrap();
    let record = client.publish(TOPIC, b"r".to_vec()).await.unwrap();

    let runner = client.clone();
    let run_token = token.clone();
    let handle = tokio::spawn(async move { runner.run(&run_token).await });

    assert!(eventually(|| log.committed(TOPIC, "storer", record.partition) == 1).await);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    token.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_discard_is_committed() {
    let log = MemoryLog::new(1);
    let client = Arc::new(BrokerClient::new(Arc::new(log.clone()), fast_config()));
    let attempts = Arc::new(AtomicUsize::new(0));

    let seen = attempts.clone();
    client.subscribe(TOPIC, "storer", move |_message| {
        seen.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>(HandlerError::discard("malformed")) }
    })
    .unwrap();

    let token = CancellationToken::new();
    client.connect(&token).await.unwrap();
    let record = client.publish(TOPIC, b"{".to_vec()).await.unwrap();

    let runner = client.clone();
    let run_token = token.clone();
    let handle = tokio::spawn(async move { runner.run(&run_token).await });

    assert!(eventually(|| log.committed(TOPIC, "storer", record.partition) == 1).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    token.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_every_group_sees_every_message() {
    let log = MemoryLog::new(4);
    let client = Arc::new(BrokerClient::new(Arc::new(log.clone()), fast_config()));
    let received: Arc<Mutex<Vec<(&'static str, Uuid)>>> = Arc::new(Mutex::new(Vec::new()));

    for group in ["storer", "audit"] {
        let received = received.clone();
        client.subscribe(TOPIC, group, move |message| {
            received.lock().push((group, message.id));
            async { Ok::<(), HandlerError>(()) }
        })
        .unwrap();
    }

    let token = CancellationToken::new();
    client.connect(&token).await.unwrap();
    let mut published = Vec::new();
    for i in 0..10u8 {
        published.push(client.publish(TOPIC, vec![i]).await.unwrap().message.id);
    }

    let runner = client.clone();
    let run_token = token.clone();
    let handle = tokio::spawn(async move { runner.run(&run_token).await });

    assert!(eventually(|| received.lock().len() == 20).await);
    token.cancel();
    handle.await.unwrap().unwrap();

    let received = received.lock();
    for group in ["storer", "audit"] {
        let mut ids: Vec<Uuid> = received
            .iter()
            .filter(|(g, _)| *g == group)
            .map(|(_, id)| *id)
            .collect();
        ids.sort();
        let mut expected = published.clone();
        expected.sort();
        assert_eq!(ids, expected, "group {group}");
    }
}

#[tokio::test]
async fn test_run_returns_when_cancelled_before_connect() {
    let log = MemoryLog::new(1);
    log.set_available(false);
    let client = BrokerClient::new(Arc::new(log), fast_config());

    let token = CancellationToken::new();
    token.cancel();
    client.run(&token).await.unwrap();
    assert!(!client.is_connected());
}

#[test_log::test(tokio::test)]
async fn test_panicking_handler_does_not_stop_consumer() {
    let log = MemoryLog::new(1);
    let client = Arc::new(BrokerClient::new(Arc::new(log.clone()), fast_config()));
    let handled = Arc::new(AtomicUsize::new(0));

    let counter = handled.clone();
    client
        .subscribe(TOPIC, "storer", move |message| {
            let counter = counter.clone();
            async move {
                if message.payload == b"boom" {
                    panic!("cannot handle boom");
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();

    let token = CancellationToken::new();
    client.connect(&token).await.unwrap();
    client.publish(TOPIC, b"boom".to_vec()).await.unwrap();
    client.publish(TOPIC, b"ok".to_vec()).await.unwrap();

    let runner = client.clone();
    let run_token = token.clone();
    let handle = tokio::spawn(async move { runner.run(&run_token).await });

    assert!(eventually(|| handled.load(Ordering::SeqCst) == 1).await);
    // Both the panicking record and the good one are committed
    assert!(eventually(|| log.committed(TOPIC, "storer", 0) == 2).await);

    client.publish(TOPIC, b"ok".to_vec()).await.unwrap();
    assert!(eventually(|| handled.load(Ordering::SeqCst) == 2).await);

    token.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_hung_handler_does_not_block_shutdown() {
    let log = MemoryLog::new(1);
    let client = Arc::new(BrokerClient::new(Arc::new(log.clone()), fast_config()));
    let started = Arc::new(AtomicUsize::new(0));

    let seen = started.clone();
    client
        .subscribe(TOPIC, "storer", move |_message| {
            seen.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();

    let token = CancellationToken::new();
    client.connect(&token).await.unwrap();
    client.publish(TOPIC, b"slow".to_vec()).await.unwrap();

    let runner = client.clone();
    let run_token = token.clone();
    let handle = tokio::spawn(async move { runner.run(&run_token).await });

    assert!(eventually(|| started.load(Ordering::SeqCst) == 1).await);
    token.cancel();

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("run waited for a hung handler")
        .unwrap()
        .unwrap();
    // Interrupted delivery stays uncommitted
    assert_eq!(log.committed(TOPIC, "storer", 0), 0);
}
