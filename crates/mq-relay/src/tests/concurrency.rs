//! Several sessions delivering at once.

use super::harness::{test_config, wait_until, MockSink, RunningRelay, SinkResponse, QUEUE};
use crate::memory_queue::{InMemoryQueueManager, Operation};
use std::collections::HashMap;
use std::time::Duration;

/// Back-to-back messages on two sessions resolve independently.
#[tokio::test]
async fn outcomes_do_not_cross_sessions() {
    let qm = InMemoryQueueManager::new(QUEUE);
    let good = qm.put_source(b"M3".to_vec());
    let bad = qm.put_source(b"M4".to_vec());
    let sink = MockSink::new();
    sink.reject_payload(b"M4");
    sink.set_default_response(SinkResponse::DelayThenAccept(Duration::from_millis(20)));
    let relay = RunningRelay::start(test_config(2), qm.clone(), sink.clone());

    assert!(wait_until(Duration::from_secs(2), || qm.commit_count() >= 1).await);
    assert!(wait_until(Duration::from_secs(2), || qm.backout_count() >= 2).await);
    relay.stop().await.unwrap();

    let journal = qm.journal();
    let committed: Vec<&String> = journal
        .iter()
        .filter_map(|op| match op {
            Operation::Committed { message_ids, .. } => message_ids.first(),
            _ => None,
        })
        .collect();
    let backed_out: Vec<&String> = journal
        .iter()
        .filter_map(|op| match op {
            Operation::BackedOut { message_ids, .. } => message_ids.first(),
            _ => None,
        })
        .collect();

    assert_eq!(committed, vec![&good], "only M3 is committed");
    assert!(backed_out.iter().all(|id| **id == bad), "only M4 is backed out");

    // M4 is still waiting with its failed attempts counted.
    let remaining = qm.messages(QUEUE);
    assert!(remaining.iter().all(|m| m.message_id == bad));
}

/// No session receives again before its previous message is resolved.
#[tokio::test]
async fn each_session_stays_serial() {
    let qm = InMemoryQueueManager::new(QUEUE);
    for i in 0..20u8 {
        qm.put_source(vec![i]);
    }
    let sink = MockSink::new();
    sink.set_default_response(SinkResponse::DelayThenAccept(Duration::from_millis(5)));
    for i in (0..20u8).step_by(3) {
        sink.queue_response(if i % 2 == 0 {
            SinkResponse::Reject
        } else {
            SinkResponse::DelayThenReject(Duration::from_millis(5))
        });
    }
    let relay = RunningRelay::start(test_config(3), qm.clone(), sink.clone());

    assert!(wait_until(Duration::from_secs(5), || qm.commit_count() == 20).await);
    relay.stop().await.unwrap();

    let mut open: HashMap<usize, String> = HashMap::new();
    for op in qm.journal() {
        match op {
            Operation::Received { slot, message_id } => {
                if let Some(previous) = open.insert(slot, message_id) {
                    panic!("slot {} received while {} was unresolved", slot, previous);
                }
            }
            Operation::Committed { slot, message_ids }
            | Operation::BackedOut { slot, message_ids } => {
                let held = open.remove(&slot).expect("outcome without a receive");
                assert_eq!(message_ids, vec![held]);
            }
            _ => {}
        }
    }
    assert!(open.is_empty());
    assert_eq!(qm.depth(QUEUE), 0);
}

/// In-flight deliveries never exceed the number of sessions.
#[tokio::test]
async fn in_flight_is_bounded_by_workers() {
    let qm = InMemoryQueueManager::new(QUEUE);
    for i in 0..12u8 {
        qm.put_source(vec![i]);
    }
    let sink = MockSink::new();
    sink.set_default_response(SinkResponse::DelayThenAccept(Duration::from_millis(30)));
    let relay = RunningRelay::start(test_config(3), qm.clone(), sink.clone());

    assert!(wait_until(Duration::from_secs(5), || qm.commit_count() == 12).await);
    let snapshot = relay.stop().await.unwrap();

    assert!(sink.max_in_flight() <= 3);
    assert!(sink.max_in_flight() >= 2, "sessions should overlap");
    assert_eq!(snapshot.committed, 12);
    assert_eq!(snapshot.received, 12);
}

/// One session reduces to a strictly sequential relay.
#[tokio::test]
async fn single_worker_is_sequential() {
    let qm = InMemoryQueueManager::new(QUEUE);
    for i in 0..5u8 {
        qm.put_source(vec![i]);
    }
    let sink = MockSink::new();
    sink.set_default_response(SinkResponse::DelayThenAccept(Duration::from_millis(10)));
    let relay = RunningRelay::start(test_config(1), qm.clone(), sink.clone());

    assert!(wait_until(Duration::from_secs(3), || qm.commit_count() == 5).await);
    relay.stop().await.unwrap();

    assert_eq!(sink.max_in_flight(), 1);
    let order: Vec<Vec<u8>> = sink.received().into_iter().map(|e| e.data).collect();
    assert_eq!(order, (0..5u8).map(|i| vec![i]).collect::<Vec<_>>());
}
