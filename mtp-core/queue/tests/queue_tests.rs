//! 队列事件与序列化测试

use mtp_common::{EventBus, PlatformEvent, QueueStatus, Requester, TestRequest};
use mtp_queue::{QueueConfig, TestQueueService};

fn request(devices: &[&str]) -> TestRequest {
    TestRequest::new(
        devices.iter().map(|d| d.to_string()).collect(),
        vec!["S1".to_string()],
    )
}

#[tokio::test]
async fn test_queue_updated_snapshot_tracks_changes() {
    let events = EventBus::default();
    let mut rx = events.subscribe_to(&["queue:updated"]);
    let queue = TestQueueService::new(QueueConfig::default(), events);

    let item = queue
        .add_to_queue(request(&["D1"]), &Requester::new("alice", "s1"), 1)
        .await;
    match rx.recv().await {
        Some(PlatformEvent::QueueUpdated { queue }) => {
            assert_eq!(queue.len(), 1);
            assert_eq!(queue[0].queue_id, item.queue_id);
            assert_eq!(queue[0].status, QueueStatus::Queued);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    queue.remove_from_queue(&item.queue_id).await.unwrap();
    match rx.recv().await {
        Some(PlatformEvent::QueueUpdated { queue }) => assert!(queue.is_empty()),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_queued_test_serializes_status_in_snake_case() {
    let queue = TestQueueService::new(QueueConfig::default(), EventBus::default());
    queue
        .add_to_queue(request(&["D1"]), &Requester::new("alice", "s1"), 0)
        .await;
    let snapshot = queue.get_queue().await;
    let json = serde_json::to_value(&snapshot[0]).unwrap();
    assert_eq!(json["status"], "queued");
    assert_eq!(json["position"], 1);
}

#[test]
fn test_queue_config_defaults_from_empty_document() {
    let config: QueueConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config, QueueConfig::default());
    assert_eq!(config.history_limit, 100);
}
