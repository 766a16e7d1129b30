//! 设备锁并发测试

use std::sync::Arc;

use futures_util::future::join_all;
use mtp_common::EventBus;
use mtp_device_lock::DeviceLockService;

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_batches_never_both_succeed() {
    for _ in 0..50 {
        let service = Arc::new(DeviceLockService::new(EventBus::default()));

        let batches = vec![
            ids(&["D1", "D2"]),
            ids(&["D2", "D3"]),
            ids(&["D3", "D4"]),
            ids(&["D4", "D1"]),
        ];

        let tasks = batches.into_iter().enumerate().map(|(i, batch)| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let execution_id = format!("e{}", i);
                let result = service
                    .lock_devices(&batch, &execution_id, "user", "test")
                    .await;
                (batch, execution_id, result.success)
            })
        });

        let results: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let winners: Vec<_> = results.iter().filter(|(_, _, ok)| *ok).collect();
        assert!(!winners.is_empty());

        // 获胜的批次之间两两无交集
        for (i, (a, _, _)) in winners.iter().enumerate() {
            for (b, _, _) in winners.iter().skip(i + 1) {
                assert!(a.iter().all(|d| !b.contains(d)));
            }
        }

        // 每个批次要么全部由自己持有，要么一个都没有
        for (batch, execution_id, ok) in &results {
            let mut owned = 0;
            for device in batch {
                if let Some(lock) = service.get_lock(device).await {
                    if &lock.execution_id == execution_id {
                        owned += 1;
                    }
                }
            }
            if *ok {
                assert_eq!(owned, batch.len());
            } else {
                assert_eq!(owned, 0);
            }
        }
    }
}

#[tokio::test]
async fn test_relock_after_release() {
    let service = DeviceLockService::new(EventBus::default());
    assert!(service.lock_devices(&ids(&["D1"]), "e1", "alice", "t").await.success);
    assert!(!service.lock_devices(&ids(&["D1"]), "e2", "bob", "t").await.success);

    service.unlock_by_execution_id("e1").await;
    let result = service.lock_devices(&ids(&["D1"]), "e2", "bob", "t").await;
    assert!(result.success);
    assert_eq!(service.get_lock("D1").await.unwrap().locked_by, "bob");
}
