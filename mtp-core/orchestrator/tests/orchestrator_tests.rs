//! 编排器集成测试

use std::sync::Arc;
use std::time::Duration;

use mtp_actions::{ActionError, ActionsProvider, SimulatedDevice, SimulatedProvider};
use mtp_common::{EventReceiver, ExecutionStatus, PlatformEvent, QueueStatus, Requester, TestRequest};
use mtp_executor::Scenario;
use mtp_orchestrator::{
    DeviceResultStatus, InMemoryCatalog, OrchestratorError, PlatformConfig, ScenarioCatalog,
    SubmitStatus, TestOrchestrator,
};

const TAP_SCENARIO: &str = r#"{
    "id": "S1",
    "name": "点击首页",
    "app_package": "com.example.shop",
    "nodes": [
        {"id": "start", "type": "start"},
        {"id": "tap", "type": "action", "action": {"type": "tap", "x": 10, "y": 20}},
        {"id": "end", "type": "end"}
    ],
    "connections": [
        {"from": "start", "to": "tap"},
        {"from": "tap", "to": "end"}
    ]
}"#;

const WAIT_SCENARIO: &str = r#"{
    "id": "WAIT",
    "name": "等待不会出现的元素",
    "nodes": [
        {"id": "start", "type": "start"},
        {"id": "wait", "type": "action", "action": {
            "type": "wait_until_exists",
            "selector": {"by": "id", "value": "never"},
            "timeout_ms": 60000
        }},
        {"id": "end", "type": "end"}
    ],
    "connections": [
        {"from": "start", "to": "wait"},
        {"from": "wait", "to": "end"}
    ]
}"#;

const BROKEN_SCENARIO: &str = r#"{
    "id": "BROKEN",
    "name": "没有结束节点",
    "nodes": [{"id": "start", "type": "start"}],
    "connections": []
}"#;

struct Harness {
    orchestrator: Arc<TestOrchestrator>,
    devices: Vec<Arc<SimulatedDevice>>,
}

async fn harness(device_ids: &[&str]) -> Harness {
    let provider = Arc::new(SimulatedProvider::new());
    let mut devices = Vec::new();
    for id in device_ids {
        devices.push(provider.add_device(id).await);
    }

    let catalog = InMemoryCatalog::new();
    catalog
        .insert_scenario(Scenario::from_json_str(TAP_SCENARIO).unwrap())
        .await;
    catalog
        .insert_scenario(Scenario::from_json_str(BROKEN_SCENARIO).unwrap())
        .await;
    catalog
        .insert_scenario(Scenario::from_json_str(WAIT_SCENARIO).unwrap())
        .await;

    let mut config = PlatformConfig::default();
    config.executor.scenario_interval_ms = 0;
    config.executor.poll_interval_ms = 10;

    let orchestrator = Arc::new(TestOrchestrator::new(
        provider as Arc<dyn ActionsProvider>,
        Arc::new(catalog) as Arc<dyn ScenarioCatalog>,
        &config,
    ));

    Harness {
        orchestrator,
        devices,
    }
}

fn request(devices: &[&str]) -> TestRequest {
    request_scenario(devices, "S1")
}

fn request_scenario(devices: &[&str], scenario_id: &str) -> TestRequest {
    TestRequest::new(
        devices.iter().map(|d| d.to_string()).collect(),
        vec![scenario_id.to_string()],
    )
}

/// 等待下一个 test:complete 事件
async fn next_complete(rx: &mut EventReceiver) -> (String, String, ExecutionStatus, usize, usize, usize) {
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("等待 test:complete 超时")
        .expect("事件总线已关闭");
    match event {
        PlatformEvent::TestComplete {
            execution_id,
            queue_id,
            status,
            success_count,
            failed_count,
            skipped_count,
        } => (execution_id, queue_id, status, success_count, failed_count, skipped_count),
        other => panic!("unexpected event: {:?}", other),
    }
}

/// 轮询直到条件成立
async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("条件在超时前未满足");
}

#[tokio::test]
async fn test_concurrent_submissions_on_same_device() {
    let h = harness(&["D1"]).await;
    h.devices[0].pause();
    let mut done = h.orchestrator.events().subscribe_to(&["test:complete"]);

    let alice = Requester::new("alice", "sock-a");
    let bob = Requester::new("bob", "sock-b");
    let (a, b) = tokio::join!(
        h.orchestrator.submit_test(request(&["D1"]), &alice, 1),
        h.orchestrator.submit_test(request(&["D1"]), &bob, 1),
    );
    let results = [a.unwrap(), b.unwrap()];

    let started: Vec<_> = results
        .iter()
        .filter(|r| r.status == SubmitStatus::Started)
        .collect();
    let queued: Vec<_> = results
        .iter()
        .filter(|r| r.status == SubmitStatus::Queued)
        .collect();
    assert_eq!(started.len(), 1);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].position, 1);
    assert!(queued[0].execution_id.is_none());
    let waiting = queued[0].waiting_info.as_ref().unwrap();
    assert_eq!(waiting.blocking_devices[0].device_id, "D1");

    h.devices[0].resume();

    let first = next_complete(&mut done).await;
    let second = next_complete(&mut done).await;
    assert_eq!(first.1, started[0].queue_id);
    assert_eq!(second.1, queued[0].queue_id);
    assert_eq!(second.2, ExecutionStatus::Completed);
    assert!(!h.orchestrator.locks().is_device_busy("D1").await);
    assert!(h.orchestrator.queue().get_queue().await.is_empty());
}

#[tokio::test]
async fn test_split_then_merge_keeps_ids() {
    let h = harness(&["D1", "D2"]).await;
    h.devices[1].pause();
    let mut done = h.orchestrator.events().subscribe_to(&["test:complete"]);

    let alice = Requester::new("alice", "sock-a");
    let bob = Requester::new("bob", "sock-b");

    let first = h
        .orchestrator
        .submit_test(request(&["D2"]), &alice, 1)
        .await
        .unwrap();
    assert_eq!(first.status, SubmitStatus::Started);

    let split = h
        .orchestrator
        .submit_test(request(&["D1", "D2"]), &bob, 1)
        .await
        .unwrap();
    assert_eq!(split.status, SubmitStatus::Partial);
    assert_eq!(split.started_devices, vec!["D1"]);
    assert_eq!(split.pending_devices, vec!["D2"]);
    let execution_id = split.execution_id.clone().unwrap();

    let entry = h.orchestrator.queue().get(&split.queue_id).await.unwrap();
    assert_eq!(entry.status, QueueStatus::Running);
    assert_eq!(entry.pending_devices, vec!["D2"]);

    // D1 完成后执行仍在等待 D2
    let orchestrator = Arc::clone(&h.orchestrator);
    let id = execution_id.clone();
    wait_until(move || {
        let orchestrator = Arc::clone(&orchestrator);
        let id = id.clone();
        async move {
            orchestrator
                .get_execution(&id)
                .await
                .map(|s| s.active_devices.is_empty())
                .unwrap_or(false)
        }
    })
    .await;
    assert!(!h.orchestrator.locks().is_device_busy("D1").await);

    h.devices[1].resume();

    let (first_exec, first_queue, ..) = next_complete(&mut done).await;
    assert_eq!(first_queue, first.queue_id);
    assert_eq!(Some(first_exec), first.execution_id);

    let (merged_exec, merged_queue, status, success, failed, skipped) =
        next_complete(&mut done).await;
    assert_eq!(merged_exec, execution_id);
    assert_eq!(merged_queue, split.queue_id);
    assert_eq!(status, ExecutionStatus::Completed);
    assert_eq!((success, failed, skipped), (2, 0, 0));

    assert_eq!(h.devices[1].action_log().await, vec!["tap:10,20", "tap:10,20"]);
}

#[tokio::test]
async fn test_priority_order_without_starvation() {
    let h = harness(&["D1"]).await;
    h.devices[0].pause();
    let mut done = h.orchestrator.events().subscribe_to(&["test:complete"]);

    let running = h
        .orchestrator
        .submit_test(request(&["D1"]), &Requester::new("a", "s-a"), 1)
        .await
        .unwrap();
    let low = h
        .orchestrator
        .submit_test(request(&["D1"]), &Requester::new("b", "s-b"), 0)
        .await
        .unwrap();
    let high = h
        .orchestrator
        .submit_test(request(&["D1"]), &Requester::new("c", "s-c"), 2)
        .await
        .unwrap();

    assert_eq!(low.position, 1);
    assert_eq!(
        h.orchestrator.queue().get_position(&high.queue_id).await,
        Some(1)
    );
    assert_eq!(
        h.orchestrator.queue().get_position(&low.queue_id).await,
        Some(2)
    );

    h.devices[0].resume();

    let order = [
        next_complete(&mut done).await.1,
        next_complete(&mut done).await.1,
        next_complete(&mut done).await.1,
    ];
    assert_eq!(order, [running.queue_id, high.queue_id, low.queue_id]);
}

#[tokio::test]
async fn test_cancel_twice_is_rejected_without_side_effects() {
    let h = harness(&["D1"]).await;
    h.devices[0].pause();
    let mut done = h.orchestrator.events().subscribe_to(&["test:complete"]);

    let alice = Requester::new("alice", "sock-a");
    let bob = Requester::new("bob", "sock-b");

    let running = h
        .orchestrator
        .submit_test(request(&["D1"]), &alice, 1)
        .await
        .unwrap();
    let queued = h
        .orchestrator
        .submit_test(request(&["D1"]), &bob, 1)
        .await
        .unwrap();
    assert_eq!(queued.status, SubmitStatus::Queued);

    // 排队项
    let result = h.orchestrator.cancel_test(&queued.queue_id, &bob).await;
    assert!(result.success);
    assert!(h.orchestrator.queue().get(&queued.queue_id).await.is_none());
    let finished = h.orchestrator.queue().get_finished(&queued.queue_id).await.unwrap();
    assert_eq!(finished.status, QueueStatus::Cancelled);

    // 他人的执行
    let denied = h.orchestrator.cancel_test(&running.queue_id, &bob).await;
    assert!(!denied.success);
    assert!(h.orchestrator.locks().is_device_busy("D1").await);

    // 同一用户名的另一个连接也算本人
    let owner = Requester::new("alice", "sock-other");
    let result = h.orchestrator.cancel_test(&running.queue_id, &owner).await;
    assert!(result.success);

    let (_, queue_id, status, success, failed, skipped) = next_complete(&mut done).await;
    assert_eq!(queue_id, running.queue_id);
    assert_eq!(status, ExecutionStatus::Cancelled);
    assert_eq!((success, failed, skipped), (0, 1, 0));
    assert!(!h.orchestrator.locks().is_device_busy("D1").await);

    // 重复取消已结束的测试：失败且不产生任何变化
    let history_before = h.orchestrator.get_completed_tests(10).await.len();
    let again = h.orchestrator.cancel_test(&running.queue_id, &alice).await;
    assert!(!again.success);
    let again = h.orchestrator.cancel_test(&queued.queue_id, &bob).await;
    assert!(!again.success);
    let finished = h.orchestrator.queue().get_finished(&queued.queue_id).await.unwrap();
    assert_eq!(finished.status, QueueStatus::Cancelled);
    assert_eq!(h.orchestrator.get_completed_tests(10).await.len(), history_before);
    assert!(done.try_recv().is_none());

    let unknown = h.orchestrator.cancel_test("no-such-queue", &alice).await;
    assert!(!unknown.success);

    let completed = h.orchestrator.get_completed_tests(10).await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].devices[0].status, DeviceResultStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_while_queued_entry_starts_always_succeeds() {
    for _ in 0..50 {
        let h = harness(&["D1"]).await;
        let alice = Requester::new("alice", "sock-a");
        let bob = Requester::new("bob", "sock-b");

        h.orchestrator
            .submit_test(request(&["D1"]), &alice, 1)
            .await
            .unwrap();
        let waiting = h
            .orchestrator
            .submit_test(request_scenario(&["D1"], "WAIT"), &bob, 1)
            .await
            .unwrap();

        // 取消与 alice 完成后的调度并发：无论排队项是否已被启动都应取消成功
        let result = h.orchestrator.cancel_test(&waiting.queue_id, &bob).await;
        assert!(result.success, "{:?}", result);

        let orchestrator = Arc::clone(&h.orchestrator);
        wait_until(move || {
            let orchestrator = Arc::clone(&orchestrator);
            async move { !orchestrator.locks().is_device_busy("D1").await }
        })
        .await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_entry_queued_during_completion_is_dispatched() {
    for _ in 0..50 {
        let h = harness(&["D1"]).await;
        let mut done = h.orchestrator.events().subscribe_to(&["test:complete"]);
        let alice = Requester::new("alice", "sock-a");
        let bob = Requester::new("bob", "sock-b");

        // alice 的执行几乎立即完成，与 bob 的排队并发
        let first = h
            .orchestrator
            .submit_test(request(&["D1"]), &alice, 1)
            .await
            .unwrap();
        let second = h
            .orchestrator
            .submit_test(request(&["D1"]), &bob, 1)
            .await
            .unwrap();

        let mut finished = vec![
            next_complete(&mut done).await.1,
            next_complete(&mut done).await.1,
        ];
        finished.sort();
        let mut expected = vec![first.queue_id, second.queue_id];
        expected.sort();
        assert_eq!(finished, expected);
        assert!(h.orchestrator.queue().get_queue().await.is_empty());
    }
}

#[tokio::test]
async fn test_force_complete_skips_pending_devices() {
    let h = harness(&["D1", "D2"]).await;
    h.devices[1].pause();

    let alice = Requester::new("alice", "sock-a");
    let bob = Requester::new("bob", "sock-b");

    let blocker = h
        .orchestrator
        .submit_test(request(&["D2"]), &alice, 1)
        .await
        .unwrap();
    let split = h
        .orchestrator
        .submit_test(request(&["D1", "D2"]), &bob, 1)
        .await
        .unwrap();
    let execution_id = split.execution_id.clone().unwrap();

    // 仍有设备执行中的执行不能强制完成
    let result = h
        .orchestrator
        .force_complete(blocker.execution_id.as_deref().unwrap(), &alice)
        .await;
    assert!(!result.success);
    assert!(result.summary.is_none());
    assert!(result.message.contains("仍有设备在执行"), "{}", result.message);

    let orchestrator = Arc::clone(&h.orchestrator);
    let id = execution_id.clone();
    wait_until(move || {
        let orchestrator = Arc::clone(&orchestrator);
        let id = id.clone();
        async move {
            orchestrator
                .get_execution(&id)
                .await
                .map(|s| s.active_devices.is_empty())
                .unwrap_or(false)
        }
    })
    .await;

    let result = h.orchestrator.force_complete(&execution_id, &alice).await;
    assert!(!result.success);
    assert!(result.message.starts_with("无权操作"), "{}", result.message);

    let result = h.orchestrator.force_complete(&execution_id, &bob).await;
    assert!(result.success, "{}", result.message);
    let summary = result.summary.unwrap();
    assert_eq!(summary.status, ExecutionStatus::Partial);
    assert_eq!(
        (summary.success_count, summary.failed_count, summary.skipped_count),
        (1, 0, 1)
    );
    assert_eq!(summary.devices[1].status, DeviceResultStatus::Skipped);

    assert!(h.orchestrator.get_execution(&execution_id).await.is_none());
    let lock = h.orchestrator.locks().get_lock("D2").await.unwrap();
    assert_eq!(Some(lock.execution_id), blocker.execution_id);

    let result = h.orchestrator.force_complete(&execution_id, &bob).await;
    assert!(!result.success);
    assert!(result.message.starts_with("执行不存在"), "{}", result.message);
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let h = harness(&["D1"]).await;
    let alice = Requester::new("alice", "sock-a");

    let err = h
        .orchestrator
        .submit_test(request(&[]), &alice, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidRequest(_)));

    let err = h
        .orchestrator
        .submit_test(TestRequest::new(vec!["D1".to_string()], Vec::new()), &alice, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidRequest(_)));

    let err = h
        .orchestrator
        .submit_test(
            TestRequest::new(vec!["D1".to_string()], vec!["missing".to_string()]),
            &alice,
            1,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ScenarioNotFound(_)));

    let err = h
        .orchestrator
        .submit_test(
            TestRequest::new(vec!["D1".to_string()], vec!["BROKEN".to_string()]),
            &alice,
            1,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidScenario(_)));

    assert!(h.orchestrator.locks().get_all_locks().await.is_empty());
    assert!(h.orchestrator.queue().get_queue().await.is_empty());
}

#[tokio::test]
async fn test_repeat_runs_twice_on_one_device() {
    let h = harness(&["D1"]).await;
    let mut done = h.orchestrator.events().subscribe_to(&["test:complete"]);

    let mut req = request(&["D1", "D1"]).with_repeat(2);
    req.test_name = Some("回归".to_string());
    let result = h
        .orchestrator
        .submit_test(req, &Requester::new("alice", "sock-a"), 1)
        .await
        .unwrap();
    assert_eq!(result.status, SubmitStatus::Started);
    assert_eq!(result.started_devices, vec!["D1"]);

    let (_, _, status, ..) = next_complete(&mut done).await;
    assert_eq!(status, ExecutionStatus::Completed);

    let summary = h.orchestrator.get_completed_tests(1).await.remove(0);
    assert_eq!(summary.test_name, "回归");
    assert_eq!(summary.devices.len(), 1);
    assert_eq!(summary.devices[0].completed_scenarios, 2);
    assert_eq!(summary.devices[0].scenarios[1].repeat_index, 2);
    assert_eq!(h.devices[0].action_log().await.len(), 2);
}

#[tokio::test]
async fn test_mixed_device_outcomes_are_partial() {
    let h = harness(&["D1", "D2"]).await;
    h.devices[1]
        .fail_on("tap", ActionError::ElementNotFound("home".to_string()))
        .await;
    let mut done = h.orchestrator.events().subscribe_to(&["test:complete"]);

    h.orchestrator
        .submit_test(request(&["D1", "D2"]), &Requester::new("alice", "sock-a"), 1)
        .await
        .unwrap();

    let (_, _, status, success, failed, skipped) = next_complete(&mut done).await;
    assert_eq!(status, ExecutionStatus::Partial);
    assert_eq!((success, failed, skipped), (1, 1, 0));

    let summary = h.orchestrator.get_completed_tests(1).await.remove(0);
    assert_eq!(summary.test_name, "点击首页");
    assert!(summary.devices[1].error.is_some());
}

#[tokio::test]
async fn test_status_projection_marks_own_entries() {
    let h = harness(&["D1"]).await;
    h.devices[0].pause();

    let alice = Requester::new("alice", "sock-a");
    let bob = Requester::new("bob", "sock-b");
    h.orchestrator
        .submit_test(request(&["D1"]), &alice, 1)
        .await
        .unwrap();
    let queued = h
        .orchestrator
        .submit_test(request(&["D1"]), &bob, 1)
        .await
        .unwrap();

    let status = h.orchestrator.get_status(Some(&bob)).await;
    assert_eq!(status.queue.len(), 2);
    assert_eq!(status.executions.len(), 1);
    assert_eq!(status.locks.len(), 1);

    let mine: Vec<_> = status.queue.iter().filter(|v| v.is_mine).collect();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].entry.queue_id, queued.queue_id);
    assert_eq!(mine[0].estimated_wait_ms, status.avg_scenario_time_ms);

    h.orchestrator.reset().await;
    let status = h.orchestrator.get_status(None).await;
    assert!(status.queue.is_empty());
    assert!(status.executions.is_empty());
    assert!(status.locks.is_empty());
}
