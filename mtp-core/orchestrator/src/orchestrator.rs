//! 测试编排器
//!
//! 提交流程：校验请求并展开执行计划，按设备忙闲拆分：
//! - 全部空闲：锁定全部设备，立即执行
//! - 全部忙碌：整体排队
//! - 部分忙碌：锁定空闲设备先执行，忙碌设备记为等待，同一个队列项以执行中状态登记
//!
//! 每台设备执行完成后单独回调 [`TestOrchestrator::handle_batch_complete`]，
//! 立即解锁该设备并重新调度。调度先合并已有执行的等待设备，再按队列顺序启动排队项。
//!
//! 锁顺序：`executions` → 设备锁 → 队列，不允许反向获取。

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mtp_actions::ActionsProvider;
use mtp_common::{
    BlockingDevice, DeviceLock, EventBus, ExecutionStatus, PlatformEvent, QueueStatus, QueuedTest,
    Requester, TestRequest, WaitingInfo, MAX_PRIORITY,
};
use mtp_device_lock::{DeviceLockService, DeviceStatusView};
use mtp_executor::{DeviceRunReport, ExecutionPlan, TestExecutor};
use mtp_queue::TestQueueService;

use crate::catalog::ScenarioCatalog;
use crate::config::{OrchestratorConfig, PlatformConfig};
use crate::context::{DeviceResultStatus, ExecutionContext, ExecutionSnapshot};
use crate::report::{ExecutionSummary, JsonFileReportSink, NoopReportSink, ReportSink};
use crate::{OrchestratorError, Result};

/// 提交结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    /// 全部设备已开始执行
    Started,
    /// 整体排队
    Queued,
    /// 部分设备开始执行，其余等待
    Partial,
}

/// 提交结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResult {
    pub status: SubmitStatus,
    pub queue_id: String,

    /// 排队时为空
    pub execution_id: Option<String>,

    pub started_devices: Vec<String>,
    pub pending_devices: Vec<String>,

    /// 等待位置 (从 1 开始，已开始执行时为 0)
    pub position: usize,

    pub estimated_wait_ms: u64,

    #[serde(default)]
    pub waiting_info: Option<WaitingInfo>,
}

/// 取消结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResult {
    pub success: bool,
    pub message: String,
}

impl CancelResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// 强制完成结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceCompleteResult {
    pub success: bool,
    pub message: String,

    /// 成功时为结束后的执行摘要
    #[serde(default)]
    pub summary: Option<ExecutionSummary>,
}

/// 队列项视图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItemView {
    #[serde(flatten)]
    pub entry: QueuedTest,

    pub estimated_wait_ms: u64,

    /// 是否为查询者本人的提交
    pub is_mine: bool,
}

/// 平台状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformStatus {
    pub queue: Vec<QueueItemView>,
    pub executions: Vec<ExecutionSnapshot>,
    pub locks: Vec<DeviceLock>,
    pub avg_scenario_time_ms: u64,
}

/// 测试编排器
pub struct TestOrchestrator {
    locks: Arc<DeviceLockService>,
    queue: Arc<TestQueueService>,
    executor: Arc<TestExecutor>,
    catalog: Arc<dyn ScenarioCatalog>,
    sink: Arc<dyn ReportSink>,
    events: EventBus,
    config: OrchestratorConfig,
    default_interval: Duration,

    /// 执行 ID -> 执行上下文
    executions: Mutex<HashMap<String, ExecutionContext>>,

    /// 已结束执行的摘要 (最新的在前)
    completed: Mutex<VecDeque<ExecutionSummary>>,

    /// 调度进行中
    is_processing_queue: AtomicBool,

    /// 调度进行中又收到了调度请求
    dispatch_requested: AtomicBool,
}

impl TestOrchestrator {
    pub fn new(
        provider: Arc<dyn ActionsProvider>,
        catalog: Arc<dyn ScenarioCatalog>,
        config: &PlatformConfig,
    ) -> Self {
        let events = EventBus::new(config.events.capacity);
        let sink: Arc<dyn ReportSink> = match &config.orchestrator.report_dir {
            Some(dir) => Arc::new(JsonFileReportSink::new(dir.clone())),
            None => Arc::new(NoopReportSink),
        };

        Self {
            locks: Arc::new(DeviceLockService::new(events.clone())),
            queue: Arc::new(TestQueueService::new(config.queue.clone(), events.clone())),
            executor: Arc::new(TestExecutor::new(
                provider,
                events.clone(),
                config.executor.clone(),
            )),
            catalog,
            sink,
            events,
            config: config.orchestrator.clone(),
            default_interval: config.executor.scenario_interval(),
            executions: Mutex::new(HashMap::new()),
            completed: Mutex::new(VecDeque::new()),
            is_processing_queue: AtomicBool::new(false),
            dispatch_requested: AtomicBool::new(false),
        }
    }

    /// 替换报告输出
    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn locks(&self) -> &Arc<DeviceLockService> {
        &self.locks
    }

    pub fn queue(&self) -> &Arc<TestQueueService> {
        &self.queue
    }

    // ============================================
    // 提交
    // ============================================

    /// 提交测试
    pub async fn submit_test(
        self: &Arc<Self>,
        request: TestRequest,
        requester: &Requester,
        priority: u8,
    ) -> Result<SubmitResult> {
        let request = Self::normalize(request)?;
        let plan = Arc::new(self.build_plan(&request).await?);
        let test_name = Self::test_name_for(&request, &plan);
        let priority = priority.min(MAX_PRIORITY);
        let interval = self.interval_for(&request);
        let execution_id = Uuid::new_v4().to_string();

        let mut executions = self.executions.lock().await;

        let busy = self.locks.get_busy_devices(&request.device_ids).await;
        // 排队项在释放执行表锁之前入队，之后的完成回调一定能调度到它
        if busy.len() == request.device_ids.len() {
            info!(
                "设备全部忙碌，整体排队: user={}, devices={:?}",
                requester.user_name, request.device_ids
            );
            let result = self.enqueue(request, requester, priority).await;
            drop(executions);
            return Ok(result);
        }

        let available: Vec<String> = request
            .device_ids
            .iter()
            .filter(|id| !busy.contains(*id))
            .cloned()
            .collect();

        let lock = self
            .locks
            .lock_devices(&available, &execution_id, &requester.user_name, &test_name)
            .await;
        if !lock.success {
            warn!(
                "加锁竞争失败 {:?}，整体排队: user={}",
                lock.busy_devices, requester.user_name
            );
            let result = self.enqueue(request, requester, priority).await;
            drop(executions);
            return Ok(result);
        }

        let entry = self
            .queue
            .register_running(
                request.clone(),
                requester,
                priority,
                &execution_id,
                busy.clone(),
            )
            .await;

        let ctx = ExecutionContext::new(
            execution_id.clone(),
            entry.queue_id.clone(),
            request,
            requester.clone(),
            test_name,
            priority,
            Arc::clone(&plan),
            interval,
            &available,
        );
        let token = ctx.token.clone();
        executions.insert(execution_id.clone(), ctx);
        drop(executions);

        info!(
            "开始执行: execution={}, queue_id={}, 设备 {:?}, 等待 {:?}",
            execution_id, entry.queue_id, available, busy
        );
        self.spawn_devices(&execution_id, available.clone(), plan, &token, interval);

        if busy.is_empty() {
            return Ok(SubmitResult {
                status: SubmitStatus::Started,
                queue_id: entry.queue_id,
                execution_id: Some(execution_id),
                started_devices: available,
                pending_devices: Vec::new(),
                position: 0,
                estimated_wait_ms: 0,
                waiting_info: None,
            });
        }

        let waiting_info = self.waiting_info_for(&entry.queue_id, &busy).await;
        self.queue
            .update_waiting_info(&entry.queue_id, Some(waiting_info.clone()))
            .await;
        self.queue.notify_positions().await;

        Ok(SubmitResult {
            status: SubmitStatus::Partial,
            queue_id: entry.queue_id,
            execution_id: Some(execution_id),
            started_devices: available,
            pending_devices: busy,
            position: 0,
            estimated_wait_ms: waiting_info.estimated_wait_ms,
            waiting_info: Some(waiting_info),
        })
    }

    async fn enqueue(&self, request: TestRequest, requester: &Requester, priority: u8) -> SubmitResult {
        let device_ids = request.device_ids.clone();
        let entry = self.queue.add_to_queue(request, requester, priority).await;

        let waiting_info = self.waiting_info_for(&entry.queue_id, &device_ids).await;
        self.queue
            .update_waiting_info(&entry.queue_id, Some(waiting_info.clone()))
            .await;
        self.queue.notify_positions().await;

        SubmitResult {
            status: SubmitStatus::Queued,
            queue_id: entry.queue_id,
            execution_id: None,
            started_devices: Vec::new(),
            pending_devices: device_ids,
            position: entry.position,
            estimated_wait_ms: waiting_info.estimated_wait_ms,
            waiting_info: Some(waiting_info),
        }
    }

    /// 设备去重并校验
    fn normalize(mut request: TestRequest) -> Result<TestRequest> {
        let mut seen = HashSet::new();
        request
            .device_ids
            .retain(|id| !id.trim().is_empty() && seen.insert(id.clone()));

        if request.device_ids.is_empty() {
            return Err(OrchestratorError::InvalidRequest("未指定设备".to_string()));
        }
        if request.scenario_ids.is_empty() {
            return Err(OrchestratorError::InvalidRequest("未指定场景".to_string()));
        }
        Ok(request)
    }

    /// 从场景库取出场景并展开执行计划
    async fn build_plan(&self, request: &TestRequest) -> Result<ExecutionPlan> {
        let mut scenarios = Vec::with_capacity(request.scenario_ids.len());
        let mut packages = HashMap::new();

        for scenario_id in &request.scenario_ids {
            let scenario = self
                .catalog
                .scenario(scenario_id)
                .await
                .ok_or_else(|| OrchestratorError::ScenarioNotFound(scenario_id.clone()))?;
            scenario
                .validate()
                .map_err(|e| OrchestratorError::InvalidScenario(e.to_string()))?;

            if let Some(package_id) = &scenario.package_id {
                if !packages.contains_key(package_id) {
                    if let Some(package) = self.catalog.package(package_id).await {
                        packages.insert(package_id.clone(), package);
                    }
                }
            }
            scenarios.push(scenario);
        }

        Ok(ExecutionPlan::build(
            &scenarios,
            &packages,
            request.repeat_count,
        ))
    }

    /// 测试名称：请求指定的名称，否则取第一个场景名称
    fn test_name_for(request: &TestRequest, plan: &ExecutionPlan) -> String {
        if let Some(name) = request.test_name.as_ref().filter(|n| !n.trim().is_empty()) {
            return name.clone();
        }
        let first = plan
            .items()
            .first()
            .map(|item| item.scenario_name.clone())
            .unwrap_or_default();
        match request.scenario_ids.len() {
            0 | 1 => first,
            n => format!("{} (+{})", first, n - 1),
        }
    }

    fn interval_for(&self, request: &TestRequest) -> Duration {
        request
            .scenario_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_interval)
    }

    /// 为每台设备启动执行任务
    ///
    /// 必须是同步函数：任务内会回调 `handle_batch_complete`，再经调度回到这里。
    fn spawn_devices(
        self: &Arc<Self>,
        execution_id: &str,
        device_ids: Vec<String>,
        plan: Arc<ExecutionPlan>,
        parent: &CancellationToken,
        interval: Duration,
    ) {
        for device_id in device_ids {
            let this = Arc::clone(self);
            let execution_id = execution_id.to_string();
            let plan = Arc::clone(&plan);
            let token = parent.child_token();

            tokio::spawn(async move {
                let report = this
                    .executor
                    .run_device(&execution_id, &device_id, &plan, token, interval)
                    .await;
                this.handle_batch_complete(&execution_id, &[device_id], vec![report])
                    .await;
            });
        }
    }

    // ============================================
    // 完成处理
    // ============================================

    /// 一批设备执行完成
    ///
    /// 执行已被取消或强制完成时忽略迟到的回调。
    pub async fn handle_batch_complete(
        self: &Arc<Self>,
        execution_id: &str,
        device_ids: &[String],
        reports: Vec<DeviceRunReport>,
    ) {
        let finished = {
            let mut executions = self.executions.lock().await;
            let Some(ctx) = executions.get_mut(execution_id) else {
                debug!("执行已结束，忽略完成回调: execution={}", execution_id);
                return;
            };

            for report in &reports {
                ctx.complete_device(report);
            }
            // 没有报告的设备视为失败
            let unreported: Vec<String> = device_ids
                .iter()
                .filter(|id| ctx.active_devices.contains(*id))
                .cloned()
                .collect();
            for device_id in &unreported {
                ctx.active_devices.remove(device_id);
                ctx.completed_devices.insert(device_id.clone());
                if let Some(result) = ctx.device_results.get_mut(device_id) {
                    result.status = DeviceResultStatus::Failed;
                    result.success = Some(false);
                    result.error = Some("设备没有返回执行结果".to_string());
                }
            }

            for device_id in device_ids {
                self.locks.unlock_device(device_id, execution_id).await;
            }

            debug_assert!(ctx.is_partition_consistent());
            info!(
                "设备执行完成: execution={}, 设备 {:?}, 剩余执行中 {}, 等待 {}",
                execution_id,
                device_ids,
                ctx.active_devices.len(),
                ctx.pending_devices.len()
            );

            if ctx.is_finished() {
                executions.remove(execution_id)
            } else {
                None
            }
        };

        if let Some(ctx) = finished {
            self.finalize(ctx, false).await;
        }
        self.try_dispatch_pending().await;
    }

    /// 结束一次执行：更新耗时估计、结束队列项、记录摘要并输出报告
    async fn finalize(&self, ctx: ExecutionContext, cancelled: bool) -> ExecutionSummary {
        let (success_count, failed_count, skipped_count) = ctx.counts();
        let status = if cancelled {
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::from_counts(success_count, failed_count, skipped_count)
        };

        if !cancelled {
            if let Some(avg) = ctx.avg_scenario_duration_ms() {
                self.queue.update_avg_scenario_time(avg).await;
            }
        }
        self.queue.complete(&ctx.queue_id, status.queue_status()).await;

        let summary = ExecutionSummary::from_context(&ctx, status);
        info!(
            "执行结束: execution={}, status={:?}, 成功 {} / 失败 {} / 跳过 {}",
            summary.execution_id, status, success_count, failed_count, skipped_count
        );

        {
            let mut completed = self.completed.lock().await;
            completed.push_front(summary.clone());
            completed.truncate(self.config.completed_history_limit);
        }

        self.events.publish(PlatformEvent::TestComplete {
            execution_id: summary.execution_id.clone(),
            queue_id: summary.queue_id.clone(),
            status,
            success_count,
            failed_count,
            skipped_count,
        });

        let sink = Arc::clone(&self.sink);
        let report = summary.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.create(&report).await {
                warn!("执行报告输出失败: execution={}: {}", report.execution_id, e);
            }
        });

        summary
    }

    // ============================================
    // 调度
    // ============================================

    /// 重新调度等待中的设备与排队项
    ///
    /// 调度进行中时只记录请求并立即返回，由进行中的调度再跑一轮。
    pub async fn try_dispatch_pending(self: &Arc<Self>) {
        self.dispatch_requested.store(true, Ordering::SeqCst);
        loop {
            if self
                .is_processing_queue
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }

            while self.dispatch_requested.swap(false, Ordering::SeqCst) {
                self.dispatch_once().await;
            }

            self.is_processing_queue.store(false, Ordering::SeqCst);

            // 释放标志前后到达的请求
            if !self.dispatch_requested.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    async fn dispatch_once(self: &Arc<Self>) {
        let mut starts: Vec<(String, Vec<String>, Arc<ExecutionPlan>, CancellationToken, Duration)> =
            Vec::new();
        let mut auto_started: Vec<PlatformEvent> = Vec::new();

        {
            let mut executions = self.executions.lock().await;
            let mut busy = self.locks.busy_device_set().await;

            // 1. 已有执行的等待设备
            let mut waiting: Vec<(chrono::DateTime<chrono::Utc>, String)> = executions
                .values()
                .filter(|ctx| !ctx.stop_requested && !ctx.pending_devices.is_empty())
                .map(|ctx| (ctx.started_at, ctx.execution_id.clone()))
                .collect();
            waiting.sort();

            for (_, execution_id) in waiting {
                let Some(ctx) = executions.get_mut(&execution_id) else {
                    continue;
                };
                let ready: Vec<String> = ctx
                    .pending_devices
                    .iter()
                    .filter(|id| !busy.contains(*id))
                    .cloned()
                    .collect();
                if ready.is_empty() {
                    continue;
                }

                let lock = self
                    .locks
                    .lock_devices(&ready, &execution_id, &ctx.requester.user_name, &ctx.test_name)
                    .await;
                if !lock.success {
                    busy.extend(lock.busy_devices);
                    continue;
                }

                busy.extend(ready.iter().cloned());
                ctx.activate(&ready);
                self.queue
                    .update_pending_devices(&ctx.queue_id, ctx.pending_list())
                    .await;

                info!(
                    "等待设备已释放，加入执行: execution={}, 设备 {:?}",
                    execution_id, ready
                );
                starts.push((
                    execution_id.clone(),
                    ready,
                    Arc::clone(&ctx.plan),
                    ctx.token.clone(),
                    ctx.scenario_interval,
                ));
            }

            // 2. 排队项
            while let Some(entry) = self.queue.get_next_executable(&busy).await {
                let plan = match self.build_plan(&entry.request).await {
                    Ok(plan) => Arc::new(plan),
                    Err(e) => {
                        warn!("排队项无法执行: queue_id={}: {}", entry.queue_id, e);
                        self.queue.complete(&entry.queue_id, QueueStatus::Failed).await;
                        continue;
                    }
                };

                let requester =
                    Requester::new(entry.requester_name.clone(), entry.requester_socket_id.clone());
                let test_name = Self::test_name_for(&entry.request, &plan);
                let execution_id = Uuid::new_v4().to_string();
                let device_ids = entry.request.device_ids.clone();

                let lock = self
                    .locks
                    .lock_devices(&device_ids, &execution_id, &requester.user_name, &test_name)
                    .await;
                if !lock.success {
                    busy.extend(lock.busy_devices);
                    continue;
                }
                busy.extend(device_ids.iter().cloned());

                if let Err(e) = self
                    .queue
                    .mark_running(&entry.queue_id, &execution_id, Vec::new())
                    .await
                {
                    warn!("排队项状态更新失败: queue_id={}: {}", entry.queue_id, e);
                    self.locks.unlock_by_execution_id(&execution_id).await;
                    continue;
                }

                let interval = self.interval_for(&entry.request);
                let ctx = ExecutionContext::new(
                    execution_id.clone(),
                    entry.queue_id.clone(),
                    entry.request,
                    requester.clone(),
                    test_name,
                    entry.priority,
                    Arc::clone(&plan),
                    interval,
                    &device_ids,
                );

                info!(
                    "排队项开始执行: queue_id={}, execution={}, 设备 {:?}",
                    entry.queue_id, execution_id, device_ids
                );
                auto_started.push(PlatformEvent::QueueAutoStart {
                    queue_id: entry.queue_id,
                    execution_id: execution_id.clone(),
                    user_name: requester.user_name,
                    socket_id: requester.socket_id,
                    device_ids: device_ids.clone(),
                });
                starts.push((execution_id.clone(), device_ids, plan, ctx.token.clone(), interval));
                executions.insert(execution_id, ctx);
            }
        }

        for (execution_id, device_ids, plan, token, interval) in starts {
            self.spawn_devices(&execution_id, device_ids, plan, &token, interval);
        }
        for event in auto_started {
            self.events.publish(event);
        }

        self.refresh_waiting_info().await;
    }

    /// 重新计算仍在等待的队列项的阻塞信息并推送位置
    async fn refresh_waiting_info(&self) {
        for entry in self.queue.get_queue().await {
            let devices = if entry.status.is_waiting() {
                entry.request.device_ids.clone()
            } else if !entry.pending_devices.is_empty() {
                entry.pending_devices.clone()
            } else {
                continue;
            };
            let info = self.waiting_info_for(&entry.queue_id, &devices).await;
            self.queue.update_waiting_info(&entry.queue_id, Some(info)).await;
        }
        self.queue.notify_positions().await;
    }

    async fn waiting_info_for(&self, queue_id: &str, device_ids: &[String]) -> WaitingInfo {
        let mut blocking_devices = Vec::new();
        let mut blocking_users: Vec<String> = Vec::new();

        for device_id in device_ids {
            if let Some(lock) = self.locks.get_lock(device_id).await {
                if !blocking_users.contains(&lock.locked_by) {
                    blocking_users.push(lock.locked_by.clone());
                }
                blocking_devices.push(BlockingDevice {
                    device_id: lock.device_id,
                    locked_by: lock.locked_by,
                    test_name: lock.test_name,
                    execution_id: lock.execution_id,
                });
            }
        }

        WaitingInfo {
            blocking_devices,
            blocking_users,
            estimated_wait_ms: self
                .queue
                .get_estimated_wait_time(queue_id)
                .await
                .unwrap_or(0),
        }
    }

    // ============================================
    // 强制完成 / 取消
    // ============================================

    /// 放弃仍在等待的设备，立即结束执行
    ///
    /// 只在没有执行中的设备、但还有等待设备时允许。
    pub async fn force_complete(
        self: &Arc<Self>,
        execution_id: &str,
        requester: &Requester,
    ) -> ForceCompleteResult {
        match self.try_force_complete(execution_id, requester).await {
            Ok(summary) => ForceCompleteResult {
                success: true,
                message: "测试已强制完成".to_string(),
                summary: Some(summary),
            },
            Err(e) => {
                debug!("强制完成被拒绝: execution={}: {}", execution_id, e);
                ForceCompleteResult {
                    success: false,
                    message: e.to_string(),
                    summary: None,
                }
            }
        }
    }

    async fn try_force_complete(
        self: &Arc<Self>,
        execution_id: &str,
        requester: &Requester,
    ) -> Result<ExecutionSummary> {
        let ctx = {
            let mut executions = self.executions.lock().await;
            let ctx = executions
                .get(execution_id)
                .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))?;

            if !ctx.requester.owns(&requester.user_name, &requester.socket_id) {
                return Err(OrchestratorError::PermissionDenied(format!(
                    "{} 不是执行 {} 的提交者",
                    requester.user_name, execution_id
                )));
            }
            if !ctx.active_devices.is_empty() {
                return Err(OrchestratorError::InvalidState(
                    "仍有设备在执行".to_string(),
                ));
            }
            if ctx.pending_devices.is_empty() {
                return Err(OrchestratorError::InvalidState("没有等待中的设备".to_string()));
            }

            let mut ctx = executions
                .remove(execution_id)
                .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))?;
            let skipped = ctx.skip_pending("强制完成，未执行");
            info!(
                "强制完成: execution={}, 跳过设备 {:?}",
                execution_id, skipped
            );
            ctx
        };

        let summary = self.finalize(ctx, false).await;
        self.try_dispatch_pending().await;
        Ok(summary)
    }

    /// 取消测试 (执行中或排队中)
    ///
    /// 已结束 (完成、失败或已取消) 的测试返回失败且不产生任何变化。
    pub async fn cancel_test(self: &Arc<Self>, queue_id: &str, requester: &Requester) -> CancelResult {
        let mut executions = self.executions.lock().await;
        let found = executions
            .values()
            .find(|ctx| ctx.queue_id == queue_id)
            .map(|ctx| ctx.execution_id.clone());

        if let Some(execution_id) = found {
            let Some(mut ctx) = executions.remove(&execution_id) else {
                return CancelResult::rejected("执行不存在");
            };
            if !ctx.requester.owns(&requester.user_name, &requester.socket_id) {
                executions.insert(execution_id, ctx);
                return CancelResult::rejected("无权取消他人的测试");
            }

            ctx.stop_requested = true;
            ctx.token.cancel();

            let active = ctx.active_list();
            self.executor.stop_devices(&active).await;
            ctx.fail_active("执行已取消");
            ctx.skip_pending("执行已取消");
            self.locks.unlock_by_execution_id(&execution_id).await;
            drop(executions);

            info!(
                "取消执行: queue_id={}, execution={}, 停止设备 {:?}",
                queue_id, ctx.execution_id, active
            );

            if self.config.terminate_app_on_cancel {
                let packages = ctx.app_packages();
                for device_id in active {
                    let executor = Arc::clone(&self.executor);
                    let packages = packages.clone();
                    tokio::spawn(async move {
                        for package in packages {
                            executor.terminate_app(&device_id, &package).await;
                        }
                    });
                }
            }

            self.finalize(ctx, true).await;
            self.try_dispatch_pending().await;
            return CancelResult::ok("测试已取消");
        }

        // 仍持有执行表锁：调度不会在查询期间启动这个排队项
        let result = match self.queue.get(queue_id).await {
            Some(entry) if !entry.is_owned_by(&requester.user_name, &requester.socket_id) => {
                CancelResult::rejected("无权取消他人的测试")
            }
            Some(entry) if entry.status == QueueStatus::Running => {
                CancelResult::rejected("测试正在结束")
            }
            Some(_) => {
                self.queue.complete(queue_id, QueueStatus::Cancelled).await;
                info!("取消排队: queue_id={}, user={}", queue_id, requester.user_name);
                CancelResult::ok("已移出队列")
            }
            None => match self.queue.get_finished(queue_id).await {
                Some(entry) if entry.status == QueueStatus::Cancelled => {
                    CancelResult::rejected("测试已取消")
                }
                Some(_) => CancelResult::rejected("测试已结束"),
                None => CancelResult::rejected(format!("队列项不存在: {}", queue_id)),
            },
        };
        drop(executions);

        if result.success {
            self.refresh_waiting_info().await;
        }
        result
    }

    // ============================================
    // 查询
    // ============================================

    /// 平台状态 (队列、执行中的测试、设备锁)
    pub async fn get_status(&self, requester: Option<&Requester>) -> PlatformStatus {
        let executions: Vec<ExecutionSnapshot> = {
            let executions = self.executions.lock().await;
            let mut snapshots: Vec<ExecutionSnapshot> =
                executions.values().map(|ctx| ctx.snapshot()).collect();
            snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at));
            snapshots
        };
        let locks = self.locks.get_all_locks().await;

        let mut queue = Vec::new();
        for entry in self.queue.get_queue().await {
            let estimated_wait_ms = self
                .queue
                .get_estimated_wait_time(&entry.queue_id)
                .await
                .unwrap_or(0);
            let is_mine = requester
                .map(|r| entry.is_owned_by(&r.user_name, &r.socket_id))
                .unwrap_or(false);
            queue.push(QueueItemView {
                entry,
                estimated_wait_ms,
                is_mine,
            });
        }

        PlatformStatus {
            queue,
            executions,
            locks,
            avg_scenario_time_ms: self.queue.avg_scenario_time_ms().await,
        }
    }

    pub async fn get_execution(&self, execution_id: &str) -> Option<ExecutionSnapshot> {
        self.executions
            .lock()
            .await
            .get(execution_id)
            .map(|ctx| ctx.snapshot())
    }

    /// 设备状态视图
    pub async fn get_device_statuses(
        &self,
        all_device_ids: &[String],
        device_names: &HashMap<String, String>,
        current_user: &str,
    ) -> Vec<DeviceStatusView> {
        self.locks
            .get_device_statuses(all_device_ids, device_names, current_user)
            .await
    }

    /// 已结束的执行 (最新的在前)
    pub async fn get_completed_tests(&self, limit: usize) -> Vec<ExecutionSummary> {
        self.completed
            .lock()
            .await
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    /// 清空所有状态 (服务重启)
    ///
    /// 执行中的任务会收到取消信号，迟到的完成回调被忽略。
    pub async fn reset(&self) {
        let dropped = {
            let mut executions = self.executions.lock().await;
            for ctx in executions.values() {
                ctx.token.cancel();
            }
            let count = executions.len();
            executions.clear();
            count
        };
        self.locks.reset().await;
        self.queue.reset().await;
        self.completed.lock().await.clear();
        self.dispatch_requested.store(false, Ordering::SeqCst);
        info!("编排器已重置，丢弃 {} 个执行", dropped);
    }
}
