//! 测试队列服务

use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use mtp_common::{
    EventBus, PlatformEvent, QueueStatus, QueuedTest, Requester, TestRequest, WaitingInfo,
    MAX_PRIORITY,
};

use crate::{QueueConfig, QueueError, Result};

struct QueueState {
    /// 活动队列 (执行中的项在前，等待中的项按优先级/到达顺序在后)
    entries: Vec<QueuedTest>,

    /// 已结束的队列项 (最新的在前)
    history: VecDeque<QueuedTest>,

    /// 单个场景平均耗时 (毫秒)
    avg_scenario_time_ms: f64,
}

impl QueueState {
    fn recompute_positions(&mut self) {
        let mut position = 0;
        for entry in &mut self.entries {
            if entry.status == QueueStatus::Running {
                entry.position = 0;
            } else {
                position += 1;
                entry.position = position;
            }
        }
    }

    fn index_of(&self, queue_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.queue_id == queue_id)
    }

    fn estimated_wait(&self, index: usize) -> u64 {
        let runs: usize = self.entries[..index]
            .iter()
            .filter(|e| e.status == QueueStatus::Running || e.status.is_waiting())
            .map(|e| e.request.total_runs())
            .sum();
        (runs as f64 * self.avg_scenario_time_ms).round() as u64
    }
}

/// 测试队列服务
pub struct TestQueueService {
    state: Arc<RwLock<QueueState>>,
    config: QueueConfig,
    events: EventBus,
}

impl TestQueueService {
    /// 创建新的队列服务
    pub fn new(config: QueueConfig, events: EventBus) -> Self {
        let state = QueueState {
            entries: Vec::new(),
            history: VecDeque::new(),
            avg_scenario_time_ms: config.initial_avg_scenario_time_ms as f64,
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            config,
            events,
        }
    }

    /// 加入等待队列
    ///
    /// 从队首查找第一个优先级更低的非执行项并插入其前；同优先级保持到达顺序。
    pub async fn add_to_queue(
        &self,
        request: TestRequest,
        requester: &Requester,
        priority: u8,
    ) -> QueuedTest {
        let item = Self::new_item(request, requester, priority, QueueStatus::Queued);

        let (queued, snapshot) = {
            let mut state = self.state.write().await;
            let index = state
                .entries
                .iter()
                .position(|e| e.status != QueueStatus::Running && e.priority < item.priority)
                .unwrap_or(state.entries.len());
            state.entries.insert(index, item);
            state.recompute_positions();
            (state.entries[index].clone(), state.entries.clone())
        };

        info!(
            "加入队列: queue_id={}, user={}, priority={}, position={}",
            queued.queue_id, queued.requester_name, queued.priority, queued.position
        );
        self.broadcast(snapshot).await;
        queued
    }

    /// 登记一个已经开始执行的请求
    ///
    /// 执行中的项排在所有等待项之前，使其计入后续项的预计等待时间。
    pub async fn register_running(
        &self,
        request: TestRequest,
        requester: &Requester,
        priority: u8,
        execution_id: &str,
        pending_devices: Vec<String>,
    ) -> QueuedTest {
        let mut item = Self::new_item(request, requester, priority, QueueStatus::Running);
        item.execution_id = Some(execution_id.to_string());
        item.pending_devices = pending_devices;

        let (registered, snapshot) = {
            let mut state = self.state.write().await;
            let index = state
                .entries
                .iter()
                .position(|e| e.status != QueueStatus::Running)
                .unwrap_or(state.entries.len());
            state.entries.insert(index, item);
            state.recompute_positions();
            (state.entries[index].clone(), state.entries.clone())
        };

        debug!(
            "登记执行中的队列项: queue_id={}, execution={}",
            registered.queue_id, execution_id
        );
        self.broadcast(snapshot).await;
        registered
    }

    /// 从队列移除 (执行中的项由编排器负责结束，不能在这里移除)
    pub async fn remove_from_queue(&self, queue_id: &str) -> Result<QueuedTest> {
        let (removed, snapshot) = {
            let mut state = self.state.write().await;
            let index = state
                .index_of(queue_id)
                .ok_or_else(|| QueueError::NotFound(queue_id.to_string()))?;
            if state.entries[index].status == QueueStatus::Running {
                return Err(QueueError::Running(queue_id.to_string()));
            }
            let removed = state.entries.remove(index);
            state.recompute_positions();
            (removed, state.entries.clone())
        };

        info!("移出队列: queue_id={}", queue_id);
        self.broadcast(snapshot).await;
        Ok(removed)
    }

    /// 取出第一个可执行的等待项
    ///
    /// 顺序扫描，返回第一个与 `busy_device_ids` 无交集的等待项；
    /// 扫描中跳过的等待项会被标记为 `waiting_devices`。
    pub async fn get_next_executable(&self, busy_device_ids: &HashSet<String>) -> Option<QueuedTest> {
        let (next, changed) = {
            let mut state = self.state.write().await;
            let mut changed = false;
            let mut next = None;
            for entry in state.entries.iter_mut() {
                if !entry.status.is_waiting() {
                    continue;
                }
                if entry.request.overlaps(busy_device_ids) {
                    if entry.status != QueueStatus::WaitingDevices {
                        entry.status = QueueStatus::WaitingDevices;
                        changed = true;
                    }
                    continue;
                }
                next = Some(entry.clone());
                break;
            }
            (next, changed.then(|| state.entries.clone()))
        };

        if let Some(snapshot) = changed {
            self.broadcast(snapshot).await;
        }
        next
    }

    /// 标记为执行中
    pub async fn mark_running(
        &self,
        queue_id: &str,
        execution_id: &str,
        pending_devices: Vec<String>,
    ) -> Result<()> {
        let snapshot = {
            let mut state = self.state.write().await;
            let index = state
                .index_of(queue_id)
                .ok_or_else(|| QueueError::NotFound(queue_id.to_string()))?;
            let mut entry = state.entries.remove(index);
            entry.status = QueueStatus::Running;
            entry.execution_id = Some(execution_id.to_string());
            entry.pending_devices = pending_devices;
            entry.waiting_info = None;

            // 执行中的项移到等待项之前
            let target = state
                .entries
                .iter()
                .position(|e| e.status != QueueStatus::Running)
                .unwrap_or(state.entries.len());
            state.entries.insert(target, entry);
            state.recompute_positions();
            state.entries.clone()
        };

        info!("队列项开始执行: queue_id={}, execution={}", queue_id, execution_id);
        self.broadcast(snapshot).await;
        Ok(())
    }

    /// 更新分拆执行中仍在等待的设备
    pub async fn update_pending_devices(&self, queue_id: &str, pending_devices: Vec<String>) {
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(index) = state.index_of(queue_id) else {
                return;
            };
            let entry = &mut state.entries[index];
            if entry.pending_devices == pending_devices {
                return;
            }
            if pending_devices.is_empty() {
                entry.waiting_info = None;
            }
            entry.pending_devices = pending_devices;
            state.entries.clone()
        };
        self.broadcast(snapshot).await;
    }

    /// 更新等待信息 (不广播，由调用方统一通知)
    pub async fn update_waiting_info(&self, queue_id: &str, waiting_info: Option<WaitingInfo>) {
        let mut state = self.state.write().await;
        if let Some(index) = state.index_of(queue_id) {
            state.entries[index].waiting_info = waiting_info;
        }
    }

    /// 结束队列项，移入历史
    pub async fn complete(&self, queue_id: &str, status: QueueStatus) -> Option<QueuedTest> {
        let (finished, snapshot) = {
            let mut state = self.state.write().await;
            let index = state.index_of(queue_id)?;
            let mut entry = state.entries.remove(index);
            entry.status = status;
            entry.position = 0;
            entry.waiting_info = None;
            entry.completed_at = Some(Utc::now());

            state.history.push_front(entry.clone());
            while state.history.len() > self.config.history_limit {
                state.history.pop_back();
            }
            state.recompute_positions();
            (entry, state.entries.clone())
        };

        info!("队列项结束: queue_id={}, status={:?}", queue_id, status);
        self.broadcast(snapshot).await;
        Some(finished)
    }

    pub async fn get(&self, queue_id: &str) -> Option<QueuedTest> {
        let state = self.state.read().await;
        state.index_of(queue_id).map(|i| state.entries[i].clone())
    }

    /// 在历史中查找
    pub async fn get_finished(&self, queue_id: &str) -> Option<QueuedTest> {
        let state = self.state.read().await;
        state.history.iter().find(|e| e.queue_id == queue_id).cloned()
    }

    /// 当前队列快照
    pub async fn get_queue(&self) -> Vec<QueuedTest> {
        self.state.read().await.entries.clone()
    }

    pub async fn get_position(&self, queue_id: &str) -> Option<usize> {
        let state = self.state.read().await;
        state.index_of(queue_id).map(|i| state.entries[i].position)
    }

    /// 预计等待时间 (毫秒)
    ///
    /// 排在前面的执行中/等待中项的 `场景数 × 重复次数 × 平均场景耗时` 之和。
    pub async fn get_estimated_wait_time(&self, queue_id: &str) -> Option<u64> {
        let state = self.state.read().await;
        state.index_of(queue_id).map(|i| state.estimated_wait(i))
    }

    /// 用一次执行的实际平均场景耗时更新估计值
    pub async fn update_avg_scenario_time(&self, actual_ms: f64) {
        if !actual_ms.is_finite() || actual_ms <= 0.0 {
            return;
        }
        let alpha = self.config.ema_alpha.clamp(0.0, 1.0);
        let mut state = self.state.write().await;
        state.avg_scenario_time_ms = alpha * actual_ms + (1.0 - alpha) * state.avg_scenario_time_ms;
        debug!(
            "平均场景耗时更新为 {:.0}ms (本次 {:.0}ms)",
            state.avg_scenario_time_ms, actual_ms
        );
    }

    pub async fn avg_scenario_time_ms(&self) -> u64 {
        self.state.read().await.avg_scenario_time_ms.round() as u64
    }

    /// 已结束的队列项 (最新的在前)
    pub async fn completed_history(&self, limit: usize) -> Vec<QueuedTest> {
        self.state
            .read()
            .await
            .history
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    /// 向每个等待中的提交者推送位置
    pub async fn notify_positions(&self) {
        let notices: Vec<PlatformEvent> = {
            let state = self.state.read().await;
            state
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.status.is_waiting() || !e.pending_devices.is_empty())
                .map(|(i, e)| PlatformEvent::QueuePosition {
                    queue_id: e.queue_id.clone(),
                    user_name: e.requester_name.clone(),
                    socket_id: e.requester_socket_id.clone(),
                    position: e.position,
                    estimated_wait_ms: state.estimated_wait(i),
                    waiting_info: e.waiting_info.clone(),
                })
                .collect()
        };
        for notice in notices {
            self.events.publish(notice);
        }
    }

    /// 清空队列与历史 (服务重启)
    pub async fn reset(&self) {
        {
            let mut state = self.state.write().await;
            state.entries.clear();
            state.history.clear();
            state.avg_scenario_time_ms = self.config.initial_avg_scenario_time_ms as f64;
        }
        info!("测试队列已重置");
        self.broadcast(Vec::new()).await;
    }

    fn new_item(
        request: TestRequest,
        requester: &Requester,
        priority: u8,
        status: QueueStatus,
    ) -> QueuedTest {
        QueuedTest {
            queue_id: Uuid::new_v4().to_string(),
            request,
            requester_name: requester.user_name.clone(),
            requester_socket_id: requester.socket_id.clone(),
            requested_at: Utc::now(),
            status,
            priority: priority.min(MAX_PRIORITY),
            position: 0,
            execution_id: None,
            waiting_info: None,
            pending_devices: Vec::new(),
            completed_at: None,
        }
    }

    async fn broadcast(&self, queue: Vec<QueuedTest>) {
        self.events.publish(PlatformEvent::QueueUpdated { queue });
        self.notify_positions().await;
    }
}
