//! 执行上下文
//!
//! 每个被接受的提交对应一个执行上下文。目标设备在任意时刻恰好属于
//! `active`、`pending`、`completed` 三个集合之一；`active` 与 `pending`
//! 都为空时执行结束。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use mtp_common::{ProgressStatus, Requester, TestRequest};
use mtp_executor::{DeviceRunReport, ExecutionPlan, ScenarioReport};

/// 单台设备在一次执行中的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceResultStatus {
    /// 等待设备释放
    Pending,
    Running,
    Completed,
    Failed,
    /// 未执行 (取消或强制完成)
    Skipped,
}

/// 单台设备的执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceExecutionResult {
    pub device_id: String,
    pub status: DeviceResultStatus,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub success: Option<bool>,

    #[serde(default)]
    pub error: Option<String>,

    pub total_scenarios: usize,
    pub completed_scenarios: usize,
    pub failed_scenarios: usize,

    #[serde(default)]
    pub scenarios: Vec<ScenarioReport>,
}

impl DeviceExecutionResult {
    fn pending(device_id: &str, total_scenarios: usize) -> Self {
        Self {
            device_id: device_id.to_string(),
            status: DeviceResultStatus::Pending,
            started_at: None,
            completed_at: None,
            success: None,
            error: None,
            total_scenarios,
            completed_scenarios: 0,
            failed_scenarios: 0,
            scenarios: Vec::new(),
        }
    }
}

/// 执行上下文
pub struct ExecutionContext {
    pub execution_id: String,
    pub queue_id: String,
    pub request: TestRequest,
    pub requester: Requester,
    pub test_name: String,
    pub priority: u8,

    /// 目标设备 (去重后，保持提交顺序)
    pub device_ids: Vec<String>,

    pub active_devices: BTreeSet<String>,
    pub pending_devices: BTreeSet<String>,
    pub completed_devices: BTreeSet<String>,
    pub device_results: BTreeMap<String, DeviceExecutionResult>,

    pub started_at: DateTime<Utc>,
    pub stop_requested: bool,

    /// 执行级取消令牌，每台设备使用它的子令牌
    pub token: CancellationToken,

    pub plan: Arc<ExecutionPlan>,
    pub scenario_interval: Duration,
}

impl ExecutionContext {
    /// 创建上下文：`active` 中的设备立即执行，其余设备等待
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        execution_id: String,
        queue_id: String,
        request: TestRequest,
        requester: Requester,
        test_name: String,
        priority: u8,
        plan: Arc<ExecutionPlan>,
        scenario_interval: Duration,
        active: &[String],
    ) -> Self {
        let device_ids = request.device_ids.clone();
        let device_results = device_ids
            .iter()
            .map(|id| (id.clone(), DeviceExecutionResult::pending(id, plan.len())))
            .collect();

        let mut ctx = Self {
            execution_id,
            queue_id,
            request,
            requester,
            test_name,
            priority,
            pending_devices: device_ids.iter().cloned().collect(),
            active_devices: BTreeSet::new(),
            completed_devices: BTreeSet::new(),
            device_ids,
            device_results,
            started_at: Utc::now(),
            stop_requested: false,
            token: CancellationToken::new(),
            plan,
            scenario_interval,
        };
        ctx.activate(active);
        ctx
    }

    /// 等待中的设备转为执行中
    pub fn activate(&mut self, device_ids: &[String]) {
        let now = Utc::now();
        for device_id in device_ids {
            if !self.pending_devices.remove(device_id) {
                continue;
            }
            self.active_devices.insert(device_id.clone());
            if let Some(result) = self.device_results.get_mut(device_id) {
                result.status = DeviceResultStatus::Running;
                result.started_at = Some(now);
            }
        }
    }

    /// 记录一台设备的执行报告，设备转为已完成
    pub fn complete_device(&mut self, report: &DeviceRunReport) {
        if !self.active_devices.remove(&report.device_id) {
            return;
        }
        self.completed_devices.insert(report.device_id.clone());

        if let Some(result) = self.device_results.get_mut(&report.device_id) {
            result.status = if report.success {
                DeviceResultStatus::Completed
            } else {
                DeviceResultStatus::Failed
            };
            result.started_at = Some(report.started_at);
            result.completed_at = Some(report.completed_at);
            result.success = Some(report.success);
            result.error = report.error.clone();
            result.total_scenarios = report.progress.total_scenarios;
            result.completed_scenarios = report.progress.completed_scenarios;
            result.failed_scenarios = report.progress.failed_scenarios;
            result.scenarios = report.scenarios.clone();

            if report.progress.status == ProgressStatus::Stopped && result.error.is_none() {
                result.error = Some("执行已取消".to_string());
            }
        }
    }

    /// 执行中的设备直接记为失败 (没有执行报告时)
    pub fn fail_active(&mut self, reason: &str) -> Vec<String> {
        let failed: Vec<String> = std::mem::take(&mut self.active_devices).into_iter().collect();
        self.close_devices(&failed, DeviceResultStatus::Failed, Some(false), reason);
        failed
    }

    /// 等待中的设备记为跳过
    pub fn skip_pending(&mut self, reason: &str) -> Vec<String> {
        let skipped: Vec<String> = std::mem::take(&mut self.pending_devices).into_iter().collect();
        self.close_devices(&skipped, DeviceResultStatus::Skipped, None, reason);
        skipped
    }

    fn close_devices(
        &mut self,
        device_ids: &[String],
        status: DeviceResultStatus,
        success: Option<bool>,
        reason: &str,
    ) {
        let now = Utc::now();
        for device_id in device_ids {
            self.completed_devices.insert(device_id.clone());
            if let Some(result) = self.device_results.get_mut(device_id) {
                result.status = status;
                result.completed_at = Some(now);
                result.success = success;
                result.error = Some(reason.to_string());
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.active_devices.is_empty() && self.pending_devices.is_empty()
    }

    /// 三个集合两两不相交且并集等于目标设备
    pub fn is_partition_consistent(&self) -> bool {
        let total = self.active_devices.len() + self.pending_devices.len() + self.completed_devices.len();
        total == self.device_ids.len()
            && self.device_ids.iter().all(|id| {
                self.active_devices.contains(id)
                    || self.pending_devices.contains(id)
                    || self.completed_devices.contains(id)
            })
    }

    pub fn pending_list(&self) -> Vec<String> {
        self.pending_devices.iter().cloned().collect()
    }

    pub fn active_list(&self) -> Vec<String> {
        self.active_devices.iter().cloned().collect()
    }

    /// (成功, 失败, 跳过) 设备数
    pub fn counts(&self) -> (usize, usize, usize) {
        self.device_results
            .values()
            .fold((0, 0, 0), |(ok, failed, skipped), result| match result.status {
                DeviceResultStatus::Completed => (ok + 1, failed, skipped),
                DeviceResultStatus::Failed => (ok, failed + 1, skipped),
                DeviceResultStatus::Skipped => (ok, failed, skipped + 1),
                _ => (ok, failed, skipped),
            })
    }

    /// 本次执行所有场景的平均耗时 (毫秒)
    pub fn avg_scenario_duration_ms(&self) -> Option<f64> {
        let durations: Vec<u64> = self
            .device_results
            .values()
            .flat_map(|r| r.scenarios.iter().map(|s| s.duration_ms))
            .collect();
        if durations.is_empty() {
            return None;
        }
        Some(durations.iter().sum::<u64>() as f64 / durations.len() as f64)
    }

    /// 计划中涉及的被测应用包名 (去重)
    pub fn app_packages(&self) -> Vec<String> {
        let packages: BTreeSet<String> = self
            .plan
            .items()
            .iter()
            .filter_map(|item| item.app_package.clone())
            .collect();
        packages.into_iter().collect()
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            execution_id: self.execution_id.clone(),
            queue_id: self.queue_id.clone(),
            test_name: self.test_name.clone(),
            requester_name: self.requester.user_name.clone(),
            device_ids: self.device_ids.clone(),
            active_devices: self.active_list(),
            pending_devices: self.pending_list(),
            completed_devices: self.completed_devices.iter().cloned().collect(),
            total_scenarios: self.plan.len(),
            started_at: self.started_at,
            stop_requested: self.stop_requested,
            device_results: self.ordered_results(),
        }
    }

    /// 按提交顺序排列的设备结果
    pub fn ordered_results(&self) -> Vec<DeviceExecutionResult> {
        self.device_ids
            .iter()
            .filter_map(|id| self.device_results.get(id).cloned())
            .collect()
    }
}

/// 执行中的上下文快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: String,
    pub queue_id: String,
    pub test_name: String,
    pub requester_name: String,
    pub device_ids: Vec<String>,
    pub active_devices: Vec<String>,
    pub pending_devices: Vec<String>,
    pub completed_devices: Vec<String>,

    /// 每台设备的场景总数
    pub total_scenarios: usize,

    pub started_at: DateTime<Utc>,
    pub stop_requested: bool,
    pub device_results: Vec<DeviceExecutionResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtp_common::DeviceProgress;
    use std::collections::HashMap;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn context(devices: &[&str], active: &[&str]) -> ExecutionContext {
        let request = TestRequest::new(ids(devices), ids(&["S1"]));
        ExecutionContext::new(
            "e1".to_string(),
            "q1".to_string(),
            request,
            Requester::new("alice", "sock-1"),
            "冒烟".to_string(),
            1,
            Arc::new(ExecutionPlan::build(&[], &HashMap::new(), 1)),
            Duration::ZERO,
            &ids(active),
        )
    }

    fn report(device_id: &str, success: bool) -> DeviceRunReport {
        let mut progress = DeviceProgress::new(1);
        if success {
            progress.completed_scenarios = 1;
            progress.status = ProgressStatus::Completed;
        } else {
            progress.failed_scenarios = 1;
            progress.status = ProgressStatus::Failed;
        }
        DeviceRunReport {
            execution_id: "e1".to_string(),
            device_id: device_id.to_string(),
            success,
            error: (!success).then(|| "断言失败".to_string()),
            progress,
            started_at: Utc::now(),
            completed_at: Utc::now(),
            duration_ms: 10,
            scenarios: Vec::new(),
        }
    }

    #[test]
    fn test_partition_through_lifecycle() {
        let mut ctx = context(&["D1", "D2", "D3"], &["D1", "D2"]);
        assert!(ctx.is_partition_consistent());
        assert_eq!(ctx.pending_list(), ids(&["D3"]));

        ctx.complete_device(&report("D1", true));
        assert!(ctx.is_partition_consistent());
        assert!(!ctx.is_finished());

        ctx.activate(&ids(&["D3"]));
        assert_eq!(ctx.active_list(), ids(&["D2", "D3"]));
        assert!(ctx.is_partition_consistent());

        ctx.complete_device(&report("D2", false));
        ctx.complete_device(&report("D3", true));
        assert!(ctx.is_finished());
        assert!(ctx.is_partition_consistent());
        assert_eq!(ctx.counts(), (2, 1, 0));
    }

    #[test]
    fn test_duplicate_completion_is_ignored() {
        let mut ctx = context(&["D1"], &["D1"]);
        ctx.complete_device(&report("D1", true));
        ctx.complete_device(&report("D1", false));
        assert_eq!(ctx.counts(), (1, 0, 0));
        assert!(ctx.is_partition_consistent());
    }

    #[test]
    fn test_cancel_fails_active_and_skips_pending() {
        let mut ctx = context(&["D1", "D2"], &["D1"]);
        assert_eq!(ctx.fail_active("执行已取消"), ids(&["D1"]));
        assert_eq!(ctx.skip_pending("执行已取消"), ids(&["D2"]));

        assert!(ctx.is_finished());
        assert!(ctx.is_partition_consistent());
        assert_eq!(ctx.counts(), (0, 1, 1));

        let results = ctx.ordered_results();
        assert_eq!(results[0].status, DeviceResultStatus::Failed);
        assert_eq!(results[1].status, DeviceResultStatus::Skipped);
        assert_eq!(results[1].success, None);
    }

    #[test]
    fn test_snapshot_keeps_submission_order() {
        let ctx = context(&["D9", "D1"], &["D9"]);
        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.device_ids, ids(&["D9", "D1"]));
        assert_eq!(snapshot.device_results[0].device_id, "D9");
        assert_eq!(snapshot.device_results[0].status, DeviceResultStatus::Running);
        assert_eq!(snapshot.device_results[1].status, DeviceResultStatus::Pending);
    }
}
