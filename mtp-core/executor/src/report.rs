//! 执行报告

use chrono::{DateTime, Utc};
use mtp_common::{DeviceProgress, ProgressStatus};
use serde::{Deserialize, Serialize};

use crate::FailureType;

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// 执行成功
    Passed,
    /// 断言或等待未满足
    Failed,
    /// 驱动异常、超时或取消
    Error,
}

/// 步骤报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    /// 节点 ID
    pub node_id: String,

    /// 步骤描述
    pub description: String,

    /// 步骤状态
    pub status: StepStatus,

    /// 错误信息
    pub error: Option<String>,

    /// 失败类型
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<FailureType>,

    /// 耗时（毫秒）
    pub duration_ms: u64,

    /// 输出内容
    pub output: Option<String>,

    /// 失败截图 (base64)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

impl StepReport {
    pub fn success(node_id: &str, description: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            description: description.to_string(),
            status: StepStatus::Passed,
            error: None,
            failure_type: None,
            duration_ms: 0,
            output: None,
            screenshot: None,
        }
    }

    pub fn failed(
        node_id: &str,
        description: &str,
        status: StepStatus,
        error: &str,
        failure_type: FailureType,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            description: description.to_string(),
            status,
            error: Some(error.to_string()),
            failure_type: Some(failure_type),
            duration_ms: 0,
            output: None,
            screenshot: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn is_passed(&self) -> bool {
        self.status == StepStatus::Passed
    }
}

/// 场景执行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Passed,
    Failed,
    Cancelled,
}

/// 场景报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    /// 场景 ID
    pub scenario_id: String,

    /// 场景名称
    pub scenario_name: String,

    /// 重复轮次 (从 1 开始)
    pub repeat_index: u32,

    /// 执行结果
    pub status: ScenarioStatus,

    /// 执行的步骤数
    pub steps_executed: usize,

    /// 通过的步骤数
    pub passed_count: usize,

    /// 失败的步骤数
    pub failed_count: usize,

    /// 场景失败原因
    pub error: Option<String>,

    /// 失败类型
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<FailureType>,

    /// 开始时间
    pub started_at: DateTime<Utc>,

    /// 总耗时（毫秒）
    pub duration_ms: u64,

    /// 步骤报告列表
    pub steps: Vec<StepReport>,
}

impl ScenarioReport {
    pub fn new(scenario_id: &str, scenario_name: &str, repeat_index: u32) -> Self {
        Self {
            scenario_id: scenario_id.to_string(),
            scenario_name: scenario_name.to_string(),
            repeat_index,
            status: ScenarioStatus::Passed,
            steps_executed: 0,
            passed_count: 0,
            failed_count: 0,
            error: None,
            failure_type: None,
            started_at: Utc::now(),
            duration_ms: 0,
            steps: Vec::new(),
        }
    }

    pub fn add_step(&mut self, step: StepReport) {
        self.steps_executed += 1;

        if step.is_passed() {
            self.passed_count += 1;
        } else {
            self.failed_count += 1;
            if self.error.is_none() {
                self.error = step.error.clone();
                self.failure_type = step.failure_type;
            }
            if self.status == ScenarioStatus::Passed {
                self.status = ScenarioStatus::Failed;
            }
        }

        self.steps.push(step);
    }

    /// 不对应任何步骤的场景级失败 (循环、图结构错误等)
    pub fn fail(&mut self, error: &str, failure_type: FailureType) {
        self.error = Some(error.to_string());
        self.failure_type = Some(failure_type);
        self.status = match failure_type {
            FailureType::Cancelled => ScenarioStatus::Cancelled,
            _ => ScenarioStatus::Failed,
        };
    }

    pub fn passed(&self) -> bool {
        self.status == ScenarioStatus::Passed
    }

    /// 导出为 JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// 单台设备的执行报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRunReport {
    pub execution_id: String,
    pub device_id: String,

    /// 是否全部场景通过
    pub success: bool,

    /// 设备级错误 (获取设备失败、中途停止等)
    pub error: Option<String>,

    pub progress: DeviceProgress,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    /// 总耗时（毫秒）
    pub duration_ms: u64,

    pub scenarios: Vec<ScenarioReport>,
}

impl DeviceRunReport {
    pub fn status(&self) -> ProgressStatus {
        self.progress.status
    }

    /// 已执行场景的平均耗时 (毫秒)
    pub fn avg_scenario_duration_ms(&self) -> Option<f64> {
        if self.scenarios.is_empty() {
            return None;
        }
        let total: u64 = self.scenarios.iter().map(|s| s.duration_ms).sum();
        Some(total as f64 / self.scenarios.len() as f64)
    }

    /// 导出为 JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// 导出为 YAML
    pub fn to_yaml(&self) -> serde_yaml::Result<String> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_report_first_failure_wins() {
        let mut report = ScenarioReport::new("S1", "登录", 1);
        report.add_step(StepReport::success("a", "点击"));
        report.add_step(StepReport::failed(
            "b",
            "等待元素出现",
            StepStatus::Failed,
            "元素未找到",
            FailureType::ElementNotFound,
        ));
        report.add_step(StepReport::failed(
            "c",
            "截图",
            StepStatus::Error,
            "驱动错误",
            FailureType::Unknown,
        ));

        assert!(!report.passed());
        assert_eq!(report.steps_executed, 3);
        assert_eq!(report.passed_count, 1);
        assert_eq!(report.failed_count, 2);
        assert_eq!(report.error.as_deref(), Some("元素未找到"));
        assert_eq!(report.failure_type, Some(FailureType::ElementNotFound));
    }

    #[test]
    fn test_scenario_report_cancel() {
        let mut report = ScenarioReport::new("S1", "登录", 1);
        report.fail("执行已取消", FailureType::Cancelled);
        assert_eq!(report.status, ScenarioStatus::Cancelled);
    }

    #[test]
    fn test_step_report_json_skips_empty_fields() {
        let json = serde_json::to_string(&StepReport::success("a", "点击")).unwrap();
        assert!(json.contains("\"status\":\"passed\""));
        assert!(!json.contains("screenshot"));
        assert!(!json.contains("failure_type"));
    }
}
