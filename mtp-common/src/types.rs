//! 共享数据模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// 最高优先级 (优先级取值 0..=2，数值越大越优先)
pub const MAX_PRIORITY: u8 = 2;

/// 提交者身份
///
/// 取消/强制完成时用于归属校验：socket ID 或用户名任一匹配即视为本人。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    /// 用户名
    pub user_name: String,

    /// 实时通道连接 ID
    pub socket_id: String,
}

impl Requester {
    pub fn new(user_name: impl Into<String>, socket_id: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            socket_id: socket_id.into(),
        }
    }

    /// 判断是否为同一提交者
    pub fn owns(&self, user_name: &str, socket_id: &str) -> bool {
        self.socket_id == socket_id || self.user_name == user_name
    }
}

/// 测试提交请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRequest {
    /// 目标设备 ID 列表
    pub device_ids: Vec<String>,

    /// 场景 ID 列表 (按执行顺序)
    pub scenario_ids: Vec<String>,

    /// 重复次数 (默认: 1)
    #[serde(default = "default_repeat_count")]
    pub repeat_count: u32,

    /// 场景间隔 (毫秒，可选，覆盖配置中的默认值)
    #[serde(default)]
    pub scenario_interval_ms: Option<u64>,

    /// 测试名称 (可选，默认取第一个场景名称)
    #[serde(default)]
    pub test_name: Option<String>,
}

fn default_repeat_count() -> u32 {
    1
}

impl TestRequest {
    pub fn new(device_ids: Vec<String>, scenario_ids: Vec<String>) -> Self {
        Self {
            device_ids,
            scenario_ids,
            repeat_count: default_repeat_count(),
            scenario_interval_ms: None,
            test_name: None,
        }
    }

    pub fn with_repeat(mut self, repeat_count: u32) -> Self {
        self.repeat_count = repeat_count;
        self
    }

    /// 场景数量
    pub fn scenario_count(&self) -> usize {
        self.scenario_ids.len()
    }

    /// 每台设备需要执行的场景总次数
    pub fn total_runs(&self) -> usize {
        self.scenario_ids.len() * self.repeat_count.max(1) as usize
    }

    /// 是否与给定设备集合有交集
    pub fn overlaps(&self, devices: &HashSet<String>) -> bool {
        self.device_ids.iter().any(|id| devices.contains(id))
    }
}

/// 设备锁
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLock {
    pub device_id: String,
    pub execution_id: String,
    /// 持有者用户名
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub test_name: String,
}

/// 队列项状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// 排队中
    Queued,
    /// 等待设备释放
    WaitingDevices,
    /// 执行中
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl QueueStatus {
    /// 是否仍在等待调度
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Queued | Self::WaitingDevices)
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// 阻塞设备信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingDevice {
    pub device_id: String,
    pub locked_by: String,
    pub test_name: String,
    pub execution_id: String,
}

/// 等待信息 (阻塞的设备与用户、预计等待时间)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingInfo {
    pub blocking_devices: Vec<BlockingDevice>,
    pub blocking_users: Vec<String>,
    pub estimated_wait_ms: u64,
}

/// 队列项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTest {
    pub queue_id: String,
    pub request: TestRequest,
    pub requester_name: String,
    pub requester_socket_id: String,
    pub requested_at: DateTime<Utc>,
    pub status: QueueStatus,

    /// 优先级 0..=2
    pub priority: u8,

    /// 等待位置 (从 1 开始，执行中的项为 0)
    pub position: usize,

    #[serde(default)]
    pub execution_id: Option<String>,

    #[serde(default)]
    pub waiting_info: Option<WaitingInfo>,

    /// 分拆执行时仍在等待的设备
    #[serde(default)]
    pub pending_devices: Vec<String>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueuedTest {
    pub fn is_owned_by(&self, user_name: &str, socket_id: &str) -> bool {
        self.requester_socket_id == socket_id || self.requester_name == user_name
    }
}

/// 设备进度状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

/// 设备进度 (设备场景队列中的游标)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProgress {
    pub current_scenario_index: usize,
    pub total_scenarios: usize,
    pub completed_scenarios: usize,
    pub failed_scenarios: usize,
    pub status: ProgressStatus,
}

impl DeviceProgress {
    pub fn new(total_scenarios: usize) -> Self {
        Self {
            current_scenario_index: 0,
            total_scenarios,
            completed_scenarios: 0,
            failed_scenarios: 0,
            status: ProgressStatus::Running,
        }
    }

    /// 完成百分比 (0-100)
    pub fn percent(&self) -> u8 {
        if self.total_scenarios == 0 {
            return 100;
        }
        let done = self.completed_scenarios + self.failed_scenarios;
        ((done * 100) / self.total_scenarios).min(100) as u8
    }
}

/// 执行最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// 所有设备成功
    Completed,
    /// 部分设备成功
    Partial,
    /// 没有设备成功
    Failed,
    /// 用户取消
    Cancelled,
}

impl ExecutionStatus {
    /// 根据设备成功/失败/跳过数量推导最终状态
    pub fn from_counts(success: usize, failed: usize, skipped: usize) -> Self {
        if success > 0 && failed == 0 && skipped == 0 {
            Self::Completed
        } else if success > 0 {
            Self::Partial
        } else {
            Self::Failed
        }
    }

    /// 对应的队列终态
    pub fn queue_status(&self) -> QueueStatus {
        match self {
            Self::Completed | Self::Partial => QueueStatus::Completed,
            Self::Failed => QueueStatus::Failed,
            Self::Cancelled => QueueStatus::Cancelled,
        }
    }
}
