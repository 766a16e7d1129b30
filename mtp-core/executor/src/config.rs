//! 执行器配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 执行器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// 等待类动作的轮询间隔 (毫秒)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// 等待类动作未指定超时时的默认超时 (毫秒)
    #[serde(default = "default_wait_timeout_ms")]
    pub default_wait_timeout_ms: u64,

    /// 单个动作的执行超时 (毫秒)，等待类动作在自身超时之外再加上这个值
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,

    /// 步骤失败时是否截图
    #[serde(default = "default_screenshot_on_failure")]
    pub screenshot_on_failure: bool,

    /// 场景之间的默认间隔 (毫秒)
    #[serde(default = "default_scenario_interval_ms")]
    pub scenario_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            default_wait_timeout_ms: default_wait_timeout_ms(),
            action_timeout_ms: default_action_timeout_ms(),
            screenshot_on_failure: default_screenshot_on_failure(),
            scenario_interval_ms: default_scenario_interval_ms(),
        }
    }
}

impl ExecutorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn scenario_interval(&self) -> Duration {
        Duration::from_millis(self.scenario_interval_ms)
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_wait_timeout_ms() -> u64 {
    10_000
}

fn default_action_timeout_ms() -> u64 {
    30_000
}

fn default_screenshot_on_failure() -> bool {
    true
}

fn default_scenario_interval_ms() -> u64 {
    1_000
}
