//! 队列配置

use serde::{Deserialize, Serialize};

/// 队列配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 单个场景的初始平均耗时 (毫秒)
    #[serde(default = "default_avg_scenario_time_ms")]
    pub initial_avg_scenario_time_ms: u64,

    /// 平均耗时的指数移动平均系数
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,

    /// 已完成历史的最大条数
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            initial_avg_scenario_time_ms: default_avg_scenario_time_ms(),
            ema_alpha: default_ema_alpha(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_avg_scenario_time_ms() -> u64 {
    60_000
}

fn default_ema_alpha() -> f64 {
    0.2
}

fn default_history_limit() -> usize {
    100
}
