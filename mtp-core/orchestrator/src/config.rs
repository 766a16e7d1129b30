//! 平台配置
//!
//! 支持多种配置源，按以下优先级合并：
//! 1. 环境变量 (`MTP_*`)
//! 2. 配置文件 (`MTP_CONFIG` 指定，或按默认路径搜索)
//! 3. 默认值

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use mtp_common::DEFAULT_EVENT_CAPACITY;
use mtp_executor::ExecutorConfig;
use mtp_queue::QueueConfig;

/// 平台配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// 执行器配置
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// 队列配置
    #[serde(default)]
    pub queue: QueueConfig,

    /// 编排器配置
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// 事件总线配置
    #[serde(default)]
    pub events: EventsConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            executor: ExecutorConfig::default(),
            queue: QueueConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

/// 编排器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// 已完成执行摘要的保留条数
    #[serde(default = "default_completed_history_limit")]
    pub completed_history_limit: usize,

    /// 取消时是否结束设备上的被测应用
    #[serde(default = "default_terminate_app_on_cancel")]
    pub terminate_app_on_cancel: bool,

    /// 执行报告输出目录 (不配置则不写报告)
    #[serde(default)]
    pub report_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            completed_history_limit: default_completed_history_limit(),
            terminate_app_on_cancel: default_terminate_app_on_cancel(),
            report_dir: None,
        }
    }
}

/// 事件总线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// 广播缓冲容量
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_completed_history_limit() -> usize {
    100
}

fn default_terminate_app_on_cancel() -> bool {
    true
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl PlatformConfig {
    /// 从多个源加载配置 (优先级: 环境变量 > 配置文件 > 默认值)
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => {
                tracing::debug!("加载配置文件: {:?}", path);
                Self::load_from_file(&path)?
            }
            None => {
                tracing::debug!("未找到配置文件，使用默认配置");
                Self::default()
            }
        };

        config.apply_env_vars()?;
        Ok(config)
    }

    /// 从指定文件加载配置
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        let config = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("解析 TOML 配置失败: {:?}", path))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("解析 YAML 配置失败: {:?}", path))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("解析 JSON 配置失败: {:?}", path))?,
            _ => anyhow::bail!("不支持的配置文件格式: {:?}", path),
        };

        Ok(config)
    }

    /// 查找配置文件 (按优先级搜索)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(path) = env::var("MTP_CONFIG") {
            let p = PathBuf::from(path);
            if p.exists() {
                return Some(p);
            }
        }

        let mut candidates = vec![
            PathBuf::from("./mtp.toml"),
            PathBuf::from("./mtp.yaml"),
            PathBuf::from("./mtp.json"),
        ];

        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".config/mtp/mtp.toml"));
        }

        #[cfg(target_os = "linux")]
        candidates.push(PathBuf::from("/etc/mtp/mtp.toml"));

        candidates.into_iter().find(|p| p.exists())
    }

    /// 从环境变量覆盖配置
    fn apply_env_vars(&mut self) -> Result<()> {
        if let Ok(level) = env::var("MTP_LOG_LEVEL") {
            self.log_level = level;
        }

        // Executor
        if let Ok(value) = env::var("MTP_POLL_INTERVAL_MS") {
            self.executor.poll_interval_ms =
                value.parse().context("无效的 MTP_POLL_INTERVAL_MS")?;
        }
        if let Ok(value) = env::var("MTP_WAIT_TIMEOUT_MS") {
            self.executor.default_wait_timeout_ms =
                value.parse().context("无效的 MTP_WAIT_TIMEOUT_MS")?;
        }
        if let Ok(value) = env::var("MTP_SCENARIO_INTERVAL_MS") {
            self.executor.scenario_interval_ms =
                value.parse().context("无效的 MTP_SCENARIO_INTERVAL_MS")?;
        }
        if let Ok(value) = env::var("MTP_SCREENSHOT_ON_FAILURE") {
            self.executor.screenshot_on_failure = value.parse().unwrap_or(true);
        }

        // Queue
        if let Ok(value) = env::var("MTP_AVG_SCENARIO_TIME_MS") {
            self.queue.initial_avg_scenario_time_ms =
                value.parse().context("无效的 MTP_AVG_SCENARIO_TIME_MS")?;
        }
        if let Ok(value) = env::var("MTP_HISTORY_LIMIT") {
            let limit: usize = value.parse().context("无效的 MTP_HISTORY_LIMIT")?;
            self.queue.history_limit = limit;
            self.orchestrator.completed_history_limit = limit;
        }

        // Orchestrator
        if let Ok(dir) = env::var("MTP_REPORT_DIR") {
            self.orchestrator.report_dir = Some(PathBuf::from(dir));
        }

        // Events
        if let Ok(value) = env::var("MTP_EVENT_CAPACITY") {
            self.events.capacity = value.parse().context("无效的 MTP_EVENT_CAPACITY")?;
        }

        Ok(())
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.executor.poll_interval_ms == 0 {
            anyhow::bail!("executor.poll_interval_ms 必须大于 0");
        }
        if !(self.queue.ema_alpha > 0.0 && self.queue.ema_alpha <= 1.0) {
            anyhow::bail!("queue.ema_alpha 必须在 (0, 1] 范围内");
        }
        if self.queue.initial_avg_scenario_time_ms == 0 {
            anyhow::bail!("queue.initial_avg_scenario_time_ms 必须大于 0");
        }
        if self.events.capacity == 0 {
            anyhow::bail!("events.capacity 必须大于 0");
        }
        Ok(())
    }

    /// 保存配置到文件
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("创建目录失败: {:?}", parent))?;
        }

        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::to_string_pretty(self).context("序列化 TOML 失败")?,
            Some("yaml") | Some("yml") => {
                serde_yaml::to_string(self).context("序列化 YAML 失败")?
            }
            Some("json") => serde_json::to_string_pretty(self).context("序列化 JSON 失败")?,
            _ => anyhow::bail!("不支持的配置文件格式: {:?}", path),
        };

        fs::write(path, content).with_context(|| format!("写入配置文件失败: {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PlatformConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.executor.poll_interval_ms, 500);
        assert_eq!(config.queue.initial_avg_scenario_time_ms, 60_000);
        assert_eq!(config.orchestrator.completed_history_limit, 100);
        assert!(config.orchestrator.terminate_app_on_cancel);
        assert_eq!(config.events.capacity, DEFAULT_EVENT_CAPACITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: PlatformConfig = toml::from_str(
            r#"
log_level = "debug"

[executor]
poll_interval_ms = 200

[orchestrator]
report_dir = "/tmp/mtp-reports"
"#,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.executor.poll_interval_ms, 200);
        assert_eq!(config.executor.default_wait_timeout_ms, 10_000);
        assert_eq!(
            config.orchestrator.report_dir,
            Some(PathBuf::from("/tmp/mtp-reports"))
        );
        assert_eq!(config.queue.ema_alpha, 0.2);
    }

    #[test]
    fn test_config_validation() {
        let mut config = PlatformConfig::default();
        config.queue.ema_alpha = 0.0;
        assert!(config.validate().is_err());

        config.queue.ema_alpha = 0.5;
        config.executor.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = env::temp_dir().join(format!("mtp-config-{}", uuid::Uuid::new_v4()));
        let mut config = PlatformConfig::default();
        config.log_level = "warn".to_string();
        config.orchestrator.terminate_app_on_cancel = false;

        for name in ["mtp.toml", "mtp.yaml", "mtp.json"] {
            let path = dir.join(name);
            config.save_to_file(&path).unwrap();
            let loaded = PlatformConfig::load_from_file(&path).unwrap();
            assert_eq!(loaded, config);
        }

        assert!(config.save_to_file(&dir.join("mtp.ini")).is_err());
        fs::remove_dir_all(&dir).ok();
    }
}
