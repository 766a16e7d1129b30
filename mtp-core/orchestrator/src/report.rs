//! 执行摘要与报告输出

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

use mtp_common::ExecutionStatus;

use crate::context::{DeviceExecutionResult, ExecutionContext};
use crate::{OrchestratorError, Result};

/// 一次执行的最终摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub queue_id: String,
    pub test_name: String,
    pub requester_name: String,
    pub status: ExecutionStatus,
    pub device_ids: Vec<String>,
    pub scenario_ids: Vec<String>,
    pub repeat_count: u32,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    /// 总耗时（毫秒）
    pub duration_ms: u64,

    pub devices: Vec<DeviceExecutionResult>,
}

impl ExecutionSummary {
    pub fn from_context(ctx: &ExecutionContext, status: ExecutionStatus) -> Self {
        let (success_count, failed_count, skipped_count) = ctx.counts();
        let completed_at = Utc::now();
        let duration_ms = (completed_at - ctx.started_at).num_milliseconds().max(0) as u64;

        Self {
            execution_id: ctx.execution_id.clone(),
            queue_id: ctx.queue_id.clone(),
            test_name: ctx.test_name.clone(),
            requester_name: ctx.requester.user_name.clone(),
            status,
            device_ids: ctx.device_ids.clone(),
            scenario_ids: ctx.request.scenario_ids.clone(),
            repeat_count: ctx.request.repeat_count.max(1),
            success_count,
            failed_count,
            skipped_count,
            started_at: ctx.started_at,
            completed_at,
            duration_ms,
            devices: ctx.ordered_results(),
        }
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

/// 报告输出
///
/// 编排器在执行结束后异步调用，失败只记录日志，不影响执行结果。
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn create(&self, summary: &ExecutionSummary) -> Result<()>;
}

/// 不输出报告
pub struct NoopReportSink;

#[async_trait]
impl ReportSink for NoopReportSink {
    async fn create(&self, _summary: &ExecutionSummary) -> Result<()> {
        Ok(())
    }
}

/// 每次执行写一个 JSON 文件: `{dir}/{execution_id}.json`
pub struct JsonFileReportSink {
    dir: PathBuf,
}

impl JsonFileReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, execution_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", execution_id))
    }
}

#[async_trait]
impl ReportSink for JsonFileReportSink {
    async fn create(&self, summary: &ExecutionSummary) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = summary
            .to_json()
            .map_err(|e| OrchestratorError::ReportError(e.to_string()))?;
        let path = self.path_for(&summary.execution_id);
        tokio::fs::write(&path, json).await?;
        info!("执行报告已写入: {}", path.display());
        Ok(())
    }
}
