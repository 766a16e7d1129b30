//! MTP 编排器
//!
//! 顶层控制循环：接收提交，按设备忙闲拆分为立即执行与排队等待，
//! 驱动执行器运行，处理逐设备完成回调，并在设备释放后重新调度。

pub mod catalog;
pub mod config;
pub mod context;
pub mod orchestrator;
pub mod report;

pub use catalog::{InMemoryCatalog, ScenarioCatalog};
pub use config::{EventsConfig, OrchestratorConfig, PlatformConfig};
pub use context::{DeviceExecutionResult, DeviceResultStatus, ExecutionContext, ExecutionSnapshot};
pub use orchestrator::{
    CancelResult, ForceCompleteResult, PlatformStatus, QueueItemView, SubmitResult, SubmitStatus,
    TestOrchestrator,
};
pub use report::{ExecutionSummary, JsonFileReportSink, NoopReportSink, ReportSink};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("无效的测试请求: {0}")]
    InvalidRequest(String),

    #[error("场景不存在: {0}")]
    ScenarioNotFound(String),

    #[error("场景校验失败: {0}")]
    InvalidScenario(String),

    #[error("执行不存在: {0}")]
    ExecutionNotFound(String),

    #[error("无权操作: {0}")]
    PermissionDenied(String),

    #[error("当前状态不允许该操作: {0}")]
    InvalidState(String),

    #[error("场景库加载失败: {0}")]
    CatalogError(String),

    #[error("报告写入失败: {0}")]
    ReportError(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
