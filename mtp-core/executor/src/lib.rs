//! MTP 执行器
//!
//! 场景以节点图描述，由 [`ScenarioGraphRunner`] 在单台设备上逐节点执行；
//! [`TestExecutor`] 负责一台设备上的场景队列 (含重复轮次)，批次内的设备相互独立并发运行。
//! 执行器从不加锁或解锁设备，设备归属由编排器管理。

pub mod action;
pub mod classifier;
pub mod config;
pub mod executor;
pub mod plan;
pub mod report;
pub mod runner;
pub mod scenario;

pub use action::{Action, Condition};
pub use classifier::{classify_failure, FailureType};
pub use config::ExecutorConfig;
pub use executor::TestExecutor;
pub use plan::{ExecutionPlan, ScenarioQueueItem};
pub use report::{DeviceRunReport, ScenarioReport, ScenarioStatus, StepReport, StepStatus};
pub use runner::ScenarioGraphRunner;
pub use scenario::{Branch, Category, Connection, LoopMode, Node, NodeKind, Package, Scenario};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("场景加载失败: {0}")]
    ScenarioLoadFailed(String),

    #[error("场景校验失败: {scenario}: {reason}")]
    InvalidScenario { scenario: String, reason: String },

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    SerdeError(String),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
