//! MTP 设备操作接口
//!
//! 编排器与执行器只通过 [`ActionsProvider`] / [`DeviceActions`] 访问设备，
//! 具体驱动 (会话创建、截图、UI 元素交互、图像/OCR 匹配) 由外部实现。

pub mod simulated;
pub mod traits;

pub use simulated::{SimulatedDevice, SimulatedProvider};
pub use traits::{ActionsProvider, DeviceActions, ImageTemplate, Point, Selector, SelectorKind};

use thiserror::Error;

/// 设备操作错误
///
/// 错误消息会被执行器的失败分类器按模式匹配，消息中应保留关键信息。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("设备不存在: {0}")]
    DeviceNotFound(String),

    #[error("元素未找到: {0}")]
    ElementNotFound(String),

    #[error("图像未匹配: {0}")]
    ImageNotMatched(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("会话错误: {0}")]
    Session(String),

    #[error("连接失败: {0}")]
    Connection(String),

    #[error("应用未运行: {0}")]
    AppNotRunning(String),

    #[error("应用崩溃: {0}")]
    AppCrashed(String),

    #[error("权限不足: {0}")]
    PermissionDenied(String),

    #[error("操作已停止")]
    Stopped,

    #[error("驱动错误: {0}")]
    Driver(String),
}

pub type Result<T> = std::result::Result<T, ActionError>;
