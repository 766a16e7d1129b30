//! MTP 测试队列
//!
//! 队列是列表而不是堆：优先级只决定插入位置，之后不再重排。
//! 位置和预计等待时间都是派生值。

pub mod config;
pub mod service;

pub use config::QueueConfig;
pub use service::TestQueueService;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("队列项不存在: {0}")]
    NotFound(String),

    #[error("队列项 {0} 正在执行，不能直接移除")]
    Running(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
