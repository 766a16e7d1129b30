//! MTP 通用类型定义
//!
//! 此 crate 包含设备锁服务、测试队列、执行器与编排器之间共享的类型，
//! 以及各服务向观察者广播状态变化所用的事件总线。

pub mod event;
pub mod types;

pub use event::{EventBus, EventReceiver, PlatformEvent, DEFAULT_EVENT_CAPACITY};
pub use types::{
    BlockingDevice, DeviceLock, DeviceProgress, ExecutionStatus, ProgressStatus, QueueStatus,
    QueuedTest, Requester, TestRequest, WaitingInfo, MAX_PRIORITY,
};
