//! MTP 设备锁服务
//!
//! 设备是唯一需要互斥的资源。锁的存在是设备繁忙的唯一依据，
//! 批量加锁要么全部成功，要么一个都不加。

pub mod service;

pub use service::{DeviceLockService, DeviceStatus, DeviceStatusView, LockResult};
