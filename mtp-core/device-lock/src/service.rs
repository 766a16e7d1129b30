//! 设备锁服务

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use mtp_common::{DeviceLock, EventBus, PlatformEvent};

/// 批量加锁结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResult {
    pub success: bool,

    /// 冲突的设备 (失败时非空)
    #[serde(default)]
    pub busy_devices: Vec<String>,
}

/// 设备对当前用户的可用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Available,
    /// 被当前用户占用
    BusyMine,
    /// 被其他用户占用
    BusyOther,
}

/// 设备状态视图 (UI 投影)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatusView {
    pub device_id: String,
    pub device_name: String,
    pub status: DeviceStatus,
    #[serde(default)]
    pub lock: Option<DeviceLock>,
}

/// 设备锁服务
pub struct DeviceLockService {
    /// 设备 ID -> 锁
    locks: Arc<RwLock<HashMap<String, DeviceLock>>>,

    /// 状态广播
    events: EventBus,
}

impl DeviceLockService {
    /// 创建新的设备锁服务
    pub fn new(events: EventBus) -> Self {
        Self {
            locks: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// 批量加锁
    ///
    /// 任意一个设备已被锁定时整体失败并返回冲突的设备，不会留下部分锁。
    pub async fn lock_devices(
        &self,
        device_ids: &[String],
        execution_id: &str,
        user: &str,
        test_name: &str,
    ) -> LockResult {
        let snapshot = {
            let mut locks = self.locks.write().await;

            let busy_devices: Vec<String> = device_ids
                .iter()
                .filter(|id| locks.contains_key(id.as_str()))
                .cloned()
                .collect();

            if !busy_devices.is_empty() {
                debug!(
                    "加锁失败: execution={}, 冲突设备 {:?}",
                    execution_id, busy_devices
                );
                return LockResult {
                    success: false,
                    busy_devices,
                };
            }

            let locked_at = Utc::now();
            for device_id in device_ids {
                locks.insert(
                    device_id.clone(),
                    DeviceLock {
                        device_id: device_id.clone(),
                        execution_id: execution_id.to_string(),
                        locked_by: user.to_string(),
                        locked_at,
                        test_name: test_name.to_string(),
                    },
                );
            }

            Self::sorted(&locks)
        };

        info!(
            "设备已锁定: {:?} (execution={}, user={})",
            device_ids, execution_id, user
        );
        self.broadcast(snapshot);

        LockResult {
            success: true,
            busy_devices: Vec::new(),
        }
    }

    /// 批量解锁 (幂等)
    pub async fn unlock_devices(&self, device_ids: &[String]) -> Vec<String> {
        let (released, snapshot) = {
            let mut locks = self.locks.write().await;
            let released: Vec<String> = device_ids
                .iter()
                .filter(|id| locks.remove(id.as_str()).is_some())
                .cloned()
                .collect();
            (released, Self::sorted(&locks))
        };

        if !released.is_empty() {
            info!("设备已解锁: {:?}", released);
        }
        self.broadcast(snapshot);
        released
    }

    /// 解锁单个设备
    ///
    /// 设备被其他执行持有时不做任何操作 (防止过期回调误解锁)。
    pub async fn unlock_device(&self, device_id: &str, execution_id: &str) -> bool {
        let snapshot = {
            let mut locks = self.locks.write().await;
            match locks.get(device_id) {
                Some(lock) if lock.execution_id == execution_id => {
                    locks.remove(device_id);
                }
                Some(lock) => {
                    warn!(
                        "忽略解锁请求: 设备 {} 属于 execution={}，请求方 execution={}",
                        device_id, lock.execution_id, execution_id
                    );
                    return false;
                }
                None => return false,
            }
            Self::sorted(&locks)
        };

        info!("设备已解锁: {} (execution={})", device_id, execution_id);
        self.broadcast(snapshot);
        true
    }

    /// 释放某个执行持有的全部设备
    pub async fn unlock_by_execution_id(&self, execution_id: &str) -> Vec<String> {
        let (mut released, snapshot) = {
            let mut locks = self.locks.write().await;
            let released: Vec<String> = locks
                .values()
                .filter(|lock| lock.execution_id == execution_id)
                .map(|lock| lock.device_id.clone())
                .collect();
            for device_id in &released {
                locks.remove(device_id);
            }
            (released, Self::sorted(&locks))
        };

        released.sort();
        if !released.is_empty() {
            info!("执行 {} 释放设备: {:?}", execution_id, released);
        }
        self.broadcast(snapshot);
        released
    }

    /// 返回给定设备中已被锁定的部分
    pub async fn get_busy_devices(&self, device_ids: &[String]) -> Vec<String> {
        let locks = self.locks.read().await;
        device_ids
            .iter()
            .filter(|id| locks.contains_key(id.as_str()))
            .cloned()
            .collect()
    }

    /// 返回给定设备中空闲的部分
    pub async fn get_available_devices(&self, device_ids: &[String]) -> Vec<String> {
        let locks = self.locks.read().await;
        device_ids
            .iter()
            .filter(|id| !locks.contains_key(id.as_str()))
            .cloned()
            .collect()
    }

    pub async fn is_device_busy(&self, device_id: &str) -> bool {
        self.locks.read().await.contains_key(device_id)
    }

    pub async fn get_lock(&self, device_id: &str) -> Option<DeviceLock> {
        self.locks.read().await.get(device_id).cloned()
    }

    /// 所有锁 (按设备 ID 排序)
    pub async fn get_all_locks(&self) -> Vec<DeviceLock> {
        Self::sorted(&*self.locks.read().await)
    }

    /// 当前所有繁忙设备的集合
    pub async fn busy_device_set(&self) -> HashSet<String> {
        self.locks.read().await.keys().cloned().collect()
    }

    /// 设备状态视图
    pub async fn get_device_statuses(
        &self,
        all_device_ids: &[String],
        device_names: &HashMap<String, String>,
        current_user: &str,
    ) -> Vec<DeviceStatusView> {
        let locks = self.locks.read().await;
        all_device_ids
            .iter()
            .map(|device_id| {
                let lock = locks.get(device_id).cloned();
                let status = match &lock {
                    None => DeviceStatus::Available,
                    Some(lock) if lock.locked_by == current_user => DeviceStatus::BusyMine,
                    Some(_) => DeviceStatus::BusyOther,
                };
                DeviceStatusView {
                    device_id: device_id.clone(),
                    device_name: device_names
                        .get(device_id)
                        .cloned()
                        .unwrap_or_else(|| device_id.clone()),
                    status,
                    lock,
                }
            })
            .collect()
    }

    /// 清空所有锁 (服务重启)
    pub async fn reset(&self) {
        let cleared = {
            let mut locks = self.locks.write().await;
            let count = locks.len();
            locks.clear();
            count
        };
        info!("设备锁已重置，清除 {} 个锁", cleared);
        self.broadcast(Vec::new());
    }

    fn sorted(locks: &HashMap<String, DeviceLock>) -> Vec<DeviceLock> {
        let mut all: Vec<DeviceLock> = locks.values().cloned().collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    fn broadcast(&self, locks: Vec<DeviceLock>) {
        self.events
            .publish(PlatformEvent::DeviceLocksUpdated { locks });
    }
}
