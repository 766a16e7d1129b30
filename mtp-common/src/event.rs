//! 事件总线
//!
//! 各服务通过 [`EventBus`] 向观察者 (实时通道、CLI、测试) 广播状态变化。
//! 投递是尽力而为的：没有订阅者或订阅者落后时事件直接丢弃，不会阻塞发布方。

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::types::{
    DeviceLock, DeviceProgress, ExecutionStatus, QueuedTest, WaitingInfo,
};

/// 默认事件缓冲容量
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// 平台事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum PlatformEvent {
    /// 设备锁表变化
    DeviceLocksUpdated { locks: Vec<DeviceLock> },

    /// 队列变化
    QueueUpdated { queue: Vec<QueuedTest> },

    /// 发给单个提交者的队列位置通知
    QueuePosition {
        queue_id: String,
        user_name: String,
        socket_id: String,
        position: usize,
        estimated_wait_ms: u64,
        waiting_info: Option<WaitingInfo>,
    },

    /// 排队项被自动调度
    QueueAutoStart {
        queue_id: String,
        execution_id: String,
        user_name: String,
        socket_id: String,
        device_ids: Vec<String>,
    },

    /// 设备开始执行
    DeviceStart {
        execution_id: String,
        device_id: String,
        total_scenarios: usize,
    },

    /// 设备上某个场景开始
    DeviceScenarioStart {
        execution_id: String,
        device_id: String,
        scenario_id: String,
        scenario_name: String,
        index: usize,
        repeat_index: u32,
    },

    /// 设备上某个场景结束
    DeviceScenarioComplete {
        execution_id: String,
        device_id: String,
        scenario_id: String,
        passed: bool,
        duration_ms: u64,
        error: Option<String>,
    },

    /// 设备执行结束
    DeviceComplete {
        execution_id: String,
        device_id: String,
        success: bool,
        progress: DeviceProgress,
    },

    /// 执行进度
    TestProgress {
        execution_id: String,
        device_id: String,
        progress: DeviceProgress,
    },

    /// 整个执行结束
    TestComplete {
        execution_id: String,
        queue_id: String,
        status: ExecutionStatus,
        success_count: usize,
        failed_count: usize,
        skipped_count: usize,
    },
}

impl PlatformEvent {
    /// 事件名称 (实时通道使用的名称)
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeviceLocksUpdated { .. } => "device:locks_updated",
            Self::QueueUpdated { .. } => "queue:updated",
            Self::QueuePosition { .. } => "queue:position",
            Self::QueueAutoStart { .. } => "queue:auto_start",
            Self::DeviceStart { .. } => "test:device:start",
            Self::DeviceScenarioStart { .. } => "test:device:scenario_start",
            Self::DeviceScenarioComplete { .. } => "test:device:scenario_complete",
            Self::DeviceComplete { .. } => "test:device:complete",
            Self::TestProgress { .. } => "test:progress",
            Self::TestComplete { .. } => "test:complete",
        }
    }

    /// 仅发给某个连接的事件返回其 socket ID
    pub fn target_socket(&self) -> Option<&str> {
        match self {
            Self::QueuePosition { socket_id, .. } | Self::QueueAutoStart { socket_id, .. } => {
                Some(socket_id)
            }
            _ => None,
        }
    }
}

/// 事件总线
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PlatformEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 发布事件 (没有订阅者时静默丢弃)
    pub fn publish(&self, event: PlatformEvent) {
        let name = event.name();
        if self.sender.send(event).is_err() {
            debug!("事件 {} 没有订阅者", name);
        }
    }

    /// 订阅所有事件
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            names: None,
        }
    }

    /// 只订阅指定名称的事件
    pub fn subscribe_to(&self, names: &[&'static str]) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            names: Some(names.to_vec()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 事件订阅者
pub struct EventReceiver {
    receiver: broadcast::Receiver<PlatformEvent>,
    names: Option<Vec<&'static str>>,
}

impl EventReceiver {
    /// 接收下一个事件，总线关闭时返回 None
    ///
    /// 订阅者落后导致的丢失只记录警告，继续接收后续事件。
    pub async fn recv(&mut self) -> Option<PlatformEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("事件订阅者落后，丢弃 {} 个事件", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// 非阻塞地取出当前已缓冲的事件
    pub fn try_recv(&mut self) -> Option<PlatformEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("事件订阅者落后，丢弃 {} 个事件", skipped);
                }
                Err(_) => return None,
            }
        }
    }

    fn accepts(&self, event: &PlatformEvent) -> bool {
        match &self.names {
            Some(names) => names.contains(&event.name()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let event = PlatformEvent::DeviceLocksUpdated { locks: vec![] };
        assert_eq!(event.name(), "device:locks_updated");
        let event = PlatformEvent::QueueUpdated { queue: vec![] };
        assert_eq!(event.name(), "queue:updated");
        assert!(event.target_socket().is_none());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(PlatformEvent::QueueUpdated { queue: vec![] });
    }

    #[tokio::test]
    async fn test_subscribe_to_filters_by_name() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(&["queue:updated"]);

        bus.publish(PlatformEvent::DeviceLocksUpdated { locks: vec![] });
        bus.publish(PlatformEvent::QueueUpdated { queue: vec![] });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "queue:updated");
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_receiving() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(PlatformEvent::QueueUpdated { queue: vec![] });
        }
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = PlatformEvent::QueuePosition {
            queue_id: "q1".to_string(),
            user_name: "alice".to_string(),
            socket_id: "s1".to_string(),
            position: 1,
            estimated_wait_ms: 1000,
            waiting_info: None,
        };
        assert_eq!(event.target_socket(), Some("s1"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "queue_position");
        assert_eq!(json["payload"]["position"], 1);
    }
}
