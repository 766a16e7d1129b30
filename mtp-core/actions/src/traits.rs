//! 设备操作抽象接口

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::Result;

/// 屏幕坐标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// 元素定位方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    #[default]
    Id,
    Text,
    Xpath,
    AccessibilityId,
    ClassName,
}

/// 元素选择器
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector {
    #[serde(default)]
    pub by: SelectorKind,
    pub value: String,
}

impl Selector {
    pub fn id(value: impl Into<String>) -> Self {
        Self {
            by: SelectorKind::Id,
            value: value.into(),
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self {
            by: SelectorKind::Text,
            value: value.into(),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}={}", self.by, self.value)
    }
}

/// 图像模板 (交给外部匹配引擎)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageTemplate {
    /// 模板 ID 或路径
    pub template: String,

    /// 匹配阈值 (默认: 0.8)
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

fn default_threshold() -> f32 {
    0.8
}

impl ImageTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            threshold: default_threshold(),
        }
    }
}

/// 单台设备的操作能力
///
/// 所有方法都可能返回 [`crate::ActionError`]，执行器会对错误消息做分类。
/// 轮询等待 (等待元素出现/消失等) 由执行器基于查询方法实现，
/// 以便在每个轮询周期检查取消信号。
#[async_trait]
pub trait DeviceActions: Send + Sync {
    /// 设备 ID
    fn device_id(&self) -> &str;

    async fn tap(&self, point: Point) -> Result<()>;

    async fn double_tap(&self, point: Point) -> Result<()>;

    async fn long_press(&self, point: Point, duration_ms: u64) -> Result<()>;

    async fn swipe(&self, from: Point, to: Point, duration_ms: u64) -> Result<()>;

    async fn input_text(&self, text: &str) -> Result<()>;

    async fn clear_text(&self) -> Result<()>;

    /// 按键 (back / home / enter 等)
    async fn press_key(&self, key: &str) -> Result<()>;

    async fn tap_element(&self, selector: &Selector) -> Result<()>;

    async fn element_exists(&self, selector: &Selector) -> Result<bool>;

    async fn element_text(&self, selector: &Selector) -> Result<Option<String>>;

    /// 屏幕是否包含文本 (OCR)
    async fn screen_contains_text(&self, text: &str) -> Result<bool>;

    /// 查找文本位置 (OCR)
    async fn find_text(&self, text: &str) -> Result<Option<Point>>;

    /// 查找图像位置 (模板匹配)
    async fn find_image(&self, template: &ImageTemplate) -> Result<Option<Point>>;

    async fn launch_app(&self, package: &str) -> Result<()>;

    async fn terminate_app(&self, package: &str) -> Result<()>;

    async fn clear_app_data(&self, package: &str) -> Result<()>;

    async fn is_app_running(&self, package: &str) -> Result<bool>;

    /// 截图 (PNG 字节)
    async fn screenshot(&self) -> Result<Vec<u8>>;

    /// 停止信号：之后的操作尽快返回 [`crate::ActionError::Stopped`]
    async fn stop(&self);

    /// 清除停止信号和会话内的临时状态
    async fn reset(&self);
}

/// 设备操作提供者
#[async_trait]
pub trait ActionsProvider: Send + Sync {
    /// 获取设备的操作句柄 (必要时创建会话)
    async fn get_actions(&self, device_id: &str) -> Result<Arc<dyn DeviceActions>>;
}
