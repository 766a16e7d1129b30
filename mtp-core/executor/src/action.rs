//! 场景动作与条件定义

use mtp_actions::{ImageTemplate, Selector};
use serde::{Deserialize, Serialize};

/// 动作类型
///
/// 省略 `package` 的应用类动作作用于场景所属应用包。
/// 带 `timeout_ms` 的动作会轮询等待，未指定时使用执行器的默认等待超时。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    // ========================================
    // 触控与输入
    // ========================================
    /// 点击坐标
    Tap { x: i32, y: i32 },

    /// 双击坐标
    DoubleTap { x: i32, y: i32 },

    /// 长按坐标
    LongPress {
        x: i32,
        y: i32,
        #[serde(default = "default_long_press_ms")]
        duration_ms: u64,
    },

    /// 滑动
    Swipe {
        from_x: i32,
        from_y: i32,
        to_x: i32,
        to_y: i32,
        #[serde(default = "default_swipe_ms")]
        duration_ms: u64,
    },

    /// 输入文本
    InputText { text: String },

    /// 清空输入框
    ClearText,

    /// 按键
    PressKey { key: String },

    /// 返回键
    Back,

    /// 主页键
    Home,

    /// 固定等待
    Wait { duration_ms: u64 },

    // ========================================
    // 元素 / 文本 / 图像
    // ========================================
    /// 点击元素 (先等待元素出现)
    TapElement {
        selector: Selector,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// 点击屏幕上的文本 (先等待文本出现)
    TapText {
        text: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// 点击匹配到的图像 (先等待图像出现)
    TapImage {
        image: ImageTemplate,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// 等待元素出现
    WaitUntilExists {
        selector: Selector,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// 等待元素消失
    WaitUntilGone {
        selector: Selector,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// 等待文本出现
    WaitUntilText {
        text: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// 等待文本消失
    WaitUntilTextGone {
        text: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// 等待图像出现
    WaitUntilImage {
        image: ImageTemplate,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// 等待图像消失
    WaitUntilImageGone {
        image: ImageTemplate,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    // ========================================
    // 应用生命周期
    // ========================================
    /// 启动应用
    LaunchApp {
        #[serde(default)]
        package: Option<String>,
    },

    /// 结束应用
    TerminateApp {
        #[serde(default)]
        package: Option<String>,
    },

    /// 重启应用
    RestartApp {
        #[serde(default)]
        package: Option<String>,
    },

    /// 清除应用数据
    ClearAppData {
        #[serde(default)]
        package: Option<String>,
    },

    // ========================================
    // 断言
    // ========================================
    /// 断言元素存在
    AssertExists { selector: Selector },

    /// 断言元素不存在
    AssertNotExists { selector: Selector },

    /// 断言元素文本
    AssertText {
        selector: Selector,
        expected: String,
        /// 为 true 时只要求包含
        #[serde(default)]
        contains: bool,
    },

    /// 断言屏幕上可见某段文本
    AssertTextVisible { text: String },

    /// 断言应用正在运行
    AssertAppRunning {
        #[serde(default)]
        package: Option<String>,
    },

    /// 截图 (结果以 base64 写入步骤输出)
    Screenshot,
}

fn default_long_press_ms() -> u64 {
    1_000
}

fn default_swipe_ms() -> u64 {
    300
}

impl Action {
    /// 动作是否会轮询等待，返回其显式指定的超时
    pub fn wait_timeout_ms(&self) -> Option<Option<u64>> {
        match self {
            Action::TapElement { timeout_ms, .. }
            | Action::TapText { timeout_ms, .. }
            | Action::TapImage { timeout_ms, .. }
            | Action::WaitUntilExists { timeout_ms, .. }
            | Action::WaitUntilGone { timeout_ms, .. }
            | Action::WaitUntilText { timeout_ms, .. }
            | Action::WaitUntilTextGone { timeout_ms, .. }
            | Action::WaitUntilImage { timeout_ms, .. }
            | Action::WaitUntilImageGone { timeout_ms, .. } => Some(*timeout_ms),
            _ => None,
        }
    }

    /// 步骤描述 (用于报告和日志)
    pub fn describe(&self) -> String {
        match self {
            Action::Tap { x, y } => format!("点击 ({}, {})", x, y),
            Action::DoubleTap { x, y } => format!("双击 ({}, {})", x, y),
            Action::LongPress { x, y, duration_ms } => {
                format!("长按 ({}, {}) {}ms", x, y, duration_ms)
            }
            Action::Swipe {
                from_x,
                from_y,
                to_x,
                to_y,
                ..
            } => format!("滑动 ({}, {}) -> ({}, {})", from_x, from_y, to_x, to_y),
            Action::InputText { text } => format!("输入文本: {}", text),
            Action::ClearText => "清空输入".to_string(),
            Action::PressKey { key } => format!("按键: {}", key),
            Action::Back => "返回".to_string(),
            Action::Home => "主页".to_string(),
            Action::Wait { duration_ms } => format!("等待 {}ms", duration_ms),
            Action::TapElement { selector, .. } => format!("点击元素: {}", selector),
            Action::TapText { text, .. } => format!("点击文本: {}", text),
            Action::TapImage { image, .. } => format!("点击图像: {}", image.template),
            Action::WaitUntilExists { selector, .. } => format!("等待元素出现: {}", selector),
            Action::WaitUntilGone { selector, .. } => format!("等待元素消失: {}", selector),
            Action::WaitUntilText { text, .. } => format!("等待文本出现: {}", text),
            Action::WaitUntilTextGone { text, .. } => format!("等待文本消失: {}", text),
            Action::WaitUntilImage { image, .. } => format!("等待图像出现: {}", image.template),
            Action::WaitUntilImageGone { image, .. } => {
                format!("等待图像消失: {}", image.template)
            }
            Action::LaunchApp { package } => format!("启动应用: {}", package_label(package)),
            Action::TerminateApp { package } => format!("结束应用: {}", package_label(package)),
            Action::RestartApp { package } => format!("重启应用: {}", package_label(package)),
            Action::ClearAppData { package } => {
                format!("清除应用数据: {}", package_label(package))
            }
            Action::AssertExists { selector } => format!("断言元素存在: {}", selector),
            Action::AssertNotExists { selector } => format!("断言元素不存在: {}", selector),
            Action::AssertText {
                selector, expected, ..
            } => format!("断言元素文本: {} == {}", selector, expected),
            Action::AssertTextVisible { text } => format!("断言文本可见: {}", text),
            Action::AssertAppRunning { package } => {
                format!("断言应用运行: {}", package_label(package))
            }
            Action::Screenshot => "截图".to_string(),
        }
    }
}

fn package_label(package: &Option<String>) -> &str {
    package.as_deref().unwrap_or("<场景应用>")
}

/// 条件节点的判断项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// 元素存在
    ElementExists { selector: Selector },

    /// 屏幕上存在文本
    TextExists { text: String },

    /// 屏幕上匹配到图像
    ImageExists { image: ImageTemplate },

    /// 应用正在运行
    AppRunning {
        #[serde(default)]
        package: Option<String>,
    },
}

impl Condition {
    pub fn describe(&self) -> String {
        match self {
            Condition::ElementExists { selector } => format!("元素存在: {}", selector),
            Condition::TextExists { text } => format!("文本存在: {}", text),
            Condition::ImageExists { image } => format!("图像存在: {}", image.template),
            Condition::AppRunning { package } => {
                format!("应用运行中: {}", package_label(package))
            }
        }
    }
}
