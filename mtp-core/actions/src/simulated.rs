//! 模拟设备
//!
//! 内存中的屏幕模型 (可见元素、文本、图像、运行中的应用)，实现 [`DeviceActions`]。
//! CLI 的本地演练和各 crate 的测试都使用它代替真实驱动。

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info};

use crate::{
    ActionError, ActionsProvider, DeviceActions, ImageTemplate, Point, Result, Selector,
};

/// 模拟屏幕中心 (宽松模式下查询命中的位置)
const SCREEN_CENTER: Point = Point { x: 540, y: 960 };

#[derive(Debug, Default)]
struct ScreenState {
    /// 可见元素 -> 元素文本
    elements: HashMap<Selector, String>,
    /// 可见文本 -> 位置
    texts: HashMap<String, Point>,
    /// 可见图像模板 -> 位置
    images: HashMap<String, Point>,
    /// 宽松模式下显式隐藏的元素/文本/图像
    hidden: HashSet<String>,
    running_apps: HashSet<String>,
    foreground_app: Option<String>,
    input_buffer: String,
    /// 注入的失败 (操作名 -> 错误)
    failures: HashMap<String, ActionError>,
}

/// 模拟设备
pub struct SimulatedDevice {
    device_id: String,
    /// 宽松模式：未显式隐藏的查询一律命中
    permissive: bool,
    latency: Duration,
    state: RwLock<ScreenState>,
    stopped: AtomicBool,
    paused: watch::Sender<bool>,
    action_log: Mutex<Vec<String>>,
}

impl SimulatedDevice {
    /// 创建严格模式的模拟设备 (屏幕初始为空)
    pub fn new(device_id: impl Into<String>) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            device_id: device_id.into(),
            permissive: false,
            latency: Duration::ZERO,
            state: RwLock::new(ScreenState::default()),
            stopped: AtomicBool::new(false),
            paused,
            action_log: Mutex::new(Vec::new()),
        }
    }

    /// 创建宽松模式的模拟设备
    pub fn permissive(device_id: impl Into<String>) -> Self {
        Self {
            permissive: true,
            ..Self::new(device_id)
        }
    }

    /// 设置每个操作的模拟延迟
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn show_element(&self, selector: Selector, text: impl Into<String>) {
        let mut state = self.state.write().await;
        state.hidden.remove(&selector.value);
        state.elements.insert(selector, text.into());
    }

    pub async fn hide_element(&self, selector: &Selector) {
        let mut state = self.state.write().await;
        state.elements.remove(selector);
        state.hidden.insert(selector.value.clone());
    }

    pub async fn show_text(&self, text: impl Into<String>, at: Point) {
        let text = text.into();
        let mut state = self.state.write().await;
        state.hidden.remove(&text);
        state.texts.insert(text, at);
    }

    pub async fn hide_text(&self, text: &str) {
        let mut state = self.state.write().await;
        state.texts.remove(text);
        state.hidden.insert(text.to_string());
    }

    pub async fn show_image(&self, template: impl Into<String>, at: Point) {
        let template = template.into();
        let mut state = self.state.write().await;
        state.hidden.remove(&template);
        state.images.insert(template, at);
    }

    pub async fn hide_image(&self, template: &str) {
        let mut state = self.state.write().await;
        state.images.remove(template);
        state.hidden.insert(template.to_string());
    }

    /// 注入失败：之后对该操作的调用返回给定错误
    pub async fn fail_on(&self, operation: &str, error: ActionError) {
        self.state
            .write()
            .await
            .failures
            .insert(operation.to_string(), error);
    }

    pub async fn clear_failures(&self) {
        self.state.write().await.failures.clear();
    }

    /// 暂停：之后的操作阻塞直到 [`Self::resume`] 或停止
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// 已执行的操作记录
    pub async fn action_log(&self) -> Vec<String> {
        self.action_log.lock().await.clone()
    }

    pub async fn input_buffer(&self) -> String {
        self.state.read().await.input_buffer.clone()
    }

    pub async fn foreground_app(&self) -> Option<String> {
        self.state.read().await.foreground_app.clone()
    }

    /// 每个操作的公共前置：停止检查、暂停等待、延迟、失败注入、记录
    async fn begin(&self, operation: &str, detail: String) -> Result<()> {
        self.wait_if_paused().await?;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.is_stopped() {
            return Err(ActionError::Stopped);
        }

        if let Some(error) = self.state.read().await.failures.get(operation) {
            debug!("[{}] 注入失败: {} -> {}", self.device_id, operation, error);
            return Err(error.clone());
        }

        let entry = if detail.is_empty() {
            operation.to_string()
        } else {
            format!("{}:{}", operation, detail)
        };
        self.action_log.lock().await.push(entry);
        Ok(())
    }

    async fn wait_if_paused(&self) -> Result<()> {
        let mut rx = self.paused.subscribe();
        loop {
            if self.is_stopped() {
                return Err(ActionError::Stopped);
            }
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    fn is_hidden(state: &ScreenState, key: &str) -> bool {
        state.hidden.contains(key)
    }
}

#[async_trait]
impl DeviceActions for SimulatedDevice {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn tap(&self, point: Point) -> Result<()> {
        self.begin("tap", format!("{},{}", point.x, point.y)).await
    }

    async fn double_tap(&self, point: Point) -> Result<()> {
        self.begin("double_tap", format!("{},{}", point.x, point.y))
            .await
    }

    async fn long_press(&self, point: Point, duration_ms: u64) -> Result<()> {
        self.begin(
            "long_press",
            format!("{},{},{}ms", point.x, point.y, duration_ms),
        )
        .await
    }

    async fn swipe(&self, from: Point, to: Point, duration_ms: u64) -> Result<()> {
        self.begin(
            "swipe",
            format!("{},{}->{},{},{}ms", from.x, from.y, to.x, to.y, duration_ms),
        )
        .await
    }

    async fn input_text(&self, text: &str) -> Result<()> {
        self.begin("input_text", text.to_string()).await?;
        self.state.write().await.input_buffer.push_str(text);
        Ok(())
    }

    async fn clear_text(&self) -> Result<()> {
        self.begin("clear_text", String::new()).await?;
        self.state.write().await.input_buffer.clear();
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        self.begin("press_key", key.to_string()).await
    }

    async fn tap_element(&self, selector: &Selector) -> Result<()> {
        self.begin("tap_element", selector.value.clone()).await?;
        if self.element_exists(selector).await? {
            Ok(())
        } else {
            Err(ActionError::ElementNotFound(selector.to_string()))
        }
    }

    async fn element_exists(&self, selector: &Selector) -> Result<bool> {
        self.wait_if_paused().await?;
        let state = self.state.read().await;
        if let Some(error) = state.failures.get("element_exists") {
            return Err(error.clone());
        }
        Ok(state.elements.contains_key(selector)
            || (self.permissive && !Self::is_hidden(&state, &selector.value)))
    }

    async fn element_text(&self, selector: &Selector) -> Result<Option<String>> {
        self.wait_if_paused().await?;
        let state = self.state.read().await;
        Ok(state.elements.get(selector).cloned())
    }

    async fn screen_contains_text(&self, text: &str) -> Result<bool> {
        Ok(self.find_text(text).await?.is_some())
    }

    async fn find_text(&self, text: &str) -> Result<Option<Point>> {
        self.wait_if_paused().await?;
        let state = self.state.read().await;
        if let Some(error) = state.failures.get("find_text") {
            return Err(error.clone());
        }
        if let Some(point) = state.texts.get(text) {
            return Ok(Some(*point));
        }
        let in_element = state.elements.values().any(|value| value.contains(text));
        if in_element {
            return Ok(Some(SCREEN_CENTER));
        }
        if self.permissive && !Self::is_hidden(&state, text) {
            return Ok(Some(SCREEN_CENTER));
        }
        Ok(None)
    }

    async fn find_image(&self, template: &ImageTemplate) -> Result<Option<Point>> {
        self.wait_if_paused().await?;
        let state = self.state.read().await;
        if let Some(error) = state.failures.get("find_image") {
            return Err(error.clone());
        }
        if let Some(point) = state.images.get(&template.template) {
            return Ok(Some(*point));
        }
        if self.permissive && !Self::is_hidden(&state, &template.template) {
            return Ok(Some(SCREEN_CENTER));
        }
        Ok(None)
    }

    async fn launch_app(&self, package: &str) -> Result<()> {
        self.begin("launch_app", package.to_string()).await?;
        let mut state = self.state.write().await;
        state.running_apps.insert(package.to_string());
        state.foreground_app = Some(package.to_string());
        info!("[{}] 启动应用: {}", self.device_id, package);
        Ok(())
    }

    async fn terminate_app(&self, package: &str) -> Result<()> {
        self.begin("terminate_app", package.to_string()).await?;
        let mut state = self.state.write().await;
        state.running_apps.remove(package);
        if state.foreground_app.as_deref() == Some(package) {
            state.foreground_app = None;
        }
        Ok(())
    }

    async fn clear_app_data(&self, package: &str) -> Result<()> {
        self.begin("clear_app_data", package.to_string()).await
    }

    async fn is_app_running(&self, package: &str) -> Result<bool> {
        self.wait_if_paused().await?;
        let state = self.state.read().await;
        Ok(state.running_apps.contains(package)
            || (self.permissive && !Self::is_hidden(&state, package)))
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        if self.is_stopped() {
            return Err(ActionError::Stopped);
        }
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.extend_from_slice(self.device_id.as_bytes());
        Ok(bytes)
    }

    async fn stop(&self) {
        info!("[{}] 收到停止信号", self.device_id);
        self.stopped.store(true, Ordering::SeqCst);
        // 唤醒暂停中的操作
        self.paused.send_modify(|_| {});
    }

    async fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        let mut state = self.state.write().await;
        state.input_buffer.clear();
    }
}

/// 模拟设备提供者
pub struct SimulatedProvider {
    devices: RwLock<HashMap<String, Arc<SimulatedDevice>>>,
    /// 未注册的设备是否自动创建 (宽松模式)
    auto_create: bool,
    latency: Duration,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProvider {
    /// 只提供显式注册的设备
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            auto_create: false,
            latency: Duration::ZERO,
        }
    }

    /// 按需自动创建宽松模式设备 (本地演练使用)
    pub fn permissive(latency: Duration) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            auto_create: true,
            latency,
        }
    }

    /// 注册严格模式设备
    pub async fn add_device(&self, device_id: &str) -> Arc<SimulatedDevice> {
        let device = Arc::new(SimulatedDevice::new(device_id).with_latency(self.latency));
        self.devices
            .write()
            .await
            .insert(device_id.to_string(), Arc::clone(&device));
        device
    }

    pub async fn device(&self, device_id: &str) -> Option<Arc<SimulatedDevice>> {
        self.devices.read().await.get(device_id).cloned()
    }
}

#[async_trait]
impl ActionsProvider for SimulatedProvider {
    async fn get_actions(&self, device_id: &str) -> Result<Arc<dyn DeviceActions>> {
        if let Some(device) = self.devices.read().await.get(device_id) {
            return Ok(Arc::clone(device) as Arc<dyn DeviceActions>);
        }

        if !self.auto_create {
            return Err(ActionError::DeviceNotFound(device_id.to_string()));
        }

        let mut devices = self.devices.write().await;
        let device = devices
            .entry(device_id.to_string())
            .or_insert_with(|| {
                debug!("自动创建模拟设备: {}", device_id);
                Arc::new(SimulatedDevice::permissive(device_id).with_latency(self.latency))
            })
            .clone();
        Ok(device as Arc<dyn DeviceActions>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_strict_device_queries() {
        let device = SimulatedDevice::new("D1");
        let selector = Selector::id("login");
        assert!(!device.element_exists(&selector).await.unwrap());

        device.show_element(selector.clone(), "登录").await;
        assert!(device.element_exists(&selector).await.unwrap());
        assert!(device.screen_contains_text("登录").await.unwrap());
        assert!(device.tap_element(&selector).await.is_ok());

        device.hide_element(&selector).await;
        assert!(matches!(
            device.tap_element(&selector).await,
            Err(ActionError::ElementNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_permissive_device_hits_unless_hidden() {
        let device = SimulatedDevice::permissive("D1");
        let template = ImageTemplate::new("ok.png");
        assert_eq!(device.find_image(&template).await.unwrap(), Some(SCREEN_CENTER));
        device.hide_image("ok.png").await;
        assert_eq!(device.find_image(&template).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let device = SimulatedDevice::new("D1");
        device
            .fail_on("tap", ActionError::Session("session expired".to_string()))
            .await;
        let err = device.tap(Point::new(1, 2)).await.unwrap_err();
        assert!(err.to_string().contains("session expired"));

        device.clear_failures().await;
        assert!(device.tap(Point::new(1, 2)).await.is_ok());
        assert_eq!(device.action_log().await, vec!["tap:1,2".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_releases_paused_action() {
        let device = Arc::new(SimulatedDevice::new("D1"));
        device.pause();

        let worker = Arc::clone(&device);
        let handle = tokio::spawn(async move { worker.tap(Point::new(0, 0)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        device.stop().await;
        let result = handle.await.unwrap();
        assert_eq!(result, Err(ActionError::Stopped));

        device.reset().await;
        device.resume();
        assert!(device.tap(Point::new(0, 0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_app_lifecycle() {
        let device = SimulatedDevice::new("D1");
        device.launch_app("com.example.app").await.unwrap();
        assert!(device.is_app_running("com.example.app").await.unwrap());
        assert_eq!(
            device.foreground_app().await.as_deref(),
            Some("com.example.app")
        );
        device.terminate_app("com.example.app").await.unwrap();
        assert!(!device.is_app_running("com.example.app").await.unwrap());
    }

    #[tokio::test]
    async fn test_provider_strict_and_permissive() {
        let strict = SimulatedProvider::new();
        assert!(matches!(
            strict.get_actions("D1").await,
            Err(ActionError::DeviceNotFound(_))
        ));
        strict.add_device("D1").await;
        assert_eq!(strict.get_actions("D1").await.unwrap().device_id(), "D1");

        let permissive = SimulatedProvider::permissive(Duration::ZERO);
        let actions = permissive.get_actions("D9").await.unwrap();
        assert!(actions.element_exists(&Selector::id("any")).await.unwrap());
        assert!(permissive.device("D9").await.is_some());
    }
}
