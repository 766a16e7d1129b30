//! 场景图执行器

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mtp_actions::{ActionError, DeviceActions, ImageTemplate, Point, Selector};

use crate::{
    classify_failure, Action, Branch, Condition, ExecutorConfig, FailureType, LoopMode, Node,
    NodeKind, Scenario, ScenarioQueueItem, ScenarioReport, StepReport, StepStatus,
};

/// 步骤失败
#[derive(Debug)]
enum StepError {
    /// 断言或等待未满足
    Failed(String),
    /// 驱动异常
    Error(String),
    Cancelled,
}

impl From<ActionError> for StepError {
    fn from(e: ActionError) -> Self {
        match e {
            ActionError::Stopped => StepError::Cancelled,
            ActionError::ElementNotFound(_)
            | ActionError::ImageNotMatched(_)
            | ActionError::AppNotRunning(_) => StepError::Failed(e.to_string()),
            _ => StepError::Error(e.to_string()),
        }
    }
}

type StepResult<T> = std::result::Result<T, StepError>;

/// 场景级失败 (不对应某个步骤)
type WalkError = (String, FailureType);

/// 进行中的循环
struct LoopFrame {
    node_id: String,
    iteration: u32,
    /// 进入循环时的已访问集合，每轮开始时恢复
    visited: HashSet<String>,
}

/// 场景图执行器
///
/// 在一台设备上执行一个场景：从 `start` 节点出发逐节点前进，
/// 任何步骤失败即中止场景，重复访问节点视为循环错误 (循环节点的新一轮除外)。
pub struct ScenarioGraphRunner {
    actions: Arc<dyn DeviceActions>,
    config: ExecutorConfig,
    token: CancellationToken,
}

impl ScenarioGraphRunner {
    pub fn new(
        actions: Arc<dyn DeviceActions>,
        config: ExecutorConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            actions,
            config,
            token,
        }
    }

    fn device_id(&self) -> &str {
        self.actions.device_id()
    }

    /// 执行场景
    pub async fn run(&self, scenario: &Scenario, item: &ScenarioQueueItem) -> ScenarioReport {
        let start_time = Instant::now();
        let mut report = ScenarioReport::new(&scenario.id, &scenario.name, item.repeat_index);

        info!(
            "[{}] 开始执行场景: {} (第 {} 轮)",
            self.device_id(),
            scenario.name,
            item.repeat_index
        );

        if let Err((message, failure_type)) = self
            .walk(scenario, item.app_package.as_deref(), &mut report)
            .await
        {
            warn!("[{}] 场景 {} 中止: {}", self.device_id(), scenario.name, message);
            report.fail(&message, failure_type);
        }

        report.duration_ms = start_time.elapsed().as_millis() as u64;

        info!(
            "[{}] 场景执行完成: {} - {:?}, {}/{} 步骤成功",
            self.device_id(),
            scenario.name,
            report.status,
            report.passed_count,
            report.steps_executed
        );

        report
    }

    async fn walk(
        &self,
        scenario: &Scenario,
        app_package: Option<&str>,
        report: &mut ScenarioReport,
    ) -> std::result::Result<(), WalkError> {
        let start = scenario
            .start_node()
            .ok_or_else(|| ("场景缺少 start 节点".to_string(), FailureType::Unknown))?;

        let mut current = start.id.clone();
        let mut visited: HashSet<String> = HashSet::new();
        let mut loops: Vec<LoopFrame> = Vec::new();

        loop {
            if self.token.is_cancelled() {
                return Err(cancelled_error());
            }

            let node = scenario.node(&current).ok_or_else(|| {
                (format!("节点不存在: {}", current), FailureType::Unknown)
            })?;

            let reentered = if visited.insert(node.id.clone()) {
                false
            } else {
                match loops.iter().rposition(|f| f.node_id == node.id) {
                    Some(pos) => {
                        // 回到循环节点：结束一轮，丢弃更内层的循环
                        loops.truncate(pos + 1);
                        let frame = &mut loops[pos];
                        frame.iteration += 1;
                        visited = frame.visited.clone();
                        true
                    }
                    None => {
                        return Err((
                            format!("检测到循环: 节点 {} 被重复访问", node.id),
                            FailureType::CycleDetected,
                        ));
                    }
                }
            };

            debug!("[{}] 节点 {} ({})", self.device_id(), node.id, node.kind.type_name());

            let next = match &node.kind {
                NodeKind::Start => scenario.next_node(&node.id, None),

                NodeKind::End => return Ok(()),

                NodeKind::Action { action } => {
                    let step = self.execute_step(node, action, app_package).await;
                    if !self.record(report, step) {
                        return Ok(());
                    }
                    scenario.next_node(&node.id, None)
                }

                NodeKind::Condition { condition, negate } => {
                    let Some(value) = self.check(node, condition, app_package, report).await else {
                        return Ok(());
                    };
                    let branch = if value != *negate { Branch::Yes } else { Branch::No };
                    scenario.next_node(&node.id, Some(branch))
                }

                NodeKind::Loop { mode } => {
                    if !reentered {
                        loops.push(LoopFrame {
                            node_id: node.id.clone(),
                            iteration: 0,
                            visited: visited.clone(),
                        });
                    }
                    let iteration = loops.last().map(|f| f.iteration).unwrap_or(0);

                    let again = match mode {
                        LoopMode::Count { times } => iteration < *times,
                        LoopMode::WhileExists {
                            condition,
                            max_iterations,
                        } => {
                            if iteration >= *max_iterations {
                                warn!(
                                    "[{}] 循环节点 {} 达到最大轮数 {}，退出循环",
                                    self.device_id(),
                                    node.id,
                                    max_iterations
                                );
                                false
                            } else {
                                match self.check(node, condition, app_package, report).await {
                                    Some(value) => value,
                                    None => return Ok(()),
                                }
                            }
                        }
                    };

                    if again {
                        debug!("[{}] 循环 {} 第 {} 轮", self.device_id(), node.id, iteration + 1);
                        scenario
                            .outgoing(&node.id)
                            .find(|c| c.branch == Some(Branch::Body))
                            .map(|c| c.to.as_str())
                    } else {
                        loops.pop();
                        scenario.next_node(&node.id, Some(Branch::Exit))
                    }
                }
            };

            match next {
                Some(id) => current = id.to_string(),
                None => {
                    debug!("[{}] 节点 {} 没有后续连线，场景结束", self.device_id(), node.id);
                    return Ok(());
                }
            }
        }
    }

    /// 记录步骤，返回是否可以继续
    fn record(&self, report: &mut ScenarioReport, step: StepReport) -> bool {
        let passed = step.is_passed();
        let cancelled = step.failure_type == Some(FailureType::Cancelled);
        report.add_step(step);
        if cancelled {
            let (message, failure_type) = cancelled_error();
            report.fail(&message, failure_type);
        }
        passed
    }

    /// 求值条件并记录为一个步骤；失败时返回 None
    async fn check(
        &self,
        node: &Node,
        condition: &Condition,
        app_package: Option<&str>,
        report: &mut ScenarioReport,
    ) -> Option<bool> {
        let description = node.name.clone().unwrap_or_else(|| condition.describe());
        let start_time = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(StepError::Cancelled),
            result = self.evaluate(condition, app_package) => result,
        };

        let (step, value) = match outcome {
            Ok(value) => (
                StepReport::success(&node.id, &description).with_output(value.to_string()),
                Some(value),
            ),
            Err(e) => (self.failed_step(&node.id, &description, e).await, None),
        };

        let mut step = step;
        step.duration_ms = start_time.elapsed().as_millis() as u64;
        self.record(report, step);
        value
    }

    async fn evaluate(&self, condition: &Condition, app_package: Option<&str>) -> StepResult<bool> {
        let actions = self.actions.as_ref();
        let value = match condition {
            Condition::ElementExists { selector } => actions.element_exists(selector).await?,
            Condition::TextExists { text } => actions.screen_contains_text(text).await?,
            Condition::ImageExists { image } => actions.find_image(image).await?.is_some(),
            Condition::AppRunning { package } => {
                let package = resolve_package(package, app_package)?;
                actions.is_app_running(package).await?
            }
        };
        Ok(value)
    }

    async fn execute_step(
        &self,
        node: &Node,
        action: &Action,
        app_package: Option<&str>,
    ) -> StepReport {
        let description = node.name.clone().unwrap_or_else(|| action.describe());
        let start_time = Instant::now();
        let budget = self.step_budget(action);

        debug!("[{}] 执行步骤: {}", self.device_id(), description);

        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(StepError::Cancelled),
            result = timeout(budget, self.execute_action(action, app_package)) => match result {
                Ok(result) => result,
                Err(_) => Err(StepError::Error(format!(
                    "步骤执行超时 ({}ms)",
                    budget.as_millis()
                ))),
            },
        };

        let mut step = match outcome {
            Ok(output) => {
                let mut step = StepReport::success(&node.id, &description);
                step.output = output;
                step
            }
            Err(e) => self.failed_step(&node.id, &description, e).await,
        };
        step.duration_ms = start_time.elapsed().as_millis() as u64;
        step
    }

    async fn failed_step(&self, node_id: &str, description: &str, error: StepError) -> StepReport {
        let (status, message, failure_type) = match error {
            StepError::Failed(message) => {
                let failure_type = classify_failure(&message);
                (StepStatus::Failed, message, failure_type)
            }
            StepError::Error(message) => {
                let failure_type = classify_failure(&message);
                (StepStatus::Error, message, failure_type)
            }
            StepError::Cancelled => {
                let (message, failure_type) = cancelled_error();
                (StepStatus::Error, message, failure_type)
            }
        };

        if failure_type != FailureType::Cancelled {
            warn!(
                "[{}] 步骤失败: {} - {} ({:?})",
                self.device_id(),
                description,
                message,
                failure_type
            );
        }

        let mut step = StepReport::failed(node_id, description, status, &message, failure_type);
        if failure_type != FailureType::Cancelled && self.config.screenshot_on_failure {
            step.screenshot = self.capture_screenshot().await;
        }
        step
    }

    async fn capture_screenshot(&self) -> Option<String> {
        match self.actions.screenshot().await {
            Ok(bytes) => Some(STANDARD.encode(bytes)),
            Err(e) => {
                warn!("[{}] 失败截图获取失败: {}", self.device_id(), e);
                None
            }
        }
    }

    /// 单个步骤的总时限
    fn step_budget(&self, action: &Action) -> Duration {
        let base = self.config.action_timeout();
        match action {
            Action::Wait { duration_ms } => base + Duration::from_millis(*duration_ms),
            _ => match action.wait_timeout_ms() {
                Some(wait) => base + self.wait_timeout(wait),
                None => base,
            },
        }
    }

    fn wait_timeout(&self, timeout_ms: Option<u64>) -> Duration {
        Duration::from_millis(timeout_ms.unwrap_or(self.config.default_wait_timeout_ms))
    }

    async fn execute_action(
        &self,
        action: &Action,
        app_package: Option<&str>,
    ) -> StepResult<Option<String>> {
        let actions = self.actions.as_ref();

        match action {
            Action::Tap { x, y } => actions.tap(Point::new(*x, *y)).await?,
            Action::DoubleTap { x, y } => actions.double_tap(Point::new(*x, *y)).await?,
            Action::LongPress { x, y, duration_ms } => {
                actions.long_press(Point::new(*x, *y), *duration_ms).await?
            }
            Action::Swipe {
                from_x,
                from_y,
                to_x,
                to_y,
                duration_ms,
            } => {
                actions
                    .swipe(
                        Point::new(*from_x, *from_y),
                        Point::new(*to_x, *to_y),
                        *duration_ms,
                    )
                    .await?
            }
            Action::InputText { text } => actions.input_text(text).await?,
            Action::ClearText => actions.clear_text().await?,
            Action::PressKey { key } => actions.press_key(key).await?,
            Action::Back => actions.press_key("back").await?,
            Action::Home => actions.press_key("home").await?,
            Action::Wait { duration_ms } => self.pause(Duration::from_millis(*duration_ms)).await?,

            Action::TapElement {
                selector,
                timeout_ms,
            } => {
                self.wait_for_element(selector, *timeout_ms).await?;
                actions.tap_element(selector).await?
            }
            Action::TapText { text, timeout_ms } => {
                let point = self.wait_for_text(text, *timeout_ms).await?;
                actions.tap(point).await?
            }
            Action::TapImage { image, timeout_ms } => {
                let point = self.wait_for_image(image, *timeout_ms).await?;
                actions.tap(point).await?
            }
            Action::WaitUntilExists {
                selector,
                timeout_ms,
            } => self.wait_for_element(selector, *timeout_ms).await?,
            Action::WaitUntilGone {
                selector,
                timeout_ms,
            } => {
                let wait = self.wait_timeout(*timeout_ms);
                let gone = self
                    .poll_until(wait, move || async move {
                        Ok::<_, ActionError>((!actions.element_exists(selector).await?).then_some(()))
                    })
                    .await?;
                if gone.is_none() {
                    return Err(StepError::Failed(format!(
                        "等待元素消失超时 ({}ms): {}",
                        wait.as_millis(),
                        selector
                    )));
                }
            }
            Action::WaitUntilText { text, timeout_ms } => {
                self.wait_for_text(text, *timeout_ms).await?;
            }
            Action::WaitUntilTextGone { text, timeout_ms } => {
                let wait = self.wait_timeout(*timeout_ms);
                let gone = self
                    .poll_until(wait, move || async move {
                        Ok::<_, ActionError>((!actions.screen_contains_text(text).await?).then_some(()))
                    })
                    .await?;
                if gone.is_none() {
                    return Err(StepError::Failed(format!(
                        "等待文本消失超时 ({}ms): {}",
                        wait.as_millis(),
                        text
                    )));
                }
            }
            Action::WaitUntilImage { image, timeout_ms } => {
                self.wait_for_image(image, *timeout_ms).await?;
            }
            Action::WaitUntilImageGone { image, timeout_ms } => {
                let wait = self.wait_timeout(*timeout_ms);
                let gone = self
                    .poll_until(wait, move || async move {
                        Ok::<_, ActionError>(actions.find_image(image).await?.is_none().then_some(()))
                    })
                    .await?;
                if gone.is_none() {
                    return Err(StepError::Failed(format!(
                        "等待图像消失超时 ({}ms): {}",
                        wait.as_millis(),
                        image.template
                    )));
                }
            }

            Action::LaunchApp { package } => {
                actions
                    .launch_app(resolve_package(package, app_package)?)
                    .await?
            }
            Action::TerminateApp { package } => {
                actions
                    .terminate_app(resolve_package(package, app_package)?)
                    .await?
            }
            Action::RestartApp { package } => {
                let package = resolve_package(package, app_package)?;
                actions.terminate_app(package).await?;
                actions.launch_app(package).await?
            }
            Action::ClearAppData { package } => {
                actions
                    .clear_app_data(resolve_package(package, app_package)?)
                    .await?
            }

            Action::AssertExists { selector } => {
                if !actions.element_exists(selector).await? {
                    return Err(StepError::Failed(format!(
                        "断言失败: 元素不存在: {}",
                        selector
                    )));
                }
            }
            Action::AssertNotExists { selector } => {
                if actions.element_exists(selector).await? {
                    return Err(StepError::Failed(format!(
                        "断言失败: 元素不应存在: {}",
                        selector
                    )));
                }
            }
            Action::AssertText {
                selector,
                expected,
                contains,
            } => {
                let actual = actions.element_text(selector).await?.ok_or_else(|| {
                    StepError::Failed(format!("断言失败: 元素不存在: {}", selector))
                })?;
                let matched = if *contains {
                    actual.contains(expected.as_str())
                } else {
                    actual == *expected
                };
                if !matched {
                    return Err(StepError::Failed(format!(
                        "断言失败: 元素 {} 文本为 '{}', 期望 '{}'",
                        selector, actual, expected
                    )));
                }
                return Ok(Some(actual));
            }
            Action::AssertTextVisible { text } => {
                if !actions.screen_contains_text(text).await? {
                    return Err(StepError::Failed(format!("断言失败: 文本不可见: {}", text)));
                }
            }
            Action::AssertAppRunning { package } => {
                let package = resolve_package(package, app_package)?;
                if !actions.is_app_running(package).await? {
                    return Err(StepError::Failed(format!(
                        "断言失败: 应用未运行: {}",
                        package
                    )));
                }
            }

            Action::Screenshot => {
                let bytes = actions.screenshot().await?;
                return Ok(Some(STANDARD.encode(bytes)));
            }
        }

        Ok(None)
    }

    async fn wait_for_element(&self, selector: &Selector, timeout_ms: Option<u64>) -> StepResult<()> {
        let actions = self.actions.as_ref();
        let wait = self.wait_timeout(timeout_ms);
        self.poll_until(wait, move || async move {
            Ok::<_, ActionError>(actions.element_exists(selector).await?.then_some(()))
        })
        .await?
        .ok_or_else(|| {
            StepError::Failed(format!(
                "等待元素出现超时 ({}ms): {}",
                wait.as_millis(),
                selector
            ))
        })
    }

    async fn wait_for_text(&self, text: &str, timeout_ms: Option<u64>) -> StepResult<Point> {
        let actions = self.actions.as_ref();
        let wait = self.wait_timeout(timeout_ms);
        self.poll_until(wait, move || actions.find_text(text))
            .await?
            .ok_or_else(|| {
                StepError::Failed(format!(
                    "等待文本出现超时 ({}ms): {}",
                    wait.as_millis(),
                    text
                ))
            })
    }

    async fn wait_for_image(
        &self,
        image: &ImageTemplate,
        timeout_ms: Option<u64>,
    ) -> StepResult<Point> {
        let actions = self.actions.as_ref();
        let wait = self.wait_timeout(timeout_ms);
        self.poll_until(wait, move || actions.find_image(image))
            .await?
            .ok_or_else(|| {
                StepError::Failed(format!(
                    "等待图像出现超时 ({}ms): {}",
                    wait.as_millis(),
                    image.template
                ))
            })
    }

    /// 轮询直到探测返回值或超时 (超时返回 None)，每个周期检查取消
    async fn poll_until<T, F, Fut>(&self, wait: Duration, mut check: F) -> StepResult<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = mtp_actions::Result<Option<T>>>,
    {
        let deadline = Instant::now() + wait;
        loop {
            if self.token.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            if let Some(value) = check().await? {
                return Ok(Some(value));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let interval = self.config.poll_interval().min(deadline - now);
            tokio::select! {
                _ = self.token.cancelled() => return Err(StepError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// 可取消的等待
    async fn pause(&self, duration: Duration) -> StepResult<()> {
        tokio::select! {
            _ = self.token.cancelled() => Err(StepError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

fn resolve_package<'a>(
    package: &'a Option<String>,
    app_package: Option<&'a str>,
) -> StepResult<&'a str> {
    package
        .as_deref()
        .or(app_package)
        .ok_or_else(|| StepError::Error("未指定应用包名".to_string()))
}

fn cancelled_error() -> WalkError {
    ("执行已取消".to_string(), FailureType::Cancelled)
}
