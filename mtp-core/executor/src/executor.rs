//! 测试执行器
//!
//! 每台设备按执行计划顺序执行场景：场景失败即停止该设备后续场景，
//! 设备之间互不影响。取消通过 [`CancellationToken`] 传递，
//! 同时把停止信号转发给设备操作层，让进行中的驱动调用尽快返回。

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mtp_actions::{ActionsProvider, DeviceActions};
use mtp_common::{DeviceProgress, EventBus, PlatformEvent, ProgressStatus};

use crate::{
    DeviceRunReport, ExecutionPlan, ExecutorConfig, ScenarioGraphRunner, ScenarioReport,
    ScenarioStatus,
};

/// 测试执行器
pub struct TestExecutor {
    provider: Arc<dyn ActionsProvider>,
    events: EventBus,
    config: ExecutorConfig,
}

impl TestExecutor {
    pub fn new(provider: Arc<dyn ActionsProvider>, events: EventBus, config: ExecutorConfig) -> Self {
        Self {
            provider,
            events,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// 在一台设备上执行整个场景队列
    pub async fn run_device(
        &self,
        execution_id: &str,
        device_id: &str,
        plan: &ExecutionPlan,
        token: CancellationToken,
        scenario_interval: Duration,
    ) -> DeviceRunReport {
        let started_at = Utc::now();
        let start_time = Instant::now();
        let mut progress = DeviceProgress::new(plan.len());
        let mut scenarios: Vec<ScenarioReport> = Vec::new();
        let mut device_error: Option<String> = None;

        info!(
            "[{}] 设备开始执行: execution={}, 共 {} 个场景",
            device_id,
            execution_id,
            plan.len()
        );
        self.events.publish(PlatformEvent::DeviceStart {
            execution_id: execution_id.to_string(),
            device_id: device_id.to_string(),
            total_scenarios: plan.len(),
        });

        match self.provider.get_actions(device_id).await {
            Ok(actions) => {
                actions.reset().await;
                let runner = ScenarioGraphRunner::new(
                    Arc::clone(&actions),
                    self.config.clone(),
                    token.clone(),
                );

                for (index, item) in plan.items().iter().enumerate() {
                    if token.is_cancelled() {
                        progress.status = ProgressStatus::Stopped;
                        break;
                    }

                    progress.current_scenario_index = index;

                    let Some(scenario) = plan.scenario(&item.scenario_id) else {
                        let message = format!("场景不存在: {}", item.scenario_id);
                        error!("[{}] {}", device_id, message);
                        device_error = Some(message);
                        progress.failed_scenarios += 1;
                        progress.status = ProgressStatus::Failed;
                        break;
                    };

                    self.events.publish(PlatformEvent::DeviceScenarioStart {
                        execution_id: execution_id.to_string(),
                        device_id: device_id.to_string(),
                        scenario_id: item.scenario_id.clone(),
                        scenario_name: item.scenario_name.clone(),
                        index,
                        repeat_index: item.repeat_index,
                    });

                    let report = runner.run(scenario, item).await;

                    self.events.publish(PlatformEvent::DeviceScenarioComplete {
                        execution_id: execution_id.to_string(),
                        device_id: device_id.to_string(),
                        scenario_id: item.scenario_id.clone(),
                        passed: report.passed(),
                        duration_ms: report.duration_ms,
                        error: report.error.clone(),
                    });

                    let status = report.status;
                    scenarios.push(report);

                    match status {
                        ScenarioStatus::Passed => progress.completed_scenarios += 1,
                        ScenarioStatus::Failed => {
                            progress.failed_scenarios += 1;
                            progress.status = ProgressStatus::Failed;
                        }
                        ScenarioStatus::Cancelled => progress.status = ProgressStatus::Stopped,
                    }

                    self.events.publish(PlatformEvent::TestProgress {
                        execution_id: execution_id.to_string(),
                        device_id: device_id.to_string(),
                        progress: progress.clone(),
                    });

                    if progress.status != ProgressStatus::Running {
                        break;
                    }

                    let has_more = index + 1 < plan.len();
                    if has_more && !scenario_interval.is_zero() {
                        tokio::select! {
                            _ = token.cancelled() => {
                                progress.status = ProgressStatus::Stopped;
                                break;
                            }
                            _ = tokio::time::sleep(scenario_interval) => {}
                        }
                    }
                }
            }
            Err(e) => {
                error!("[{}] 获取设备操作接口失败: {}", device_id, e);
                device_error = Some(e.to_string());
                progress.status = ProgressStatus::Failed;
            }
        }

        if progress.status == ProgressStatus::Running {
            progress.status = ProgressStatus::Completed;
        }
        if progress.status == ProgressStatus::Stopped && device_error.is_none() {
            device_error = Some("执行已取消".to_string());
        }
        if device_error.is_none() {
            device_error = scenarios.iter().rev().find_map(|s| s.error.clone());
        }

        let success = progress.status == ProgressStatus::Completed;

        info!(
            "[{}] 设备执行结束: {:?}, 成功 {} / 失败 {} / 共 {}",
            device_id,
            progress.status,
            progress.completed_scenarios,
            progress.failed_scenarios,
            progress.total_scenarios
        );
        self.events.publish(PlatformEvent::DeviceComplete {
            execution_id: execution_id.to_string(),
            device_id: device_id.to_string(),
            success,
            progress: progress.clone(),
        });

        DeviceRunReport {
            execution_id: execution_id.to_string(),
            device_id: device_id.to_string(),
            success,
            error: device_error,
            progress,
            started_at,
            completed_at: Utc::now(),
            duration_ms: start_time.elapsed().as_millis() as u64,
            scenarios,
        }
    }

    /// 向设备操作层转发停止信号
    pub async fn stop_devices(&self, device_ids: &[String]) {
        for device_id in device_ids {
            match self.provider.get_actions(device_id).await {
                Ok(actions) => actions.stop().await,
                Err(e) => warn!("[{}] 发送停止信号失败: {}", device_id, e),
            }
        }
    }

    /// 结束设备上的被测应用 (取消后的清理，失败只记录日志)
    pub async fn terminate_app(&self, device_id: &str, package: &str) {
        let actions: Arc<dyn DeviceActions> = match self.provider.get_actions(device_id).await {
            Ok(actions) => actions,
            Err(e) => {
                warn!("[{}] 结束应用失败: {}", device_id, e);
                return;
            }
        };
        // 停止标志会拒绝后续操作，先复位
        actions.reset().await;
        if let Err(e) = actions.terminate_app(package).await {
            warn!("[{}] 结束应用 {} 失败: {}", device_id, package, e);
        } else {
            info!("[{}] 已结束应用: {}", device_id, package);
        }
    }
}
