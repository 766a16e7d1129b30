//! Run 命令处理
//!
//! 从场景库目录加载场景，在模拟设备上提交一次测试并等待结束。

use anyhow::{Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use mtp_actions::{ActionsProvider, SimulatedProvider};
use mtp_common::{ExecutionStatus, PlatformEvent, Requester, TestRequest};
use mtp_orchestrator::{
    DeviceResultStatus, ExecutionSummary, InMemoryCatalog, JsonFileReportSink, PlatformConfig,
    ReportSink, ScenarioCatalog, SubmitStatus, TestOrchestrator,
};

use crate::RunArgs;

pub async fn handle(args: RunArgs, mut config: PlatformConfig) -> Result<()> {
    // 报告由命令自己写出，确保退出前落盘
    let report_dir = args
        .report_dir
        .as_ref()
        .map(PathBuf::from)
        .or_else(|| config.orchestrator.report_dir.take());

    let catalog = InMemoryCatalog::load_dir(&args.catalog)
        .await
        .with_context(|| format!("加载场景库失败: {}", args.catalog))?;

    let provider = SimulatedProvider::permissive(Duration::from_millis(args.latency_ms));
    let orchestrator = Arc::new(TestOrchestrator::new(
        Arc::new(provider) as Arc<dyn ActionsProvider>,
        Arc::new(catalog) as Arc<dyn ScenarioCatalog>,
        &config,
    ));

    let mut events = orchestrator.events().subscribe();
    let requester = Requester::new(args.user.clone(), format!("cli-{}", std::process::id()));

    let mut request = TestRequest::new(args.devices.clone(), args.scenarios.clone())
        .with_repeat(args.repeat);
    request.scenario_interval_ms = args.interval_ms;
    request.test_name = args.name.clone();

    let submitted = orchestrator
        .submit_test(request, &requester, args.priority)
        .await?;

    let status = match submitted.status {
        SubmitStatus::Started => "已开始".green(),
        SubmitStatus::Queued => "排队中".yellow(),
        SubmitStatus::Partial => "部分开始".yellow(),
    };
    println!(
        "{} 测试已提交: {} (queue_id={})",
        "✓".green().bold(),
        status,
        submitted.queue_id.bright_black()
    );

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .context("进度条模板无效")?,
    );
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("执行中...");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    anyhow::bail!("事件总线已关闭");
                };
                match event {
                    PlatformEvent::DeviceScenarioStart { device_id, scenario_name, repeat_index, .. } => {
                        spinner.set_message(format!("[{}] {} #{}", device_id, scenario_name, repeat_index));
                    }
                    PlatformEvent::DeviceScenarioComplete { device_id, scenario_id, passed, duration_ms, error, .. } => {
                        let icon = if passed { "✓".green() } else { "✗".red() };
                        spinner.println(format!(
                            "{} [{}] {} ({} ms){}",
                            icon,
                            device_id,
                            scenario_id,
                            duration_ms,
                            error.map(|e| format!(": {}", e.red())).unwrap_or_default()
                        ));
                    }
                    PlatformEvent::TestComplete { queue_id, .. } if queue_id == submitted.queue_id => {
                        break;
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                spinner.println("收到中断信号，正在取消...".yellow().to_string());
                let result = orchestrator.cancel_test(&submitted.queue_id, &requester).await;
                if !result.success {
                    warn!("取消失败: {}", result.message);
                }
            }
        }
    }
    spinner.finish_and_clear();

    let summary = orchestrator
        .get_completed_tests(1)
        .await
        .into_iter()
        .find(|s| s.queue_id == submitted.queue_id)
        .context("未找到执行摘要")?;

    match args.format.as_str() {
        "json" => println!("{}", summary.to_json()?),
        "yaml" => println!("{}", summary.to_yaml()?),
        _ => print_summary(&summary),
    }

    if let Some(dir) = report_dir {
        let sink = JsonFileReportSink::new(dir);
        sink.create(&summary).await?;
        info!("执行报告已写入: {:?}", sink.path_for(&summary.execution_id));
    }

    if summary.status != ExecutionStatus::Completed {
        anyhow::bail!("测试未全部通过: {:?}", summary.status);
    }
    Ok(())
}

fn print_summary(summary: &ExecutionSummary) {
    println!("\n{}", "=".repeat(60));
    println!("{}", "执行报告".bold());
    println!("{}", "=".repeat(60));
    println!();

    println!("测试名称: {}", summary.test_name.cyan().bold());
    println!("执行 ID:  {}", summary.execution_id.bright_black());
    println!("场景:     {}", summary.scenario_ids.join(", "));
    println!("重复次数: {}", summary.repeat_count);
    println!("执行时间: {} ms", summary.duration_ms.to_string().yellow());
    println!();

    println!("设备统计:");
    println!("  成功: {}", summary.success_count.to_string().green());
    println!("  失败: {}", summary.failed_count.to_string().red());
    println!("  跳过: {}", summary.skipped_count.to_string().yellow());
    println!();

    for device in &summary.devices {
        let icon = match device.status {
            DeviceResultStatus::Completed => "✓".green(),
            DeviceResultStatus::Failed => "✗".red(),
            _ => "⊘".yellow(),
        };
        println!(
            "{} {}: 通过 {} / 失败 {} / 共 {}",
            icon.bold(),
            device.device_id,
            device.completed_scenarios,
            device.failed_scenarios,
            device.total_scenarios
        );
        if let Some(error) = &device.error {
            println!("   错误: {}", error.red());
        }
    }

    println!("{}", "=".repeat(60));
    let status = match summary.status {
        ExecutionStatus::Completed => format!("{} 测试全部通过", "✓".green().bold()),
        ExecutionStatus::Partial => format!("{} 部分设备失败", "✗".yellow().bold()),
        ExecutionStatus::Failed => format!("{} 测试失败", "✗".red().bold()),
        ExecutionStatus::Cancelled => format!("{} 测试已取消", "⊘".yellow().bold()),
    };
    println!("{}", status);
    println!("{}", "=".repeat(60));
}
