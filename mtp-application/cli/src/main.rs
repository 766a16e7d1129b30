//! MTP CLI 应用

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "mtp")]
#[command(about = "MTP - 移动设备自动化测试平台", long_about = None)]
#[command(version)]
struct Cli {
    /// 日志级别 (未指定时使用 RUST_LOG 或配置文件中的 log_level)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 在模拟设备上执行测试
    Run(RunArgs),

    /// 校验场景文件
    Validate {
        /// 场景文件路径 (.json / .yaml / .yml)
        file: String,
    },

    /// 配置管理
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
pub struct RunArgs {
    /// 场景库目录
    #[arg(long, default_value = "./scenarios")]
    catalog: String,

    /// 目标设备 (逗号分隔或重复指定)
    #[arg(short, long = "device", value_delimiter = ',', required = true)]
    devices: Vec<String>,

    /// 场景 ID (逗号分隔或重复指定，按顺序执行)
    #[arg(short, long = "scenario", value_delimiter = ',', required = true)]
    scenarios: Vec<String>,

    /// 重复次数
    #[arg(short, long, default_value = "1")]
    repeat: u32,

    /// 优先级 (0-2)
    #[arg(short, long, default_value = "1")]
    priority: u8,

    /// 场景间隔 (毫秒)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// 测试名称
    #[arg(long)]
    name: Option<String>,

    /// 提交者用户名
    #[arg(short, long, default_value = "cli")]
    user: String,

    /// 模拟设备的操作延迟 (毫秒)
    #[arg(long, default_value = "50")]
    latency_ms: u64,

    /// 执行报告输出目录
    #[arg(long)]
    report_dir: Option<String>,

    /// 输出格式 (table/json/yaml)
    #[arg(short = 'f', long, default_value = "table")]
    format: String,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// 显示当前生效的配置
    Show {
        /// 输出格式 (toml/yaml/json)
        #[arg(short = 'f', long, default_value = "toml")]
        format: String,
    },

    /// 生成默认配置文件
    Init {
        /// 输出路径
        #[arg(short, long, default_value = "./mtp.toml")]
        path: String,

        /// 覆盖已存在的文件
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = commands::load_config(cli.config.as_deref())?;

    // 初始化日志: RUST_LOG > --log-level > 配置文件
    let level = cli.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("MTP CLI 启动");

    match cli.command {
        Commands::Run(args) => commands::run::handle(args, config).await?,
        Commands::Validate { file } => commands::validate::handle(&file)?,
        Commands::Config { action } => commands::config::handle(action, &config)?,
    }

    Ok(())
}
