//! Config 命令处理

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;

use mtp_orchestrator::PlatformConfig;

use crate::ConfigAction;

pub fn handle(action: ConfigAction, config: &PlatformConfig) -> Result<()> {
    match action {
        ConfigAction::Show { format } => show(config, &format),
        ConfigAction::Init { path, force } => init(&path, force),
    }
}

fn show(config: &PlatformConfig, format: &str) -> Result<()> {
    let content = match format {
        "toml" => toml::to_string_pretty(config).context("序列化 TOML 失败")?,
        "yaml" => serde_yaml::to_string(config).context("序列化 YAML 失败")?,
        "json" => serde_json::to_string_pretty(config).context("序列化 JSON 失败")?,
        other => anyhow::bail!("不支持的输出格式: {}", other),
    };
    println!("{}", content);
    Ok(())
}

fn init(path: &str, force: bool) -> Result<()> {
    let path = Path::new(path);
    if path.exists() && !force {
        anyhow::bail!("配置文件已存在: {:?} (使用 --force 覆盖)", path);
    }

    PlatformConfig::default().save_to_file(path)?;
    println!("{} 已生成配置文件: {}", "✓".green().bold(), path.display());
    Ok(())
}
