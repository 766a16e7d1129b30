//! Validate 命令处理

use anyhow::{Context, Result};
use colored::Colorize;

use mtp_executor::{NodeKind, Scenario};

pub fn handle(file: &str) -> Result<()> {
    let scenario =
        Scenario::from_file(file).with_context(|| format!("加载场景文件失败: {}", file))?;

    println!("场景: {} ({})", scenario.name.cyan().bold(), scenario.id);
    if let Some(desc) = &scenario.description {
        println!("描述: {}", desc.bright_black());
    }

    let count = |pred: fn(&NodeKind) -> bool| scenario.nodes.iter().filter(|n| pred(&n.kind)).count();
    println!(
        "节点: {} (动作 {}, 条件 {}, 循环 {})",
        scenario.nodes.len().to_string().yellow(),
        count(|k| matches!(k, NodeKind::Action { .. })),
        count(|k| matches!(k, NodeKind::Condition { .. })),
        count(|k| matches!(k, NodeKind::Loop { .. })),
    );
    println!("连线: {}", scenario.connections.len().to_string().yellow());
    if !scenario.tags.is_empty() {
        println!("标签: {}", scenario.tags.join(", ").bright_black());
    }

    match scenario.validate() {
        Ok(()) => {
            println!("{} 场景校验通过", "✓".green().bold());
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "✗".red().bold(), e.to_string().red());
            anyhow::bail!("场景校验失败");
        }
    }
}
