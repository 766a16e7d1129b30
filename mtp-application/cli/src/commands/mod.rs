//! CLI 命令处理模块

pub mod config;
pub mod run;
pub mod validate;

use anyhow::Result;
use std::path::Path;

use mtp_orchestrator::PlatformConfig;

/// 加载平台配置：指定路径时只读该文件，否则按默认搜索顺序
pub fn load_config(path: Option<&str>) -> Result<PlatformConfig> {
    let config = match path {
        Some(path) => PlatformConfig::load_from_file(Path::new(path))?,
        None => PlatformConfig::load()?,
    };
    config.validate()?;
    Ok(config)
}
