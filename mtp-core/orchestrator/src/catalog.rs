//! 场景库
//!
//! 编排器只读地查询场景、应用包和分类。持久化存储由外部实现，
//! 这里提供内存实现，可以从目录加载：
//! - `*.json` / `*.yaml` / `*.yml`：每个文件一个场景
//! - `packages.*`：应用包列表
//! - `categories.*`：分类列表

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use mtp_executor::{Category, Package, Scenario};

use crate::{OrchestratorError, Result};

/// 场景库查询接口
#[async_trait]
pub trait ScenarioCatalog: Send + Sync {
    async fn scenario(&self, id: &str) -> Option<Arc<Scenario>>;

    async fn package(&self, id: &str) -> Option<Package>;

    async fn category(&self, id: &str) -> Option<Category>;
}

/// 内存场景库
#[derive(Default)]
pub struct InMemoryCatalog {
    scenarios: RwLock<HashMap<String, Arc<Scenario>>>,
    packages: RwLock<HashMap<String, Package>>,
    categories: RwLock<HashMap<String, Category>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_scenario(&self, scenario: Scenario) {
        self.scenarios
            .write()
            .await
            .insert(scenario.id.clone(), Arc::new(scenario));
    }

    pub async fn insert_package(&self, package: Package) {
        self.packages
            .write()
            .await
            .insert(package.id.clone(), package);
    }

    pub async fn insert_category(&self, category: Category) {
        self.categories
            .write()
            .await
            .insert(category.id.clone(), category);
    }

    pub async fn scenario_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.scenarios.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 从目录加载场景库
    pub async fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let catalog = Self::new();

        let entries = fs::read_dir(dir).map_err(|e| {
            OrchestratorError::CatalogError(format!("无法读取目录 {}: {}", dir.display(), e))
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("json") | Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();

        for path in paths {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            match stem {
                "packages" => {
                    for package in read_list::<Package>(&path)? {
                        catalog.insert_package(package).await;
                    }
                }
                "categories" => {
                    for category in read_list::<Category>(&path)? {
                        catalog.insert_category(category).await;
                    }
                }
                _ => {
                    let scenario = Scenario::from_file(&path).map_err(|e| {
                        OrchestratorError::CatalogError(format!("{}: {}", path.display(), e))
                    })?;
                    debug!("加载场景: {} ({})", scenario.id, path.display());
                    catalog.insert_scenario(scenario).await;
                }
            }
        }

        info!(
            "场景库加载完成: {} 个场景, {} 个应用包, {} 个分类",
            catalog.scenarios.read().await.len(),
            catalog.packages.read().await.len(),
            catalog.categories.read().await.len()
        );
        Ok(catalog)
    }
}

fn read_list<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = fs::read_to_string(path)?;
    let parsed = if path.extension().and_then(|s| s.to_str()) == Some("json") {
        serde_json::from_str(&content).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(&content).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| OrchestratorError::CatalogError(format!("{}: {}", path.display(), e)))
}

#[async_trait]
impl ScenarioCatalog for InMemoryCatalog {
    async fn scenario(&self, id: &str) -> Option<Arc<Scenario>> {
        self.scenarios.read().await.get(id).cloned()
    }

    async fn package(&self, id: &str) -> Option<Package> {
        self.packages.read().await.get(id).cloned()
    }

    async fn category(&self, id: &str) -> Option<Category> {
        self.categories.read().await.get(id).cloned()
    }
}
