//! 执行计划：一次提交展开后的场景队列

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{Package, Scenario};

/// 场景队列项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioQueueItem {
    pub scenario_id: String,
    pub scenario_name: String,
    pub package_id: Option<String>,

    /// 被测应用包名
    pub app_package: Option<String>,

    pub category_id: Option<String>,

    /// 在队列中的序号 (从 0 开始)
    pub order: usize,

    /// 重复轮次 (从 1 开始)
    pub repeat_index: u32,
}

/// 执行计划
///
/// 每台设备执行同一份计划。`repeat_count` 轮，每轮按请求顺序列出全部场景：
/// s1#1, s2#1, ..., s1#2, s2#2, ...
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    items: Vec<ScenarioQueueItem>,
    scenarios: HashMap<String, Arc<Scenario>>,
}

impl ExecutionPlan {
    pub fn build(
        scenarios: &[Arc<Scenario>],
        packages: &HashMap<String, Package>,
        repeat_count: u32,
    ) -> Self {
        let rounds = repeat_count.max(1);
        let mut items = Vec::with_capacity(scenarios.len() * rounds as usize);

        for repeat_index in 1..=rounds {
            for scenario in scenarios {
                let app_package = scenario.app_package.clone().or_else(|| {
                    scenario
                        .package_id
                        .as_ref()
                        .and_then(|id| packages.get(id))
                        .map(|p| p.app_package.clone())
                });

                items.push(ScenarioQueueItem {
                    scenario_id: scenario.id.clone(),
                    scenario_name: scenario.name.clone(),
                    package_id: scenario.package_id.clone(),
                    app_package,
                    category_id: scenario.category_id.clone(),
                    order: items.len(),
                    repeat_index,
                });
            }
        }

        let scenarios = scenarios
            .iter()
            .map(|s| (s.id.clone(), Arc::clone(s)))
            .collect();

        Self { items, scenarios }
    }

    pub fn items(&self) -> &[ScenarioQueueItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn scenario(&self, scenario_id: &str) -> Option<&Arc<Scenario>> {
        self.scenarios.get(scenario_id)
    }
}
