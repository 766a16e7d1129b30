//! 测试场景定义
//!
//! 场景是一张有向图：`start` 节点为入口，沿连线执行 `action` / `condition` / `loop` 节点，
//! 到达 `end` 节点结束。条件节点的连线带 `yes` / `no` 分支，循环节点带 `body` / `exit` 分支。

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use crate::{Action, Condition, ExecutorError, Result};

/// 测试场景
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// 场景 ID
    pub id: String,

    /// 场景名称
    pub name: String,

    /// 场景描述
    #[serde(default)]
    pub description: Option<String>,

    /// 所属应用包
    #[serde(default)]
    pub package_id: Option<String>,

    /// 所属分类
    #[serde(default)]
    pub category_id: Option<String>,

    /// 被测应用包名 (覆盖应用包中的配置)
    #[serde(default)]
    pub app_package: Option<String>,

    /// 标签
    #[serde(default)]
    pub tags: Vec<String>,

    /// 节点
    pub nodes: Vec<Node>,

    /// 连线
    #[serde(default)]
    pub connections: Vec<Connection>,
}

/// 场景节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,

    /// 显示名称
    #[serde(default)]
    pub name: Option<String>,

    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    /// 报告中使用的名称
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.clone())
    }
}

/// 节点类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Start,

    /// 执行一个动作
    Action {
        action: Action,
    },

    /// 判断条件并选择 `yes` / `no` 分支
    Condition {
        condition: Condition,
        /// 取反
        #[serde(default)]
        negate: bool,
    },

    /// 有界循环：沿 `body` 分支执行循环体，循环体回到本节点即完成一轮
    Loop {
        #[serde(rename = "loop")]
        mode: LoopMode,
    },

    End,
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::Action { .. } => "action",
            NodeKind::Condition { .. } => "condition",
            NodeKind::Loop { .. } => "loop",
            NodeKind::End => "end",
        }
    }
}

/// 循环模式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LoopMode {
    /// 固定次数
    Count { times: u32 },

    /// 条件成立时继续，最多 `max_iterations` 轮
    WhileExists {
        condition: Condition,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
    },
}

fn default_max_iterations() -> u32 {
    100
}

/// 连线分支
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Yes,
    No,
    Body,
    Exit,
}

/// 节点连线
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub branch: Option<Branch>,
}

/// 应用包
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub name: String,

    /// 被测应用包名
    pub app_package: String,

    #[serde(default)]
    pub description: Option<String>,
}

/// 场景分类
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,
}

impl Scenario {
    /// 从 YAML 文件加载场景
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// 从 YAML 字符串加载场景
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| ExecutorError::SerdeError(e.to_string()))
    }

    /// 从 JSON 文件加载场景
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// 从 JSON 字符串加载场景
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ExecutorError::SerdeError(e.to_string()))
    }

    /// 按扩展名加载场景文件
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_file(path),
            Some("yaml") | Some("yml") => Self::from_yaml_file(path),
            _ => Err(ExecutorError::ScenarioLoadFailed(format!(
                "不支持的场景文件格式: {}",
                path.display()
            ))),
        }
    }

    /// 导出为 YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| ExecutorError::SerdeError(e.to_string()))
    }

    /// 导出为 JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ExecutorError::SerdeError(e.to_string()))
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Start))
    }

    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| c.from == node_id)
    }

    /// 下一个节点
    ///
    /// 指定分支时优先走该分支，找不到再退回到无标签连线。
    pub fn next_node(&self, node_id: &str, branch: Option<Branch>) -> Option<&str> {
        let mut edges = self.connections.iter().filter(|c| c.from == node_id);
        if let Some(branch) = branch {
            if let Some(edge) = edges.clone().find(|c| c.branch == Some(branch)) {
                return Some(edge.to.as_str());
            }
        }
        edges.find(|c| c.branch.is_none()).map(|c| c.to.as_str())
    }

    /// 结构校验
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| ExecutorError::InvalidScenario {
            scenario: self.id.clone(),
            reason,
        };

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(invalid(format!("节点 ID 重复: {}", node.id)));
            }
        }

        let starts = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Start))
            .count();
        if starts != 1 {
            return Err(invalid(format!("需要且只能有一个 start 节点, 实际 {}", starts)));
        }

        for edge in &self.connections {
            if !ids.contains(edge.from.as_str()) {
                return Err(invalid(format!("连线起点不存在: {}", edge.from)));
            }
            if !ids.contains(edge.to.as_str()) {
                return Err(invalid(format!("连线终点不存在: {}", edge.to)));
            }
        }

        for node in &self.nodes {
            let edges: Vec<&Connection> = self.outgoing(&node.id).collect();
            match &node.kind {
                NodeKind::Condition { .. } => {
                    if let Some(edge) = edges
                        .iter()
                        .find(|e| matches!(e.branch, Some(Branch::Body) | Some(Branch::Exit)))
                    {
                        return Err(invalid(format!(
                            "条件节点 {} 的连线只能使用 yes/no 分支: -> {}",
                            node.id, edge.to
                        )));
                    }
                }
                NodeKind::Loop { mode } => {
                    let bodies = edges
                        .iter()
                        .filter(|e| e.branch == Some(Branch::Body))
                        .count();
                    if bodies != 1 {
                        return Err(invalid(format!(
                            "循环节点 {} 需要且只能有一条 body 连线",
                            node.id
                        )));
                    }
                    if let LoopMode::WhileExists { max_iterations, .. } = mode {
                        if *max_iterations == 0 {
                            return Err(invalid(format!(
                                "循环节点 {} 的 max_iterations 必须大于 0",
                                node.id
                            )));
                        }
                    }
                }
                NodeKind::Start | NodeKind::Action { .. } => {
                    if edges.iter().any(|e| e.branch.is_some()) {
                        return Err(invalid(format!(
                            "{} 节点 {} 的连线不能带分支",
                            node.kind.type_name(),
                            node.id
                        )));
                    }
                    if edges.len() > 1 {
                        return Err(invalid(format!(
                            "{} 节点 {} 有多条出边",
                            node.kind.type_name(),
                            node.id
                        )));
                    }
                }
                NodeKind::End => {}
            }
        }

        if !self.end_reachable() {
            return Err(invalid("从 start 节点无法到达任何 end 节点".to_string()));
        }

        Ok(())
    }

    fn end_reachable(&self) -> bool {
        let Some(start) = self.start_node() else {
            return false;
        };

        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.connections {
            adjacency
                .entry(edge.from.as_str())
                .or_default()
                .push(edge.to.as_str());
        }

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start.id.as_str()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if matches!(self.node(id).map(|n| &n.kind), Some(NodeKind::End)) {
                return true;
            }
            if let Some(next) = adjacency.get(id) {
                queue.extend(next.iter().copied());
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_YAML: &str = r#"
id: "login"
name: "登录"
package_id: "shop"
nodes:
  - id: "s"
    type: start
  - id: "launch"
    type: action
    action:
      type: launch_app
  - id: "has_popup"
    type: condition
    condition:
      type: text_exists
      text: "同意"
  - id: "accept"
    type: action
    action:
      type: tap_text
      text: "同意"
  - id: "e"
    type: end
connections:
  - { from: "s", to: "launch" }
  - { from: "launch", to: "has_popup" }
  - { from: "has_popup", to: "accept", branch: "yes" }
  - { from: "has_popup", to: "e", branch: "no" }
  - { from: "accept", to: "e" }
"#;

    #[test]
    fn test_scenario_from_yaml() {
        let scenario = Scenario::from_yaml_str(LOGIN_YAML).unwrap();
        assert_eq!(scenario.name, "登录");
        assert_eq!(scenario.nodes.len(), 5);
        assert_eq!(scenario.start_node().unwrap().id, "s");
        assert!(matches!(
            scenario.node("has_popup").unwrap().kind,
            NodeKind::Condition { negate: false, .. }
        ));
        scenario.validate().unwrap();
    }

    #[test]
    fn test_next_node_branch_fallback() {
        let mut scenario = Scenario::from_yaml_str(LOGIN_YAML).unwrap();
        assert_eq!(scenario.next_node("has_popup", Some(Branch::Yes)), Some("accept"));
        assert_eq!(scenario.next_node("has_popup", Some(Branch::No)), Some("e"));
        assert_eq!(scenario.next_node("launch", None), Some("has_popup"));

        // 没有 no 分支时退回到无标签连线
        scenario
            .connections
            .retain(|c| !(c.from == "has_popup" && c.branch == Some(Branch::No)));
        scenario.connections.push(Connection {
            from: "has_popup".to_string(),
            to: "e".to_string(),
            branch: None,
        });
        assert_eq!(scenario.next_node("has_popup", Some(Branch::No)), Some("e"));
        assert_eq!(scenario.next_node("e", None), None);
    }

    #[test]
    fn test_json_round_trip_keeps_node_kind() {
        let scenario = Scenario::from_yaml_str(LOGIN_YAML).unwrap();
        let json = scenario.to_json().unwrap();
        assert!(json.contains("\"type\": \"condition\""));
        let parsed = Scenario::from_json_str(&json).unwrap();
        assert_eq!(parsed.nodes, scenario.nodes);
    }

    #[test]
    fn test_loop_node_from_json() {
        let node: Node = serde_json::from_str(
            r#"{"id": "l", "type": "loop", "loop": {"mode": "while_exists", "condition": {"type": "text_exists", "text": "下一页"}}}"#,
        )
        .unwrap();
        match node.kind {
            NodeKind::Loop {
                mode: LoopMode::WhileExists { max_iterations, .. },
            } => assert_eq!(max_iterations, 100),
            other => panic!("unexpected node: {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_missing_start() {
        let mut scenario = Scenario::from_yaml_str(LOGIN_YAML).unwrap();
        scenario.nodes.retain(|n| n.id != "s");
        scenario.connections.retain(|c| c.from != "s");
        let err = scenario.validate().unwrap_err();
        assert!(err.to_string().contains("start"));
    }

    #[test]
    fn test_validate_rejects_dangling_edge() {
        let mut scenario = Scenario::from_yaml_str(LOGIN_YAML).unwrap();
        scenario.connections.push(Connection {
            from: "accept".to_string(),
            to: "ghost".to_string(),
            branch: None,
        });
        assert!(scenario.validate().unwrap_err().to_string().contains("ghost"));
    }

    #[test]
    fn test_validate_rejects_unreachable_end() {
        let mut scenario = Scenario::from_yaml_str(LOGIN_YAML).unwrap();
        scenario.connections.retain(|c| c.to != "e");
        assert!(scenario
            .validate()
            .unwrap_err()
            .to_string()
            .contains("end"));
    }

    #[test]
    fn test_validate_rejects_loop_without_body() {
        let scenario = Scenario::from_json_str(
            r#"{
                "id": "loop", "name": "循环",
                "nodes": [
                    {"id": "s", "type": "start"},
                    {"id": "l", "type": "loop", "loop": {"mode": "count", "times": 2}},
                    {"id": "e", "type": "end"}
                ],
                "connections": [
                    {"from": "s", "to": "l"},
                    {"from": "l", "to": "e", "branch": "exit"}
                ]
            }"#,
        )
        .unwrap();
        assert!(scenario.validate().unwrap_err().to_string().contains("body"));
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        let err = Scenario::from_file("scenario.txt").unwrap_err();
        assert!(matches!(err, ExecutorError::ScenarioLoadFailed(_)));
    }
}
