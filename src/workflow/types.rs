//! 流定义类型
//!
//! FlowDefinition 是部署内嵌的任务图：有序的 TaskNode 列表，每个节点声明其上游依赖。

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::ValidationError;
use crate::workflow::graph::DependencyGraph;

pub type TaskId = String;

/// 工具绑定：(来源服务器, 工具名)，规划时一次性解析，执行器按此键查表
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ToolBinding {
    pub origin_server: String,
    pub tool_name: String,
}

impl ToolBinding {
    pub fn new(origin_server: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            origin_server: origin_server.into(),
            tool_name: tool_name.into(),
        }
    }

    /// 全限定名 `server_tool`
    pub fn qualified_name(&self) -> String {
        format!("{}_{}", self.origin_server, self.tool_name)
    }
}

/// 任务图中的一个节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: TaskId,
    /// 显示名
    pub name: String,
    pub binding: ToolBinding,
    /// 参数 schema（JSON Schema 的 properties）
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub required: Vec<String>,
    /// 上游任务 ID（全部完成后本任务才可执行）
    #[serde(default)]
    pub upstream: Vec<TaskId>,
    /// 调用参数；形如 `{{task_id}}` 的字符串引用上游任务的输出
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl TaskNode {
    pub fn new(id: impl Into<TaskId>, binding: ToolBinding) -> Self {
        let id = id.into();
        Self {
            name: binding.qualified_name(),
            id,
            binding,
            parameters: Map::new(),
            required: Vec::new(),
            upstream: Vec::new(),
            arguments: Map::new(),
        }
    }

    pub fn depends_on(&self, task_id: &str) -> bool {
        self.upstream.iter().any(|u| u == task_id)
    }

    /// arguments 中引用的任务 ID（按出现顺序，去重）
    pub fn argument_refs(&self) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        self.arguments
            .values()
            .filter_map(|v| v.as_str().and_then(parse_task_ref))
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }
}

/// 解析 `{{task_id}}` 引用
pub fn parse_task_ref(value: &str) -> Option<TaskId> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^\{\{\s*([A-Za-z0-9_\-]+)\s*\}\}$").expect("valid regex"));
    re.captures(value.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// 流定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskNode>,
}

impl FlowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            tasks: Vec::new(),
        }
    }

    pub fn task(&self, id: &str) -> Option<&TaskNode> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    /// 校验不变式：ID 唯一、上游存在、无自依赖、参数引用指向上游、无环
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut ids = HashSet::new();
        for task in &self.tasks {
            if task.id.trim().is_empty() {
                return Err(ValidationError::new("task id must not be empty"));
            }
            if !ids.insert(task.id.as_str()) {
                return Err(ValidationError::with_nodes(
                    format!("duplicate task id '{}'", task.id),
                    vec![task.id.clone()],
                ));
            }
        }

        for task in &self.tasks {
            for up in &task.upstream {
                if up == &task.id {
                    return Err(ValidationError::with_nodes(
                        format!("task '{}' depends on itself", task.id),
                        vec![task.id.clone()],
                    ));
                }
                if !ids.contains(up.as_str()) {
                    return Err(ValidationError::with_nodes(
                        format!("task '{}' depends on unknown task '{}'", task.id, up),
                        vec![task.id.clone(), up.clone()],
                    ));
                }
            }
            for r in task.argument_refs() {
                if !task.depends_on(&r) {
                    return Err(ValidationError::with_nodes(
                        format!(
                            "task '{}' references output of '{}' which is not upstream",
                            task.id, r
                        ),
                        vec![task.id.clone(), r],
                    ));
                }
            }
        }

        let graph = DependencyGraph::new(&self.tasks);
        if let Some(cycle) = graph.find_cycle() {
            let mut path = cycle.clone();
            if let Some(first) = cycle.first() {
                path.push(first.clone());
            }
            return Err(ValidationError::with_nodes(
                format!("cyclic dependency detected: {}", path.join(" -> ")),
                cycle,
            ));
        }
        Ok(())
    }

    pub fn is_acyclic(&self) -> bool {
        DependencyGraph::new(&self.tasks).find_cycle().is_none()
    }

    /// 执行顺序：拓扑序，同层按定义中的位置
    pub fn execution_order(&self) -> Result<Vec<TaskId>, ValidationError> {
        DependencyGraph::new(&self.tasks)
            .topological_order()
            .map_err(|stuck| ValidationError::with_nodes("task graph contains a cycle", stuck))
    }
}
