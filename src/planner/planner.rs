//! 任务图规划器
//!
//! 工具描述 -> 任务节点（确定性映射）-> 合并声明依赖与提示依赖 -> 校验无环 -> FlowDefinition。
//! 提示缺失或引用未知任务时按回退策略连边，并在 Plan 中记录原因；环直接拒绝整个定义。
//! 规划器从不执行任务。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PlannerSection;
use crate::core::ValidationError;
use crate::planner::descriptor::{slugify, to_task_node, RejectedTool, ToolDescriptor};
use crate::planner::hint::{OrderingHint, OrderingHintProvider};
use crate::workflow::{parse_task_ref, DependencyGraph, FlowDefinition, TaskId, TaskNode};

/// 提示不可用时的连边方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    /// 按输入顺序串成一条链
    #[default]
    Sequential,
    /// 不加边，全部可并行
    Parallel,
}

/// 回退记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackNote {
    pub policy: FallbackPolicy,
    pub reason: String,
}

/// 规划结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub definition: FlowDefinition,
    /// 被拒绝的描述及原因
    pub rejected: Vec<RejectedTool>,
    /// 使用了回退策略时记录原因
    pub fallback: Option<FallbackNote>,
}

/// 任务图规划器
pub struct TaskGraphPlanner {
    hints: Arc<dyn OrderingHintProvider>,
    fallback: FallbackPolicy,
    max_name_len: usize,
}

impl TaskGraphPlanner {
    pub fn new(hints: Arc<dyn OrderingHintProvider>) -> Self {
        Self {
            hints,
            fallback: FallbackPolicy::default(),
            max_name_len: 80,
        }
    }

    pub fn from_config(section: &PlannerSection, hints: Arc<dyn OrderingHintProvider>) -> Self {
        Self::new(hints)
            .with_fallback(section.fallback)
            .with_max_name_len(section.max_name_len)
    }

    pub fn with_fallback(mut self, policy: FallbackPolicy) -> Self {
        self.fallback = policy;
        self
    }

    pub fn with_max_name_len(mut self, len: usize) -> Self {
        self.max_name_len = len.max(1);
        self
    }

    /// 规划：返回的定义必然无环；环、或没有任何可用工具时返回 ValidationError
    pub async fn plan(&self, goal: &str, descriptors: &[ToolDescriptor]) -> Result<Plan, ValidationError> {
        let (nodes, rejected) = self.map_tools(descriptors);
        if nodes.is_empty() {
            return Err(ValidationError::new("no valid tools to plan"));
        }
        tracing::debug!("Mapped {} tools to tasks, {} rejected", nodes.len(), rejected.len());

        let hint = match self.hints.propose(goal, &nodes).await {
            Ok(Some(h)) if h.tasks.is_empty() => Err("hint is empty".to_string()),
            Ok(Some(h)) => Ok(h),
            Ok(None) => Err("no hint provided".to_string()),
            Err(e) => Err(format!("hint provider failed: {e}")),
        };

        let (tasks, fallback, flow_name, description) = match hint {
            Ok(h) => match apply_hint(&nodes, &h) {
                Ok(tasks) => (tasks, None, h.flow_name, h.description),
                Err(reason) => (self.fallback_edges(nodes), Some(reason), None, None),
            },
            Err(reason) => (self.fallback_edges(nodes), Some(reason), None, None),
        };

        let fallback = fallback.map(|reason| {
            tracing::warn!("Ordering hint unusable ({}), using {:?} fallback", reason, self.fallback);
            FallbackNote {
                policy: self.fallback,
                reason,
            }
        });

        let name = flow_name
            .map(|n| slugify(&n))
            .unwrap_or_else(|| format!("flow_{}", slugify(&goal.chars().take(40).collect::<String>())));
        let description = description
            .filter(|d| !d.trim().is_empty())
            .or_else(|| (!goal.trim().is_empty()).then(|| goal.to_string()));

        let definition = FlowDefinition {
            name,
            description,
            tasks,
        };
        definition.validate()?;

        tracing::info!(
            "Planned flow '{}' with {} tasks ({} rejected)",
            definition.name,
            definition.tasks.len(),
            rejected.len()
        );
        Ok(Plan {
            definition,
            rejected,
            fallback,
        })
    }

    /// 逐个校验描述并解析声明依赖；依赖被拒绝描述的描述同样被拒绝
    pub fn map_tools(&self, descriptors: &[ToolDescriptor]) -> (Vec<TaskNode>, Vec<RejectedTool>) {
        let mut rejected = Vec::new();
        let mut accepted: Vec<(&ToolDescriptor, TaskNode)> = Vec::new();

        for desc in descriptors {
            match to_task_node(desc, self.max_name_len) {
                Ok(node) if accepted.iter().any(|(_, n)| n.id == node.id) => {
                    rejected.push(RejectedTool::new(desc, format!("duplicate task id '{}'", node.id)));
                }
                Ok(node) => accepted.push((desc, node)),
                Err(reason) => rejected.push(RejectedTool::new(desc, reason)),
            }
        }

        let all_ids: Vec<TaskId> = descriptors.iter().map(|d| d.task_id()).collect();
        let mut failed: Vec<(usize, String)> = Vec::new();
        for (idx, (desc, node)) in accepted.iter_mut().enumerate() {
            for dep in &desc.depends_on {
                match resolve_declared(dep, desc, &all_ids) {
                    Some(id) if id == node.id => {
                        failed.push((idx, format!("'{dep}' refers to the task itself")));
                        break;
                    }
                    Some(id) => {
                        if !node.upstream.contains(&id) {
                            node.upstream.push(id);
                        }
                    }
                    None => {
                        failed.push((idx, format!("unknown dependency '{dep}'")));
                        break;
                    }
                }
            }
        }

        let mut reasons: HashMap<usize, String> = failed.into_iter().collect();
        // 传递拒绝：直到没有新的描述因依赖被拒绝而失效
        loop {
            let alive: Vec<&TaskId> = accepted
                .iter()
                .enumerate()
                .filter(|(i, _)| !reasons.contains_key(i))
                .map(|(_, (_, n))| &n.id)
                .collect();
            let dropped: Vec<TaskId> = all_ids
                .iter()
                .filter(|id| !alive.contains(id))
                .cloned()
                .collect();
            let mut changed = false;
            for (idx, (_, node)) in accepted.iter().enumerate() {
                if reasons.contains_key(&idx) {
                    continue;
                }
                if let Some(up) = node.upstream.iter().find(|u| dropped.contains(u)) {
                    reasons.insert(idx, format!("depends on rejected task '{up}'"));
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut nodes = Vec::new();
        for (idx, (desc, node)) in accepted.into_iter().enumerate() {
            match reasons.remove(&idx) {
                Some(reason) => rejected.push(RejectedTool::new(desc, reason)),
                None => nodes.push(node),
            }
        }
        for r in &rejected {
            tracing::warn!("Rejected tool {}/{}: {}", r.origin_server, r.tool_name, r.reason);
        }
        (nodes, rejected)
    }

    fn fallback_edges(&self, mut nodes: Vec<TaskNode>) -> Vec<TaskNode> {
        if self.fallback == FallbackPolicy::Parallel {
            return nodes;
        }
        // 按声明依赖的拓扑序串链，保证链与声明边方向一致；声明边成环时交给校验报错
        let Ok(order) = DependencyGraph::new(&nodes).topological_order() else {
            return nodes;
        };
        for pair in order.windows(2) {
            if let Some(node) = nodes.iter_mut().find(|n| n.id == pair[1]) {
                if !node.upstream.contains(&pair[0]) {
                    node.upstream.push(pair[0].clone());
                }
            }
        }
        nodes
    }
}

/// 声明依赖可写任务 ID，也可写同一服务器上的工具名
fn resolve_declared(dep: &str, desc: &ToolDescriptor, ids: &[TaskId]) -> Option<TaskId> {
    let same_server = slugify(&format!("{}_{}", desc.origin_server.trim(), dep.trim()));
    [dep.trim().to_string(), slugify(dep), same_server]
        .into_iter()
        .find(|candidate| ids.contains(candidate))
}

fn resolve_hinted(key: &str, nodes: &[TaskNode]) -> Option<TaskId> {
    let slug = slugify(key);
    nodes
        .iter()
        .find(|n| n.id == key.trim() || n.id == slug)
        .map(|n| n.id.clone())
}

/// 把提示合并进节点；任何未知引用都使提示整体无效（返回原因）
fn apply_hint(nodes: &[TaskNode], hint: &OrderingHint) -> Result<Vec<TaskNode>, String> {
    let mut tasks = nodes.to_vec();
    for hinted in &hint.tasks {
        let id = resolve_hinted(&hinted.task_key, nodes)
            .ok_or_else(|| format!("hint references unknown task '{}'", hinted.task_key))?;
        let mut upstream = Vec::new();
        for dep in &hinted.depends_on {
            let dep_id = resolve_hinted(dep, nodes)
                .ok_or_else(|| format!("hint task '{}' depends on unknown task '{}'", hinted.task_key, dep))?;
            upstream.push(dep_id);
        }

        let Some(node) = tasks.iter_mut().find(|n| n.id == id) else {
            continue;
        };
        for dep_id in upstream {
            if !node.upstream.contains(&dep_id) {
                node.upstream.push(dep_id);
            }
        }
        for (key, value) in &hinted.parameters {
            let value = match value.as_str().and_then(parse_task_ref) {
                Some(r) => {
                    let target = resolve_hinted(&r, nodes)
                        .ok_or_else(|| format!("parameter '{key}' of '{id}' references unknown task '{r}'"))?;
                    if !node.upstream.contains(&target) {
                        return Err(format!(
                            "parameter '{key}' of '{id}' references '{target}' which is not upstream"
                        ));
                    }
                    Value::String(format!("{{{{{target}}}}}"))
                }
                None => value.clone(),
            };
            node.arguments.insert(key.clone(), value);
        }
    }
    Ok(tasks)
}
