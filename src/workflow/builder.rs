//! 流定义构建器
//!
//! 提供流畅的API来构建 FlowDefinition，build 时统一校验

use serde_json::Value;

use crate::core::ValidationError;
use crate::workflow::types::*;

/// 流定义构建器
pub struct FlowBuilder {
    name: String,
    description: Option<String>,
    tasks: Vec<TaskNode>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            tasks: Vec::new(),
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// 添加任务（ID 取工具全限定名）
    pub fn tool(self, origin_server: &str, tool_name: &str) -> Self {
        let binding = ToolBinding::new(origin_server, tool_name);
        let id = binding.qualified_name();
        self.node(TaskNode::new(id, binding))
    }

    /// 添加任务
    pub fn task(self, id: impl Into<TaskId>, binding: ToolBinding) -> Self {
        self.node(TaskNode::new(id, binding))
    }

    pub fn node(mut self, node: TaskNode) -> Self {
        self.tasks.push(node);
        self
    }

    /// 设置顺序依赖：from 完成后执行 to
    pub fn sequential(self, from: impl Into<TaskId>, to: impl Into<TaskId>) -> Self {
        let from = from.into();
        self.depends_on(to, vec![from])
    }

    /// 追加依赖（所有前置任务完成）
    pub fn depends_on(mut self, task_id: impl Into<TaskId>, deps: Vec<TaskId>) -> Self {
        let id = task_id.into();
        if let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) {
            for dep in deps {
                if !task.upstream.contains(&dep) {
                    task.upstream.push(dep);
                }
            }
        }
        self
    }

    /// 设置调用参数
    pub fn argument(mut self, task_id: &str, key: impl Into<String>, value: Value) -> Self {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.id == task_id) {
            task.arguments.insert(key.into(), value);
        }
        self
    }

    /// 构建并校验
    pub fn build(self) -> Result<FlowDefinition, ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::new("flow name is required"));
        }
        let flow = FlowDefinition {
            name: self.name,
            description: self.description,
            tasks: self.tasks,
        };
        flow.validate()?;
        Ok(flow)
    }
}
