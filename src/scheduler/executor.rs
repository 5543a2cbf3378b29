//! 任务执行器
//!
//! 调度器通过 TaskExecutor 执行单个任务。SimulatedExecutor 是按 ToolBinding 建立的查找表：
//! 表中配置的绑定返回固定结果或失败，未配置的绑定返回回显解析后参数的模拟结果。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::workflow::{parse_task_ref, TaskId, TaskNode, ToolBinding};

/// 执行单个任务时可见的输入
#[derive(Debug, Clone, Default)]
pub struct TaskInputs {
    /// 运行参数（部署默认值叠加提交时的参数）
    pub parameters: Map<String, Value>,
    /// 已完成上游任务的输出
    pub upstream: HashMap<TaskId, Value>,
}

impl TaskInputs {
    /// 将 arguments 中的 `{{task_id}}` 替换为上游输出
    pub fn resolve_arguments(&self, task: &TaskNode) -> Map<String, Value> {
        task.arguments
            .iter()
            .map(|(k, v)| {
                let resolved = v
                    .as_str()
                    .and_then(parse_task_ref)
                    .and_then(|id| self.upstream.get(&id).cloned())
                    .unwrap_or_else(|| v.clone());
                (k.clone(), resolved)
            })
            .collect()
    }
}

/// 任务执行器 trait
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// 执行单个任务；Err 为人类可读的失败原因
    async fn execute(&self, task: &TaskNode, inputs: &TaskInputs) -> Result<Value, String>;
}

/// 模拟行为
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed(Value),
    Fail(String),
}

/// 模拟执行器
#[derive(Debug, Clone, Default)]
pub struct SimulatedExecutor {
    behaviors: HashMap<ToolBinding, Behavior>,
    delay: Option<Duration>,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, binding: ToolBinding, result: Value) -> Self {
        self.behaviors.insert(binding, Behavior::Succeed(result));
        self
    }

    pub fn fail_on(mut self, binding: ToolBinding, message: impl Into<String>) -> Self {
        self.behaviors.insert(binding, Behavior::Fail(message.into()));
        self
    }

    /// 每个任务的模拟耗时
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    async fn execute(&self, task: &TaskNode, inputs: &TaskInputs) -> Result<Value, String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.behaviors.get(&task.binding) {
            Some(Behavior::Succeed(v)) => Ok(v.clone()),
            Some(Behavior::Fail(msg)) => Err(msg.clone()),
            None => Ok(json!({
                "tool": task.binding.qualified_name(),
                "status": "ok",
                "arguments": Value::Object(inputs.resolve_arguments(task)),
            })),
        }
    }
}
