//! 工具描述与逐个校验
//!
//! 工具清单来自外部（不可信），每个描述独立校验：不合法的描述被拒绝并记录原因，不影响其他描述。

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::workflow::{TaskId, TaskNode, ToolBinding};

/// 工具描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub origin_server: String,
    pub tool_name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema（object）
    #[serde(default)]
    pub parameter_schema: Value,
    /// 声明的依赖：任务 ID，或同一服务器上的工具名
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ToolDescriptor {
    pub fn new(origin_server: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            origin_server: origin_server.into(),
            tool_name: tool_name.into(),
            description: String::new(),
            parameter_schema: Value::Null,
            depends_on: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.parameter_schema = schema;
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on.extend(deps.iter().map(|d| d.to_string()));
        self
    }

    /// 确定性的任务 ID：`server_tool` 的 slug
    pub fn task_id(&self) -> TaskId {
        slugify(&format!("{}_{}", self.origin_server.trim(), self.tool_name.trim()))
    }

    pub fn binding(&self) -> ToolBinding {
        ToolBinding::new(self.origin_server.trim(), self.tool_name.trim())
    }
}

/// 被拒绝的描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedTool {
    pub origin_server: String,
    pub tool_name: String,
    pub reason: String,
}

impl RejectedTool {
    pub fn new(desc: &ToolDescriptor, reason: impl Into<String>) -> Self {
        Self {
            origin_server: desc.origin_server.clone(),
            tool_name: desc.tool_name.clone(),
            reason: reason.into(),
        }
    }
}

/// 非字母数字字符替换为 `_`，去掉首尾 `_` 并转小写；结果为空时为 `task`
pub fn slugify(name: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_]").expect("valid regex"));
    let slug = re.replace_all(name, "_");
    let slug = slug.trim_matches('_').to_lowercase();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

/// 校验单个描述并映射为任务节点（不含依赖边）
///
/// 以 `_` 开头的参数由宿主注入，从 properties 与 required 中剔除。
pub fn to_task_node(desc: &ToolDescriptor, max_name_len: usize) -> Result<TaskNode, String> {
    if desc.origin_server.trim().is_empty() {
        return Err("origin server must not be empty".to_string());
    }
    if desc.tool_name.trim().is_empty() {
        return Err("tool name must not be empty".to_string());
    }

    let empty = Map::new();
    let schema = match &desc.parameter_schema {
        Value::Null => &empty,
        Value::Object(obj) => obj,
        other => return Err(format!("parameter schema must be an object, got {}", json_type(other))),
    };

    if let Some(t) = schema.get("type") {
        if t != "object" {
            return Err(format!("parameter schema type must be \"object\", got {t}"));
        }
    }

    let properties = match schema.get("properties") {
        None => Map::new(),
        Some(Value::Object(props)) => props.clone(),
        Some(other) => return Err(format!("properties must be an object, got {}", json_type(other))),
    };

    let mut required = Vec::new();
    match schema.get("required") {
        None => {}
        Some(Value::Array(items)) => {
            for item in items {
                let Some(name) = item.as_str() else {
                    return Err(format!("required entries must be strings, got {item}"));
                };
                if !properties.contains_key(name) {
                    return Err(format!("required parameter '{name}' is not declared in properties"));
                }
                if !name.starts_with('_') {
                    required.push(name.to_string());
                }
            }
        }
        Some(other) => return Err(format!("required must be an array, got {}", json_type(other))),
    }

    let parameters: Map<String, Value> = properties
        .into_iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .collect();

    let binding = desc.binding();
    let name = if desc.description.trim().is_empty() {
        binding.qualified_name()
    } else {
        desc.description.trim().chars().take(max_name_len).collect()
    };

    let mut node = TaskNode::new(desc.task_id(), binding);
    node.name = name;
    node.parameters = parameters;
    node.required = required;
    Ok(node)
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 工具注册表格式：`{"available_servers": [{"server_name", "tools": [...]}]}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolFeed {
    #[serde(default)]
    pub available_servers: Vec<FeedServer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedServer {
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub tools: Vec<FeedTool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedTool {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ToolFeed {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// 展开为描述列表（保持清单顺序）
    pub fn into_descriptors(self) -> Vec<ToolDescriptor> {
        self.available_servers
            .into_iter()
            .flat_map(|server| {
                let server_name = server.server_name;
                server.tools.into_iter().map(move |tool| ToolDescriptor {
                    origin_server: server_name.clone(),
                    tool_name: tool.name,
                    description: tool.description,
                    parameter_schema: tool.parameters,
                    depends_on: tool.depends_on,
                })
            })
            .collect()
    }
}
