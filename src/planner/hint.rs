//! 排序提示
//!
//! 提示只是建议：规划器会逐条复核其中的依赖与参数引用。提示来源可插拔（无提示、固定提示、LLM）。

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::LlmClient;
use crate::workflow::TaskNode;

/// 提示格式（LLM 按此 JSON 输出）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OrderingHint {
    /// 流名称
    #[serde(default)]
    pub flow_name: Option<String>,
    /// 一句话说明
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tasks: Vec<HintedTask>,
}

/// 提示中的单个任务
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HintedTask {
    /// 候选任务的 task_key
    pub task_key: String,
    /// 必须先完成的 task_key
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// 调用参数；`{{task_key}}` 引用上游任务的输出
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl OrderingHint {
    /// 提示格式的 JSON Schema，可拼入 system prompt
    pub fn schema_json() -> String {
        let schema = schema_for!(OrderingHint);
        serde_json::to_string_pretty(&schema).unwrap_or_default()
    }

    /// 从模型回复中解析提示
    pub fn from_reply(text: &str) -> Result<Self, String> {
        let value = extract_json(text).ok_or_else(|| "no JSON object found in reply".to_string())?;
        serde_json::from_value(value).map_err(|e| format!("hint does not match schema: {e}"))
    }
}

/// 取出文本中第一个 JSON 对象，忽略 markdown 代码围栏
pub fn extract_json(text: &str) -> Option<Value> {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| Regex::new(r"```(?:json)?\s*").expect("valid regex"));
    let cleaned = fence.replace_all(text, "").replace("```", "");

    let start = cleaned.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in cleaned[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&cleaned[start..start + i + 1]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// 提示提供者
#[async_trait]
pub trait OrderingHintProvider: Send + Sync {
    /// Ok(None) 表示没有提示；Err 按缺失提示处理
    async fn propose(&self, goal: &str, candidates: &[TaskNode]) -> Result<Option<OrderingHint>, String>;
}

/// 不提供提示，总是走回退策略
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHint;

#[async_trait]
impl OrderingHintProvider for NoHint {
    async fn propose(&self, _goal: &str, _candidates: &[TaskNode]) -> Result<Option<OrderingHint>, String> {
        Ok(None)
    }
}

/// 固定提示（测试、CLI `--hint` 文件）
#[derive(Debug, Clone)]
pub struct StaticHint(pub OrderingHint);

#[async_trait]
impl OrderingHintProvider for StaticHint {
    async fn propose(&self, _goal: &str, _candidates: &[TaskNode]) -> Result<Option<OrderingHint>, String> {
        Ok(Some(self.0.clone()))
    }
}

const SYSTEM_PROMPT: &str = "You are a workflow planner. Given a user goal and a list of candidate tasks, \
decide which tasks depend on which and how their parameters are filled. \
Only reference task_key values from the candidate list. \
Use {{task_key}} as a parameter value to pass the output of an upstream task. \
Reply with a single JSON object matching this schema and nothing else:\n";

/// 由 LLM 生成提示
pub struct LlmHintProvider {
    client: Arc<dyn LlmClient>,
}

impl LlmHintProvider {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    fn build_prompt(goal: &str, candidates: &[TaskNode]) -> String {
        let listing: Vec<Value> = candidates
            .iter()
            .map(|t| {
                serde_json::json!({
                    "task_key": t.id,
                    "name": t.name,
                    "parameters": t.parameters,
                    "required": t.required,
                })
            })
            .collect();
        let listing = serde_json::to_string_pretty(&listing).unwrap_or_default();
        format!("User goal: {goal}\n\nCandidate tasks:\n{listing}\n\nProduce the flow JSON.")
    }
}

#[async_trait]
impl OrderingHintProvider for LlmHintProvider {
    async fn propose(&self, goal: &str, candidates: &[TaskNode]) -> Result<Option<OrderingHint>, String> {
        let system = format!("{}{}", SYSTEM_PROMPT, OrderingHint::schema_json());
        let reply = self
            .client
            .complete(&system, &Self::build_prompt(goal, candidates))
            .await?;
        OrderingHint::from_reply(&reply).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::workflow::ToolBinding;

    #[test]
    fn test_extract_json_from_fenced_reply() {
        let reply = "Here you go:\n```json\n{\"tasks\": [{\"task_key\": \"a\", \"parameters\": {\"x\": {\"y\": 1}}}]}\n```\ntrailing {junk}";
        let v = extract_json(reply).unwrap();
        assert_eq!(v["tasks"][0]["task_key"], "a");
        assert_eq!(v["tasks"][0]["parameters"]["x"]["y"], 1);
    }

    #[test]
    fn test_extract_json_ignores_braces_in_strings() {
        let reply = r#"{"flow_name": "etl", "description": "load {raw} rows, emit \"}\" markers", "tasks": [{"task_key": "db_load"}]} done"#;
        let v = extract_json(reply).unwrap();
        assert_eq!(v["description"], "load {raw} rows, emit \"}\" markers");
        assert_eq!(v["tasks"][0]["task_key"], "db_load");

        let hint = OrderingHint::from_reply(reply).unwrap();
        assert_eq!(hint.tasks.len(), 1);
    }

    #[test]
    fn test_extract_json_none() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("{ unbalanced").is_none());
        assert!(extract_json("{not json}").is_none());
    }

    #[test]
    fn test_schema_mentions_fields() {
        let schema = OrderingHint::schema_json();
        assert!(schema.contains("task_key"));
        assert!(schema.contains("depends_on"));
    }

    #[tokio::test]
    async fn test_llm_provider_parses_reply() {
        let client = Arc::new(MockLlmClient::replying(
            r#"{"flow_name": "report", "tasks": [{"task_key": "s_b", "depends_on": ["s_a"]}]}"#,
        ));
        let provider = LlmHintProvider::new(client.clone());
        let candidates = vec![TaskNode::new("s_a", ToolBinding::new("s", "a"))];
        let hint = provider.propose("make a report", &candidates).await.unwrap().unwrap();
        assert_eq!(hint.flow_name.as_deref(), Some("report"));
        assert_eq!(hint.tasks[0].depends_on, vec!["s_a"]);

        let prompts = client.prompts();
        assert!(prompts[0].contains("make a report"));
        assert!(prompts[0].contains("s_a"));
    }

    #[tokio::test]
    async fn test_llm_provider_errors() {
        let provider = LlmHintProvider::new(Arc::new(MockLlmClient::unavailable()));
        assert!(provider.propose("g", &[]).await.is_err());

        let provider = LlmHintProvider::new(Arc::new(MockLlmClient::replying("sorry, I can't")));
        assert!(provider.propose("g", &[]).await.is_err());
    }
}
