//! Mock LLM 客户端（用于测试，无需 API）

use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::LlmClient;

/// Mock 客户端：返回预设回复，并记录收到的提示
#[derive(Debug, Default)]
pub struct MockLlmClient {
    reply: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmClient {
    /// 固定回复
    pub fn replying(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 没有预设回复时 complete 返回错误
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// 已收到的用户提示
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _system: &str, prompt: &str) -> Result<String, String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        self.reply
            .clone()
            .ok_or_else(|| "mock llm has no reply configured".to_string())
    }
}
