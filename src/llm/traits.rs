//! LLM 客户端抽象
//!
//! 规划器只需要非流式完成：给定 system 提示与用户提示，返回模型原始文本。

use async_trait::async_trait;

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, String>;
}
