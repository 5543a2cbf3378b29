//! 编排错误类型
//!
//! 实体存储与编排 API 同步返回这些错误，从不内部重试；只有 Runner 会对 `Transport` 类轮询失败做有限重试。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::state::RunState;

/// 实体种类（用于 NotFound / AlreadyExists 的提示信息）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    WorkPool,
    Deployment,
    FlowRun,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityKind::WorkPool => "work pool",
            EntityKind::Deployment => "deployment",
            EntityKind::FlowRun => "flow run",
        };
        f.write_str(s)
    }
}

/// 流定义 / 工具描述校验失败；nodes 列出涉及的任务（如环上的节点）
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            nodes: Vec::new(),
        }
    }

    pub fn with_nodes(message: impl Into<String>, nodes: Vec<String>) -> Self {
        Self {
            message: message.into(),
            nodes,
        }
    }
}

/// 编排过程中的错误分类
#[derive(Error, Debug, Clone)]
pub enum OrchestrationError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: EntityKind, id: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: EntityKind, name: String },

    #[error("invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: RunState,
        to: RunState,
    },

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("run {run_id} did not reach a terminal state within {waited_ms}ms")]
    Timeout { run_id: String, waited_ms: u64 },

    #[error("run {run_id} was cancelled: {detail}")]
    Cancelled { run_id: String, detail: String },

    #[error("run {run_id} failed: {detail}")]
    UpstreamFailure { run_id: String, detail: String },

    /// 与编排后端通信失败（可重试）
    #[error("transport error: {0}")]
    Transport(String),
}

impl OrchestrationError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::UpstreamFailure { .. } => ErrorKind::UpstreamFailure,
            Self::Transport(_) => ErrorKind::Transport,
        }
    }

    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// 错误种类标签（REST 响应体中的 `kind` 字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidTransition,
    Validation,
    Timeout,
    Cancelled,
    UpstreamFailure,
    Transport,
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;
