//! 状态机定义：流运行状态、工作池状态、任务运行状态
//!
//! ```text
//! SCHEDULED -> PENDING -> RUNNING -> COMPLETED
//! SCHEDULED|PENDING|RUNNING -> CANCELLED
//! RUNNING -> FAILED
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 流运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Scheduled,
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Cancelled)
    }

    /// 状态机是否允许 self -> next
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Scheduled, Pending)
                | (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Scheduled, Cancelled)
                | (Pending, Cancelled)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Scheduled => "SCHEDULED",
            RunState::Pending => "PENDING",
            RunState::Running => "RUNNING",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
            RunState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SCHEDULED" => Ok(RunState::Scheduled),
            "PENDING" => Ok(RunState::Pending),
            "RUNNING" => Ok(RunState::Running),
            "COMPLETED" => Ok(RunState::Completed),
            "FAILED" => Ok(RunState::Failed),
            "CANCELLED" => Ok(RunState::Cancelled),
            other => Err(format!("unknown run state: {other}")),
        }
    }
}

/// 工作池状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolStatus {
    #[default]
    Ready,
    Paused,
}

/// 单个任务的执行结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRunState {
    Completed,
    Failed,
}
