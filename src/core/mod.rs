//! 核心层：错误分类、状态机、优雅关闭

pub mod error;
pub mod shutdown;
pub mod state;

pub use error::{EntityKind, ErrorKind, OrchestrationError, Result, ValidationError};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{PoolStatus, RunState, TaskRunState};
