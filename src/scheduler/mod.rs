//! 运行调度：周期性推进流运行的状态机并执行任务

pub mod executor;
pub mod run_scheduler;

pub use executor::{Behavior, SimulatedExecutor, TaskExecutor, TaskInputs};
pub use run_scheduler::{RunScheduler, TickReport};
