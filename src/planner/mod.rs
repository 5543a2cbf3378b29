//! 任务图规划：工具描述 -> 校验 -> 排序提示 -> 无环的流定义

pub mod descriptor;
pub mod hint;
#[allow(clippy::module_inception)]
pub mod planner;
pub mod render;

pub use descriptor::{slugify, RejectedTool, ToolDescriptor, ToolFeed};
pub use hint::{extract_json, HintedTask, LlmHintProvider, NoHint, OrderingHint, OrderingHintProvider, StaticHint};
pub use planner::{FallbackNote, FallbackPolicy, Plan, TaskGraphPlanner};
pub use render::{render_outline, render_script};
