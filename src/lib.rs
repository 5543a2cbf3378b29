//! flowsim - 工作流编排模拟器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、运行状态机、优雅关闭
//! - **observability**: 日志初始化
//! - **workflow**: 流定义、任务节点、依赖图与构建器
//! - **store**: 实体存储（工作池 / 部署 / 流运行）
//! - **scheduler**: 运行调度器与任务执行器
//! - **api**: 编排 API（进程内 / REST 客户端 / axum 路由）
//! - **llm**: LLM 客户端抽象（排序提示后端）
//! - **planner**: 工具描述 -> 任务图规划
//! - **runner**: 部署、提交并轮询流运行

pub mod api;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod planner;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod workflow;
