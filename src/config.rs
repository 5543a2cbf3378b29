//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `FLOWSIM__*` 覆盖（双下划线表示嵌套，如 `FLOWSIM__SCHEDULER__TICK_INTERVAL_MS=200`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::planner::FallbackPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub planner: PlannerSection,
}

/// [server] 段：REST 编排服务监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4220
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// [scheduler] 段：tick 间隔与每次 tick 每个运行最多执行的任务数
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_tasks_per_tick")]
    pub tasks_per_tick: usize,
}

fn default_tick_interval_ms() -> u64 {
    500
}

fn default_tasks_per_tick() -> usize {
    1
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            tasks_per_tick: default_tasks_per_tick(),
        }
    }
}

impl SchedulerSection {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// [runner] 段：轮询间隔、退避、超时；api_url 为空时使用进程内编排后端
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSection {
    pub api_url: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// 等待运行进入终态的总时长（秒）
    #[serde(default = "default_runner_timeout_secs")]
    pub timeout_secs: u64,
    /// 连续轮询失败（网络类错误）的最大次数
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,
    #[serde(default = "default_pool_type")]
    pub pool_type: String,
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_max_poll_interval_ms() -> u64 {
    2000
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_runner_timeout_secs() -> u64 {
    60
}

fn default_max_poll_failures() -> u32 {
    5
}

fn default_pool_type() -> String {
    "process".to_string()
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            api_url: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            backoff_factor: default_backoff_factor(),
            timeout_secs: default_runner_timeout_secs(),
            max_poll_failures: default_max_poll_failures(),
            pool_type: default_pool_type(),
        }
    }
}

/// [planner] 段：提示无效时的回退策略、任务显示名截断长度
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerSection {
    #[serde(default)]
    pub fallback: FallbackPolicy,
    #[serde(default = "default_max_name_len")]
    pub max_name_len: usize,
}

fn default_max_name_len() -> usize {
    80
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            fallback: FallbackPolicy::default(),
            max_name_len: default_max_name_len(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 FLOWSIM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 FLOWSIM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("FLOWSIM")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 4220);
        assert_eq!(cfg.scheduler.tasks_per_tick, 1);
        assert_eq!(cfg.runner.pool_type, "process");
        assert!(cfg.runner.api_url.is_none());
        assert_eq!(cfg.planner.fallback, FallbackPolicy::Sequential);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[scheduler]\ntick_interval_ms = 50\n\n[planner]\nfallback = \"parallel\"\n\n[runner]\ntimeout_secs = 3"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.scheduler.tick_interval_ms, 50);
        assert_eq!(cfg.scheduler.tick_interval(), Duration::from_millis(50));
        assert_eq!(cfg.planner.fallback, FallbackPolicy::Parallel);
        assert_eq!(cfg.runner.timeout_secs, 3);
        // 未配置的键保持默认值
        assert_eq!(cfg.runner.poll_interval_ms, 200);
    }
}
