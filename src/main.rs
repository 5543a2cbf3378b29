//! flowsim CLI
//!
//! 入口：加载配置、初始化日志，按子命令规划工具清单或规划后执行。
//! 未配置 api_url 时在进程内启动实体存储与调度器；否则连接 flowsim-server。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use flowsim::api::{HttpOrchestrationClient, LocalOrchestrator, OrchestrationApi};
use flowsim::config::{load_config, AppConfig};
use flowsim::core::{ShutdownManager, ShutdownReason};
use flowsim::planner::{
    render_outline, render_script, FallbackPolicy, NoHint, OrderingHint, OrderingHintProvider, Plan, StaticHint,
    TaskGraphPlanner, ToolFeed,
};
use flowsim::runner::{FlowRunner, RunnerConfig};
use flowsim::scheduler::{RunScheduler, SimulatedExecutor};
use flowsim::store::{EntityStore, RunRequest};
use flowsim::workflow::ToolBinding;

#[derive(Parser)]
#[command(name = "flowsim")]
#[command(about = "Plan tool feeds into task graphs and run them on a simulated orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Extra config file (overrides config/default.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a tool feed and print the result
    Plan {
        #[command(flatten)]
        plan: PlanArgs,

        /// Output format
        #[arg(short, long, value_enum, default_value = "outline")]
        format: OutputFormat,
    },

    /// Plan a tool feed, deploy it and wait for the run to finish
    Run {
        #[command(flatten)]
        plan: PlanArgs,

        /// Work pool name
        #[arg(long, default_value = "default")]
        pool: String,

        /// Orchestration server URL (defaults to runner.api_url, else in-process)
        #[arg(long)]
        api_url: Option<String>,

        /// Run parameters as a JSON object
        #[arg(long)]
        params: Option<String>,

        /// Comma-separated run tags
        #[arg(long)]
        tags: Option<String>,

        /// Make a tool fail in the in-process simulator (server/tool)
        #[arg(long = "fail", value_name = "SERVER/TOOL")]
        failing: Vec<String>,
    },

    /// List work pools on a server
    Pools {
        #[arg(long)]
        api_url: Option<String>,
    },

    /// Show a flow run on a server
    Status {
        run_id: String,

        #[arg(long)]
        api_url: Option<String>,
    },
}

#[derive(clap::Args)]
struct PlanArgs {
    /// Tool feed JSON ({"available_servers": [...]})
    feed: PathBuf,

    /// What the flow should accomplish
    #[arg(short, long, default_value = "Run all available tools")]
    goal: String,

    /// Ordering hint file (JSON object, markdown fences allowed)
    #[arg(long)]
    hint: Option<PathBuf>,

    /// Fallback when the hint is missing or invalid
    #[arg(long, value_enum)]
    fallback: Option<FallbackArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Outline,
    Script,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum FallbackArg {
    Sequential,
    Parallel,
}

impl From<FallbackArg> for FallbackPolicy {
    fn from(arg: FallbackArg) -> Self {
        match arg {
            FallbackArg::Sequential => FallbackPolicy::Sequential,
            FallbackArg::Parallel => FallbackPolicy::Parallel,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    flowsim::observability::init();

    let cli = Cli::parse();
    let config = load_config(cli.config.clone()).context("Failed to load config")?;

    match cli.command {
        Commands::Plan { plan, format } => {
            let plan = build_plan(&config, &plan).await?;
            report_rejections(&plan);
            let text = match format {
                OutputFormat::Outline => render_outline(&plan.definition),
                OutputFormat::Script => render_script(&plan.definition),
                OutputFormat::Json => serde_json::to_string_pretty(&plan)?,
            };
            println!("{text}");
        }
        Commands::Run {
            plan,
            pool,
            api_url,
            params,
            tags,
            failing,
        } => {
            let plan = build_plan(&config, &plan).await?;
            report_rejections(&plan);
            let request = run_request(params.as_deref(), tags.as_deref())?;
            run(&config, plan, &pool, api_url, request, &failing).await?;
        }
        Commands::Pools { api_url } => {
            let api = remote(&config, api_url)?;
            let pools = api.list_pools().await.context("Failed to list work pools")?;
            println!("{}", serde_json::to_string_pretty(&pools)?);
        }
        Commands::Status { run_id, api_url } => {
            let api = remote(&config, api_url)?;
            let run = api.get_run(&run_id).await.context("Failed to fetch flow run")?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
    }
    Ok(())
}

async fn build_plan(config: &AppConfig, args: &PlanArgs) -> anyhow::Result<Plan> {
    let text = std::fs::read_to_string(&args.feed)
        .with_context(|| format!("Failed to read tool feed {}", args.feed.display()))?;
    let feed = ToolFeed::from_json(&text).context("Tool feed is not valid JSON")?;

    let hints: Arc<dyn OrderingHintProvider> = match &args.hint {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read hint {}", path.display()))?;
            let hint = OrderingHint::from_reply(&text).map_err(anyhow::Error::msg)?;
            Arc::new(StaticHint(hint))
        }
        None => Arc::new(NoHint),
    };

    let mut planner = TaskGraphPlanner::from_config(&config.planner, hints);
    if let Some(fallback) = args.fallback {
        planner = planner.with_fallback(fallback.into());
    }
    let plan = planner
        .plan(&args.goal, &feed.into_descriptors())
        .await
        .context("Planning failed")?;
    Ok(plan)
}

fn report_rejections(plan: &Plan) {
    for r in &plan.rejected {
        eprintln!("rejected {}/{}: {}", r.origin_server, r.tool_name, r.reason);
    }
    if let Some(note) = &plan.fallback {
        eprintln!("fallback {:?}: {}", note.policy, note.reason);
    }
}

fn run_request(params: Option<&str>, tags: Option<&str>) -> anyhow::Result<RunRequest> {
    let mut request = RunRequest::default();
    if let Some(params) = params {
        request.parameters = serde_json::from_str(params).context("--params must be a JSON object")?;
    }
    if let Some(tags) = tags {
        request.tags = tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();
    }
    Ok(request)
}

fn remote(config: &AppConfig, api_url: Option<String>) -> anyhow::Result<HttpOrchestrationClient> {
    let Some(url) = api_url.or_else(|| config.runner.api_url.clone()) else {
        bail!("This command needs a server: pass --api-url or set runner.api_url");
    };
    HttpOrchestrationClient::new(&url).context("Invalid api url")
}

async fn run(
    config: &AppConfig,
    plan: Plan,
    pool: &str,
    api_url: Option<String>,
    request: RunRequest,
    failing: &[String],
) -> anyhow::Result<()> {
    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let api: Arc<dyn OrchestrationApi> = match api_url.or_else(|| config.runner.api_url.clone()) {
        Some(url) => {
            tracing::info!("Using orchestration server at {}", url);
            Arc::new(HttpOrchestrationClient::new(&url).context("Invalid api url")?)
        }
        None => {
            let mut executor = SimulatedExecutor::new();
            for spec in failing {
                let Some((server, tool)) = spec.split_once('/') else {
                    bail!("--fail expects SERVER/TOOL, got '{spec}'");
                };
                executor = executor.fail_on(ToolBinding::new(server, tool), "simulated failure");
            }
            let store = Arc::new(EntityStore::new());
            let scheduler = RunScheduler::new(Arc::clone(&store), Arc::new(executor))
                .with_tasks_per_tick(config.scheduler.tasks_per_tick);
            Arc::new(scheduler).spawn(config.scheduler.tick_interval(), shutdown.child_token());
            Arc::new(LocalOrchestrator::new(store))
        }
    };

    let runner = FlowRunner::new(api, RunnerConfig::from(&config.runner));
    let outcome = tokio::select! {
        result = runner.run_flow(pool, plan.definition, request) => result,
        _ = shutdown.wait_for_shutdown() => bail!("Interrupted"),
    };
    shutdown.shutdown(ShutdownReason::Finished);

    let report = outcome.context("Flow run did not complete")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
