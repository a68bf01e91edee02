//! hive 命令行入口
//!
//! 用法：
//!   hive "整理 data 目录里的 csv 并汇总"      运行一个新会话
//!   hive --resume <session-id>               从最近检查点恢复
//!   hive --events "..."                      以 JSONL 输出会话事件流

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use hive::capability::{core_pack, CapabilityInvoker, CapabilityRegistry, DomainClassifier};
use hive::checkpoint::CheckpointStore;
use hive::config::load_config;
use hive::llm::MockProposalClient;
use hive::memory::SharedMemory;
use hive::plan::{Decomposer, Goal};
use hive::scheduler::{Scheduler, Verifier};
use hive::session::{AgentLoop, SessionContext, SessionOutcome};
use hive::subagent::SubAgentManager;

#[derive(Parser, Debug)]
#[command(name = "hive", version, about = "面向长程任务的编排引擎")]
struct Cli {
    /// 目标文本；与 --resume 二选一
    goal: Option<String>,

    /// 从最近检查点恢复指定会话
    #[arg(long, value_name = "SESSION_ID")]
    resume: Option<String>,

    /// 目标的成功判据（如 "value >= 0.85" 或自由文本）
    #[arg(long)]
    criteria: Option<String>,

    /// 覆盖配置中的最大迭代次数
    #[arg(long)]
    max_iterations: Option<u32>,

    /// 预装指定领域包（逗号分隔），分类结果之外额外可用
    #[arg(long, value_delimiter = ',')]
    domains: Vec<String>,

    /// 配置文件路径（叠加在 config/default.toml 之上）
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// 以 JSONL 输出会话事件流
    #[arg(long)]
    events: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.clone()).context("loading configuration")?;
    if let Some(n) = cli.max_iterations {
        config.session.max_iterations = n;
    }

    let registry = Arc::new(CapabilityRegistry::new(config.registry.capability_budget));
    let notes = Arc::new(StdMutex::new(Vec::new()));
    registry.install_pack(core_pack(notes))?;
    if !cli.domains.is_empty() {
        registry.load(&cli.domains)?;
    }

    let invoker = Arc::new(CapabilityInvoker::new(
        registry.clone(),
        Duration::from_secs(config.scheduler.subtask_timeout_secs),
    ));
    let subagents = Arc::new(SubAgentManager::new(
        invoker.clone(),
        Duration::from_secs(config.subagent.timeout_secs),
        config.subagent.max_iterations,
    ));
    let proposals = Arc::new(MockProposalClient::new());
    let agent = AgentLoop::new(
        DomainClassifier::new(),
        Decomposer::new(proposals.clone()),
        Scheduler::new(invoker, subagents, Verifier::new(proposals.clone())),
    );

    let shared = SharedMemory::open(config.memory.dir.join("shared.json"))?;
    let checkpoints = Arc::new(CheckpointStore::new(
        config.checkpoint.dir.clone(),
        config.checkpoint.retain,
    ));

    let mut ctx = SessionContext::new(
        config,
        registry,
        Arc::new(Mutex::new(shared)),
        checkpoints,
        proposals,
    );
    if let Some(session_id) = &cli.resume {
        ctx = ctx.with_session_id(session_id.clone());
    }
    if cli.events {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        ctx = ctx.with_events(tx);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{}", line);
                }
            }
        });
    }

    // Ctrl-C 触发协作式取消，调度器落一个最终检查点后退出
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling session");
            cancel.cancel();
        }
    });

    let report = if cli.resume.is_some() {
        agent.resume_session(&ctx).await?
    } else {
        let text = cli
            .goal
            .clone()
            .context("provide a goal, or --resume <session-id>")?;
        let mut goal = Goal::new(text);
        if let Some(criteria) = cli.criteria.clone() {
            goal = goal.with_criteria(criteria);
        }
        agent.run_session(goal, &ctx).await?
    };

    println!("session: {}", report.session_id);
    println!("outcome: {}", report.outcome.as_str());
    println!("{}", report.summary);
    if !report.failed.is_empty() {
        println!("failed:  {}", report.failed.join(", "));
    }
    if !report.skipped.is_empty() {
        println!("skipped: {}", report.skipped.join(", "));
    }

    if report.outcome == SessionOutcome::Complete {
        Ok(())
    } else {
        std::process::exit(1)
    }
}
