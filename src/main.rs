//! Stinger - 多 Agent 安全分析编排器
//!
//! 用法：stinger <target> [--config <file>] [--language <lang>] [--no-ai]
//! 入口：初始化日志、加载配置、发现 Agent、执行完整流水线，并把最终 Run 以 JSON 输出到 stdout。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use stinger::agents::{AgentRegistry, AnalysisTarget};
use stinger::bus::MessageBus;
use stinger::config::load_config;
use stinger::core::{AuditLog, Orchestrator, ShutdownManager};
use stinger::findings::CorrelationEngine;
use stinger::observability;
use stinger::triage::TriageEngine;

struct CliArgs {
    target: PathBuf,
    config: Option<PathBuf>,
    language: Option<String>,
    no_ai: bool,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut args = std::env::args().skip(1);
    let mut target = None;
    let mut config = None;
    let mut language = None;
    let mut no_ai = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => config = Some(PathBuf::from(args.next().context("--config requires a path")?)),
            "--language" | "-l" => language = Some(args.next().context("--language requires a value")?),
            "--no-ai" => no_ai = true,
            "--help" | "-h" => {
                eprintln!("usage: stinger <target> [--config <file>] [--language <lang>] [--no-ai]");
                std::process::exit(0);
            }
            other if other.starts_with('-') => bail!("unknown option: {}", other),
            other => {
                if target.replace(PathBuf::from(other)).is_some() {
                    bail!("only one target may be given");
                }
            }
        }
    }

    Ok(CliArgs {
        target: target.context("missing <target>; see --help")?,
        config,
        language,
        no_ai,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let args = parse_args()?;
    let mut cfg = load_config(args.config.clone()).context("Failed to load config")?;
    if args.no_ai {
        cfg.triage.ai_enabled = false;
    }

    let registry = Arc::new(AgentRegistry::new());
    registry.register_commands(&cfg.agents);
    let report = registry.discover();
    if !report.unavailable.is_empty() {
        tracing::warn!(skipped = ?report.unavailable, "Some agents are not installed");
    }

    let audit = Arc::new(AuditLog::new());
    let bus = Arc::new(MessageBus::with_history_capacity(cfg.orchestrator.bus_history));
    let triage = Arc::new(TriageEngine::from_config(cfg.triage.clone(), Arc::clone(&audit)));

    let mut orchestrator = Orchestrator::new(registry, bus, Arc::clone(&audit), cfg.orchestrator.clone())
        .with_triage(triage);
    if cfg.correlation.enabled {
        orchestrator = orchestrator.with_correlation(CorrelationEngine::new(cfg.correlation.engine.clone()));
    }

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let supervisor = shutdown.supervisor();

    let mut target = AnalysisTarget::new(args.target.clone());
    if let Some(language) = args.language {
        target = target.with_language(language);
    }

    let run = orchestrator
        .run(target, &cfg.selection, &supervisor)
        .await
        .context("Run failed")?;

    let json = serde_json::to_string_pretty(&run).context("Failed to serialize run")?;
    println!("{}", json);
    tracing::info!(audit_entries = audit.len(), "Done");
    Ok(())
}
