//! 编排器：选择 → 派发 → 收集 → 聚合 →（关联 → 分级）→ 完成
//!
//! 每个 Agent 调用在独立任务中执行，并与硬超时及运行级取消信号竞速；超时或取消时
//! 中止该任务（子进程随之被杀掉）。单个 Agent 的失败只产生一条失败记录，
//! 只有全部 Agent 都未成功时整个运行才失败。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::{
    Agent, AgentDescriptor, AgentFilter, AgentRegistry, AnalysisTarget, Capability, CostClass, SpeedClass,
};
use crate::bus::{
    BusMessage, MessageBus, ProgressEvent, TOPIC_FINDINGS_CORRELATED, TOPIC_FINDINGS_RAW, TOPIC_FINDINGS_TRIAGED,
};
use crate::core::{
    AgentError, AnalysisResult, AnalysisStatus, AuditEvent, AuditLog, DispatchMode, OrchestratorError, Run,
    RunPhase, SessionSupervisor, TaskScheduler,
};
use crate::findings::{normalize, CorrelationEngine, NormalizeError, RawFinding};
use crate::triage::TriageEngine;

const PRODUCER: &str = "orchestrator";

/// [orchestrator] 配置段
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrency: usize,
    pub agent_timeout_secs: u64,
    /// 按 Agent 名覆盖超时（秒）
    pub agent_timeouts: HashMap<String, u64>,
    pub dispatch_mode: DispatchMode,
    /// 每个主题保留的历史消息条数
    pub bus_history: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            agent_timeout_secs: 60,
            agent_timeouts: HashMap::new(),
            dispatch_mode: DispatchMode::Parallel,
            bus_history: crate::bus::DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl OrchestratorConfig {
    pub fn timeout_for(&self, agent: &str) -> Duration {
        let secs = self
            .agent_timeouts
            .get(agent)
            .copied()
            .unwrap_or(self.agent_timeout_secs);
        Duration::from_secs(secs)
    }
}

/// 选择条件（[selection] 配置段提供默认值）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionCriteria {
    /// 任一匹配即可；空表示不限
    pub capabilities: Vec<Capability>,
    pub max_cost: Option<CostClass>,
    /// 时间预算（秒），换算为速度等级上限
    pub time_budget_secs: Option<u64>,
    /// 覆盖目标自身的语言
    pub language: Option<String>,
    pub max_agents: Option<usize>,
}

impl SelectionCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn max_cost(mut self, cost: CostClass) -> Self {
        self.max_cost = Some(cost);
        self
    }

    pub fn time_budget(mut self, budget: Duration) -> Self {
        self.time_budget_secs = Some(budget.as_secs());
        self
    }

    pub fn max_agents(mut self, n: usize) -> Self {
        self.max_agents = Some(n);
        self
    }

    fn to_filter(&self, target: &AnalysisTarget) -> AgentFilter {
        AgentFilter {
            language: self.language.clone().or_else(|| target.infer_language()),
            capabilities: self.capabilities.clone(),
            max_cost: self.max_cost,
            max_speed: self
                .time_budget_secs
                .map(|secs| SpeedClass::ceiling_for_budget(Duration::from_secs(secs))),
            available_only: false,
        }
    }
}

/// 选择结果：待派发的 Agent 与匹配但不可用的 Agent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub agents: Vec<AgentDescriptor>,
    pub unavailable: Vec<AgentDescriptor>,
}

struct AgentOutcome {
    agent: String,
    duration: Duration,
    result: Result<Vec<RawFinding>, AgentError>,
}

/// 编排器：注册表、总线、审计日志均由调用方注入，便于多个运行互不干扰
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    bus: Arc<MessageBus>,
    audit: Arc<AuditLog>,
    config: OrchestratorConfig,
    correlation: Option<CorrelationEngine>,
    triage: Option<Arc<TriageEngine>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        bus: Arc<MessageBus>,
        audit: Arc<AuditLog>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            bus,
            audit,
            config,
            correlation: None,
            triage: None,
        }
    }

    pub fn with_correlation(mut self, engine: CorrelationEngine) -> Self {
        self.correlation = Some(engine);
        self
    }

    pub fn with_triage(mut self, engine: Arc<TriageEngine>) -> Self {
        self.triage = Some(engine);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// 按条件查询注册表；结果按速度等级（快在前）排序，超出 max_agents 的截断
    pub fn select(&self, target: &AnalysisTarget, criteria: &SelectionCriteria) -> Selection {
        let (mut agents, unavailable): (Vec<_>, Vec<_>) = self
            .registry
            .filter(&criteria.to_filter(target))
            .into_iter()
            .partition(|d| d.available);
        if let Some(max) = criteria.max_agents {
            agents.truncate(max);
        }
        Selection { agents, unavailable }
    }

    /// 执行一次完整运行
    pub async fn run(
        &self,
        target: AnalysisTarget,
        criteria: &SelectionCriteria,
        supervisor: &SessionSupervisor,
    ) -> Result<Run, OrchestratorError> {
        let mut run = Run::new(target.clone());
        let run_id = run.id();

        self.advance(&mut run, RunPhase::Selecting)?;
        let selection = self.select(&target, criteria);
        for descriptor in &selection.unavailable {
            self.audit.record(
                Some(run_id),
                AuditEvent::AgentSkipped {
                    agent: descriptor.name.clone(),
                    reason: "not installed".to_string(),
                },
            );
            run.push_result(AnalysisResult::skipped(&descriptor.name, "not installed"));
        }
        run.stats_mut().selected_agents = selection.agents.len();
        run.stats_mut().skipped_agents = selection.unavailable.len();

        let names: Vec<String> = selection.agents.iter().map(|d| d.name.clone()).collect();
        tracing::info!(%run_id, target = %target.path.display(), agents = ?names, "Run started");
        self.bus.publish(BusMessage::progress(
            PRODUCER,
            ProgressEvent::RunStarted {
                run_id,
                target: target.path.display().to_string(),
                agents: names,
            },
        ));

        if selection.agents.is_empty() {
            tracing::warn!(%run_id, "No available agent matches the selection criteria");
            self.abort(&mut run)?;
            return Err(OrchestratorError::NoAgentsSelected {
                skipped: selection.unavailable.len(),
            });
        }

        self.advance(&mut run, RunPhase::Dispatching)?;
        let pending = self.dispatch(run_id, &target, &selection.agents, supervisor);

        self.advance(&mut run, RunPhase::Collecting)?;
        let outcomes = join_all(pending).await;
        if supervisor.is_cancelled() {
            tracing::warn!(%run_id, "Run cancelled, keeping completed results");
            run.mark_cancelled();
        }

        let mut findings = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(raw) => {
                    let normalized = normalize(&outcome.agent, &raw);
                    for NormalizeError::MalformedFinding { agent, index, reason } in normalized.rejected.iter().cloned() {
                        self.audit
                            .record(Some(run_id), AuditEvent::MalformedFinding { agent, index, reason });
                    }
                    let stats = run.stats_mut();
                    stats.successful_agents += 1;
                    stats.total_raw_findings += raw.len();
                    stats.normalized_findings += normalized.findings.len();
                    stats.rejected_findings += normalized.rejected.len();

                    if !normalized.findings.is_empty() {
                        self.bus.publish(BusMessage::findings(
                            TOPIC_FINDINGS_RAW,
                            outcome.agent.clone(),
                            normalized.findings.clone(),
                        ));
                    }
                    findings.extend(normalized.findings);
                    run.push_result(AnalysisResult::success(&outcome.agent, outcome.duration, raw.len()));
                }
                Err(e) => {
                    let result = AnalysisResult::failure(&outcome.agent, outcome.duration, &e);
                    tracing::warn!(%run_id, agent = %outcome.agent, status = ?result.status, "Agent failed: {}", e);
                    self.audit.record(
                        Some(run_id),
                        AuditEvent::AgentFailed {
                            agent: outcome.agent.clone(),
                            status: result.status,
                            error: e.to_string(),
                        },
                    );
                    run.stats_mut().failed_agents += 1;
                    run.push_result(result);
                }
            }
        }

        if run.stats().successful_agents == 0 {
            tracing::error!(%run_id, "All selected agents failed");
            self.abort(&mut run)?;
            return Err(OrchestratorError::AllAgentsFailed {
                results: run.results().to_vec(),
            });
        }

        self.advance(&mut run, RunPhase::Aggregated)?;
        run.set_findings(findings);

        if let Some(engine) = &self.correlation {
            self.advance(&mut run, RunPhase::Correlating)?;
            let (correlated, stats) = engine.correlate_with_stats(run.take_findings());
            tracing::info!(
                %run_id,
                input = stats.input,
                output = stats.output,
                dedup_rate = stats.dedup_rate,
                "Correlation finished"
            );
            run.stats_mut().dedup_rate = stats.dedup_rate;
            self.bus
                .publish(BusMessage::findings(TOPIC_FINDINGS_CORRELATED, PRODUCER, correlated.clone()));
            run.set_findings(correlated);
        }
        run.stats_mut().correlated_findings = run.findings().len();

        if let Some(engine) = &self.triage {
            self.advance(&mut run, RunPhase::Triaging)?;
            // 取消后不再调用外部分类服务，只用规则分级
            let (triaged, summary) = if run.was_cancelled() {
                engine.triage_rules_only(Some(run_id), run.take_findings()).await
            } else {
                engine.triage(Some(run_id), run.take_findings()).await
            };
            run.stats_mut().triage_cost = summary.cost;
            self.bus
                .publish(BusMessage::findings(TOPIC_FINDINGS_TRIAGED, PRODUCER, triaged.clone()));
            run.set_findings(triaged);
        }

        self.advance(&mut run, RunPhase::Done)?;
        run.finalize();
        self.publish_completed(&run);
        tracing::info!(
            %run_id,
            findings = run.findings().len(),
            succeeded = run.stats().successful_agents,
            failed = run.stats().failed_agents,
            "Run finished"
        );
        Ok(run)
    }

    /// 为每个 Agent 启动一个任务；任务内部先取得调度许可再执行
    fn dispatch(
        &self,
        run_id: Uuid,
        target: &AnalysisTarget,
        agents: &[AgentDescriptor],
        supervisor: &SessionSupervisor,
    ) -> Vec<impl std::future::Future<Output = AgentOutcome>> {
        let scheduler = TaskScheduler::for_dispatch(self.config.dispatch_mode, agents.len(), self.config.max_concurrency);
        tracing::debug!(%run_id, mode = ?self.config.dispatch_mode, capacity = scheduler.capacity(), "Dispatching agents");

        agents
            .iter()
            .map(|descriptor| {
                let name = descriptor.name.clone();
                let agent = self.registry.instantiate(&name);
                let timeout = self.config.timeout_for(&name);
                let scheduler = scheduler.clone();
                let cancel = supervisor.child_token();
                let bus = Arc::clone(&self.bus);
                let target = target.clone();

                let task = tokio::spawn({
                    let name = name.clone();
                    async move {
                        let Some(agent) = agent else {
                            return (Duration::ZERO, Err(AgentError::Unavailable(format!("'{}' is not registered", name))));
                        };
                        let Some(_permit) = scheduler.acquire(&cancel).await else {
                            return (Duration::ZERO, Err(AgentError::Cancelled));
                        };

                        bus.publish(BusMessage::progress(
                            name.clone(),
                            ProgressEvent::AgentStarted {
                                run_id,
                                agent: name.clone(),
                            },
                        ));
                        let started = Instant::now();
                        let result = call_with_watchdog(&name, agent, target, timeout, &cancel).await;
                        let duration = started.elapsed();

                        let (status, raw_findings) = match &result {
                            Ok(raw) => (AnalysisStatus::Success, raw.len()),
                            Err(e) => (AnalysisResult::failure(&name, duration, e).status, 0),
                        };
                        bus.publish(BusMessage::progress(
                            name.clone(),
                            ProgressEvent::AgentFinished {
                                run_id,
                                agent: name.clone(),
                                status,
                                duration_ms: duration.as_millis() as u64,
                                raw_findings,
                            },
                        ));
                        (duration, result)
                    }
                });

                async move {
                    match task.await {
                        Ok((duration, result)) => AgentOutcome {
                            agent: name,
                            duration,
                            result,
                        },
                        Err(e) => AgentOutcome {
                            agent: name,
                            duration: Duration::ZERO,
                            result: Err(AgentError::Execution(format!("dispatch task failed: {}", e))),
                        },
                    }
                }
            })
            .collect()
    }

    fn advance(&self, run: &mut Run, next: RunPhase) -> Result<(), OrchestratorError> {
        run.transition(next)?;
        self.bus.publish(BusMessage::progress(
            PRODUCER,
            ProgressEvent::PhaseChanged {
                run_id: run.id(),
                phase: next,
            },
        ));
        Ok(())
    }

    fn abort(&self, run: &mut Run) -> Result<(), OrchestratorError> {
        self.advance(run, RunPhase::Aborted)?;
        run.finalize();
        self.publish_completed(run);
        Ok(())
    }

    fn publish_completed(&self, run: &Run) {
        self.bus.publish(BusMessage::progress(
            PRODUCER,
            ProgressEvent::RunCompleted {
                run_id: run.id(),
                phase: run.phase(),
                findings: run.findings().len(),
            },
        ));
    }
}

/// 在独立任务中调用 Agent，与硬超时和取消信号竞速；落败时中止该任务
async fn call_with_watchdog(
    name: &str,
    agent: Arc<dyn Agent>,
    target: AnalysisTarget,
    timeout: Duration,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<Vec<RawFinding>, AgentError> {
    let mut call = tokio::spawn(async move { agent.analyze(&target, timeout).await });

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            call.abort();
            Err(AgentError::Cancelled)
        }
        joined = tokio::time::timeout(timeout, &mut call) => match joined {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => Err(AgentError::Execution(format!("agent '{}' panicked", name))),
            Ok(Err(e)) => Err(AgentError::Execution(e.to_string())),
            Err(_) => {
                call.abort();
                Err(AgentError::Timeout {
                    agent: name.to_string(),
                    after_ms: timeout.as_millis() as u64,
                })
            }
        },
    }
}
