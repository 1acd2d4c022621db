//! 运行状态：阶段状态机、单个 Agent 的执行记录、Run 聚合根
//!
//! Run 由编排器创建并独占修改；进入终态（Aggregated 且无后续阶段 / Done / Aborted）后只读，
//! 报告与合规映射等下游只能读取。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::AnalysisTarget;
use crate::core::{AgentError, OrchestratorError};
use crate::findings::Finding;

/// 运行阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Selecting,
    Dispatching,
    Collecting,
    Aggregated,
    Correlating,
    Triaging,
    Done,
    Aborted,
}

impl RunPhase {
    /// 合法转换；Correlating / Triaging 是可选阶段
    pub fn can_transition_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (Done, _) | (Aborted, _) => false,
            (_, Aborted) => true,
            (Idle, Selecting)
            | (Selecting, Dispatching)
            | (Dispatching, Collecting)
            | (Collecting, Aggregated)
            | (Aggregated, Correlating)
            | (Aggregated, Triaging)
            | (Aggregated, Done)
            | (Correlating, Triaging)
            | (Correlating, Done)
            | (Triaging, Done) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Aborted)
    }
}

/// 单个 Agent 的执行状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Success,
    Timeout,
    Error,
    Skipped,
    Cancelled,
}

/// 单个 Agent 的执行记录；创建后不再修改
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub agent: String,
    pub status: AnalysisStatus,
    pub duration_ms: u64,
    pub raw_finding_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalysisResult {
    pub fn success(agent: impl Into<String>, duration: Duration, raw_finding_count: usize) -> Self {
        Self {
            agent: agent.into(),
            status: AnalysisStatus::Success,
            duration_ms: duration.as_millis() as u64,
            raw_finding_count,
            error: None,
        }
    }

    /// 由 AgentError 推导状态（Timeout / Cancelled / Skipped / Error）
    pub fn failure(agent: impl Into<String>, duration: Duration, error: &AgentError) -> Self {
        let status = match error {
            AgentError::Timeout { .. } => AnalysisStatus::Timeout,
            AgentError::Cancelled => AnalysisStatus::Cancelled,
            AgentError::Unavailable(_) => AnalysisStatus::Skipped,
            AgentError::Execution(_) => AnalysisStatus::Error,
        };
        Self {
            agent: agent.into(),
            status,
            duration_ms: duration.as_millis() as u64,
            raw_finding_count: 0,
            error: Some(error.to_string()),
        }
    }

    pub fn skipped(agent: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            status: AnalysisStatus::Skipped,
            duration_ms: 0,
            raw_finding_count: 0,
            error: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AnalysisStatus::Success
    }
}

/// 运行级统计
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub selected_agents: usize,
    pub successful_agents: usize,
    pub failed_agents: usize,
    pub skipped_agents: usize,
    pub total_raw_findings: usize,
    pub normalized_findings: usize,
    pub rejected_findings: usize,
    pub correlated_findings: usize,
    pub dedup_rate: f64,
    pub triage_cost: f64,
}

/// 一次端到端编排会话
#[derive(Clone, Debug, Serialize)]
pub struct Run {
    id: Uuid,
    target: AnalysisTarget,
    phase: RunPhase,
    /// 运行是否因取消信号提前结束（已完成的结果仍保留）
    cancelled: bool,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    results: Vec<AnalysisResult>,
    findings: Vec<Finding>,
    stats: RunStats,
}

impl Run {
    pub(crate) fn new(target: AnalysisTarget) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            phase: RunPhase::Idle,
            cancelled: false,
            started_at: Utc::now(),
            finished_at: None,
            results: Vec::new(),
            findings: Vec::new(),
            stats: RunStats::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &AnalysisTarget {
        &self.target
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn results(&self) -> &[AnalysisResult] {
        &self.results
    }

    pub fn result_for(&self, agent: &str) -> Option<&AnalysisResult> {
        self.results.iter().find(|r| r.agent == agent)
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn is_finalized(&self) -> bool {
        self.finished_at.is_some()
    }

    pub(crate) fn transition(&mut self, next: RunPhase) -> Result<(), OrchestratorError> {
        if !self.phase.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::debug!(run_id = %self.id, from = ?self.phase, to = ?next, "Run phase transition");
        self.phase = next;
        Ok(())
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub(crate) fn push_result(&mut self, result: AnalysisResult) {
        self.results.push(result);
    }

    pub(crate) fn set_findings(&mut self, findings: Vec<Finding>) {
        self.findings = findings;
    }

    pub(crate) fn take_findings(&mut self) -> Vec<Finding> {
        std::mem::take(&mut self.findings)
    }

    pub(crate) fn stats_mut(&mut self) -> &mut RunStats {
        &mut self.stats
    }

    pub(crate) fn finalize(&mut self) {
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use RunPhase::*;
        assert!(Idle.can_transition_to(Selecting));
        assert!(Aggregated.can_transition_to(Done));
        assert!(Aggregated.can_transition_to(Triaging));
        assert!(Collecting.can_transition_to(Aborted));
        assert!(!Idle.can_transition_to(Dispatching));
        assert!(!Done.can_transition_to(Aborted));
        assert!(!Triaging.can_transition_to(Correlating));
    }

    #[test]
    fn test_run_rejects_invalid_transition() {
        let mut run = Run::new(AnalysisTarget::new("a.sol"));
        assert!(run.transition(RunPhase::Selecting).is_ok());
        let err = run.transition(RunPhase::Done).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        assert_eq!(run.phase(), RunPhase::Selecting);
    }

    #[test]
    fn test_result_status_from_error() {
        let d = Duration::from_millis(5);
        let timeout = AgentError::Timeout {
            agent: "c".into(),
            after_ms: 60_000,
        };
        assert_eq!(AnalysisResult::failure("c", d, &timeout).status, AnalysisStatus::Timeout);
        assert_eq!(
            AnalysisResult::failure("c", d, &AgentError::Execution("boom".into())).status,
            AnalysisStatus::Error
        );
        assert_eq!(
            AnalysisResult::failure("c", d, &AgentError::Cancelled).status,
            AnalysisStatus::Cancelled
        );
        assert!(AnalysisResult::success("c", d, 3).is_success());
    }
}
