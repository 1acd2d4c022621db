//! 总线消息定义
//!
//! 消息发布后不可变：Hub 只做扇出，不会改写已发布的消息。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::core::{AnalysisStatus, RunPhase};
use crate::findings::Finding;

/// 运行进度（阶段切换、Agent 开始/结束）
pub const TOPIC_RUN_PROGRESS: &str = "run.progress";
/// 规范化后、关联前的发现批次
pub const TOPIC_FINDINGS_RAW: &str = "findings.raw";
/// 关联后的发现批次（分级引擎订阅此主题）
pub const TOPIC_FINDINGS_CORRELATED: &str = "findings.correlated";
/// 分级完成的发现批次
pub const TOPIC_FINDINGS_TRIAGED: &str = "findings.triaged";

/// 进度事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        run_id: Uuid,
        target: String,
        agents: Vec<String>,
    },
    PhaseChanged {
        run_id: Uuid,
        phase: RunPhase,
    },
    AgentStarted {
        run_id: Uuid,
        agent: String,
    },
    AgentFinished {
        run_id: Uuid,
        agent: String,
        status: AnalysisStatus,
        duration_ms: u64,
        raw_findings: usize,
    },
    RunCompleted {
        run_id: Uuid,
        phase: RunPhase,
        findings: usize,
    },
}

/// 负载：进度事件或一批发现
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum BusPayload {
    Progress(ProgressEvent),
    Findings(Arc<Vec<Finding>>),
}

/// 总线消息信封
#[derive(Debug, Clone, Serialize)]
pub struct BusMessage {
    pub id: Uuid,
    pub topic: String,
    /// 生产者标识（Agent 名、orchestrator、triage 等）
    pub producer: String,
    pub timestamp: DateTime<Utc>,
    pub payload: BusPayload,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, producer: impl Into<String>, payload: BusPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            producer: producer.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn progress(producer: impl Into<String>, event: ProgressEvent) -> Self {
        Self::new(TOPIC_RUN_PROGRESS, producer, BusPayload::Progress(event))
    }

    pub fn findings(
        topic: impl Into<String>,
        producer: impl Into<String>,
        findings: Vec<Finding>,
    ) -> Self {
        Self::new(topic, producer, BusPayload::Findings(Arc::new(findings)))
    }

    pub fn as_progress(&self) -> Option<&ProgressEvent> {
        match &self.payload {
            BusPayload::Progress(event) => Some(event),
            BusPayload::Findings(_) => None,
        }
    }

    pub fn as_findings(&self) -> Option<&[Finding]> {
        match &self.payload {
            BusPayload::Findings(batch) => Some(batch.as_slice()),
            BusPayload::Progress(_) => None,
        }
    }
}
