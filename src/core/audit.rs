//! 追加式审计日志
//!
//! 记录所有降级处理的情况（Agent 跳过/失败、格式错误的发现、提供者失败、成本超限）
//! 以及每一次分级决策。条目只追加不修改；每次追加同时输出一条结构化 JSON tracing 日志。

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::core::AnalysisStatus;
use crate::findings::{Severity, TriageStatus};

/// 审计事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    AgentSkipped {
        agent: String,
        reason: String,
    },
    AgentFailed {
        agent: String,
        status: AnalysisStatus,
        error: String,
    },
    MalformedFinding {
        agent: String,
        index: usize,
        reason: String,
    },
    ProviderFailed {
        finding_id: String,
        provider: String,
        error: String,
    },
    CostCeilingExceeded {
        finding_id: String,
        provider: String,
        estimated: f64,
        limit: f64,
    },
    Classified {
        finding_id: String,
        provider: String,
        model: Option<String>,
        true_positive: bool,
        confidence: f64,
        rationale: String,
        cost: f64,
        status: TriageStatus,
    },
    HumanReviewRequired {
        finding_id: String,
        severity: Severity,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

/// 审计日志（通过 Arc 在编排器与分级引擎间共享）
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, run_id: Option<Uuid>, event: AuditEvent) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = AuditEntry {
            seq: entries.len() as u64,
            timestamp: Utc::now(),
            run_id,
            event,
        };
        match serde_json::to_string(&entry) {
            Ok(json) => tracing::info!(audit = %json, "audit"),
            Err(e) => tracing::warn!("Failed to serialize audit entry: {}", e),
        }
        entries.push(entry);
    }

    /// 全部条目的快照
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn entries_for_run(&self, run_id: Uuid) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.run_id == Some(run_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
