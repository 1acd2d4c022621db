//! 规范化：把 Agent 返回的 RawFinding 校验并转换为统一的 Finding
//!
//! 只做三件事：检查必填字段、把置信度夹到 [0, 1]、拒绝格式错误的记录。
//! 单条记录出错只记 warn 并丢弃，不影响同批次的其余记录。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::finding::{Finding, Location, Severity};

/// 未提供置信度时的默认值
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// 工具包装器返回的原始发现；字段均可缺失，由 Normalizer 校验
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFinding {
    #[serde(rename = "type", alias = "finding_type", default)]
    pub finding_type: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(alias = "start_line", default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// 包装器输出中无法解码的记录：保留原因，由 normalize 拒绝
    #[serde(skip)]
    pub undecodable: Option<String>,
}

impl RawFinding {
    pub fn new(finding_type: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            finding_type: Some(finding_type.into()),
            file: Some(file.into()),
            line: Some(line),
            ..Default::default()
        }
    }

    /// 占位记录：保持批次中的下标，normalize 时以 reason 拒绝
    pub fn undecodable(reason: impl Into<String>) -> Self {
        Self {
            undecodable: Some(reason.into()),
            ..Default::default()
        }
    }

    /// 逐条解码 JSON 记录；类型不符的记录变为 undecodable 占位，不影响其余记录
    pub fn from_json_records(records: Vec<serde_json::Value>) -> Vec<Self> {
        records
            .into_iter()
            .map(|value| {
                serde_json::from_value::<Self>(value)
                    .unwrap_or_else(|e| Self::undecodable(format!("undecodable record: {}", e)))
            })
            .collect()
    }

    pub fn with_end_line(mut self, end_line: u32) -> Self {
        self.end_line = Some(end_line);
        self
    }

    pub fn with_severity(mut self, severity: impl Into<String>) -> Self {
        self.severity = Some(severity.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// 规范化阶段的错误：对应记录被丢弃，批次继续
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("Malformed finding #{index} from '{agent}': {reason}")]
    MalformedFinding {
        agent: String,
        index: usize,
        reason: String,
    },
}

/// 一个批次的规范化结果
#[derive(Debug, Clone, Default)]
pub struct NormalizeOutcome {
    pub findings: Vec<Finding>,
    pub rejected: Vec<NormalizeError>,
}

/// 把单个 Agent 的原始输出转换为 Finding 列表
pub fn normalize(agent: &str, raw: &[RawFinding]) -> NormalizeOutcome {
    let mut outcome = NormalizeOutcome::default();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (index, record) in raw.iter().enumerate() {
        match normalize_one(agent, record) {
            Ok(mut finding) => {
                let count = seen.entry(finding.id.clone()).or_insert(0);
                *count += 1;
                if *count > 1 {
                    finding.id = format!("{}#{}", finding.id, count);
                }
                outcome.findings.push(finding);
            }
            Err(reason) => {
                tracing::warn!(agent, index, %reason, "Dropping malformed finding");
                outcome.rejected.push(NormalizeError::MalformedFinding {
                    agent: agent.to_string(),
                    index,
                    reason,
                });
            }
        }
    }

    tracing::debug!(
        agent,
        accepted = outcome.findings.len(),
        rejected = outcome.rejected.len(),
        "Normalized batch"
    );
    outcome
}

fn normalize_one(agent: &str, raw: &RawFinding) -> Result<Finding, String> {
    if let Some(reason) = &raw.undecodable {
        return Err(reason.clone());
    }
    let finding_type = required_text(raw.finding_type.as_deref(), "type")?.to_lowercase();
    let file = required_text(raw.file.as_deref(), "file")?.to_string();
    let start = raw.line.ok_or_else(|| "missing field 'line'".to_string())?;
    let end = raw.end_line.unwrap_or(start);

    let severity = match raw.severity.as_deref() {
        Some(s) => s.parse::<Severity>()?,
        None => Severity::Medium,
    };

    let confidence = match raw.confidence {
        Some(c) if !c.is_finite() => return Err(format!("confidence is not finite: {}", c)),
        Some(c) => c.clamp(0.0, 1.0),
        None => DEFAULT_CONFIDENCE,
    };

    let mut location = Location::new(file, start, end);
    if let Some(function) = raw.function.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
        location = location.with_function(function);
    }

    let id = format!(
        "{}:{}:{}:{}-{}",
        agent, finding_type, location.file, location.start_line, location.end_line
    );
    let description = raw.description.clone().unwrap_or_default();

    Ok(Finding::new(
        id,
        agent,
        finding_type,
        severity,
        confidence,
        location,
        description,
    ))
}

fn required_text<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, String> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(format!("missing field '{}'", field)),
    }
}
