//! 发现（Finding）数据模型
//!
//! Finding 由 Normalizer 从单个 Agent 的原始输出创建；之后只有 Correlation（合并来源、调整置信度）
//! 与 Triage（分级状态、调整严重性）可以修改它。Agent 本身从不修改 Finding。

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 严重性等级（声明顺序即排序：Informational < Low < Medium < High < Critical）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Critical / High 必须人工复核
    pub fn requires_human_review(self) -> bool {
        self >= Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Informational => "informational",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Severity {
    type Err = String;

    /// 宽松解析：大小写不敏感，接受常见别名（info / crit / warning）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" | "crit" => Ok(Severity::Critical),
            "high" | "error" => Ok(Severity::High),
            "medium" | "moderate" | "warning" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            "informational" | "info" | "note" => Ok(Severity::Informational),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// 分级状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageStatus {
    Pending,
    Confirmed,
    FalsePositive,
    NeedsHumanReview,
}

/// 代码位置：文件 + 行区间（闭区间）+ 可选函数名
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

impl Location {
    pub fn new(file: impl Into<String>, start_line: u32, end_line: u32) -> Self {
        let (start_line, end_line) = if start_line <= end_line {
            (start_line, end_line)
        } else {
            (end_line, start_line)
        };
        Self {
            file: file.into(),
            start_line,
            end_line,
            function: None,
        }
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    /// 两个区间在容差窗口内是否重叠
    pub fn overlaps(&self, other: &Location, tolerance: u32) -> bool {
        self.file == other.file
            && self.start_line <= other.end_line.saturating_add(tolerance)
            && other.start_line <= self.end_line.saturating_add(tolerance)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start_line == self.end_line {
            write!(f, "{}:{}", self.file, self.start_line)
        } else {
            write!(f, "{}:{}-{}", self.file, self.start_line, self.end_line)
        }
    }
}

/// 分级结论：由哪个分类器给出、置信度、理由与花费
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// 分类器是否认为是真实问题
    pub true_positive: bool,
    /// 提供者名称（规则回退时为 "rules"）
    pub provider: String,
    pub model: Option<String>,
    pub confidence: f64,
    pub rationale: String,
    pub cost: f64,
}

/// 规范化后的发现
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    /// 漏洞类别（如 reentrancy、integer-overflow）
    pub finding_type: String,
    pub severity: Severity,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub location: Location,
    pub description: String,
    /// 来源 Agent 集合（关联合并后可能多于一个）
    pub agents: BTreeSet<String>,
    pub triage_status: TriageStatus,
    /// 分级阶段给出的调整后严重性
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjusted_severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
}

impl Finding {
    pub(crate) fn new(
        id: String,
        agent: &str,
        finding_type: String,
        severity: Severity,
        confidence: f64,
        location: Location,
        description: String,
    ) -> Self {
        let mut agents = BTreeSet::new();
        agents.insert(agent.to_string());
        Self {
            id,
            finding_type,
            severity,
            confidence,
            location,
            description,
            agents,
            triage_status: TriageStatus::Pending,
            adjusted_severity: None,
            classification: None,
        }
    }

    /// 最终生效的严重性（分级调整优先）
    pub fn effective_severity(&self) -> Severity {
        self.adjusted_severity.unwrap_or(self.severity)
    }

    pub fn needs_human_review(&self) -> bool {
        self.triage_status == TriageStatus::NeedsHumanReview
    }

    pub fn is_triaged(&self) -> bool {
        self.triage_status != TriageStatus::Pending
    }

    /// 外部人工复核的结论。分级引擎从不调用此方法。
    pub fn resolve_human_review(&mut self, confirmed: bool) {
        if self.triage_status == TriageStatus::NeedsHumanReview {
            self.triage_status = if confirmed {
                TriageStatus::Confirmed
            } else {
                TriageStatus::FalsePositive
            };
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Finding {
        Finding::new(
            "a:reentrancy:Vault.sol:40-42".to_string(),
            "a",
            "reentrancy".to_string(),
            Severity::High,
            0.6,
            Location::new("Vault.sol", 40, 42),
            "external call before state update".to_string(),
        )
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Low > Severity::Informational);
        assert!(Severity::High.requires_human_review());
        assert!(!Severity::Medium.requires_human_review());
    }

    #[test]
    fn test_severity_parse_aliases() {
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
        assert_eq!("info".parse::<Severity>().unwrap(), Severity::Informational);
        assert_eq!("warning".parse::<Severity>().unwrap(), Severity::Medium);
        assert!("urgent".parse::<Severity>().is_err());
    }

    #[test]
    fn test_location_normalizes_reversed_range() {
        let loc = Location::new("a.sol", 12, 10);
        assert_eq!(loc.start_line, 10);
        assert_eq!(loc.end_line, 12);
    }

    #[test]
    fn test_location_overlap_with_tolerance() {
        let a = Location::new("a.sol", 40, 42);
        let b = Location::new("a.sol", 45, 45);
        assert!(a.overlaps(&b, 3));
        assert!(!a.overlaps(&b, 2));
        assert!(!a.overlaps(&Location::new("b.sol", 40, 42), 3));
    }

    #[test]
    fn test_resolve_human_review_only_from_review_state() {
        let mut f = sample();
        f.resolve_human_review(true);
        assert_eq!(f.triage_status, TriageStatus::Pending);

        f.triage_status = TriageStatus::NeedsHumanReview;
        f.resolve_human_review(false);
        assert_eq!(f.triage_status, TriageStatus::FalsePositive);
    }

    #[test]
    fn test_effective_severity_prefers_adjusted() {
        let mut f = sample();
        assert_eq!(f.effective_severity(), Severity::High);
        f.adjusted_severity = Some(Severity::Low);
        assert_eq!(f.effective_severity(), Severity::Low);
    }
}
