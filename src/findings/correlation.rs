//! 关联引擎：跨工具去重与置信度提升
//!
//! 按 (type, file, 容差窗口内重叠的行区间) 分组。组内合并为一条 Finding：
//! - 置信度 = 组内最大值 × (1 + 按不同 Agent 数计算的一致性加成)，上限 1.0
//! - 严重性取组内最高，不静默降级
//! - 无组伙伴的 Finding 原样通过
//!
//! 分组前先按稳定键排序，因此结果与 Agent 完成顺序无关；对已关联的集合再次执行是空操作。

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::finding::{Finding, Location};

/// 关联参数；默认值未经基准集标定，可在配置中调整
///
/// 分组是单链接的：新成员只需落在组当前区间 ±line_tolerance 内，组区间随之扩展。
/// 因此同类型、步距不超过容差的一串发现（如 10, 13, 16, ... 25 行）会合并为一条跨越
/// 整段区间的发现。这样的分组与输入顺序无关，重复执行结果不变。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// 行号容差（±N 行视为同一位置）
    pub line_tolerance: u32,
    /// 恰好 2 个不同 Agent 一致时的加成
    pub two_agent_boost: f64,
    /// 3 个及以上 Agent 一致时的加成
    pub multi_agent_boost: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            line_tolerance: 3,
            two_agent_boost: 0.15,
            multi_agent_boost: 0.25,
        }
    }
}

/// 关联统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorrelationStats {
    pub input: usize,
    pub output: usize,
    /// 包含 2 条及以上成员的组数
    pub merged_groups: usize,
    /// 1 - output / input
    pub dedup_rate: f64,
}

/// 关联引擎
#[derive(Debug, Clone, Default)]
pub struct CorrelationEngine {
    config: CorrelationConfig,
}

impl CorrelationEngine {
    pub fn new(config: CorrelationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// 不同 Agent 数对应的加成（边际递减）
    pub fn agreement_boost(&self, distinct_agents: usize) -> f64 {
        match distinct_agents {
            0 | 1 => 0.0,
            2 => self.config.two_agent_boost,
            _ => self.config.multi_agent_boost,
        }
    }

    /// 关联一批 Finding，返回去重后的集合
    pub fn correlate(&self, findings: Vec<Finding>) -> Vec<Finding> {
        self.correlate_with_stats(findings).0
    }

    pub fn correlate_with_stats(&self, mut findings: Vec<Finding>) -> (Vec<Finding>, CorrelationStats) {
        let input = findings.len();
        findings.sort_by(|a, b| {
            a.finding_type
                .cmp(&b.finding_type)
                .then_with(|| a.location.file.cmp(&b.location.file))
                .then_with(|| a.location.start_line.cmp(&b.location.start_line))
                .then_with(|| a.location.end_line.cmp(&b.location.end_line))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut output = Vec::with_capacity(findings.len());
        let mut merged_groups = 0;
        let mut group: Vec<Finding> = Vec::new();
        // 当前组覆盖的区间
        let mut span: Option<Location> = None;

        for finding in findings {
            let joins = group
                .first()
                .is_some_and(|head| head.finding_type == finding.finding_type)
                && span
                    .as_ref()
                    .is_some_and(|s| s.overlaps(&finding.location, self.config.line_tolerance));

            if !joins && !group.is_empty() {
                if group.len() > 1 {
                    merged_groups += 1;
                }
                output.push(self.merge_group(std::mem::take(&mut group)));
            }
            span = match span.take() {
                Some(mut s) if joins => {
                    s.end_line = s.end_line.max(finding.location.end_line);
                    Some(s)
                }
                _ => Some(Location::new(
                    finding.location.file.clone(),
                    finding.location.start_line,
                    finding.location.end_line,
                )),
            };
            group.push(finding);
        }
        if !group.is_empty() {
            if group.len() > 1 {
                merged_groups += 1;
            }
            output.push(self.merge_group(group));
        }

        let stats = CorrelationStats {
            input,
            output: output.len(),
            merged_groups,
            dedup_rate: if input == 0 {
                0.0
            } else {
                1.0 - output.len() as f64 / input as f64
            },
        };
        tracing::debug!(
            input = stats.input,
            output = stats.output,
            merged_groups = stats.merged_groups,
            "Correlated findings"
        );
        (output, stats)
    }

    fn merge_group(&self, mut group: Vec<Finding>) -> Finding {
        if group.len() == 1 {
            return group.remove(0);
        }

        let agents: BTreeSet<String> = group.iter().flat_map(|f| f.agents.iter().cloned()).collect();
        let boost = self.agreement_boost(agents.len());

        // 代表成员：置信度最高者；并列时取 id 最小者，保证与输入顺序无关
        let lead_index = group
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.confidence
                    .total_cmp(&b.confidence)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|(i, _)| i)
            .unwrap_or(0);

        let max_confidence = group[lead_index].confidence;
        let severity = group.iter().map(|f| f.severity).max().unwrap_or(group[lead_index].severity);
        let start = group.iter().map(|f| f.location.start_line).min().unwrap_or(0);
        let end = group.iter().map(|f| f.location.end_line).max().unwrap_or(start);
        let id = group.iter().map(|f| f.id.as_str()).min().unwrap_or_default().to_string();
        let function = group
            .iter()
            .filter_map(|f| f.location.function.clone())
            .min();
        let adjusted_severity = group.iter().filter_map(|f| f.adjusted_severity).max();

        let mut merged = group.swap_remove(lead_index);
        merged.id = id;
        merged.agents = agents;
        merged.confidence = (max_confidence * (1.0 + boost)).min(1.0);
        merged.severity = severity;
        merged.location.start_line = start;
        merged.location.end_line = end;
        merged.location.function = function;
        merged.adjusted_severity = adjusted_severity;
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::findings::{normalize, RawFinding, Severity};

    fn finding(agent: &str, ty: &str, file: &str, start: u32, end: u32, conf: f64) -> Finding {
        let raw = RawFinding::new(ty, file, start)
            .with_end_line(end)
            .with_confidence(conf)
            .with_severity("medium");
        normalize(agent, &[raw]).findings.remove(0)
    }

    #[test]
    fn test_two_agents_same_issue_merge() {
        let engine = CorrelationEngine::default();
        let out = engine.correlate(vec![
            finding("A", "reentrancy", "Vault.sol", 40, 42, 0.6),
            finding("B", "reentrancy", "Vault.sol", 41, 41, 0.7),
        ]);
        assert_eq!(out.len(), 1);
        let merged = &out[0];
        assert!(merged.confidence >= 0.7 * 1.15 - 1e-9);
        assert!(merged.confidence <= 1.0);
        let agents: Vec<&str> = merged.agents.iter().map(String::as_str).collect();
        assert_eq!(agents, vec!["A", "B"]);
        assert_eq!(merged.location.start_line, 40);
        assert_eq!(merged.location.end_line, 42);
    }

    #[test]
    fn test_different_types_never_merge() {
        let engine = CorrelationEngine::default();
        let out = engine.correlate(vec![
            finding("A", "reentrancy", "Vault.sol", 40, 42, 0.6),
            finding("B", "unchecked-call", "Vault.sol", 40, 42, 0.7),
        ]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_tolerance_window() {
        let engine = CorrelationEngine::default();
        let near = engine.correlate(vec![
            finding("A", "overflow", "a.sol", 10, 10, 0.5),
            finding("B", "overflow", "a.sol", 13, 13, 0.5),
        ]);
        assert_eq!(near.len(), 1);

        let far = engine.correlate(vec![
            finding("A", "overflow", "a.sol", 10, 10, 0.5),
            finding("B", "overflow", "a.sol", 14, 14, 0.5),
        ]);
        assert_eq!(far.len(), 2);
    }

    #[test]
    fn test_severity_takes_group_maximum() {
        let engine = CorrelationEngine::default();
        let mut a = finding("A", "overflow", "a.sol", 10, 10, 0.9);
        a.severity = Severity::Low;
        let mut b = finding("B", "overflow", "a.sol", 11, 11, 0.4);
        b.severity = Severity::Critical;
        let out = engine.correlate(vec![a, b]);
        assert_eq!(out[0].severity, Severity::Critical);
    }

    #[test]
    fn test_boost_diminishing_and_capped() {
        let engine = CorrelationEngine::default();
        assert_eq!(engine.agreement_boost(1), 0.0);
        assert_eq!(engine.agreement_boost(2), 0.15);
        assert_eq!(engine.agreement_boost(5), 0.25);

        let out = engine.correlate(vec![
            finding("A", "overflow", "a.sol", 10, 10, 0.9),
            finding("B", "overflow", "a.sol", 10, 10, 0.9),
            finding("C", "overflow", "a.sol", 10, 10, 0.9),
        ]);
        assert_eq!(out[0].confidence, 1.0);
    }

    #[test]
    fn test_same_agent_duplicates_merge_without_boost() {
        let engine = CorrelationEngine::default();
        let out = engine.correlate(vec![
            finding("A", "overflow", "a.sol", 10, 10, 0.5),
            finding("A", "overflow", "a.sol", 11, 11, 0.6),
        ]);
        assert_eq!(out.len(), 1);
        assert!((out[0].confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_singletons_pass_through_unchanged() {
        let engine = CorrelationEngine::default();
        let f = finding("A", "overflow", "a.sol", 10, 10, 0.5);
        let out = engine.correlate(vec![f.clone()]);
        assert_eq!(out, vec![f]);
    }

    #[test]
    fn test_correlation_idempotent() {
        let engine = CorrelationEngine::default();
        let input = vec![
            finding("A", "reentrancy", "Vault.sol", 40, 42, 0.6),
            finding("B", "reentrancy", "Vault.sol", 41, 41, 0.7),
            finding("C", "reentrancy", "Vault.sol", 44, 46, 0.3),
            finding("A", "overflow", "Vault.sol", 41, 41, 0.4),
            finding("B", "overflow", "Token.sol", 80, 80, 0.8),
            finding("C", "overflow", "Token.sol", 90, 90, 0.8),
        ];
        let once = engine.correlate(input);
        let twice = engine.correlate(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_order_independent() {
        let engine = CorrelationEngine::default();
        let a = finding("A", "reentrancy", "Vault.sol", 40, 42, 0.6);
        let b = finding("B", "reentrancy", "Vault.sol", 41, 41, 0.7);
        let c = finding("C", "overflow", "Vault.sol", 12, 12, 0.2);
        let forward = engine.correlate(vec![a.clone(), b.clone(), c.clone()]);
        let backward = engine.correlate(vec![c, b, a]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_chain_within_tolerance_collapses() {
        let engine = CorrelationEngine::default();
        let chain: Vec<Finding> = [10, 13, 16, 19, 22, 25]
            .iter()
            .enumerate()
            .map(|(i, line)| finding(if i % 2 == 0 { "A" } else { "B" }, "overflow", "a.sol", *line, *line, 0.5))
            .collect();
        let out = engine.correlate(chain);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].location.start_line, 10);
        assert_eq!(out[0].location.end_line, 25);

        // 步距超过容差时断开
        let split = engine.correlate(vec![
            finding("A", "overflow", "a.sol", 10, 10, 0.5),
            finding("B", "overflow", "a.sol", 14, 14, 0.5),
        ]);
        assert_eq!(split.len(), 2);
    }

    #[test]
    fn test_stats_dedup_rate() {
        let engine = CorrelationEngine::default();
        let (_, stats) = engine.correlate_with_stats(vec![
            finding("A", "overflow", "a.sol", 10, 10, 0.5),
            finding("B", "overflow", "a.sol", 10, 10, 0.5),
            finding("A", "overflow", "b.sol", 10, 10, 0.5),
            finding("B", "overflow", "b.sol", 10, 10, 0.5),
        ]);
        assert_eq!(stats.input, 4);
        assert_eq!(stats.output, 2);
        assert_eq!(stats.merged_groups, 2);
        assert!((stats.dedup_rate - 0.5).abs() < 1e-9);
    }
}
