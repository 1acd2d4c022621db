//! 分级引擎：提供者责任链 + 规则回退 + 强制人工复核
//!
//! 对每条关联后的发现：
//! 1. 按优先级依次尝试已启用的提供者，调用前检查单次成本上限与运行总预算
//! 2. 提供者出错、超出成本或返回无法解析的结论时记录审计并尝试下一个
//! 3. 全部失败（或 AI 被禁用）时使用规则分类器，保证不因外部服务不可用而阻塞
//! 4. Critical / High 一律标记 NeedsHumanReview；引擎自身从不撤销此标记
//!
//! 成本预算按每次 triage 调用（即每个运行）单独计算，共享同一引擎的运行互不占用预算。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::factory::{build_handles, ProviderConfig};
use super::prompts::{build_request, parse_verdict, Verdict};
use super::provider::{ProviderHandle, TryClassify};
use super::rules::{default_signatures, FalsePositiveSignature, RuleClassifier};
use crate::bus::{MessageBus, SubscriptionId, TOPIC_FINDINGS_CORRELATED};
use crate::core::{AuditEvent, AuditLog};
use crate::findings::{Classification, Finding, TriageStatus};

/// 规则分类器使用的提供者名
pub const RULES_PROVIDER: &str = "rules";

/// 提供者链耗尽；只在引擎内部出现，总是由规则分类器兜底
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TriageError {
    #[error("All {attempted} enabled providers exhausted")]
    AllProvidersExhausted { attempted: usize },
}

/// [triage] 配置段
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    /// false 时直接使用规则分类器
    pub ai_enabled: bool,
    /// 单个运行的 AI 花费上限（美元）
    pub total_cost_ceiling: f64,
    pub max_tokens: u32,
    pub temperature: f32,
    /// 低于此置信度的发现由规则判为误报
    pub min_rule_confidence: f64,
    /// 追加在内置特征之后
    pub false_positive_signatures: Vec<FalsePositiveSignature>,
    /// [[triage.providers]]
    pub providers: Vec<ProviderConfig>,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            ai_enabled: true,
            total_cost_ceiling: 1.0,
            max_tokens: 256,
            temperature: 0.0,
            min_rule_confidence: 0.2,
            false_positive_signatures: Vec::new(),
            providers: Vec::new(),
        }
    }
}

/// 一批发现的分级统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TriageSummary {
    pub ai_classified: usize,
    pub rule_classified: usize,
    pub human_review: usize,
    pub cost: f64,
}

/// 收件箱上限；超出时丢弃最早的发现
pub const DEFAULT_INBOX_CAPACITY: usize = 10_000;

/// 一次 triage 调用的花费账本
#[derive(Debug, Clone, Copy)]
struct Budget {
    ceiling: f64,
    spent: f64,
}

impl Budget {
    fn new(ceiling: f64) -> Self {
        Self { ceiling, spent: 0.0 }
    }

    fn remaining(&self) -> f64 {
        (self.ceiling - self.spent).max(0.0)
    }

    fn charge(&mut self, cost: f64) {
        if cost.is_finite() && cost > 0.0 {
            self.spent += cost;
        }
    }
}

/// 分级引擎
pub struct TriageEngine {
    providers: Vec<ProviderHandle>,
    rules: RuleClassifier,
    config: TriageConfig,
    audit: Arc<AuditLog>,
    inbox: Arc<Mutex<VecDeque<Finding>>>,
    inbox_capacity: usize,
}

impl TriageEngine {
    pub fn new(config: TriageConfig, audit: Arc<AuditLog>) -> Self {
        let mut signatures = default_signatures();
        signatures.extend(config.false_positive_signatures.iter().cloned());
        let rules = RuleClassifier::new(signatures, config.min_rule_confidence);
        Self {
            providers: Vec::new(),
            rules,
            config,
            audit,
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }

    /// 按配置中的 [[triage.providers]] 构造提供者链
    pub fn from_config(config: TriageConfig, audit: Arc<AuditLog>) -> Self {
        let handles = build_handles(&config.providers);
        let mut engine = Self::new(config, audit);
        for handle in handles {
            engine.add_provider(handle);
        }
        engine
    }

    /// 添加提供者；按 priority 稳定排序（同优先级保持添加顺序）
    pub fn with_provider(mut self, handle: ProviderHandle) -> Self {
        self.add_provider(handle);
        self
    }

    pub fn add_provider(&mut self, handle: ProviderHandle) {
        self.providers.push(handle);
        self.providers.sort_by_key(|h| h.priority);
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|h| h.name().to_string()).collect()
    }

    /// 收件箱容量（须在 attach 之前设置）
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity.max(1);
        self
    }

    /// 订阅关联后的发现批次，放入收件箱，由 triage_pending 处理
    ///
    /// 收件箱有界：未及时处理时丢弃最早的发现并记 warn。
    pub fn attach(&self, bus: &MessageBus) -> SubscriptionId {
        let inbox = Arc::clone(&self.inbox);
        let capacity = self.inbox_capacity;
        bus.subscribe(TOPIC_FINDINGS_CORRELATED, move |message| {
            if let Some(batch) = message.as_findings() {
                let mut inbox = inbox.lock().unwrap_or_else(|e| e.into_inner());
                inbox.extend(batch.iter().cloned());
                let overflow = inbox.len().saturating_sub(capacity);
                if overflow > 0 {
                    inbox.drain(..overflow);
                    tracing::warn!(dropped = overflow, capacity, "Triage inbox full, dropping oldest findings");
                }
            }
        })
    }

    pub fn pending_count(&self) -> usize {
        self.inbox.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 处理收件箱中的全部发现
    pub async fn triage_pending(&self, run_id: Option<Uuid>) -> (Vec<Finding>, TriageSummary) {
        let batch: Vec<Finding> = std::mem::take(&mut *self.inbox.lock().unwrap_or_else(|e| e.into_inner())).into();
        self.triage(run_id, batch).await
    }

    /// 分级一批发现；已分级（非 Pending）的发现原样返回
    pub async fn triage(&self, run_id: Option<Uuid>, findings: Vec<Finding>) -> (Vec<Finding>, TriageSummary) {
        self.triage_batch(run_id, findings, self.config.ai_enabled).await
    }

    /// 只用规则分类器分级，不发起任何外部调用（运行被取消后使用）
    pub async fn triage_rules_only(&self, run_id: Option<Uuid>, findings: Vec<Finding>) -> (Vec<Finding>, TriageSummary) {
        self.triage_batch(run_id, findings, false).await
    }

    async fn triage_batch(
        &self,
        run_id: Option<Uuid>,
        mut findings: Vec<Finding>,
        use_ai: bool,
    ) -> (Vec<Finding>, TriageSummary) {
        let mut summary = TriageSummary::default();
        let mut budget = Budget::new(self.config.total_cost_ceiling);

        for finding in findings.iter_mut().filter(|f| !f.is_triaged()) {
            let used_ai = self.triage_one(run_id, finding, use_ai, &mut budget).await;
            if used_ai {
                summary.ai_classified += 1;
            } else {
                summary.rule_classified += 1;
            }
            if finding.needs_human_review() {
                summary.human_review += 1;
            }
        }

        summary.cost = budget.spent;
        tracing::info!(
            ai = summary.ai_classified,
            rules = summary.rule_classified,
            human_review = summary.human_review,
            cost = summary.cost,
            "Triage finished"
        );
        (findings, summary)
    }

    /// 返回是否由 AI 提供者完成分类
    async fn triage_one(&self, run_id: Option<Uuid>, finding: &mut Finding, use_ai: bool, budget: &mut Budget) -> bool {
        let classification = if use_ai {
            self.classify_with_providers(run_id, finding, budget).await
        } else {
            Err(TriageError::AllProvidersExhausted { attempted: 0 })
        };
        let used_ai = classification.is_ok();

        let (classification, severity) = match classification {
            Ok((classification, verdict)) => (classification, verdict.severity),
            Err(e) => {
                tracing::debug!(finding = %finding.id, "{}, using rules", e);
                let verdict = self.rules.classify(finding);
                (
                    Classification {
                        true_positive: verdict.true_positive,
                        provider: RULES_PROVIDER.to_string(),
                        model: None,
                        confidence: verdict.confidence,
                        rationale: verdict.rationale,
                        cost: 0.0,
                    },
                    None,
                )
            }
        };

        if let Some(severity) = severity.filter(|s| *s != finding.severity) {
            finding.adjusted_severity = Some(severity);
        }
        finding.triage_status = if classification.true_positive {
            TriageStatus::Confirmed
        } else {
            TriageStatus::FalsePositive
        };

        // 原始与调整后任一为 Critical / High 都需要人工复核，AI 降级不能绕过
        let review_severity = finding.severity.max(finding.effective_severity());
        if review_severity.requires_human_review() {
            finding.triage_status = TriageStatus::NeedsHumanReview;
            self.audit.record(
                run_id,
                AuditEvent::HumanReviewRequired {
                    finding_id: finding.id.clone(),
                    severity: review_severity,
                },
            );
        }

        self.audit.record(
            run_id,
            AuditEvent::Classified {
                finding_id: finding.id.clone(),
                provider: classification.provider.clone(),
                model: classification.model.clone(),
                true_positive: classification.true_positive,
                confidence: classification.confidence,
                rationale: classification.rationale.clone(),
                cost: classification.cost,
                status: finding.triage_status,
            },
        );
        finding.classification = Some(classification);
        used_ai
    }

    async fn classify_with_providers(
        &self,
        run_id: Option<Uuid>,
        finding: &Finding,
        budget: &mut Budget,
    ) -> Result<(Classification, Verdict), TriageError> {
        let request = build_request(finding, self.config.max_tokens, self.config.temperature);
        let mut attempted = 0;

        for handle in self.providers.iter().filter(|h| h.enabled) {
            attempted += 1;
            let provider = handle.name().to_string();
            match handle.try_classify(&request, budget.remaining()).await {
                TryClassify::Classified(response) => {
                    budget.charge(response.estimated_cost);
                    match parse_verdict(&response.content) {
                        Ok(verdict) => {
                            let classification = Classification {
                                true_positive: verdict.true_positive,
                                provider: response.provider_name.clone(),
                                model: Some(response.model_name.clone()),
                                confidence: verdict.confidence.unwrap_or(response.confidence),
                                rationale: verdict.rationale.clone(),
                                cost: response.estimated_cost,
                            };
                            return Ok((classification, verdict));
                        }
                        Err(e) => {
                            tracing::warn!(%provider, finding = %finding.id, "Unparseable verdict: {}", e);
                            self.audit.record(
                                run_id,
                                AuditEvent::ProviderFailed {
                                    finding_id: finding.id.clone(),
                                    provider,
                                    error: e.to_string(),
                                },
                            );
                        }
                    }
                }
                TryClassify::CostExceeded { estimated, limit } => {
                    tracing::warn!(%provider, estimated, limit, "Skipping provider: cost ceiling");
                    self.audit.record(
                        run_id,
                        AuditEvent::CostCeilingExceeded {
                            finding_id: finding.id.clone(),
                            provider,
                            estimated,
                            limit,
                        },
                    );
                }
                TryClassify::Failed(e) => {
                    tracing::warn!(%provider, finding = %finding.id, "Provider failed: {}", e);
                    self.audit.record(
                        run_id,
                        AuditEvent::ProviderFailed {
                            finding_id: finding.id.clone(),
                            provider,
                            error: e.to_string(),
                        },
                    );
                }
            }
        }

        Err(TriageError::AllProvidersExhausted { attempted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusMessage;
    use crate::findings::{normalize, RawFinding, Severity};
    use crate::triage::{FailingProvider, MockProvider};

    fn finding(severity: &str, file: &str) -> Finding {
        let raw = RawFinding::new("overflow", file, 10)
            .with_severity(severity)
            .with_confidence(0.8);
        normalize("a", &[raw]).findings.remove(0)
    }

    fn engine() -> (TriageEngine, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::new());
        (TriageEngine::new(TriageConfig::default(), Arc::clone(&audit)), audit)
    }

    #[tokio::test]
    async fn test_first_provider_wins() {
        let (engine, _) = engine();
        let first = Arc::new(MockProvider::dismissing("local"));
        let second = Arc::new(MockProvider::confirming("cloud"));
        let engine = engine
            .with_provider(ProviderHandle::new(second.clone(), 10, 1.0))
            .with_provider(ProviderHandle::new(first.clone(), 1, 1.0));
        assert_eq!(engine.provider_names(), vec!["local", "cloud"]);

        let (out, summary) = engine.triage(None, vec![finding("medium", "src/A.sol")]).await;
        assert_eq!(out[0].triage_status, TriageStatus::FalsePositive);
        assert_eq!(out[0].adjusted_severity, Some(Severity::Low));
        assert_eq!(out[0].classification.as_ref().unwrap().provider, "local");
        assert_eq!(summary.ai_classified, 1);
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn test_falls_through_failed_provider() {
        let (engine, audit) = engine();
        let down = Arc::new(FailingProvider::new("down"));
        let engine = engine
            .with_provider(ProviderHandle::new(down.clone(), 0, 1.0))
            .with_provider(ProviderHandle::new(Arc::new(MockProvider::confirming("backup")), 1, 1.0));

        let (out, _) = engine.triage(None, vec![finding("low", "src/A.sol")]).await;
        assert_eq!(out[0].triage_status, TriageStatus::Confirmed);
        assert_eq!(down.calls(), 1);
        assert!(audit
            .entries()
            .iter()
            .any(|e| matches!(e.event, AuditEvent::ProviderFailed { .. })));
    }

    #[tokio::test]
    async fn test_all_providers_failing_uses_rules() {
        let (engine, _) = engine();
        let engine = engine
            .with_provider(ProviderHandle::new(Arc::new(FailingProvider::new("a")), 0, 1.0))
            .with_provider(ProviderHandle::new(Arc::new(FailingProvider::new("b")), 1, 1.0));
        let findings = vec![
            finding("low", "src/A.sol"),
            finding("medium", "test/B.sol"),
            finding("informational", "src/C.sol"),
        ];
        let (out, summary) = engine.triage(None, findings).await;
        assert!(out.iter().all(|f| f.triage_status != TriageStatus::Pending));
        assert!(out
            .iter()
            .all(|f| f.classification.as_ref().unwrap().provider == RULES_PROVIDER));
        assert_eq!(out[1].triage_status, TriageStatus::FalsePositive);
        assert_eq!(summary.rule_classified, 3);
    }

    #[tokio::test]
    async fn test_high_severity_always_needs_review() {
        let (engine, _) = engine();
        let engine = engine.with_provider(ProviderHandle::new(Arc::new(MockProvider::dismissing("m")), 0, 1.0));
        let (out, summary) = engine
            .triage(None, vec![finding("critical", "src/A.sol"), finding("high", "src/B.sol")])
            .await;
        assert!(out.iter().all(|f| f.needs_human_review()));
        // AI 建议降级为 low，但原始严重性仍要求人工复核
        assert_eq!(out[0].adjusted_severity, Some(Severity::Low));
        assert_eq!(summary.human_review, 2);
    }

    #[tokio::test]
    async fn test_review_flag_not_cleared_on_retriage() {
        let (engine, _) = engine();
        let (once, _) = engine.triage(None, vec![finding("high", "src/A.sol")]).await;
        let (twice, summary) = engine.triage(None, once).await;
        assert!(twice[0].needs_human_review());
        assert_eq!(summary.rule_classified, 0);
    }

    #[tokio::test]
    async fn test_total_cost_ceiling() {
        let audit = Arc::new(AuditLog::new());
        let config = TriageConfig {
            total_cost_ceiling: 0.25,
            ..Default::default()
        };
        let paid = Arc::new(MockProvider::confirming("paid").with_cost(0.1));
        let engine = TriageEngine::new(config, Arc::clone(&audit))
            .with_provider(ProviderHandle::new(paid.clone(), 0, 1.0));

        let findings = (0..4).map(|i| finding("low", &format!("src/{}.sol", i))).collect();
        let (out, summary) = engine.triage(None, findings).await;
        assert_eq!(paid.calls(), 2);
        assert_eq!(summary.ai_classified, 2);
        assert_eq!(summary.rule_classified, 2);
        assert!(summary.cost <= 0.25 + 1e-9);
        assert!((summary.cost - 0.2).abs() < 1e-9);
        assert!(out.iter().all(|f| f.is_triaged()));
        assert!(audit
            .entries()
            .iter()
            .any(|e| matches!(e.event, AuditEvent::CostCeilingExceeded { .. })));
    }

    #[tokio::test]
    async fn test_cost_ceiling_is_per_batch() {
        let config = TriageConfig {
            total_cost_ceiling: 0.25,
            ..Default::default()
        };
        let paid = Arc::new(MockProvider::confirming("paid").with_cost(0.1));
        let engine = TriageEngine::new(config, Arc::new(AuditLog::new()))
            .with_provider(ProviderHandle::new(paid.clone(), 0, 1.0));

        let batch = || (0..3).map(|i| finding("low", &format!("src/{}.sol", i))).collect::<Vec<_>>();
        let (_, first) = engine.triage(None, batch()).await;
        let (_, second) = engine.triage(None, batch()).await;
        assert_eq!(first.ai_classified, 2);
        assert_eq!(second.ai_classified, 2);
        assert!((second.cost - 0.2).abs() < 1e-9);
        assert_eq!(paid.calls(), 4);
    }

    #[tokio::test]
    async fn test_rules_only_sets_review_without_calls() {
        let (engine, _) = engine();
        let provider = Arc::new(MockProvider::confirming("m"));
        let engine = engine.with_provider(ProviderHandle::new(provider.clone(), 0, 1.0));
        let (out, summary) = engine
            .triage_rules_only(None, vec![finding("critical", "src/A.sol"), finding("low", "src/B.sol")])
            .await;
        assert_eq!(provider.calls(), 0);
        assert_eq!(out[0].triage_status, TriageStatus::NeedsHumanReview);
        assert!(out[1].is_triaged());
        assert_eq!(summary.rule_classified, 2);
        assert_eq!(summary.cost, 0.0);
    }

    #[tokio::test]
    async fn test_inbox_drops_oldest_past_capacity() {
        let (engine, _) = engine();
        let engine = engine.with_inbox_capacity(2);
        let bus = MessageBus::new();
        engine.attach(&bus);
        bus.publish(BusMessage::findings(
            TOPIC_FINDINGS_CORRELATED,
            "orchestrator",
            vec![
                finding("low", "src/A.sol"),
                finding("low", "src/B.sol"),
                finding("low", "src/C.sol"),
            ],
        ));
        assert_eq!(engine.pending_count(), 2);
        let (out, _) = engine.triage_pending(None).await;
        assert_eq!(out[0].location.file, "src/B.sol");
    }

    #[tokio::test]
    async fn test_ai_disabled_skips_providers() {
        let audit = Arc::new(AuditLog::new());
        let provider = Arc::new(MockProvider::confirming("m"));
        let engine = TriageEngine::new(
            TriageConfig {
                ai_enabled: false,
                ..Default::default()
            },
            audit,
        )
        .with_provider(ProviderHandle::new(provider.clone(), 0, 1.0));
        let (out, _) = engine.triage(None, vec![finding("low", "src/A.sol")]).await;
        assert_eq!(provider.calls(), 0);
        assert_eq!(out[0].classification.as_ref().unwrap().provider, RULES_PROVIDER);
    }

    #[tokio::test]
    async fn test_disabled_handle_skipped() {
        let (engine, _) = engine();
        let provider = Arc::new(MockProvider::confirming("m"));
        let engine = engine.with_provider(ProviderHandle::new(provider.clone(), 0, 1.0).disabled());
        engine.triage(None, vec![finding("low", "src/A.sol")]).await;
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_receives_batches_from_bus() {
        let (engine, _) = engine();
        let bus = MessageBus::new();
        engine.attach(&bus);
        bus.publish(BusMessage::findings(
            TOPIC_FINDINGS_CORRELATED,
            "orchestrator",
            vec![finding("low", "src/A.sol"), finding("medium", "src/B.sol")],
        ));
        assert_eq!(engine.pending_count(), 2);
        let (out, _) = engine.triage_pending(None).await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|f| f.is_triaged()));
        assert_eq!(engine.pending_count(), 0);
    }
}
