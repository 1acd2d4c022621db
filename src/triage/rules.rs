//! 规则分类器：确定性回退
//!
//! 所有 AI 提供者都不可用（或 AI 被禁用）时使用，保证每条发现都有分级结论。
//! 按已知误报特征（正则）匹配文件路径、函数名或描述；低于置信度阈值的也判为误报。

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::findings::Finding;

/// 特征匹配的字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureField {
    File,
    Function,
    Description,
    #[default]
    Any,
}

/// 误报特征（可在配置中扩展）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FalsePositiveSignature {
    /// 仅对该类型生效；None 表示所有类型
    #[serde(default)]
    pub finding_type: Option<String>,
    #[serde(default)]
    pub field: SignatureField,
    pub pattern: String,
    pub reason: String,
}

impl FalsePositiveSignature {
    pub fn new(field: SignatureField, pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            finding_type: None,
            field,
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    pub fn for_type(mut self, finding_type: impl Into<String>) -> Self {
        self.finding_type = Some(finding_type.into());
        self
    }
}

/// 内置误报特征
pub fn default_signatures() -> Vec<FalsePositiveSignature> {
    vec![
        FalsePositiveSignature::new(
            SignatureField::File,
            r"(?i)(^|/)(test|tests|mock|mocks)/|\.t\.sol$|(^|/)mock[^/]*$",
            "finding located in test or mock code",
        ),
        FalsePositiveSignature::new(
            SignatureField::File,
            r"(^|/)(node_modules|vendor|lib/openzeppelin-contracts)/",
            "finding located in third-party dependency",
        ),
        FalsePositiveSignature::new(
            SignatureField::Any,
            r"\bnonReentrant\b",
            "function is protected by a reentrancy guard",
        )
        .for_type("reentrancy"),
        FalsePositiveSignature::new(
            SignatureField::Any,
            r"\bonly(Owner|Role|Admin)\b",
            "function is protected by an access-control modifier",
        )
        .for_type("access-control"),
    ]
}

/// 规则分类结果
#[derive(Debug, Clone, PartialEq)]
pub struct RuleVerdict {
    pub true_positive: bool,
    pub confidence: f64,
    pub rationale: String,
}

/// 规则分类器
#[derive(Debug, Clone)]
pub struct RuleClassifier {
    signatures: Vec<(FalsePositiveSignature, Regex)>,
    min_confidence: f64,
}

impl RuleClassifier {
    /// 编译特征；无效正则只记 warn 并忽略
    pub fn new(signatures: Vec<FalsePositiveSignature>, min_confidence: f64) -> Self {
        let signatures = signatures
            .into_iter()
            .filter_map(|sig| match Regex::new(&sig.pattern) {
                Ok(re) => Some((sig, re)),
                Err(e) => {
                    tracing::warn!(pattern = %sig.pattern, "Ignoring invalid false-positive signature: {}", e);
                    None
                }
            })
            .collect();
        Self {
            signatures,
            min_confidence,
        }
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn classify(&self, finding: &Finding) -> RuleVerdict {
        for (sig, re) in &self.signatures {
            if sig
                .finding_type
                .as_deref()
                .is_some_and(|t| !t.eq_ignore_ascii_case(&finding.finding_type))
            {
                continue;
            }
            if Self::field_matches(sig.field, re, finding) {
                return RuleVerdict {
                    true_positive: false,
                    confidence: 0.7,
                    rationale: sig.reason.clone(),
                };
            }
        }

        if finding.confidence < self.min_confidence {
            return RuleVerdict {
                true_positive: false,
                confidence: 0.5,
                rationale: format!(
                    "confidence {:.2} below threshold {:.2}",
                    finding.confidence, self.min_confidence
                ),
            };
        }

        RuleVerdict {
            true_positive: true,
            confidence: finding.confidence,
            rationale: "no known false-positive signature matched".to_string(),
        }
    }

    fn field_matches(field: SignatureField, re: &Regex, finding: &Finding) -> bool {
        let function = finding.location.function.as_deref().unwrap_or("");
        match field {
            SignatureField::File => re.is_match(&finding.location.file),
            SignatureField::Function => re.is_match(function),
            SignatureField::Description => re.is_match(&finding.description),
            SignatureField::Any => {
                re.is_match(&finding.location.file)
                    || re.is_match(function)
                    || re.is_match(&finding.description)
            }
        }
    }
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self::new(default_signatures(), 0.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::findings::{normalize, RawFinding};

    fn finding(ty: &str, file: &str, conf: f64, description: &str) -> Finding {
        let raw = RawFinding::new(ty, file, 10)
            .with_confidence(conf)
            .with_description(description);
        normalize("a", &[raw]).findings.remove(0)
    }

    #[test]
    fn test_test_code_is_false_positive() {
        let rules = RuleClassifier::default();
        let v = rules.classify(&finding("overflow", "test/Vault.t.sol", 0.9, ""));
        assert!(!v.true_positive);
        assert!(v.rationale.contains("test"));
    }

    #[test]
    fn test_type_scoped_signature() {
        let rules = RuleClassifier::default();
        let guarded = rules.classify(&finding("reentrancy", "src/Vault.sol", 0.9, "withdraw uses nonReentrant"));
        assert!(!guarded.true_positive);

        let other_type = rules.classify(&finding("overflow", "src/Vault.sol", 0.9, "nonReentrant"));
        assert!(other_type.true_positive);
    }

    #[test]
    fn test_low_confidence_dismissed() {
        let rules = RuleClassifier::default();
        assert!(!rules.classify(&finding("overflow", "src/A.sol", 0.1, "")).true_positive);
        assert!(rules.classify(&finding("overflow", "src/A.sol", 0.6, "")).true_positive);
    }

    #[test]
    fn test_invalid_pattern_ignored() {
        let rules = RuleClassifier::new(
            vec![
                FalsePositiveSignature::new(SignatureField::Any, "([unclosed", "broken"),
                FalsePositiveSignature::new(SignatureField::Function, "^constructor$", "constructor"),
            ],
            0.0,
        );
        assert_eq!(rules.signature_count(), 1);
    }
}
