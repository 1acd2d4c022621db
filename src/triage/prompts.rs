//! 分级提示词与结论解析

use serde::Deserialize;

use super::provider::{ClassifyRequest, ProviderError};
use crate::findings::{Finding, Severity};

const TRIAGE_PROMPT: &str = "You are a security triage assistant. Decide whether the finding below \
is a true positive or a false positive. Reply with ONLY one JSON object: \
{\"verdict\": \"true_positive\" | \"false_positive\", \"severity\": \"critical|high|medium|low|informational\" (optional), \
\"confidence\": 0.0-1.0, \"rationale\": \"one sentence\"}.";

/// 从模型输出解析出的结论
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub true_positive: bool,
    pub severity: Option<Severity>,
    pub confidence: Option<f64>,
    pub rationale: String,
}

#[derive(Deserialize)]
struct VerdictJson {
    verdict: String,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    rationale: Option<String>,
}

/// 为单条发现构造分类请求
pub fn build_request(finding: &Finding, max_tokens: u32, temperature: f32) -> ClassifyRequest {
    let context = serde_json::json!({
        "type": finding.finding_type,
        "severity": finding.severity,
        "confidence": finding.confidence,
        "file": finding.location.file,
        "lines": [finding.location.start_line, finding.location.end_line],
        "function": finding.location.function,
        "description": finding.description,
        "reported_by": finding.agents,
    });
    ClassifyRequest {
        prompt: TRIAGE_PROMPT.to_string(),
        context: context.to_string(),
        max_tokens,
        temperature,
    }
}

/// 解析模型输出；允许 ```json 代码块包裹，JSON 失败时退回关键词判断
pub fn parse_verdict(content: &str) -> Result<Verdict, ProviderError> {
    let body = strip_code_fence(content);
    if let Some(json) = extract_json_object(body) {
        if let Ok(v) = serde_json::from_str::<VerdictJson>(json) {
            let true_positive = match v.verdict.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
                "true_positive" | "tp" | "confirmed" => true,
                "false_positive" | "fp" | "dismissed" => false,
                other => {
                    return Err(ProviderError::InvalidResponse(format!(
                        "unknown verdict '{}'",
                        other
                    )))
                }
            };
            return Ok(Verdict {
                true_positive,
                severity: v.severity.and_then(|s| s.parse().ok()),
                confidence: v.confidence.filter(|c| c.is_finite()).map(|c| c.clamp(0.0, 1.0)),
                rationale: v.rationale.unwrap_or_default(),
            });
        }
    }

    let lower = body.to_lowercase();
    let fp = lower.contains("false positive") || lower.contains("false_positive");
    let tp = lower.contains("true positive") || lower.contains("true_positive");
    match (tp, fp) {
        (true, false) | (false, true) => Ok(Verdict {
            true_positive: tp,
            severity: None,
            confidence: None,
            rationale: body.chars().take(200).collect(),
        }),
        _ => Err(ProviderError::InvalidResponse(
            body.chars().take(120).collect(),
        )),
    }
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
