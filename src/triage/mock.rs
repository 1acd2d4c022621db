//! Mock 提供者（用于测试，无需 API）

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::provider::{ClassifierProvider, ClassifyRequest, ClassifyResponse, ProviderError};

/// 固定返回一段内容的提供者
#[derive(Debug)]
pub struct MockProvider {
    name: String,
    content: String,
    confidence: f64,
    cost: f64,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            confidence: 0.9,
            cost: 0.0,
            calls: AtomicUsize::new(0),
        }
    }

    /// 判定为真实问题
    pub fn confirming(name: impl Into<String>) -> Self {
        Self::new(
            name,
            r#"{"verdict": "true_positive", "confidence": 0.9, "rationale": "mock confirmed"}"#,
        )
    }

    /// 判定为误报，并建议降为 low
    pub fn dismissing(name: impl Into<String>) -> Self {
        Self::new(
            name,
            r#"{"verdict": "false_positive", "severity": "low", "confidence": 0.8, "rationale": "mock dismissed"}"#,
        )
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassifierProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "mock"
    }

    fn estimate_cost(&self, _request: &ClassifyRequest) -> f64 {
        self.cost
    }

    async fn classify(&self, _request: &ClassifyRequest) -> Result<ClassifyResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ClassifyResponse {
            content: self.content.clone(),
            confidence: self.confidence,
            provider_name: self.name.clone(),
            model_name: "mock".to_string(),
            estimated_cost: self.cost,
        })
    }
}

/// 总是失败的提供者
#[derive(Debug)]
pub struct FailingProvider {
    name: String,
    calls: AtomicUsize,
}

impl FailingProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassifierProvider for FailingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        "none"
    }

    fn estimate_cost(&self, _request: &ClassifyRequest) -> f64 {
        0.0
    }

    async fn classify(&self, _request: &ClassifyRequest) -> Result<ClassifyResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Unavailable(format!("{} is down", self.name)))
    }
}
