//! 分类提供者契约
//!
//! 任何满足 {prompt, context, maxTokens, temperature} -> {content, confidence, providerName,
//! modelName, estimatedCost} 形状的提供者都可以互换使用。分级引擎持有按优先级排序的
//! ProviderHandle 列表，每次调用统一得到 TryClassify（成功 / 超出成本 / 失败）。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 分类请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifyRequest {
    pub prompt: String,
    pub context: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ClassifyRequest {
    /// 粗略 token 估算（约 4 字符 / token），用于调用前的成本预估
    pub fn estimated_tokens(&self) -> u64 {
        ((self.prompt.len() + self.context.len()) as u64).div_ceil(4) + self.max_tokens as u64
    }
}

/// 分类响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifyResponse {
    pub content: String,
    pub confidence: f64,
    pub provider_name: String,
    pub model_name: String,
    pub estimated_cost: f64,
}

/// 提供者错误：均可恢复，触发回退链
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Cost ceiling exceeded: estimated {estimated:.4} > limit {limit:.4}")]
    CostCeilingExceeded { estimated: f64, limit: f64 },

    #[error("Provider request failed: {0}")]
    Request(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

/// 分类提供者 trait
#[async_trait]
pub trait ClassifierProvider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// 调用前的成本预估（美元）
    fn estimate_cost(&self, request: &ClassifyRequest) -> f64;

    async fn classify(&self, request: &ClassifyRequest) -> Result<ClassifyResponse, ProviderError>;
}

/// 单次尝试的统一结果
#[derive(Debug, Clone, PartialEq)]
pub enum TryClassify {
    Classified(ClassifyResponse),
    CostExceeded { estimated: f64, limit: f64 },
    Failed(ProviderError),
}

/// 带优先级与单次成本上限的提供者句柄
#[derive(Clone)]
pub struct ProviderHandle {
    pub provider: Arc<dyn ClassifierProvider>,
    /// 数值越小越先尝试
    pub priority: u32,
    pub max_cost_per_call: f64,
    pub enabled: bool,
}

impl ProviderHandle {
    pub fn new(provider: Arc<dyn ClassifierProvider>, priority: u32, max_cost_per_call: f64) -> Self {
        Self {
            provider,
            priority,
            max_cost_per_call,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn name(&self) -> &str {
        self.provider.name()
    }

    /// 先检查单次上限与剩余预算，再调用提供者
    pub async fn try_classify(&self, request: &ClassifyRequest, remaining_budget: f64) -> TryClassify {
        let estimated = self.provider.estimate_cost(request);
        let limit = self.max_cost_per_call.min(remaining_budget.max(0.0));
        if estimated > limit {
            return TryClassify::CostExceeded { estimated, limit };
        }
        match self.provider.classify(request).await {
            Ok(response) => TryClassify::Classified(response),
            Err(ProviderError::CostCeilingExceeded { estimated, limit }) => {
                TryClassify::CostExceeded { estimated, limit }
            }
            Err(e) => TryClassify::Failed(e),
        }
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("provider", &self.provider.name())
            .field("priority", &self.priority)
            .field("max_cost_per_call", &self.max_cost_per_call)
            .field("enabled", &self.enabled)
            .finish()
    }
}
