//! 从配置构造提供者链

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ollama::OllamaProvider;
use super::openai::OpenAiProvider;
use super::provider::{ClassifierProvider, ProviderHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI 兼容端点（OpenAI / DeepSeek / 自建代理）
    OpenAi,
    Ollama,
}

/// [[triage.providers]] 配置项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// 读取 API key 的环境变量名
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_max_cost_per_call")]
    pub max_cost_per_call: f64,
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_max_cost_per_call() -> f64 {
    0.05
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    pub fn build(&self) -> ProviderHandle {
        let timeout = Duration::from_secs(self.timeout_secs.max(1));
        let provider: Arc<dyn ClassifierProvider> = match self.kind {
            ProviderKind::OpenAi => {
                let api_key = self
                    .api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|k| !k.is_empty());
                if api_key.is_none() {
                    tracing::warn!(provider = %self.name, "No API key found, provider will be skipped at runtime");
                }
                Arc::new(OpenAiProvider::new(
                    self.name.clone(),
                    self.base_url.as_deref(),
                    &self.model,
                    api_key,
                    self.cost_per_1k_tokens,
                    timeout,
                ))
            }
            ProviderKind::Ollama => Arc::new(OllamaProvider::new(
                self.name.clone(),
                self.base_url.as_deref(),
                &self.model,
                timeout,
            )),
        };
        let handle = ProviderHandle::new(provider, self.priority, self.max_cost_per_call);
        if self.enabled {
            handle
        } else {
            handle.disabled()
        }
    }
}

/// 按配置构造全部提供者句柄
pub fn build_handles(configs: &[ProviderConfig]) -> Vec<ProviderHandle> {
    configs.iter().map(ProviderConfig::build).collect()
}
