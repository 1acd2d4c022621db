//! OpenAI 兼容分类提供者
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；按 token 单价估算与结算成本。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use super::provider::{ClassifierProvider, ClassifyRequest, ClassifyResponse, ProviderError};

/// 模型未给出置信度时使用
const DEFAULT_RESPONSE_CONFIDENCE: f64 = 0.7;

pub struct OpenAiProvider {
    name: String,
    client: Client<OpenAIConfig>,
    model: String,
    has_api_key: bool,
    /// 每千 token 单价（美元）
    cost_per_1k_tokens: f64,
    timeout: Duration,
}

impl OpenAiProvider {
    /// api_key 为 None 时提供者仍可构造，但 classify 返回 Unavailable
    pub fn new(
        name: impl Into<String>,
        base_url: Option<&str>,
        model: &str,
        api_key: Option<String>,
        cost_per_1k_tokens: f64,
        timeout: Duration,
    ) -> Self {
        let has_api_key = api_key.is_some();
        let mut config = OpenAIConfig::new().with_api_key(api_key.unwrap_or_default());
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self {
            name: name.into(),
            client: Client::with_config(config),
            model: model.to_string(),
            has_api_key,
            cost_per_1k_tokens,
            timeout,
        }
    }

    fn cost_for_tokens(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.cost_per_1k_tokens
    }

    fn to_messages(request: &ClassifyRequest) -> Result<Vec<ChatCompletionRequestMessage>, ProviderError> {
        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content(request.prompt.clone())
            .build()
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(request.context.clone())
            .build()
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        Ok(vec![
            ChatCompletionRequestMessage::System(system),
            ChatCompletionRequestMessage::User(user),
        ])
    }
}

#[async_trait]
impl ClassifierProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn estimate_cost(&self, request: &ClassifyRequest) -> f64 {
        self.cost_for_tokens(request.estimated_tokens())
    }

    async fn classify(&self, request: &ClassifyRequest) -> Result<ClassifyResponse, ProviderError> {
        if !self.has_api_key {
            return Err(ProviderError::Unavailable(format!("{}: API key not configured", self.name)));
        }

        let body = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::to_messages(request)?)
            .max_completion_tokens(request.max_tokens)
            .temperature(request.temperature)
            .build()
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(body))
            .await
            .map_err(|_| ProviderError::Unavailable(format!("{} timed out after {:?}", self.name, self.timeout)))?
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let cost = match &response.usage {
            Some(usage) => self.cost_for_tokens(usage.prompt_tokens as u64 + usage.completion_tokens as u64),
            None => self.estimate_cost(request),
        };

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| ProviderError::InvalidResponse("empty completion".to_string()))?;

        Ok(ClassifyResponse {
            content,
            confidence: DEFAULT_RESPONSE_CONFIDENCE,
            provider_name: self.name.clone(),
            model_name: self.model.clone(),
            estimated_cost: cost,
        })
    }
}
