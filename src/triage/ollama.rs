//! Ollama 本地模型分类提供者（免费，无需 API key）

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::provider::{ClassifierProvider, ClassifyRequest, ClassifyResponse, ProviderError};

pub const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

const DEFAULT_RESPONSE_CONFIDENCE: f64 = 0.6;

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

pub struct OllamaProvider {
    name: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(name: impl Into<String>, base_url: Option<&str>, model: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            name: name.into(),
            base_url: base_url.unwrap_or(OLLAMA_DEFAULT_URL).trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        }
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }
}

#[async_trait]
impl ClassifierProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn estimate_cost(&self, _request: &ClassifyRequest) -> f64 {
        0.0
    }

    async fn classify(&self, request: &ClassifyRequest) -> Result<ClassifyResponse, ProviderError> {
        let payload = serde_json::json!({
            "model": self.model,
            "system": request.prompt,
            "prompt": request.context,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });

        let response = self
            .client
            .post(self.generate_url())
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    ProviderError::Unavailable(format!("{} at {}: {}", self.name, self.base_url, e))
                } else {
                    ProviderError::Request(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(ProviderError::Request(format!(
                "{} returned status {}",
                self.name,
                response.status()
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        if body.response.trim().is_empty() {
            return Err(ProviderError::InvalidResponse("empty response".to_string()));
        }

        Ok(ClassifyResponse {
            content: body.response,
            confidence: DEFAULT_RESPONSE_CONFIDENCE,
            provider_name: self.name.clone(),
            model_name: self.model.clone(),
            estimated_cost: 0.0,
        })
    }
}
