//! 分级层：AI 提供者责任链、规则回退、人工复核门禁

pub mod engine;
pub mod factory;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod prompts;
pub mod provider;
pub mod rules;

pub use engine::{TriageConfig, TriageEngine, TriageError, TriageSummary, RULES_PROVIDER};
pub use factory::{build_handles, ProviderConfig, ProviderKind};
pub use mock::{FailingProvider, MockProvider};
pub use ollama::{OllamaProvider, OLLAMA_DEFAULT_URL};
pub use openai::OpenAiProvider;
pub use prompts::{build_request, parse_verdict, Verdict};
pub use provider::{
    ClassifierProvider, ClassifyRequest, ClassifyResponse, ProviderError, ProviderHandle, TryClassify,
};
pub use rules::{default_signatures, FalsePositiveSignature, RuleClassifier, RuleVerdict, SignatureField};
