//! 发现层：统一数据模型、规范化、跨工具关联

pub mod correlation;
pub mod finding;
pub mod normalizer;

pub use correlation::{CorrelationConfig, CorrelationEngine, CorrelationStats};
pub use finding::{Classification, Finding, Location, Severity, TriageStatus};
pub use normalizer::{normalize, NormalizeError, NormalizeOutcome, RawFinding, DEFAULT_CONFIDENCE};
