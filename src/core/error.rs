//! 错误分类
//!
//! 只有 AllAgentsFailed（以及选不出任何 Agent 的退化情形）会作为运行失败返回给调用方；
//! 其余错误在各自阶段降级处理，并写入审计日志。

use thiserror::Error;

use crate::core::{AnalysisResult, AnalysisStatus};

/// 单个 Agent 的错误：在编排器中被隔离，不会中止整个运行
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// 注册/发现阶段：工具未安装或不可用（记为 Skipped）
    #[error("Agent unavailable: {0}")]
    Unavailable(String),

    #[error("Agent '{agent}' timed out after {after_ms}ms")]
    Timeout { agent: String, after_ms: u64 },

    #[error("Agent execution failed: {0}")]
    Execution(String),

    /// 运行级取消信号中断了进行中的调用
    #[error("Agent cancelled")]
    Cancelled,
}

/// 运行级错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// 没有任何 Agent 成功完成，无结果可聚合
    #[error("All {} dispatched agents failed", dispatched_count(results))]
    AllAgentsFailed { results: Vec<AnalysisResult> },

    /// 选择条件没有匹配到任何可用 Agent
    #[error("No available agent matches the selection criteria ({skipped} matched but unavailable)")]
    NoAgentsSelected { skipped: usize },

    #[error("Invalid run phase transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::core::RunPhase,
        to: crate::core::RunPhase,
    },
}

/// 实际派发过的 Agent 数（不含 Skipped）
fn dispatched_count(results: &[AnalysisResult]) -> usize {
    results.iter().filter(|r| r.status != AnalysisStatus::Skipped).count()
}
