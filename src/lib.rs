//! Stinger - 多 Agent 安全分析编排器
//!
//! 模块划分：
//! - **agents**: Agent 契约、注册表、命令行工具包装
//! - **bus**: 进程内消息总线（进度事件、发现批次）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排器、运行状态机、错误分类、审计日志、调度与取消
//! - **findings**: 统一发现模型、规范化、跨工具关联
//! - **observability**: tracing 初始化
//! - **triage**: AI 提供者责任链、规则回退、人工复核门禁

pub mod agents;
pub mod bus;
pub mod config;
pub mod core;
pub mod findings;
pub mod observability;
pub mod triage;

pub use crate::core::{Orchestrator, OrchestratorConfig, OrchestratorError, Run, SelectionCriteria};
pub use crate::config::{load_config, StingerConfig};
