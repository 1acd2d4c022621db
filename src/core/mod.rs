//! 核心编排层：错误分类、运行状态、审计日志、任务调度、会话监管、主控编排

pub mod audit;
pub mod error;
pub mod orchestrator;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;
pub mod task_scheduler;

pub use audit::{AuditEntry, AuditEvent, AuditLog};
pub use error::{AgentError, OrchestratorError};
pub use orchestrator::{Orchestrator, OrchestratorConfig, Selection, SelectionCriteria};
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{AnalysisResult, AnalysisStatus, Run, RunPhase, RunStats};
pub use task_scheduler::{DispatchMode, TaskScheduler};
