//! 进程级关闭信号
//!
//! Ctrl+C / SIGTERM 触发关闭令牌；运行的 SessionSupervisor 以此为父令牌，
//! 因此进程退出信号会作为运行级取消传播到所有进行中的 Agent 调用。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::SessionSupervisor;

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
}

/// 关闭信号管理器
#[derive(Debug, Clone, Default)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为一次运行创建监管者，关闭时随之取消
    pub fn supervisor(&self) -> SessionSupervisor {
        SessionSupervisor::with_parent(&self.shutdown_token)
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if !self.shutdown_token.is_cancelled() {
            tracing::info!(?reason, "Shutting down");
        }
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, cancelling run...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, cancelling run...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}
