//! 会话监管：运行级取消信号
//!
//! 用户中止或上层超时会触发取消，信号传播给所有进行中的 Agent 调用；
//! 已完成的 AnalysisResult 保留并继续进入聚合。

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// 一次运行的取消令牌持有者
#[derive(Debug, Clone, Default)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以外部令牌为父（例如进程级关闭信号）
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            cancel_token: parent.child_token(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消（用户中止）
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 上层超时：到期后自动取消
    pub fn cancel_after(&self, deadline: Duration) {
        let token = self.cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    tracing::warn!("Run deadline of {:?} reached, cancelling", deadline);
                    token.cancel();
                }
            }
        });
    }

    /// 子令牌（单个 Agent 调用）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}
