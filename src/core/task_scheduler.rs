//! 任务调度：有界工作池
//!
//! 并行派发时用 Semaphore 限制同时运行的 Agent 数；顺序派发等价于并发上限 1
//! （Agent 共享可变外部资源时使用，例如同一个编译缓存）。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// 派发模式
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    #[default]
    Parallel,
    Sequential,
}

/// 任务调度器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        let capacity = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// 并发上限 = min(选中的 Agent 数, 配置上限)；顺序模式固定为 1
    pub fn for_dispatch(mode: DispatchMode, selected: usize, max_concurrency: usize) -> Self {
        match mode {
            DispatchMode::Sequential => Self::new(1),
            DispatchMode::Parallel => Self::new(selected.min(max_concurrency)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 获取执行许可；取消信号先到时返回 None
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_for_dispatch() {
        assert_eq!(TaskScheduler::for_dispatch(DispatchMode::Parallel, 10, 4).capacity(), 4);
        assert_eq!(TaskScheduler::for_dispatch(DispatchMode::Parallel, 2, 8).capacity(), 2);
        assert_eq!(TaskScheduler::for_dispatch(DispatchMode::Sequential, 10, 8).capacity(), 1);
        assert_eq!(TaskScheduler::for_dispatch(DispatchMode::Parallel, 0, 8).capacity(), 1);
    }

    #[tokio::test]
    async fn test_acquire_respects_cancellation() {
        let scheduler = TaskScheduler::new(1);
        let token = CancellationToken::new();
        let held = scheduler.acquire(&token).await;
        assert!(held.is_some());

        token.cancel();
        assert!(scheduler.acquire(&token).await.is_none());
    }
}
